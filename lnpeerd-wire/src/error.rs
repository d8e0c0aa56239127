// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fmt;

/// Error returned by the schema loader and the message codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
	// A description of the error condition, intended for a human audience
	// (logging and diagnostics) only.
	pub message: String,

	// The error code uniquely identifying an error condition. Code that
	// detects or handles errors by type should read this, not `message`.
	pub code: WireErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorCode {
	/// Inbound bytes did not match the schema: a position assertion failed,
	/// a field was truncated, or trailing bytes were left unconsumed.
	MalformedMessage,

	/// Outbound field values could not be laid out: an integer did not fit
	/// its computed width, or a byte value had the wrong length.
	EncodingError,

	/// The 16-bit type code (or the message name) is not present in the
	/// loaded schema.
	UnknownMessage,

	/// The schema document itself is invalid, e.g. duplicate type codes or
	/// an unparseable length expression.
	InvalidSchema,
}

impl WireError {
	pub(crate) fn new(code: WireErrorCode, message: impl Into<String>) -> Self {
		WireError { message: message.into(), code }
	}
}

impl fmt::Display for WireError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}: {}", self.code, self.message)
	}
}

impl std::error::Error for WireError {}
