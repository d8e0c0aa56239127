// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fmt;
use std::io;

use lnpeerd_wire::{WireError, WireErrorCode};

/// Error raised by the transport, the peer engine, or a lifecycle flow.
///
/// Every code except [`PeerErrorCode::HtlcFailure`] is fatal for the peer
/// connection: in-flight flows are cancelled and channels stay persisted in
/// their last committed state for reestablishment on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerError {
	// A description of the error condition, intended for a human audience
	// (logging, payment failure reporting) only.
	pub message: String,

	// The error code uniquely identifying an error condition. Code that
	// detects or handles errors by type should read this, not `message`.
	pub code: PeerErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCode {
	/// The underlying stream ended or broke.
	TransportClosed,

	/// An AEAD tag did not verify, during the handshake or on a frame.
	AuthenticationFailure,

	/// Inbound bytes did not match the wire schema.
	MalformedMessage,

	/// A protocol invariant was violated during dispatch, reestablishment or
	/// a lifecycle flow.
	ProtocolViolation,

	/// An ECDSA signature over an announcement or commitment did not verify.
	SignatureInvalid,

	/// The remote failed an HTLC; `message` carries the user-visible
	/// failure string. Recovered by the pay flow.
	HtlcFailure,

	/// A local invariant failed, e.g. an outbound message would not encode.
	InternalError,
}

impl PeerError {
	pub fn new(code: PeerErrorCode, message: impl Into<String>) -> Self {
		PeerError { message: message.into(), code }
	}
}

impl fmt::Display for PeerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?}: {}", self.code, self.message)
	}
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
	fn from(e: io::Error) -> Self {
		PeerError::new(PeerErrorCode::TransportClosed, e.to_string())
	}
}

impl From<WireError> for PeerError {
	fn from(e: WireError) -> Self {
		let code = match e.code {
			WireErrorCode::MalformedMessage | WireErrorCode::UnknownMessage => {
				PeerErrorCode::MalformedMessage
			},
			WireErrorCode::EncodingError | WireErrorCode::InvalidSchema => PeerErrorCode::InternalError,
		};
		PeerError::new(code, e.message)
	}
}
