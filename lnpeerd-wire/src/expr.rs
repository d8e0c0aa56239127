// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The expression mini-language used by field `position` and `length`
//! entries in the message schema.
//!
//! An expression is either a sum of terms (`"4+gflen"`) or a product of
//! terms (`"num_htlcs*64"`), never both. Each term is an integer literal or
//! a reference to a previously bound field, whose byte value is read as a
//! big-endian unsigned integer.

use crate::error::{WireError, WireErrorCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Term {
	Lit(u64),
	Ref(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldExpr {
	Sum(Vec<Term>),
	Product(Vec<Term>),
}

/// Why an expression could not be evaluated. The caller decides whether this
/// is a decode-side or an encode-side error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvalError {
	UnknownRef(String),
	Overflow,
}

fn parse_term(raw: &str) -> Result<Term, WireError> {
	let raw = raw.trim();
	if raw.is_empty() {
		return Err(WireError::new(WireErrorCode::InvalidSchema, "empty term in expression"));
	}
	if raw.bytes().all(|b| b.is_ascii_digit()) {
		let n = raw.parse::<u64>().map_err(|_| {
			WireError::new(WireErrorCode::InvalidSchema, format!("integer literal too large: {}", raw))
		})?;
		return Ok(Term::Lit(n));
	}
	Ok(Term::Ref(raw.to_string()))
}

impl FieldExpr {
	pub(crate) fn parse(raw: &str) -> Result<Self, WireError> {
		if raw.contains('*') {
			if raw.contains('+') {
				return Err(WireError::new(
					WireErrorCode::InvalidSchema,
					format!("expression mixes '+' and '*': {}", raw),
				));
			}
			let terms = raw.split('*').map(parse_term).collect::<Result<Vec<_>, _>>()?;
			return Ok(FieldExpr::Product(terms));
		}
		let terms = raw.split('+').map(parse_term).collect::<Result<Vec<_>, _>>()?;
		Ok(FieldExpr::Sum(terms))
	}

	/// Evaluates against a binding environment. `lookup` returns the numeric
	/// value of a previously bound field, or `None` if it is not bound.
	pub(crate) fn eval(&self, lookup: &dyn Fn(&str) -> Option<u64>) -> Result<u64, EvalError> {
		let resolve = |term: &Term| -> Result<u64, EvalError> {
			match term {
				Term::Lit(n) => Ok(*n),
				Term::Ref(name) => lookup(name).ok_or_else(|| EvalError::UnknownRef(name.clone())),
			}
		};
		match self {
			FieldExpr::Sum(terms) => {
				let mut acc: u64 = 0;
				for term in terms {
					acc = acc.checked_add(resolve(term)?).ok_or(EvalError::Overflow)?;
				}
				Ok(acc)
			},
			FieldExpr::Product(terms) => {
				let mut acc: u64 = 1;
				for term in terms {
					acc = acc.checked_mul(resolve(term)?).ok_or(EvalError::Overflow)?;
				}
				Ok(acc)
			},
		}
	}
}

/// Reads a byte string as a big-endian unsigned integer. Values wider than
/// eight significant bytes do not fit a `u64` and are rejected.
pub(crate) fn be_int(bytes: &[u8]) -> Result<u64, EvalError> {
	let significant = match bytes.iter().position(|&b| b != 0) {
		Some(first) => &bytes[first..],
		None => return Ok(0),
	};
	if significant.len() > 8 {
		return Err(EvalError::Overflow);
	}
	let mut out = 0u64;
	for &b in significant {
		out = (out << 8) | u64::from(b);
	}
	Ok(out)
}
