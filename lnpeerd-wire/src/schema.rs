// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Loader for the declarative message schema.
//!
//! The schema is an ordered JSON mapping from message name to
//! `{ "type": <16-bit code>, "payload": { <field>: { "position", "length",
//! ["feature"] } } }`. Field order in the document is the wire order.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{WireError, WireErrorCode};
use crate::expr::FieldExpr;

#[derive(Debug, Clone)]
pub(crate) struct FieldSpec {
	pub(crate) name: String,
	pub(crate) position: FieldExpr,
	pub(crate) length: FieldExpr,
	/// Optional trailer, consumed only if input remains at its offset.
	pub(crate) feature: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageSpec {
	pub(crate) name: String,
	pub(crate) type_code: u16,
	pub(crate) fields: Vec<FieldSpec>,
}

/// The loaded schema: message layouts indexed by 16-bit type code (decoding)
/// and by name (encoding).
#[derive(Debug, Clone)]
pub struct WireSchema {
	messages: Vec<MessageSpec>,
	by_name: HashMap<String, usize>,
	by_type: HashMap<u16, usize>,
}

static BOLT_SCHEMA: Lazy<WireSchema> = Lazy::new(|| {
	WireSchema::from_json(include_str!("lightning.json")).expect("embedded schema is valid")
});

fn expr_entry(field: &Value, name: &str, msg: &str, key: &str) -> Result<FieldExpr, WireError> {
	let raw = field.get(key).ok_or_else(|| {
		WireError::new(
			WireErrorCode::InvalidSchema,
			format!("field {}.{} is missing `{}`", msg, name, key),
		)
	})?;
	let raw = match raw {
		Value::String(s) => s.clone(),
		Value::Number(n) => n.to_string(),
		_ => {
			return Err(WireError::new(
				WireErrorCode::InvalidSchema,
				format!("field {}.{} has a non-scalar `{}`", msg, name, key),
			))
		},
	};
	FieldExpr::parse(&raw)
}

impl WireSchema {
	/// The built-in BOLT 1/2/7 message schema.
	pub fn bolt() -> &'static WireSchema {
		&BOLT_SCHEMA
	}

	/// Parses a schema document. Entries whose `type` is not numeric or whose
	/// payload is empty are skipped; duplicate type codes are rejected.
	pub fn from_json(doc: &str) -> Result<WireSchema, WireError> {
		let root: Value = serde_json::from_str(doc).map_err(|e| {
			WireError::new(WireErrorCode::InvalidSchema, format!("schema is not valid JSON: {}", e))
		})?;
		let root = root.as_object().ok_or_else(|| {
			WireError::new(WireErrorCode::InvalidSchema, "schema root must be an object")
		})?;

		let mut schema =
			WireSchema { messages: Vec::new(), by_name: HashMap::new(), by_type: HashMap::new() };

		for (msg_name, entry) in root {
			let type_code = match entry.get("type") {
				Some(Value::String(s)) => match s.parse::<u16>() {
					Ok(code) => code,
					Err(_) => continue,
				},
				Some(Value::Number(n)) => match n.as_u64() {
					Some(code) if code <= u64::from(u16::MAX) => code as u16,
					_ => continue,
				},
				_ => continue,
			};
			let payload = entry.get("payload").and_then(Value::as_object).ok_or_else(|| {
				WireError::new(
					WireErrorCode::InvalidSchema,
					format!("message {} has no payload object", msg_name),
				)
			})?;
			if payload.is_empty() {
				continue;
			}

			let mut fields = Vec::with_capacity(payload.len());
			for (field_name, field) in payload {
				fields.push(FieldSpec {
					name: field_name.clone(),
					position: expr_entry(field, field_name, msg_name, "position")?,
					length: expr_entry(field, field_name, msg_name, "length")?,
					feature: field.get("feature").is_some(),
				});
			}

			let index = schema.messages.len();
			if schema.by_type.insert(type_code, index).is_some() {
				return Err(WireError::new(
					WireErrorCode::InvalidSchema,
					format!("duplicate message type code {} ({})", type_code, msg_name),
				));
			}
			schema.by_name.insert(msg_name.clone(), index);
			schema.messages.push(MessageSpec { name: msg_name.clone(), type_code, fields });
		}

		Ok(schema)
	}

	/// Names of all loaded messages, in document order.
	pub fn message_names(&self) -> impl Iterator<Item = &str> {
		self.messages.iter().map(|m| m.name.as_str())
	}

	pub(crate) fn spec_by_type(&self, type_code: u16) -> Option<&MessageSpec> {
		self.by_type.get(&type_code).map(|&i| &self.messages[i])
	}

	pub(crate) fn spec_by_name(&self, name: &str) -> Option<&MessageSpec> {
		self.by_name.get(name).map(|&i| &self.messages[i])
	}
}
