// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Schema-driven message encoder/decoder.

use std::collections::HashMap;

use hex::DisplayHex;

use crate::error::{WireError, WireErrorCode};
use crate::expr::{be_int, EvalError};
use crate::schema::WireSchema;

/// A caller-supplied field value for encoding. Integers are laid out
/// big-endian at the width the schema computes for the field; byte values
/// must match that width exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
	Int(u64),
	Bytes(Vec<u8>),
}

impl From<u64> for FieldValue {
	fn from(v: u64) -> Self {
		FieldValue::Int(v)
	}
}

impl From<u32> for FieldValue {
	fn from(v: u32) -> Self {
		FieldValue::Int(u64::from(v))
	}
}

impl From<u16> for FieldValue {
	fn from(v: u16) -> Self {
		FieldValue::Int(u64::from(v))
	}
}

impl From<u8> for FieldValue {
	fn from(v: u8) -> Self {
		FieldValue::Int(u64::from(v))
	}
}

impl From<Vec<u8>> for FieldValue {
	fn from(v: Vec<u8>) -> Self {
		FieldValue::Bytes(v)
	}
}

impl From<&[u8]> for FieldValue {
	fn from(v: &[u8]) -> Self {
		FieldValue::Bytes(v.to_vec())
	}
}

impl<const N: usize> From<[u8; N]> for FieldValue {
	fn from(v: [u8; N]) -> Self {
		FieldValue::Bytes(v.to_vec())
	}
}

impl<const N: usize> From<&[u8; N]> for FieldValue {
	fn from(v: &[u8; N]) -> Self {
		FieldValue::Bytes(v.to_vec())
	}
}

/// Named values handed to [`WireSchema::encode`]. Fields absent from the set
/// default to integer zero.
#[derive(Debug, Clone, Default)]
pub struct MessageFields {
	entries: Vec<(String, FieldValue)>,
}

impl MessageFields {
	pub fn new() -> Self {
		MessageFields { entries: Vec::new() }
	}

	pub fn put(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
		self.entries.push((name.to_string(), value.into()));
		self
	}

	fn get(&self, name: &str) -> Option<&FieldValue> {
		self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
	}

	fn numeric(&self, name: &str) -> Option<Result<u64, EvalError>> {
		self.get(name).map(|v| match v {
			FieldValue::Int(n) => Ok(*n),
			FieldValue::Bytes(b) => be_int(b),
		})
	}
}

/// A decoded message: its schema name and the raw bytes of every field that
/// was present on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub name: String,
	pub fields: HashMap<String, Vec<u8>>,
}

impl Message {
	/// Builds an in-memory message that never crossed the wire, used to feed
	/// collaborator sinks with locally known data.
	pub fn synthetic(name: &str, fields: &[(&str, Vec<u8>)]) -> Message {
		Message {
			name: name.to_string(),
			fields: fields.iter().map(|(n, v)| (n.to_string(), v.clone())).collect(),
		}
	}

	pub fn has(&self, field: &str) -> bool {
		self.fields.contains_key(field)
	}

	pub fn bytes(&self, field: &str) -> Result<&[u8], WireError> {
		self.fields.get(field).map(|v| v.as_slice()).ok_or_else(|| {
			WireError::new(
				WireErrorCode::MalformedMessage,
				format!("{} is missing field {}", self.name, field),
			)
		})
	}

	/// The field's bytes read as a big-endian unsigned integer.
	pub fn int(&self, field: &str) -> Result<u64, WireError> {
		be_int(self.bytes(field)?).map_err(|_| {
			WireError::new(
				WireErrorCode::MalformedMessage,
				format!("{}.{} does not fit a 64-bit integer", self.name, field),
			)
		})
	}

	/// The field's bytes as a fixed-width array.
	pub fn array<const N: usize>(&self, field: &str) -> Result<[u8; N], WireError> {
		let bytes = self.bytes(field)?;
		bytes.try_into().map_err(|_| {
			WireError::new(
				WireErrorCode::MalformedMessage,
				format!("{}.{} is {} bytes, expected {}", self.name, field, bytes.len(), N),
			)
		})
	}
}

impl WireSchema {
	/// Decodes a complete wire message (2-byte type code plus payload).
	pub fn decode(&self, data: &[u8]) -> Result<Message, WireError> {
		if data.len() < 2 {
			return Err(WireError::new(
				WireErrorCode::MalformedMessage,
				format!("message too short: {} bytes", data.len()),
			));
		}
		let type_code = u16::from_be_bytes([data[0], data[1]]);
		let spec = self.spec_by_type(type_code).ok_or_else(|| {
			WireError::new(WireErrorCode::UnknownMessage, format!("unknown message type {}", type_code))
		})?;

		let payload = &data[2..];
		let mut fields: HashMap<String, Vec<u8>> = HashMap::with_capacity(spec.fields.len());
		let lookup = |fields: &HashMap<String, Vec<u8>>, name: &str| -> Option<u64> {
			fields.get(name).and_then(|b| be_int(b).ok())
		};

		let mut pos = 0usize;
		for field in &spec.fields {
			if field.feature && pos == payload.len() {
				continue;
			}
			let expected_pos = field.position.eval(&|name| lookup(&fields, name)).map_err(|e| {
				malformed_eval(&spec.name, &field.name, "position", e)
			})?;
			if pos as u64 != expected_pos {
				return Err(WireError::new(
					WireErrorCode::MalformedMessage,
					format!(
						"{}.{}: offset {} does not match declared position {}",
						spec.name, field.name, pos, expected_pos
					),
				));
			}
			let length = field.length.eval(&|name| lookup(&fields, name)).map_err(|e| {
				malformed_eval(&spec.name, &field.name, "length", e)
			})? as usize;
			let end = pos.checked_add(length).filter(|&end| end <= payload.len()).ok_or_else(|| {
				WireError::new(
					WireErrorCode::MalformedMessage,
					format!("{}.{} is truncated", spec.name, field.name),
				)
			})?;
			fields.insert(field.name.clone(), payload[pos..end].to_vec());
			pos = end;
		}

		if pos != payload.len() {
			return Err(WireError::new(
				WireErrorCode::MalformedMessage,
				format!("{}: {} trailing bytes after payload", spec.name, payload.len() - pos),
			));
		}
		Ok(Message { name: spec.name.clone(), fields })
	}

	/// Encodes named values into a complete wire message. Feature trailers
	/// are never emitted; unspecified integer fields default to zero.
	pub fn encode(&self, name: &str, values: &MessageFields) -> Result<Vec<u8>, WireError> {
		let spec = self.spec_by_name(name).ok_or_else(|| {
			WireError::new(WireErrorCode::UnknownMessage, format!("unknown message name {}", name))
		})?;

		let mut out = spec.type_code.to_be_bytes().to_vec();
		// Running environment of already-laid-out field byte lengths; caller
		// values take precedence when a length expression references them.
		let mut lengths: HashMap<String, u64> = HashMap::new();
		for field in &spec.fields {
			if field.feature {
				continue;
			}
			let from_lengths = field.length.eval(&|n| lengths.get(n).copied());
			let overlaid = field.length.eval(&|n| match values.numeric(n) {
				Some(Ok(v)) => Some(v),
				Some(Err(_)) => None,
				None => lengths.get(n).copied(),
			});
			let length = overlaid.or(from_lengths).map_err(|e| {
				WireError::new(
					WireErrorCode::EncodingError,
					format!("{}.{}: cannot compute length ({:?})", name, field.name, e),
				)
			})? as usize;

			let bytes = match values.get(&field.name) {
				Some(FieldValue::Bytes(b)) => {
					if b.len() != length {
						return Err(WireError::new(
							WireErrorCode::EncodingError,
							format!(
								"field {} is {} bytes long, should be {} bytes long",
								field.name,
								b.len(),
								length
							),
						));
					}
					b.clone()
				},
				Some(FieldValue::Int(v)) => int_to_width(*v, length).ok_or_else(|| {
					WireError::new(
						WireErrorCode::EncodingError,
						format!("{} = {} does not fit in {} bytes", field.name, v, length),
					)
				})?,
				None => int_to_width(0, length).expect("zero fits any width"),
			};
			lengths.insert(field.name.clone(), bytes.len() as u64);
			out.extend_from_slice(&bytes);
		}
		Ok(out)
	}
}

fn int_to_width(value: u64, width: usize) -> Option<Vec<u8>> {
	let be = value.to_be_bytes();
	if width >= 8 {
		let mut out = vec![0u8; width - 8];
		out.extend_from_slice(&be);
		return Some(out);
	}
	if be[..8 - width].iter().any(|&b| b != 0) {
		return None;
	}
	Some(be[8 - width..].to_vec())
}

fn malformed_eval(msg: &str, field: &str, what: &str, e: EvalError) -> WireError {
	WireError::new(
		WireErrorCode::MalformedMessage,
		format!("{}.{}: cannot evaluate {} ({:?})", msg, field, what, e),
	)
}

/// Formats a channel or payment identifier for diagnostics.
pub fn display_id(id: &[u8]) -> String {
	id.to_lower_hex_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn schema() -> &'static WireSchema {
		WireSchema::bolt()
	}

	#[test]
	fn test_encode_init() {
		let bytes = schema()
			.encode(
				"init",
				&MessageFields::new().put("gflen", 0u16).put("lflen", 1u16).put("localfeatures", 0x08u8),
			)
			.unwrap();
		assert_eq!(bytes, vec![0x00, 0x10, 0x00, 0x00, 0x00, 0x01, 0x08]);
	}

	#[test]
	fn test_decode_init_empty_features() {
		let msg = schema().decode(&[0x00, 0x10, 0x00, 0x00, 0x00, 0x00]).unwrap();
		assert_eq!(msg.name, "init");
		assert_eq!(msg.int("gflen").unwrap(), 0);
		assert_eq!(msg.int("lflen").unwrap(), 0);
		assert_eq!(msg.bytes("localfeatures").unwrap(), &[] as &[u8]);
	}

	#[test]
	fn test_init_round_trip() {
		let bytes = schema()
			.encode(
				"init",
				&MessageFields::new()
					.put("gflen", 2u16)
					.put("globalfeatures", vec![0xaa, 0xbb])
					.put("lflen", 1u16)
					.put("localfeatures", vec![0x08]),
			)
			.unwrap();
		let msg = schema().decode(&bytes).unwrap();
		assert_eq!(msg.bytes("globalfeatures").unwrap(), &[0xaa, 0xbb]);
		assert_eq!(msg.bytes("localfeatures").unwrap(), &[0x08]);
	}

	#[test]
	fn test_unknown_type_code() {
		let err = schema().decode(&[0xff, 0xfe, 0x00]).unwrap_err();
		assert_eq!(err.code, WireErrorCode::UnknownMessage);
	}

	#[test]
	fn test_trailing_bytes_rejected() {
		let err = schema().decode(&[0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x99]).unwrap_err();
		assert_eq!(err.code, WireErrorCode::MalformedMessage);
	}

	#[test]
	fn test_truncated_field_rejected() {
		// lflen promises one byte of localfeatures that never arrives.
		let err = schema().decode(&[0x00, 0x10, 0x00, 0x00, 0x00, 0x01]).unwrap_err();
		assert_eq!(err.code, WireErrorCode::MalformedMessage);
	}

	#[test]
	fn test_byte_field_width_mismatch() {
		let err = schema()
			.encode(
				"funding_signed",
				&MessageFields::new().put("channel_id", vec![0u8; 32]).put("signature", vec![0u8; 63]),
			)
			.unwrap_err();
		assert_eq!(err.code, WireErrorCode::EncodingError);
	}

	#[test]
	fn test_integer_overflow_rejected() {
		let err = schema()
			.encode("ping", &MessageFields::new().put("num_pong_bytes", 0x1_0000u64))
			.unwrap_err();
		assert_eq!(err.code, WireErrorCode::EncodingError);
	}

	#[test]
	fn test_unspecified_fields_default_to_zero() {
		// ping with byteslen 4 and no explicit `ignored` pads with zeros
		let bytes = schema()
			.encode("ping", &MessageFields::new().put("num_pong_bytes", 4u16).put("byteslen", 4u16))
			.unwrap();
		assert_eq!(bytes, vec![0x00, 0x12, 0x00, 0x04, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
	}

	#[test]
	fn test_commitment_signed_htlc_signature_width() {
		let sig = vec![0x11u8; 64];
		let htlc_sigs = vec![0x22u8; 128];
		let bytes = schema()
			.encode(
				"commitment_signed",
				&MessageFields::new()
					.put("channel_id", vec![0x07u8; 32])
					.put("signature", sig.clone())
					.put("num_htlcs", 2u16)
					.put("htlc_signature", htlc_sigs.clone()),
			)
			.unwrap();
		let msg = schema().decode(&bytes).unwrap();
		assert_eq!(msg.bytes("signature").unwrap(), sig.as_slice());
		assert_eq!(msg.bytes("htlc_signature").unwrap(), htlc_sigs.as_slice());
	}

	#[test]
	fn test_feature_trailer_skipped_when_absent() {
		// channel_reestablish without the optional per-commitment fields
		let bytes = schema()
			.encode(
				"channel_reestablish",
				&MessageFields::new()
					.put("channel_id", vec![0x01u8; 32])
					.put("next_local_commitment_number", 1u64)
					.put("next_remote_revocation_number", 0u64),
			)
			.unwrap();
		let msg = schema().decode(&bytes).unwrap();
		assert!(!msg.has("my_current_per_commitment_point"));
		assert_eq!(msg.int("next_local_commitment_number").unwrap(), 1);
	}

	#[test]
	fn test_feature_trailer_consumed_when_present() {
		let mut bytes = schema()
			.encode(
				"channel_reestablish",
				&MessageFields::new()
					.put("channel_id", vec![0x01u8; 32])
					.put("next_local_commitment_number", 1u64)
					.put("next_remote_revocation_number", 0u64),
			)
			.unwrap();
		bytes.extend_from_slice(&[0u8; 32]);
		bytes.extend_from_slice(&[0x02u8; 33]);
		let msg = schema().decode(&bytes).unwrap();
		assert_eq!(msg.bytes("your_last_per_commitment_secret").unwrap(), &[0u8; 32]);
		assert_eq!(msg.bytes("my_current_per_commitment_point").unwrap(), &[0x02u8; 33]);
	}

	#[test]
	fn test_round_trip_all_fixed_width_messages() {
		// Synthesizes a payload for every message whose fields have static
		// widths and checks the field map survives a round trip.
		for name in ["funding_signed", "funding_locked", "revoke_and_ack", "update_fee",
			"update_fulfill_htlc", "announcement_signatures", "channel_update"]
		{
			let spec_fields: Vec<(String, u64)> = {
				// Walk an encode of all-zero values to learn each field width.
				let encoded = schema().encode(name, &MessageFields::new()).unwrap();
				let msg = schema().decode(&encoded).unwrap();
				let mut widths: Vec<(String, u64)> =
					msg.fields.iter().map(|(n, v)| (n.clone(), v.len() as u64)).collect();
				widths.sort();
				widths
			};
			let mut values = MessageFields::new();
			for (i, (field, width)) in spec_fields.iter().enumerate() {
				values = values.put(field, vec![(i as u8) + 1; *width as usize]);
			}
			let encoded = schema().encode(name, &values).unwrap();
			let decoded = schema().decode(&encoded).unwrap();
			for (i, (field, width)) in spec_fields.iter().enumerate() {
				assert_eq!(
					decoded.bytes(field).unwrap(),
					vec![(i as u8) + 1; *width as usize].as_slice(),
					"{}.{}",
					name,
					field
				);
			}
		}
	}
}
