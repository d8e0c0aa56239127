// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The persisted channel record and its derived identifiers.

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2};
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::keys::Keypair;

pub type ChannelId = [u8; 32];
pub type ShortChannelId = [u8; 8];

/// Lifecycle tag of a channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
	Opening,
	Reestablishing,
	Open,
}

/// Channel-level parameters fixed at open. `K` is [`Keypair`] for our side
/// and [`PublicKey`] for the counterparty, whose secret halves we never see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig<K> {
	pub payment_basepoint: K,
	pub multisig_key: K,
	pub htlc_basepoint: K,
	pub delayed_basepoint: K,
	pub revocation_basepoint: K,
	pub to_self_delay: u16,
	pub dust_limit_sat: u64,
	pub max_htlc_value_in_flight_msat: u64,
	pub max_accepted_htlcs: u16,
}

pub type LocalConfig = ChannelConfig<Keypair>;
pub type RemoteConfig = ChannelConfig<PublicKey>;

/// Our side of the commitment state. `ctn` starts at -1 and becomes 0 once
/// the funding_signed exchange completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalState {
	pub ctn: i64,
	pub per_commitment_secret_seed: [u8; 32],
	pub amount_msat: u64,
	pub next_htlc_id: u64,
	pub funding_locked_received: bool,
	pub was_announced: bool,
	pub current_commitment_signature: Option<Vec<u8>>,
	pub feerate: u32,
}

/// The counterparty's side of the commitment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteState {
	pub ctn: i64,
	pub next_per_commitment_point: PublicKey,
	pub current_per_commitment_point: Option<PublicKey>,
	pub amount_msat: u64,
	pub next_htlc_id: u64,
	pub feerate: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelConstraints {
	pub capacity_sat: u64,
	pub is_initiator: bool,
	pub funding_txn_minimum_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingOutpoint {
	pub txid: Txid,
	pub output_index: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
	pub node_id: PublicKey,
	pub channel_id: ChannelId,
	pub short_channel_id: Option<ShortChannelId>,
	pub funding_outpoint: FundingOutpoint,
	pub local_config: LocalConfig,
	pub remote_config: RemoteConfig,
	pub local_state: LocalState,
	pub remote_state: RemoteState,
	pub constraints: ChannelConstraints,
	pub state: ChannelState,
}

/// An HTLC as handed to the commitment engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
	pub amount_msat: u64,
	pub payment_hash: [u8; 32],
	pub cltv_expiry: u32,
	pub total_fee: u64,
}

/// The revocation material exchanged in `revoke_and_ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
	pub per_commitment_secret: [u8; 32],
	pub next_per_commitment_point: PublicKey,
}

/// Derives the 32-byte channel id from the funding outpoint.
///
/// The reversed txid is read as one big-endian integer and XORed with the
/// funding output index, so only the low bytes of the last word differ from
/// the reversed txid. Returns the id and the reversed txid bytes used on the
/// wire in `funding_created`.
pub fn channel_id_from_funding_tx(txid: &Txid, funding_index: u16) -> (ChannelId, [u8; 32]) {
	let txid_reversed = txid.to_byte_array();
	let mut channel_id = txid_reversed;
	let index_be = funding_index.to_be_bytes();
	channel_id[30] ^= index_be[0];
	channel_id[31] ^= index_be[1];
	(channel_id, txid_reversed)
}

/// The 2-of-2 multisig witness script of the funding output, keys sorted
/// ascending by their compressed serialization.
pub fn funding_output_script(local: &LocalConfig, remote: &RemoteConfig) -> ScriptBuf {
	let mut pubkeys = [local.multisig_key.pubkey.serialize(), remote.multisig_key.serialize()];
	pubkeys.sort();
	Builder::new()
		.push_opcode(OP_PUSHNUM_2)
		.push_slice(pubkeys[0])
		.push_slice(pubkeys[1])
		.push_opcode(OP_PUSHNUM_2)
		.push_opcode(OP_CHECKMULTISIG)
		.into_script()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn test_channel_id_round_trip() {
		let txid =
			Txid::from_str("8984484a580b825b9972d7adb15050b3ab624ccd731946b3eeddb92f4e7ef6be")
				.unwrap();
		let (id_a, reversed) = channel_id_from_funding_tx(&txid, 17);
		let (id_b, _) = channel_id_from_funding_tx(&txid, 17);
		assert_eq!(id_a, id_b);
		// Only the trailing bytes differ from the reversed txid.
		assert_eq!(id_a[..30], reversed[..30]);
		assert_eq!(id_a[30], reversed[30]);
		assert_eq!(id_a[31], reversed[31] ^ 17);
	}

	#[test]
	fn test_channel_id_zero_index_is_reversed_txid() {
		let txid =
			Txid::from_str("8984484a580b825b9972d7adb15050b3ab624ccd731946b3eeddb92f4e7ef6be")
				.unwrap();
		let (id, reversed) = channel_id_from_funding_tx(&txid, 0);
		assert_eq!(id, reversed);
		// The display txid is byte-reversed on the wire.
		assert_eq!(reversed[0], 0xbe);
		assert_eq!(reversed[31], 0x89);
	}
}
