// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Channel key families and per-commitment secret derivation.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerErrorCode};

/// Derivation families for channel-level keys, matching the keystore layout
/// used when opening a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
	Multisig = 0,
	RevocationBase = 1,
	HtlcBase = 2,
	PaymentBase = 3,
	DelayBase = 4,
	RevocationRoot = 5,
}

/// A basepoint we hold both halves of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
	pub privkey: SecretKey,
	pub pubkey: PublicKey,
}

impl Keypair {
	pub fn new<C: Signing>(secp: &Secp256k1<C>, privkey: SecretKey) -> Keypair {
		Keypair { privkey, pubkey: PublicKey::from_secret_key(secp, &privkey) }
	}
}

/// Index of the first commitment's per-commitment secret. Later commitments
/// count down from here.
pub const FIRST_PER_COMMITMENT_INDEX: u64 = (1 << 48) - 1;

/// Derives the per-commitment secret for `index` from the commitment seed:
/// for every set bit of the 48-bit index, from high to low, flip that bit in
/// the running value and hash it.
pub fn per_commitment_secret_from_seed(seed: &[u8; 32], index: u64) -> [u8; 32] {
	let mut res = *seed;
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx_bit(index, bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = sha256::Hash::hash(&res).to_byte_array();
		}
	}
	res
}

fn idx_bit(index: u64, bitpos: usize) -> bool {
	index & (1 << bitpos) != 0
}

/// The per-commitment point for a per-commitment secret.
pub fn secret_to_pubkey<C: Signing>(
	secp: &Secp256k1<C>, secret: &[u8; 32],
) -> Result<PublicKey, PeerError> {
	let key = SecretKey::from_slice(secret).map_err(|_| {
		PeerError::new(PeerErrorCode::InternalError, "per-commitment secret is not a valid scalar")
	})?;
	Ok(PublicKey::from_secret_key(secp, &key))
}
