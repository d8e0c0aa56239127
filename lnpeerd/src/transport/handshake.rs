// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Noise_XK handshake, initiator side.
//!
//! Three acts over the Noise_XK pattern with secp256k1, ChaCha20-Poly1305
//! and SHA-256: act one sends our ephemeral key, act two receives the
//! responder's ephemeral key, act three sends our encrypted static key and
//! settles the transport keys. Any failure tears down the connection.

use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeerError, PeerErrorCode};
use crate::transport::TransportKeys;

const PROTOCOL_NAME: &[u8] = b"Noise_XK_secp256k1_ChaChaPoly_SHA256";
const PROLOGUE: &[u8] = b"lightning";
const HANDSHAKE_VERSION: u8 = 0x00;

pub(crate) const ACT_ONE_LEN: usize = 50;
pub(crate) const ACT_TWO_LEN: usize = 50;
pub(crate) const ACT_THREE_LEN: usize = 66;

/// The chaining key, running transcript hash, and the responder's static key.
struct HandshakeState {
	h: [u8; 32],
	ck: [u8; 32],
	responder_pub: PublicKey,
}

impl HandshakeState {
	fn new(responder_pub: PublicKey) -> HandshakeState {
		let h: [u8; 32] = Sha256::digest(PROTOCOL_NAME).into();
		let mut state = HandshakeState { h, ck: h, responder_pub };
		state.update(PROLOGUE);
		state.update(&responder_pub.serialize());
		state
	}

	fn update(&mut self, data: &[u8]) {
		let mut sha = Sha256::new();
		sha.update(self.h);
		sha.update(data);
		self.h = sha.finalize().into();
	}
}

/// BOLT 8 nonces: four zero bytes then the counter, little-endian.
pub(crate) fn nonce_bytes(n: u64) -> [u8; 12] {
	let mut nonce = [0u8; 12];
	nonce[4..].copy_from_slice(&n.to_le_bytes());
	nonce
}

pub(crate) fn aead_encrypt(key: &[u8; 32], n: u64, ad: &[u8], plaintext: &[u8]) -> Vec<u8> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
	cipher
		.encrypt(Nonce::from_slice(&nonce_bytes(n)), Payload { msg: plaintext, aad: ad })
		.expect("chacha20poly1305 encryption is infallible for in-memory buffers")
}

pub(crate) fn aead_decrypt(
	key: &[u8; 32], n: u64, ad: &[u8], ciphertext: &[u8],
) -> Result<Vec<u8>, PeerError> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
	cipher
		.decrypt(Nonce::from_slice(&nonce_bytes(n)), Payload { msg: ciphertext, aad: ad })
		.map_err(|_| PeerError::new(PeerErrorCode::AuthenticationFailure, "AEAD tag mismatch"))
}

/// HKDF extract-and-expand with empty info, split into two 32-byte halves.
pub(crate) fn hkdf_two(salt: &[u8], ikm: &[u8]) -> ([u8; 32], [u8; 32]) {
	let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
	let mut okm = [0u8; 64];
	hk.expand(&[], &mut okm).expect("64 bytes is a valid hkdf output length");
	let mut t1 = [0u8; 32];
	let mut t2 = [0u8; 32];
	t1.copy_from_slice(&okm[..32]);
	t2.copy_from_slice(&okm[32..]);
	(t1, t2)
}

/// In-progress initiator handshake. Act methods must be called in order.
pub(crate) struct InitiatorHandshake {
	state: HandshakeState,
	local_secret: SecretKey,
	ephemeral: SecretKey,
}

impl InitiatorHandshake {
	pub(crate) fn new(
		local_secret: SecretKey, responder_pub: PublicKey, ephemeral: SecretKey,
	) -> InitiatorHandshake {
		InitiatorHandshake { state: HandshakeState::new(responder_pub), local_secret, ephemeral }
	}

	pub(crate) fn act_one<C: Signing>(&mut self, secp: &Secp256k1<C>) -> [u8; ACT_ONE_LEN] {
		let epub = PublicKey::from_secret_key(secp, &self.ephemeral);
		self.state.update(&epub.serialize());
		let ss = SharedSecret::new(&self.state.responder_pub, &self.ephemeral);
		let (ck, temp_k1) = hkdf_two(&self.state.ck, &ss.secret_bytes());
		self.state.ck = ck;
		let c = aead_encrypt(&temp_k1, 0, &self.state.h, &[]);
		self.state.update(&c);

		let mut msg = [0u8; ACT_ONE_LEN];
		msg[0] = HANDSHAKE_VERSION;
		msg[1..34].copy_from_slice(&epub.serialize());
		msg[34..].copy_from_slice(&c);
		msg
	}

	/// Consumes the responder's act two and produces act three plus the
	/// settled transport keys.
	pub(crate) fn process_act_two<C: Signing>(
		mut self, secp: &Secp256k1<C>, act_two: &[u8; ACT_TWO_LEN],
	) -> Result<([u8; ACT_THREE_LEN], TransportKeys), PeerError> {
		if act_two[0] != HANDSHAKE_VERSION {
			return Err(PeerError::new(
				PeerErrorCode::AuthenticationFailure,
				format!("unknown handshake version {}", act_two[0]),
			));
		}
		let responder_ephemeral = PublicKey::from_slice(&act_two[1..34]).map_err(|_| {
			PeerError::new(PeerErrorCode::AuthenticationFailure, "invalid responder ephemeral key")
		})?;
		let tag = &act_two[34..];

		self.state.update(&responder_ephemeral.serialize());
		let ss = SharedSecret::new(&responder_ephemeral, &self.ephemeral);
		let (ck, temp_k2) = hkdf_two(&self.state.ck, &ss.secret_bytes());
		self.state.ck = ck;
		aead_decrypt(&temp_k2, 0, &self.state.h, tag)?;
		self.state.update(tag);

		// Act three: our encrypted static key, then the closing tag.
		let local_pub = PublicKey::from_secret_key(secp, &self.local_secret);
		let c = aead_encrypt(&temp_k2, 1, &self.state.h, &local_pub.serialize());
		self.state.update(&c);
		let ss = SharedSecret::new(&responder_ephemeral, &self.local_secret);
		let (ck, temp_k3) = hkdf_two(&self.state.ck, &ss.secret_bytes());
		self.state.ck = ck;
		let t = aead_encrypt(&temp_k3, 0, &self.state.h, &[]);
		let (sk, rk) = hkdf_two(&self.state.ck, &[]);

		let mut msg = [0u8; ACT_THREE_LEN];
		msg[0] = HANDSHAKE_VERSION;
		msg[1..50].copy_from_slice(&c);
		msg[50..].copy_from_slice(&t);

		let keys =
			TransportKeys { sk, rk, s_ck: self.state.ck, r_ck: self.state.ck };
		Ok((msg, keys))
	}
}

/// Runs the initiator handshake over `stream` with a fresh ephemeral key.
pub async fn initiator_handshake<S, C: Signing>(
	stream: &mut S, secp: &Secp256k1<C>, local_secret: &SecretKey, responder_pub: &PublicKey,
) -> Result<TransportKeys, PeerError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let ephemeral = SecretKey::new(&mut rand::thread_rng());
	let mut handshake = InitiatorHandshake::new(*local_secret, *responder_pub, ephemeral);

	let act_one = handshake.act_one(secp);
	stream.write_all(&act_one).await?;
	stream.flush().await?;

	let mut act_two = [0u8; ACT_TWO_LEN];
	stream.read_exact(&mut act_two).await.map_err(|e| {
		PeerError::new(
			PeerErrorCode::TransportClosed,
			format!("connection closed during handshake: {}", e),
		)
	})?;

	let (act_three, keys) = handshake.process_act_two(secp, &act_two)?;
	stream.write_all(&act_three).await?;
	stream.flush().await?;
	Ok(keys)
}

#[cfg(test)]
mod tests {
	use super::*;
	use hex::FromHex;

	fn secp() -> Secp256k1<bitcoin::secp256k1::All> {
		Secp256k1::new()
	}

	fn vectors() -> (SecretKey, SecretKey, PublicKey) {
		let local_secret = SecretKey::from_slice(
			&<[u8; 32]>::from_hex("1111111111111111111111111111111111111111111111111111111111111111")
				.unwrap(),
		)
		.unwrap();
		let ephemeral = SecretKey::from_slice(
			&<[u8; 32]>::from_hex("1212121212121212121212121212121212121212121212121212121212121212")
				.unwrap(),
		)
		.unwrap();
		let responder_pub = PublicKey::from_slice(
			&<[u8; 33]>::from_hex(
				"028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7",
			)
			.unwrap(),
		)
		.unwrap();
		(local_secret, ephemeral, responder_pub)
	}

	fn act_two_bytes() -> [u8; ACT_TWO_LEN] {
		<[u8; 50]>::from_hex(
			"0002466d7fcae563e5cb09a0d1870bb580344804617879a14949cf22285f1bae3f276e2470b93aac583c9ef6eafca3f730ae",
		)
		.unwrap()
	}

	#[test]
	fn test_initiator_transcript() {
		let (local_secret, ephemeral, responder_pub) = vectors();
		let mut handshake = InitiatorHandshake::new(local_secret, responder_pub, ephemeral);

		let act_one = handshake.act_one(&secp());
		assert_eq!(
			act_one.as_slice(),
			Vec::<u8>::from_hex(
				"00036360e856310ce5d294e8be33fc807077dc56ac80d95d9cd4ddbd21325eff73f70df6086551151f58b8afe6c195782c6a"
			)
			.unwrap()
			.as_slice()
		);

		let (act_three, keys) = handshake.process_act_two(&secp(), &act_two_bytes()).unwrap();
		assert_eq!(
			act_three.as_slice(),
			Vec::<u8>::from_hex(
				"00b9e3a702e93e3a9948c2ed6e5fd7590a6e1c3a0344cfc9d5b57357049aa22355361aa02e55a8fc28fef5bd6d71ad0c38228dc68b1c466263b47fdf31e560e139ba"
			)
			.unwrap()
			.as_slice()
		);

		assert_eq!(
			keys.sk,
			<[u8; 32]>::from_hex("969ab31b4d288cedf6218839b27a3e2140827047f2c0f01bf5c04435d43511a9")
				.unwrap()
		);
		assert_eq!(
			keys.rk,
			<[u8; 32]>::from_hex("bb9020b8965f4df047e07f955f3c4b88418984aadc5cdb35096b9ea8fa5c3442")
				.unwrap()
		);
		assert_eq!(keys.s_ck, keys.r_ck);
	}

	#[test]
	fn test_perturbed_act_two_fails() {
		let (local_secret, ephemeral, responder_pub) = vectors();
		for byte in [34, 42, 49] {
			let mut handshake =
				InitiatorHandshake::new(local_secret, responder_pub, ephemeral);
			handshake.act_one(&secp());
			let mut act_two = act_two_bytes();
			act_two[byte] ^= 0x01;
			let err = handshake.process_act_two(&secp(), &act_two).unwrap_err();
			assert_eq!(err.code, PeerErrorCode::AuthenticationFailure);
		}
	}

	#[test]
	fn test_bad_version_rejected() {
		let (local_secret, ephemeral, responder_pub) = vectors();
		let mut handshake = InitiatorHandshake::new(local_secret, responder_pub, ephemeral);
		handshake.act_one(&secp());
		let mut act_two = act_two_bytes();
		act_two[0] = 0x01;
		let err = handshake.process_act_two(&secp(), &act_two).unwrap_err();
		assert_eq!(err.code, PeerErrorCode::AuthenticationFailure);
	}

	#[test]
	fn test_nonce_layout() {
		let nonce = nonce_bytes(1);
		assert_eq!(nonce, [0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
	}

	#[test]
	fn test_hkdf_splits_sixty_four_bytes() {
		let (t1, t2) = hkdf_two(&[0u8; 32], &[1u8; 32]);
		assert_ne!(t1, t2);
		// Deterministic: same inputs, same halves.
		assert_eq!(hkdf_two(&[0u8; 32], &[1u8; 32]), (t1, t2));
	}
}
