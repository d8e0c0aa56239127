// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Encrypted, length-framed message transport over an established Noise
//! session.
//!
//! Every message is two AEAD frames: an 18-byte encrypted big-endian length
//! and the payload plus its 16-byte tag. Each direction keeps its own key,
//! chaining key and nonce counter; after the 1000th use of a key, both the
//! key and its chain are replaced via HKDF and the counter resets.

pub mod handshake;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeerError, PeerErrorCode};
use self::handshake::{aead_decrypt, aead_encrypt, hkdf_two};

/// Nonce uses of a key before it is rotated.
pub(crate) const KEY_ROTATION_INTERVAL: u64 = 1000;

/// Maximum Lightning message length (BOLT 8 limits the length prefix to 16
/// bits).
pub(crate) const MAX_MSG_LEN: usize = u16::MAX as usize;

const LENGTH_FRAME_LEN: usize = 18;
const TAG_LEN: usize = 16;

/// The four 32-byte values settled by the handshake. Counters start at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportKeys {
	pub sk: [u8; 32],
	pub rk: [u8; 32],
	pub s_ck: [u8; 32],
	pub r_ck: [u8; 32],
}

/// One direction's key, chaining key and nonce counter.
#[derive(Debug, Clone)]
pub(crate) struct DirectionalState {
	key: [u8; 32],
	chain: [u8; 32],
	counter: u64,
}

impl DirectionalState {
	pub(crate) fn new(key: [u8; 32], chain: [u8; 32]) -> DirectionalState {
		DirectionalState { key, chain, counter: 0 }
	}

	/// Returns the (nonce, key) pair for the next AEAD operation and
	/// advances the counter, rotating the key after its 1000th use.
	pub(crate) fn next_nonce(&mut self) -> (u64, [u8; 32]) {
		let out = (self.counter, self.key);
		self.counter += 1;
		if self.counter == KEY_ROTATION_INTERVAL {
			let (chain, key) = hkdf_two(&self.chain, &self.key);
			self.chain = chain;
			self.key = key;
			self.counter = 0;
		}
		out
	}

	#[cfg(test)]
	pub(crate) fn counter(&self) -> u64 {
		self.counter
	}

	#[cfg(test)]
	pub(crate) fn key(&self) -> [u8; 32] {
		self.key
	}
}

/// The sending half of the transport.
pub struct MessageWriter<W> {
	inner: W,
	state: DirectionalState,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
	/// Encrypts and writes one message as its two frames.
	pub async fn write_message(&mut self, msg: &[u8]) -> Result<(), PeerError> {
		if msg.len() > MAX_MSG_LEN {
			return Err(PeerError::new(
				PeerErrorCode::InternalError,
				format!("outbound message of {} bytes exceeds the 65535-byte limit", msg.len()),
			));
		}
		let (n, key) = self.state.next_nonce();
		let length_frame = aead_encrypt(&key, n, &[], &(msg.len() as u16).to_be_bytes());
		let (n, key) = self.state.next_nonce();
		let payload_frame = aead_encrypt(&key, n, &[], msg);

		let mut out = Vec::with_capacity(length_frame.len() + payload_frame.len());
		out.extend_from_slice(&length_frame);
		out.extend_from_slice(&payload_frame);
		self.inner.write_all(&out).await?;
		self.inner.flush().await?;
		Ok(())
	}
}

/// The receiving half of the transport.
pub struct MessageReader<R> {
	inner: R,
	state: DirectionalState,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
	/// Reads and decrypts one message, blocking until both frames arrive.
	pub async fn read_message(&mut self) -> Result<Vec<u8>, PeerError> {
		let mut length_frame = [0u8; LENGTH_FRAME_LEN];
		read_exact_or_closed(&mut self.inner, &mut length_frame).await?;
		let (n, key) = self.state.next_nonce();
		let length_bytes = aead_decrypt(&key, n, &[], &length_frame)?;
		let length = u16::from_be_bytes([length_bytes[0], length_bytes[1]]) as usize;

		let mut payload_frame = vec![0u8; length + TAG_LEN];
		read_exact_or_closed(&mut self.inner, &mut payload_frame).await?;
		let (n, key) = self.state.next_nonce();
		aead_decrypt(&key, n, &[], &payload_frame)
	}
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
	inner: &mut R, buf: &mut [u8],
) -> Result<(), PeerError> {
	inner.read_exact(buf).await.map(|_| ()).map_err(|e| {
		PeerError::new(PeerErrorCode::TransportClosed, format!("peer connection closed: {}", e))
	})
}

/// Wraps stream halves with the directional key state from a completed
/// handshake.
pub fn framed<R, W>(reader: R, writer: W, keys: TransportKeys) -> (MessageReader<R>, MessageWriter<W>)
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	(
		MessageReader { inner: reader, state: DirectionalState::new(keys.rk, keys.r_ck) },
		MessageWriter { inner: writer, state: DirectionalState::new(keys.sk, keys.s_ck) },
	)
}

/// Mirror of `keys` as seen from the counterparty, used to drive the remote
/// end of a connection in tests.
#[cfg(test)]
pub(crate) fn mirrored(keys: &TransportKeys) -> TransportKeys {
	TransportKeys { sk: keys.rk, rk: keys.sk, s_ck: keys.r_ck, r_ck: keys.s_ck }
}
