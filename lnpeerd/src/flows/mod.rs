// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Channel lifecycle flows.
//!
//! Each flow is one cooperative task driving a single channel; it owns no
//! shared mutable state beyond the channel record, suspends only on
//! pending-exchange queues and collaborator I/O, and emits its outbound
//! messages in protocol order.

pub(crate) mod announce;
pub mod funding;
pub mod open;
pub mod pay;
pub(crate) mod receive;
pub mod reestablish;

use std::sync::{Arc, Mutex as StdMutex};

use bitcoin::secp256k1::PublicKey;
use lnpeerd_wire::{Message, MessageFields};
use tokio::sync::mpsc;

use crate::channel::{Channel, Revocation};
use crate::error::{PeerError, PeerErrorCode};
use crate::peer::Peer;

/// Receives the next entry of a pending-exchange queue; the queue dies with
/// the connection.
pub(crate) async fn next_message<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T, PeerError> {
	rx.recv().await.ok_or_else(|| {
		PeerError::new(PeerErrorCode::TransportClosed, "peer connection closed mid-exchange")
	})
}

pub(crate) fn parse_point(bytes: &[u8]) -> Result<PublicKey, PeerError> {
	PublicKey::from_slice(bytes).map_err(|_| {
		PeerError::new(PeerErrorCode::MalformedMessage, "invalid compressed public key")
	})
}

/// Awaits the counterparty's `revoke_and_ack` and applies it.
pub(crate) async fn receive_revoke(
	peer: &Peer, chan_arc: &Arc<StdMutex<Channel>>,
	revoke_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
	let msg = next_message(revoke_rx).await?;
	let revocation = Revocation {
		per_commitment_secret: msg.array("per_commitment_secret")?,
		next_per_commitment_point: parse_point(msg.bytes("next_per_commitment_point")?)?,
	};
	let mut chan = chan_arc.lock().unwrap();
	peer.ctx.commitment.receive_revocation(&mut chan, &revocation)
}

/// Revokes our current commitment and sends the `revoke_and_ack`.
pub(crate) async fn revoke(peer: &Peer, chan_arc: &Arc<StdMutex<Channel>>) -> Result<(), PeerError> {
	let (chan_id, revocation) = {
		let mut chan = chan_arc.lock().unwrap();
		let revocation = peer.ctx.commitment.revoke_current_commitment(&mut chan)?;
		(chan.channel_id, revocation)
	};
	peer.send_message(
		"revoke_and_ack",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("per_commitment_secret", revocation.per_commitment_secret)
			.put("next_per_commitment_point", revocation.next_per_commitment_point.serialize()),
	)
	.await
}

/// Awaits a `commitment_signed`, applies it, and returns how many HTLC
/// signatures it carried.
pub(crate) async fn receive_commitment(
	peer: &Peer, chan_arc: &Arc<StdMutex<Channel>>,
	commitment_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<usize, PeerError> {
	let msg = next_message(commitment_rx).await?;
	let htlc_sig_blob = msg.bytes("htlc_signature")?;
	let htlc_signatures: Vec<Vec<u8>> =
		htlc_sig_blob.chunks(64).map(|chunk| chunk.to_vec()).collect();
	let mut chan = chan_arc.lock().unwrap();
	peer.ctx.commitment.receive_new_commitment(&mut chan, msg.bytes("signature")?, &htlc_signatures)?;
	Ok(htlc_signatures.len())
}

/// Consumes queued `commitment_signed` messages until one with no HTLC
/// signatures arrives, revoking once per intervening commitment.
pub(crate) async fn drain_htlc_commitments(
	peer: &Peer, chan_arc: &Arc<StdMutex<Channel>>,
	commitment_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
	loop {
		let msg = next_message(commitment_rx).await?;
		if msg.bytes("htlc_signature")?.is_empty() {
			return Ok(());
		}
		revoke(peer, chan_arc).await?;
	}
}
