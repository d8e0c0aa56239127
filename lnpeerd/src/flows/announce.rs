// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Public channel announcement once the funding output is buried.

use std::sync::Arc;

use lnpeerd_wire::{Message, MessageFields};
use log::info;
use tokio::sync::mpsc;

use crate::channel::ChannelId;
use crate::error::{PeerError, PeerErrorCode};
use crate::flows::next_message;
use crate::peer::Peer;

/// Exchanges `announcement_signatures` with the counterparty, verifies both
/// of their signatures over the shared digest, and emits the final
/// `channel_announcement` with node ids sorted lexicographically (bitcoin
/// keys swapped in lockstep). A bad remote signature aborts only this
/// announcement.
pub(crate) async fn handle_announcements(
	peer: &Arc<Peer>, chan_id: ChannelId,
	mut signatures_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
	let chan_arc = peer.channel_or_violation(&chan_id, "announcement")?;

	let (digest, local_node_sig, local_bitcoin_sig) =
		peer.send_announcement_signatures(&chan_arc).await?;

	// The counterparty may have announced first, in which case its
	// signatures were kept aside by the dispatch loop.
	let theirs = match peer.take_announcement_backlog(&chan_id) {
		Some(msg) => msg,
		None => next_message(&mut signatures_rx).await?,
	};
	let remote_node_sig = theirs.bytes("node_signature")?.to_vec();
	let remote_bitcoin_sig = theirs.bytes("bitcoin_signature")?.to_vec();

	let (remote_multisig, local_multisig, short_channel_id) = {
		let chan = chan_arc.lock().unwrap();
		let scid = chan.short_channel_id.ok_or_else(|| {
			PeerError::new(PeerErrorCode::ProtocolViolation, "announcing unconfirmed channel")
		})?;
		(chan.remote_config.multisig_key, chan.local_config.multisig_key.pubkey, scid)
	};
	peer.verify_announcement_signature(&remote_multisig, &remote_bitcoin_sig, &digest, "bitcoin_sig")?;
	peer.verify_announcement_signature(&peer.remote_pubkey, &remote_node_sig, &digest, "node_sig")?;

	let mut node_sigs = [local_node_sig, remote_node_sig];
	let mut bitcoin_sigs = [local_bitcoin_sig, remote_bitcoin_sig];
	let mut node_ids = [peer.node_pubkey.serialize(), peer.remote_pubkey.serialize()];
	let mut bitcoin_keys = [local_multisig.serialize(), remote_multisig.serialize()];
	if node_ids[0] > node_ids[1] {
		node_sigs.swap(0, 1);
		bitcoin_sigs.swap(0, 1);
		node_ids.swap(0, 1);
		bitcoin_keys.swap(0, 1);
	}

	peer.send_message(
		"channel_announcement",
		&MessageFields::new()
			.put("node_signatures_1", node_sigs[0].as_slice())
			.put("node_signatures_2", node_sigs[1].as_slice())
			.put("bitcoin_signature_1", bitcoin_sigs[0].as_slice())
			.put("bitcoin_signature_2", bitcoin_sigs[1].as_slice())
			.put("len", 0u16)
			.put("chain_hash", peer.chain_hash)
			.put("short_channel_id", short_channel_id)
			.put("node_id_1", node_ids[0])
			.put("node_id_2", node_ids[1])
			.put("bitcoin_key_1", bitcoin_keys[0])
			.put("bitcoin_key_2", bitcoin_keys[1]),
	)
	.await?;

	info!("[{}] sent channel announcement", peer.host);
	Ok(())
}
