// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Channel reestablishment after a reconnect.

use std::sync::Arc;

use lnpeerd_wire::MessageFields;

use crate::channel::{ChannelId, ChannelState};
use crate::error::{PeerError, PeerErrorCode};
use crate::peer::Peer;

/// Announces our commitment counters to the counterparty and waits for the
/// matching (validated) `channel_reestablish` before resuming the channel.
pub async fn reestablish_channel(peer: &Arc<Peer>, chan_id: ChannelId) -> Result<(), PeerError> {
	peer.await_initialized().await?;
	let chan_arc = peer.channel_or_violation(&chan_id, "reestablish")?;

	let (next_local_commitment_number, next_remote_revocation_number) = {
		let mut chan = chan_arc.lock().unwrap();
		chan.state = ChannelState::Reestablishing;
		((chan.local_state.ctn + 1) as u64, chan.remote_state.ctn as u64)
	};
	peer.ctx.network.channel_event(&chan_arc.lock().unwrap());

	let pending = peer.expect_reestablish(chan_id);
	peer.send_message(
		"channel_reestablish",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("next_local_commitment_number", next_local_commitment_number)
			.put("next_remote_revocation_number", next_remote_revocation_number),
	)
	.await?;
	if let Some(rx) = pending {
		rx.await.map_err(|_| {
			PeerError::new(PeerErrorCode::TransportClosed, "connection closed during reestablish")
		})?;
	}

	let ready = {
		let mut chan = chan_arc.lock().unwrap();
		chan.state = ChannelState::Opening;
		chan.local_state.funding_locked_received && chan.short_channel_id.is_some()
	};
	if ready {
		peer.mark_open(&chan_arc)?;
	}
	peer.ctx.network.channel_event(&chan_arc.lock().unwrap());
	Ok(())
}
