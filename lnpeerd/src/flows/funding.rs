// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Funding lock: announcing that our side considers the funding confirmed.

use std::sync::Arc;

use lnpeerd_wire::MessageFields;

use crate::channel::ChannelId;
use crate::error::PeerError;
use crate::keys::{per_commitment_secret_from_seed, secret_to_pubkey, FIRST_PER_COMMITMENT_INDEX};
use crate::peer::Peer;

/// Sends `funding_locked` carrying the second per-commitment point. If the
/// counterparty's lock already arrived, the channel transitions to OPEN.
pub async fn funding_locked(peer: &Arc<Peer>, chan_id: ChannelId) -> Result<(), PeerError> {
	let chan_arc = peer.channel_or_violation(&chan_id, "funding_locked")?;
	let (seed, locked_received) = {
		let chan = chan_arc.lock().unwrap();
		(chan.local_state.per_commitment_secret_seed, chan.local_state.funding_locked_received)
	};
	let second_secret =
		per_commitment_secret_from_seed(&seed, FIRST_PER_COMMITMENT_INDEX - 1);
	let per_commitment_point_second = secret_to_pubkey(&peer.secp, &second_secret)?;

	peer.send_message(
		"funding_locked",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("next_per_commitment_point", per_commitment_point_second.serialize()),
	)
	.await?;

	if locked_received {
		peer.mark_open(&chan_arc)?;
	}
	Ok(())
}
