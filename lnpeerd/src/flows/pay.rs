// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! End-to-end HTLC payment along a route.

use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use hex::DisplayHex;
use lnpeerd_wire::{Message, MessageFields};
use rand::RngCore;

use crate::channel::{ChannelId, ChannelState, Htlc};
use crate::error::{PeerError, PeerErrorCode};
use crate::external::HopData;
use crate::flows::{drain_htlc_commitments, next_message, receive_revoke, revoke};
use crate::peer::{Peer, ResponseKind, RouteAttempt};

/// Sends an HTLC along `path`, drives the commitment/revocation exchange,
/// and races the counterparty's fulfill against its failure. On success the
/// preimage is returned as hex; an HTLC failure surfaces as
/// [`PeerErrorCode::HtlcFailure`] with the user-visible failure string.
pub async fn pay(
	peer: &Arc<Peer>, path: &[PublicKey], chan_id: ChannelId, amount_msat: u64,
	payment_hash: [u8; 32], min_final_cltv_expiry: u32,
) -> Result<String, PeerError> {
	let chan_arc = peer.channel_or_violation(&chan_id, "pay")?;
	if chan_arc.lock().unwrap().state != ChannelState::Open {
		return Err(PeerError::new(PeerErrorCode::ProtocolViolation, "channel is not open"));
	}
	if amount_msat == 0 {
		return Err(PeerError::new(PeerErrorCode::InternalError, "amount_msat is zero"));
	}

	let height = peer.ctx.network.local_height();
	let route = peer.ctx.router.create_route_from_path(path, &peer.node_pubkey)?;
	if route.is_empty() {
		return Err(PeerError::new(PeerErrorCode::InternalError, "empty route"));
	}

	// Fees and expiries accumulate backward over the forwarding hops; the
	// final hop gets the bare expiry, the HTLC itself carries the total.
	let sum_of_deltas: u32 =
		route[1..].iter().map(|edge| u32::from(edge.policy.cltv_expiry_delta)).sum();
	let final_cltv_expiry_without_deltas = height + min_final_cltv_expiry;
	let final_cltv_expiry_with_deltas = final_cltv_expiry_without_deltas + sum_of_deltas;
	let mut total_fee: u64 = 0;
	let mut hops_data = Vec::with_capacity(route.len());
	for edge in &route[1..] {
		hops_data.push(HopData {
			short_channel_id: edge.short_channel_id,
			amount_msat,
			cltv_expiry: final_cltv_expiry_without_deltas,
		});
		total_fee += edge.policy.fee_base_msat
			+ amount_msat * edge.policy.fee_proportional_millionths / 1_000_000;
	}
	hops_data.push(HopData {
		short_channel_id: [0u8; 8],
		amount_msat,
		cltv_expiry: final_cltv_expiry_without_deltas,
	});

	let mut session_key = [0u8; 32];
	rand::thread_rng().fill_bytes(&mut session_key);
	let hop_nodes: Vec<PublicKey> = route.iter().map(|edge| edge.node_id).collect();
	let onion =
		peer.ctx.router.new_onion_packet(&hop_nodes, &session_key, &hops_data, &payment_hash)?;

	let (msat_local, msat_remote, htlc_id) = {
		let chan = chan_arc.lock().unwrap();
		let msat_local = chan
			.local_state
			.amount_msat
			.checked_sub(amount_msat + total_fee)
			.ok_or_else(|| {
				PeerError::new(PeerErrorCode::InternalError, "insufficient local balance")
			})?;
		(
			msat_local,
			chan.remote_state.amount_msat + (amount_msat + total_fee),
			chan.local_state.next_htlc_id,
		)
	};
	let htlc = Htlc {
		amount_msat,
		payment_hash,
		cltv_expiry: final_cltv_expiry_with_deltas,
		total_fee,
	};

	let mut revoke_rx = peer.subscribe(ResponseKind::RevokeAndAck, chan_id);
	let mut commitment_rx = peer.subscribe(ResponseKind::CommitmentSigned, chan_id);
	let mut fulfill_rx = peer.subscribe(ResponseKind::UpdateFulfillHtlc, chan_id);
	let mut failure_rx = peer.subscribe_failures(chan_id);

	peer.send_message(
		"update_add_htlc",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("id", htlc_id)
			.put("amount_msat", amount_msat + total_fee)
			.put("payment_hash", payment_hash)
			.put("cltv_expiry", final_cltv_expiry_with_deltas)
			.put("onion_routing_packet", onion),
	)
	.await?;

	let assigned_id = {
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.add_htlc(&mut chan, &htlc)?
	};
	peer.attempted_routes
		.lock()
		.unwrap()
		.insert((chan_id, assigned_id), RouteAttempt { route, session_key });

	send_commitment(peer, &chan_arc, chan_id).await?;
	receive_revoke(peer, &chan_arc, &mut revoke_rx).await?;
	revoke(peer, &chan_arc).await?;

	enum Outcome {
		Fulfilled(Message),
		Failed(String),
	}
	let outcome = tokio::select! {
		msg = fulfill_rx.recv() => Outcome::Fulfilled(msg.ok_or_else(closed)?),
		reason = failure_rx.recv() => Outcome::Failed(reason.ok_or_else(closed)?),
	};

	match outcome {
		Outcome::Failed(reason) => {
			// Re-sign with the HTLC still present, let the counterparty's
			// htlcless commitments drain, then remove the HTLC and settle
			// the final state.
			let (signature, htlc_signatures) = {
				let mut chan = chan_arc.lock().unwrap();
				peer.ctx.commitment.sign_next_commitment(&mut chan)?
			};
			let htlc_signature = htlc_signatures.into_iter().next().ok_or_else(|| {
				PeerError::new(PeerErrorCode::InternalError, "commitment lost its HTLC signature")
			})?;
			peer.send_message(
				"commitment_signed",
				&MessageFields::new()
					.put("channel_id", chan_id)
					.put("signature", signature)
					.put("num_htlcs", 1u16)
					.put("htlc_signature", htlc_signature),
			)
			.await?;
			drain_htlc_commitments(peer, &chan_arc, &mut commitment_rx).await?;
			receive_revoke(peer, &chan_arc, &mut revoke_rx).await?;
			{
				let mut chan = chan_arc.lock().unwrap();
				peer.ctx.commitment.fail_htlc(&mut chan, &htlc)?;
			}
			send_commitment(peer, &chan_arc, chan_id).await?;
			receive_revoke(peer, &chan_arc, &mut revoke_rx).await?;
			{
				let chan = chan_arc.lock().unwrap();
				peer.save_channel_record(&chan)?;
			}
			Err(PeerError::new(PeerErrorCode::HtlcFailure, reason))
		},
		Outcome::Fulfilled(fulfill) => {
			let preimage: [u8; 32] = fulfill.array("payment_preimage")?;
			{
				let mut chan = chan_arc.lock().unwrap();
				peer.ctx.commitment.receive_htlc_settle(&mut chan, &preimage, fulfill.int("id")?)?;
			}
			drain_htlc_commitments(peer, &chan_arc, &mut commitment_rx).await?;
			revoke(peer, &chan_arc).await?;

			// A fresh commitment with no HTLCs reflecting the new balances.
			let signature = {
				let chan = chan_arc.lock().unwrap();
				let bare_commitment = peer.ctx.commitment.make_commitment(
					&chan,
					chan.remote_state.ctn + 1,
					false,
					&chan.remote_state.next_per_commitment_point,
					msat_remote,
					msat_local,
				)?;
				peer.ctx.commitment.sign_commitment_transaction(&chan, &bare_commitment)?
			};
			peer.send_message(
				"commitment_signed",
				&MessageFields::new()
					.put("channel_id", chan_id)
					.put("signature", signature)
					.put("num_htlcs", 0u16),
			)
			.await?;
			receive_revoke(peer, &chan_arc, &mut revoke_rx).await?;
			{
				let chan = chan_arc.lock().unwrap();
				peer.save_channel_record(&chan)?;
			}
			Ok(preimage.to_lower_hex_string())
		},
	}
}

async fn send_commitment(
	peer: &Peer, chan_arc: &Arc<std::sync::Mutex<crate::channel::Channel>>, chan_id: ChannelId,
) -> Result<(), PeerError> {
	let (signature, htlc_signatures) = {
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.sign_next_commitment(&mut chan)?
	};
	let htlc_signature: Vec<u8> = htlc_signatures.concat();
	peer.send_message(
		"commitment_signed",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("signature", signature)
			.put("num_htlcs", (htlc_signature.len() / 64) as u16)
			.put("htlc_signature", htlc_signature),
	)
	.await
}

fn closed() -> PeerError {
	PeerError::new(PeerErrorCode::TransportClosed, "peer connection closed mid-exchange")
}
