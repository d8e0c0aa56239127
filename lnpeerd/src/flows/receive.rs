// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Receiving an HTLC paying one of our invoices, as the end node.

use std::sync::Arc;

use lnpeerd_wire::{Message, MessageFields};
use tokio::sync::mpsc;

use crate::channel::{ChannelId, ChannelState, Htlc};
use crate::error::{PeerError, PeerErrorCode};
use crate::external::Invoice;
use crate::flows::{receive_commitment, receive_revoke, revoke};
use crate::peer::Peer;

/// Drives the receiver side of an HTLC settlement: verify the HTLC against
/// the invoice, exchange commitments and revocations, reveal the preimage,
/// and settle the final htlcless state. The channel is persisted after every
/// state-changing step.
pub(crate) async fn receive_commitment_revoke_ack(
	peer: &Arc<Peer>, add_htlc: Message, invoice: Invoice,
	mut commitment_rx: mpsc::UnboundedReceiver<Message>,
	mut revoke_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
	let chan_id: ChannelId = add_htlc.array("channel_id")?;
	let chan_arc = peer.channel_or_violation(&chan_id, "update_add_htlc")?;

	let htlc_id = add_htlc.int("id")?;
	let amount_msat = add_htlc.int("amount_msat")?;
	let cltv_expiry = add_htlc.int("cltv_expiry")? as u32;
	let payment_hash: [u8; 32] = add_htlc.array("payment_hash")?;

	{
		let chan = chan_arc.lock().unwrap();
		if chan.state != ChannelState::Open {
			return Err(violation("HTLC on a channel that is not open"));
		}
		if htlc_id != chan.remote_state.next_htlc_id {
			return Err(violation(format!(
				"unexpected htlc id {}, expected {}",
				htlc_id, chan.remote_state.next_htlc_id
			)));
		}
	}
	if amount_msat != invoice.amount_msat {
		return Err(violation(format!(
			"HTLC amount {} does not match invoiced amount {}",
			amount_msat, invoice.amount_msat
		)));
	}

	let htlc = Htlc { amount_msat, payment_hash, cltv_expiry, total_fee: 0 };
	{
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.receive_htlc(&mut chan, &htlc)?;
		peer.save_channel_record(&chan)?;
	}

	let htlc_sig_count = receive_commitment(peer, &chan_arc, &mut commitment_rx).await?;
	if htlc_sig_count != 1 {
		return Err(violation(format!(
			"expected exactly one htlc signature, got {}",
			htlc_sig_count
		)));
	}
	peer.save_channel_record(&chan_arc.lock().unwrap())?;

	revoke(peer, &chan_arc).await?;
	peer.save_channel_record(&chan_arc.lock().unwrap())?;

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

	receive_revoke(peer, &chan_arc, &mut revoke_rx).await?;
	peer.save_channel_record(&chan_arc.lock().unwrap())?;

	{
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.settle_htlc(&mut chan, &invoice.payment_preimage, htlc_id)?;
		peer.save_channel_record(&chan)?;
	}
	peer.send_message(
		"update_fulfill_htlc",
		&MessageFields::new()
			.put("channel_id", chan_id)
			.put("id", htlc_id)
			.put("payment_preimage", invoice.payment_preimage),
	)
	.await?;

	// The counterparty's commitment without the HTLC, at the new balances.
	let signature = {
		let chan = chan_arc.lock().unwrap();
		let bare_commitment = peer.ctx.commitment.make_commitment(
			&chan,
			chan.remote_state.ctn + 1,
			false,
			&chan.remote_state.next_per_commitment_point,
			chan.remote_state.amount_msat - amount_msat,
			chan.local_state.amount_msat + amount_msat,
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
	peer.save_channel_record(&chan_arc.lock().unwrap())?;

	let htlc_sig_count = receive_commitment(peer, &chan_arc, &mut commitment_rx).await?;
	if htlc_sig_count != 0 {
		return Err(violation(format!(
			"expected an htlcless commitment, got {} signatures",
			htlc_sig_count
		)));
	}
	revoke(peer, &chan_arc).await?;
	peer.save_channel_record(&chan_arc.lock().unwrap())?;
	Ok(())
}

fn violation(message: impl Into<String>) -> PeerError {
	PeerError::new(PeerErrorCode::ProtocolViolation, message)
}
