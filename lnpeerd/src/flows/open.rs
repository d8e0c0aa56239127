// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Channel opening, initiator side.

use std::sync::Arc;

use lnpeerd_wire::MessageFields;
use log::debug;

use crate::channel::{
	channel_id_from_funding_tx, funding_output_script, Channel, ChannelConstraints, ChannelId,
	ChannelState, FundingOutpoint, LocalConfig, LocalState, RemoteConfig, RemoteState,
};
use crate::error::{PeerError, PeerErrorCode};
use crate::flows::{next_message, parse_point};
use crate::keys::{
	per_commitment_secret_from_seed, secret_to_pubkey, KeyFamily, FIRST_PER_COMMITMENT_INDEX,
};
use crate::peer::{Peer, ResponseKind};

/// Fixed feerate offered in `open_channel`, in sat per 1000 weight units.
const LOCAL_FEERATE_PER_KW: u32 = 20000;

/// Highest dust limit we accept from the counterparty, in satoshi.
const MAX_REMOTE_DUST_LIMIT_SAT: u64 = 600;

/// Highest HTLC minimum we accept from the counterparty.
const MAX_REMOTE_HTLC_MINIMUM_MSAT: u64 = 600 * 1000;

/// Lowest in-flight allowance we accept from the counterparty.
const MIN_REMOTE_HTLC_IN_FLIGHT_MSAT: u64 = 198 * 1000 * 1000;

/// Opens a channel with the peer as funder: negotiates parameters, asks the
/// wallet for a funding transaction, exchanges the first commitment
/// signatures, and broadcasts the funding once validated. Returns the new
/// channel's id.
pub async fn channel_establishment_flow(
	peer: &Arc<Peer>, funding_sat: u64, push_msat: u64, temp_channel_id: ChannelId,
) -> Result<ChannelId, PeerError> {
	peer.await_initialized().await?;

	let wallet = &peer.ctx.wallet;
	let local_config = LocalConfig {
		payment_basepoint: wallet.get_keypair(KeyFamily::PaymentBase, 0)?,
		multisig_key: wallet.get_keypair(KeyFamily::Multisig, 0)?,
		htlc_basepoint: wallet.get_keypair(KeyFamily::HtlcBase, 0)?,
		delayed_basepoint: wallet.get_keypair(KeyFamily::DelayBase, 0)?,
		revocation_basepoint: wallet.get_keypair(KeyFamily::RevocationBase, 0)?,
		to_self_delay: 143,
		dust_limit_sat: 10,
		max_htlc_value_in_flight_msat: u64::MAX,
		max_accepted_htlcs: 5,
	};
	let per_commitment_secret_seed =
		wallet.get_keypair(KeyFamily::RevocationRoot, 0)?.privkey.secret_bytes();
	let per_commitment_secret_first =
		per_commitment_secret_from_seed(&per_commitment_secret_seed, FIRST_PER_COMMITMENT_INDEX);
	let per_commitment_point_first = secret_to_pubkey(&peer.secp, &per_commitment_secret_first)?;

	let mut accepted_rx = peer.subscribe(ResponseKind::AcceptChannel, temp_channel_id);
	peer.send_message(
		"open_channel",
		&MessageFields::new()
			.put("chain_hash", peer.chain_hash)
			.put("temporary_channel_id", temp_channel_id)
			.put("funding_satoshis", funding_sat)
			.put("push_msat", push_msat)
			.put("dust_limit_satoshis", local_config.dust_limit_sat)
			.put("max_htlc_value_in_flight_msat", local_config.max_htlc_value_in_flight_msat)
			.put("channel_reserve_satoshis", 10u64)
			.put("feerate_per_kw", LOCAL_FEERATE_PER_KW)
			.put("to_self_delay", local_config.to_self_delay)
			.put("max_accepted_htlcs", local_config.max_accepted_htlcs)
			.put("funding_pubkey", local_config.multisig_key.pubkey.serialize())
			.put("revocation_basepoint", local_config.revocation_basepoint.pubkey.serialize())
			.put("payment_basepoint", local_config.payment_basepoint.pubkey.serialize())
			.put("delayed_payment_basepoint", local_config.delayed_basepoint.pubkey.serialize())
			.put("htlc_basepoint", local_config.htlc_basepoint.pubkey.serialize())
			.put("first_per_commitment_point", per_commitment_point_first.serialize())
			// Announce the channel publicly.
			.put("channel_flags", 0x01u8),
	)
	.await?;

	let accepted = next_message(&mut accepted_rx).await?;
	let remote_per_commitment_point = parse_point(accepted.bytes("first_per_commitment_point")?)?;
	let remote_config = RemoteConfig {
		payment_basepoint: parse_point(accepted.bytes("payment_basepoint")?)?,
		multisig_key: parse_point(accepted.bytes("funding_pubkey")?)?,
		htlc_basepoint: parse_point(accepted.bytes("htlc_basepoint")?)?,
		delayed_basepoint: parse_point(accepted.bytes("delayed_payment_basepoint")?)?,
		revocation_basepoint: parse_point(accepted.bytes("revocation_basepoint")?)?,
		to_self_delay: accepted.int("to_self_delay")? as u16,
		dust_limit_sat: accepted.int("dust_limit_satoshis")?,
		max_htlc_value_in_flight_msat: accepted.int("max_htlc_value_in_flight_msat")?,
		max_accepted_htlcs: accepted.int("max_accepted_htlcs")? as u16,
	};
	let funding_txn_minimum_depth = accepted.int("minimum_depth")? as u32;

	if remote_config.dust_limit_sat >= MAX_REMOTE_DUST_LIMIT_SAT {
		return Err(violation(format!(
			"remote dust limit too high: {} sat",
			remote_config.dust_limit_sat
		)));
	}
	if accepted.int("htlc_minimum_msat")? >= MAX_REMOTE_HTLC_MINIMUM_MSAT {
		return Err(violation("remote htlc_minimum_msat too high"));
	}
	if remote_config.max_htlc_value_in_flight_msat < MIN_REMOTE_HTLC_IN_FLIGHT_MSAT {
		return Err(violation(format!(
			"remote max_htlc_value_in_flight_msat too low: {}",
			remote_config.max_htlc_value_in_flight_msat
		)));
	}
	debug!("[{}] remote delay {}", peer.host, remote_config.to_self_delay);
	debug!("[{}] funding_txn_minimum_depth {}", peer.host, funding_txn_minimum_depth);

	// Build the funding transaction paying the 2-of-2 P2WSH output.
	let redeem_script = funding_output_script(&local_config, &remote_config);
	let funding_spk = redeem_script.to_p2wsh();
	let funding_tx =
		peer.ctx.wallet.make_funding_tx(funding_spk.clone(), funding_sat, 1000).await?;
	let funding_txid = funding_tx.compute_txid();
	let funding_index = funding_tx
		.output
		.iter()
		.position(|out| out.script_pubkey == funding_spk && out.value.to_sat() == funding_sat)
		.ok_or_else(|| {
			PeerError::new(
				PeerErrorCode::InternalError,
				"wallet transaction does not pay the funding output",
			)
		})? as u16;

	let local_amount_msat = (funding_sat * 1000).checked_sub(push_msat).ok_or_else(|| {
		PeerError::new(PeerErrorCode::InternalError, "push_msat exceeds the funding amount")
	})?;
	let remote_amount_msat = push_msat;
	let (channel_id, funding_txid_bytes) = channel_id_from_funding_tx(&funding_txid, funding_index);

	let chan_arc = peer.insert_channel(Channel {
		node_id: peer.remote_pubkey,
		channel_id,
		short_channel_id: None,
		funding_outpoint: FundingOutpoint { txid: funding_txid, output_index: funding_index },
		local_config,
		remote_config,
		remote_state: RemoteState {
			ctn: -1,
			next_per_commitment_point: remote_per_commitment_point,
			current_per_commitment_point: None,
			amount_msat: remote_amount_msat,
			next_htlc_id: 0,
			feerate: LOCAL_FEERATE_PER_KW,
		},
		local_state: LocalState {
			ctn: -1,
			per_commitment_secret_seed,
			amount_msat: local_amount_msat,
			next_htlc_id: 0,
			funding_locked_received: false,
			was_announced: false,
			current_commitment_signature: None,
			feerate: LOCAL_FEERATE_PER_KW,
		},
		constraints: ChannelConstraints {
			capacity_sat: funding_sat,
			is_initiator: true,
			funding_txn_minimum_depth,
		},
		state: ChannelState::Opening,
	});

	let mut funding_signed_rx = peer.subscribe(ResponseKind::FundingSigned, channel_id);
	let (signature, _htlc_sigs) = {
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.sign_next_commitment(&mut chan)?
	};
	peer.send_message(
		"funding_created",
		&MessageFields::new()
			.put("temporary_channel_id", temp_channel_id)
			.put("funding_txid", funding_txid_bytes)
			.put("funding_output_index", funding_index)
			.put("signature", signature),
	)
	.await?;

	let funding_signed = next_message(&mut funding_signed_rx).await?;
	debug!("[{}] received funding_signed", peer.host);
	let remote_sig = funding_signed.bytes("signature")?.to_vec();
	{
		let mut chan = chan_arc.lock().unwrap();
		peer.ctx.commitment.receive_new_commitment(&mut chan, &remote_sig, &[])?;
	}
	peer.ctx.network.broadcast(&funding_tx).await?;
	{
		let mut chan = chan_arc.lock().unwrap();
		chan.remote_state.ctn = 0;
		chan.local_state.ctn = 0;
		chan.local_state.current_commitment_signature = Some(remote_sig);
		peer.save_channel_record(&chan)?;
	}
	Ok(channel_id)
}

fn violation(message: impl Into<String>) -> PeerError {
	PeerError::new(PeerErrorCode::ProtocolViolation, message)
}
