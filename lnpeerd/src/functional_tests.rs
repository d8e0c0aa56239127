// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! End-to-end engine tests against a scripted counterparty speaking real
//! frames over a duplex stream.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::secp256k1::{Message as SecpMessage, Secp256k1};
use lnpeerd_wire::{MessageFields, WireSchema};

use crate::channel::ChannelState;
use crate::error::PeerErrorCode;
use crate::external::{ChannelPolicy, OnionFailure, RouteEdge};
use crate::flows;
use crate::io::persist::{KVStore, CHANNELS_PERSISTENCE_NAMESPACE};
use crate::keys::{per_commitment_secret_from_seed, secret_to_pubkey, FIRST_PER_COMMITMENT_INDEX};
use crate::peer::RouteAttempt;
use crate::test_utils::*;

fn route_edge(node_byte: u8, scid_byte: u8, fee_base_msat: u64, delta: u16) -> RouteEdge {
	RouteEdge {
		node_id: pubkey(node_byte),
		short_channel_id: [scid_byte; 8],
		policy: ChannelPolicy {
			cltv_expiry_delta: delta,
			fee_base_msat,
			fee_proportional_millionths: 0,
		},
	}
}

fn revoke_fields(chan_id: [u8; 32], point_byte: u8) -> MessageFields {
	MessageFields::new()
		.put("channel_id", chan_id)
		.put("per_commitment_secret", [0x55u8; 32])
		.put("next_per_commitment_point", pubkey(point_byte).serialize())
}

#[tokio::test(start_paused = true)]
async fn test_ping_sent_after_idle_interval() {
	let mut node = build_node();
	let _handle = node.start().await;

	tokio::time::advance(Duration::from_secs(121)).await;
	let ping = node.remote.expect("ping").await;
	assert_eq!(ping.int("num_pong_bytes").unwrap(), 4);
	assert_eq!(ping.int("byteslen").unwrap(), 4);
}

#[tokio::test]
async fn test_ping_answered_with_requested_pong_size() {
	let mut node = build_node();
	let _handle = node.start().await;

	node.remote
		.send("ping", &MessageFields::new().put("num_pong_bytes", 12u16).put("byteslen", 2u16))
		.await;
	let pong = node.remote.expect("pong").await;
	assert_eq!(pong.int("byteslen").unwrap(), 12);
	assert_eq!(pong.bytes("ignored").unwrap().len(), 12);
}

#[tokio::test]
async fn test_unknown_message_type_is_ignored() {
	let mut node = build_node();
	let _handle = node.start().await;

	node.remote.send_raw(&[0x7f, 0xff, 0x01, 0x02, 0x03]).await;
	// The connection survives and keeps dispatching.
	node.barrier().await;
}

#[tokio::test]
async fn test_channel_establishment_flow() {
	let mut node = build_node();
	let _handle = node.start().await;
	let temp_channel_id = [0xAAu8; 32];

	let peer = Arc::clone(&node.peer);
	let flow = tokio::spawn(async move {
		flows::open::channel_establishment_flow(&peer, 200_000, 0, temp_channel_id).await
	});

	let open = node.remote.expect("open_channel").await;
	assert_eq!(open.bytes("temporary_channel_id").unwrap(), temp_channel_id);
	assert_eq!(open.bytes("chain_hash").unwrap(), CHAIN_HASH);
	assert_eq!(open.int("funding_satoshis").unwrap(), 200_000);
	assert_eq!(open.int("push_msat").unwrap(), 0);
	assert_eq!(open.int("feerate_per_kw").unwrap(), 20000);
	assert_eq!(open.int("to_self_delay").unwrap(), 143);
	assert_eq!(open.int("dust_limit_satoshis").unwrap(), 10);
	assert_eq!(open.int("max_accepted_htlcs").unwrap(), 5);
	assert_eq!(open.int("channel_flags").unwrap(), 0x01);

	node.remote
		.send(
			"accept_channel",
			&MessageFields::new()
				.put("temporary_channel_id", temp_channel_id)
				.put("dust_limit_satoshis", 500u64)
				.put("max_htlc_value_in_flight_msat", 200_000_000u64)
				.put("channel_reserve_satoshis", 10u64)
				.put("htlc_minimum_msat", 1000u64)
				.put("minimum_depth", 3u32)
				.put("to_self_delay", 144u16)
				.put("max_accepted_htlcs", 5u16)
				.put("funding_pubkey", pubkey(0x61).serialize())
				.put("revocation_basepoint", pubkey(0x62).serialize())
				.put("payment_basepoint", pubkey(0x63).serialize())
				.put("delayed_payment_basepoint", pubkey(0x64).serialize())
				.put("htlc_basepoint", pubkey(0x65).serialize())
				.put("first_per_commitment_point", pubkey(0x66).serialize()),
		)
		.await;

	let created = node.remote.expect("funding_created").await;
	assert_eq!(created.bytes("temporary_channel_id").unwrap(), temp_channel_id);
	// The mock wallet puts a change output before the funding output.
	assert_eq!(created.int("funding_output_index").unwrap(), 1);
	let funding_txid: [u8; 32] = created.array("funding_txid").unwrap();
	let mut channel_id = funding_txid;
	channel_id[31] ^= 1;

	node.remote
		.send(
			"funding_signed",
			&MessageFields::new().put("channel_id", channel_id).put("signature", vec![0x77u8; 64]),
		)
		.await;

	let flow_channel_id = flow.await.unwrap().unwrap();
	assert_eq!(flow_channel_id, channel_id);

	assert_eq!(node.network.broadcasts.lock().unwrap().len(), 1);
	let chan_arc = node.peer.channels.lock().unwrap().get(&channel_id).cloned().unwrap();
	let chan = chan_arc.lock().unwrap();
	assert_eq!(chan.local_state.ctn, 0);
	assert_eq!(chan.remote_state.ctn, 0);
	assert_eq!(chan.local_state.current_commitment_signature, Some(vec![0x77u8; 64]));
	assert_eq!(chan.constraints.funding_txn_minimum_depth, 3);
	assert_eq!(chan.local_state.amount_msat + chan.remote_state.amount_msat, 200_000 * 1000);
	// The record hit persistence.
	assert_eq!(node.store.list(CHANNELS_PERSISTENCE_NAMESPACE).unwrap().len(), 1);
}

#[tokio::test]
async fn test_open_flow_rejects_excessive_dust_limit() {
	let mut node = build_node();
	let _handle = node.start().await;
	let temp_channel_id = [0xABu8; 32];

	let peer = Arc::clone(&node.peer);
	let flow = tokio::spawn(async move {
		flows::open::channel_establishment_flow(&peer, 200_000, 0, temp_channel_id).await
	});

	node.remote.expect("open_channel").await;
	node.remote
		.send(
			"accept_channel",
			&MessageFields::new()
				.put("temporary_channel_id", temp_channel_id)
				.put("dust_limit_satoshis", 600u64)
				.put("max_htlc_value_in_flight_msat", 200_000_000u64)
				.put("htlc_minimum_msat", 1000u64)
				.put("minimum_depth", 3u32)
				.put("to_self_delay", 144u16)
				.put("max_accepted_htlcs", 5u16)
				.put("funding_pubkey", pubkey(0x61).serialize())
				.put("revocation_basepoint", pubkey(0x62).serialize())
				.put("payment_basepoint", pubkey(0x63).serialize())
				.put("delayed_payment_basepoint", pubkey(0x64).serialize())
				.put("htlc_basepoint", pubkey(0x65).serialize())
				.put("first_per_commitment_point", pubkey(0x66).serialize()),
		)
		.await;

	let err = flow.await.unwrap().unwrap_err();
	assert_eq!(err.code, PeerErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn test_reestablish_round_trip() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);

	let peer = Arc::clone(&node.peer);
	let flow =
		tokio::spawn(async move { flows::reestablish::reestablish_channel(&peer, chan_id).await });

	let ours = node.remote.expect("channel_reestablish").await;
	assert_eq!(ours.int("next_local_commitment_number").unwrap(), 1);
	assert_eq!(ours.int("next_remote_revocation_number").unwrap(), 0);

	// Answer with matching counters and the per-commitment point we track.
	let point = secret_to_pubkey(
		&Secp256k1::new(),
		&per_commitment_secret_from_seed(&[0x07u8; 32], FIRST_PER_COMMITMENT_INDEX),
	)
	.unwrap();
	let mut reply = WireSchema::bolt()
		.encode(
			"channel_reestablish",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("next_local_commitment_number", 1u64)
				.put("next_remote_revocation_number", 0u64),
		)
		.unwrap();
	reply.extend_from_slice(&[0u8; 32]);
	reply.extend_from_slice(&point.serialize());
	node.remote.send_raw(&reply).await;

	flow.await.unwrap().unwrap();
	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	assert_eq!(chan_arc.lock().unwrap().state, ChannelState::Open);
	assert!(*node.network.channel_events.lock().unwrap() >= 2);
}

#[tokio::test]
async fn test_reestablish_rejects_bad_counters() {
	let mut node = build_node();
	let handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);

	let point = secret_to_pubkey(
		&Secp256k1::new(),
		&per_commitment_secret_from_seed(&[0x07u8; 32], FIRST_PER_COMMITMENT_INDEX),
	)
	.unwrap();
	let mut reply = WireSchema::bolt()
		.encode(
			"channel_reestablish",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("next_local_commitment_number", 5u64)
				.put("next_remote_revocation_number", 0u64),
		)
		.unwrap();
	reply.extend_from_slice(&[0u8; 32]);
	reply.extend_from_slice(&point.serialize());
	node.remote.send_raw(&reply).await;

	let err = handle.await.unwrap().unwrap_err();
	assert_eq!(err.code, PeerErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn test_funding_locked_exchange_opens_channel() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	{
		// Not yet locked on either side.
		let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
		let mut chan = chan_arc.lock().unwrap();
		chan.local_state.funding_locked_received = false;
		chan.state = ChannelState::Opening;
	}

	flows::funding::funding_locked(&node.peer, chan_id).await.unwrap();
	let locked = node.remote.expect("funding_locked").await;
	let expected_second_point = secret_to_pubkey(
		&Secp256k1::new(),
		&per_commitment_secret_from_seed(&[0x07u8; 32], FIRST_PER_COMMITMENT_INDEX - 1),
	)
	.unwrap();
	assert_eq!(locked.bytes("next_per_commitment_point").unwrap(), expected_second_point.serialize());

	node.remote
		.send(
			"funding_locked",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("next_per_commitment_point", pubkey(0x71).serialize()),
		)
		.await;
	node.barrier().await;

	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	let chan = chan_arc.lock().unwrap();
	assert!(chan.local_state.funding_locked_received);
	assert_eq!(chan.state, ChannelState::Open);
	// The counterparty's points rotated.
	assert_eq!(chan.remote_state.next_per_commitment_point, pubkey(0x71));
	assert!(chan.remote_state.current_per_commitment_point.is_some());
}

#[tokio::test]
async fn test_pay_flow_fulfilled() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	*node.router.route.lock().unwrap() = vec![route_edge(0x22, 0x31, 0, 0)];

	let preimage = [0x99u8; 32];
	let payment_hash: [u8; 32] = sha256::Hash::hash(&preimage).to_byte_array();
	let peer = Arc::clone(&node.peer);
	let flow = tokio::spawn(async move {
		flows::pay::pay(&peer, &[pubkey(0x22)], chan_id, 100_000, payment_hash, 9).await
	});

	let add = node.remote.expect("update_add_htlc").await;
	assert_eq!(add.int("id").unwrap(), 0);
	// Direct route: no forwarding fees, expiry is height + min_final.
	assert_eq!(add.int("amount_msat").unwrap(), 100_000);
	assert_eq!(add.int("cltv_expiry").unwrap(), 500_009);
	assert_eq!(add.bytes("onion_routing_packet").unwrap().len(), 1366);

	let commitment = node.remote.expect("commitment_signed").await;
	assert_eq!(commitment.int("num_htlcs").unwrap(), 1);

	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x72)).await;
	node.remote.expect("revoke_and_ack").await;

	node.remote
		.send(
			"update_fulfill_htlc",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("id", 0u64)
				.put("payment_preimage", preimage),
		)
		.await;
	// No interleaved HTLC commitments: settle directly with an htlcless one.
	node.remote
		.send(
			"commitment_signed",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("signature", vec![0x11u8; 64])
				.put("num_htlcs", 0u16),
		)
		.await;
	node.remote.expect("revoke_and_ack").await;

	let bare = node.remote.expect("commitment_signed").await;
	assert_eq!(bare.int("num_htlcs").unwrap(), 0);
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x73)).await;

	let preimage_hex = flow.await.unwrap().unwrap();
	assert_eq!(preimage_hex, "9999999999999999999999999999999999999999999999999999999999999999");

	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	let chan = chan_arc.lock().unwrap();
	// The payment moved out of our balance; the channel total is conserved.
	assert_eq!(chan.local_state.amount_msat, 900_000);
	assert_eq!(chan.remote_state.amount_msat, 1_100_000);
	assert_eq!(chan.local_state.next_htlc_id, 1);
}

#[tokio::test]
async fn test_pay_flow_failed_htlc() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	*node.router.route.lock().unwrap() = vec![route_edge(0x22, 0x31, 0, 0)];
	// UPDATE|7 reported by the destination.
	*node.router.failure.lock().unwrap() =
		Some(OnionFailure { code: 0x1007, data: vec![], sender_idx: 0 });

	let payment_hash = [0x13u8; 32];
	let peer = Arc::clone(&node.peer);
	let flow = tokio::spawn(async move {
		flows::pay::pay(&peer, &[pubkey(0x22)], chan_id, 100_000, payment_hash, 9).await
	});

	node.remote.expect("update_add_htlc").await;
	node.remote.expect("commitment_signed").await;
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x72)).await;
	node.remote.expect("revoke_and_ack").await;

	node.remote
		.send(
			"update_fail_htlc",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("id", 0u64)
				.put("len", 4u16)
				.put("reason", vec![1u8, 2, 3, 4]),
		)
		.await;

	// The flow re-signs with the HTLC still present.
	let resign = node.remote.expect("commitment_signed").await;
	assert_eq!(resign.int("num_htlcs").unwrap(), 1);
	node.remote
		.send(
			"commitment_signed",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("signature", vec![0x11u8; 64])
				.put("num_htlcs", 0u16),
		)
		.await;
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x73)).await;

	// After failing the HTLC locally it re-signs without it.
	let resign = node.remote.expect("commitment_signed").await;
	assert_eq!(resign.int("num_htlcs").unwrap(), 0);
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x74)).await;

	let err = flow.await.unwrap().unwrap_err();
	assert_eq!(err.code, PeerErrorCode::HtlcFailure);
	assert_eq!(err.message, "HTLC failure with code 4103 (categories [\"UPDATE\"])");
	// The destination itself failed: nothing to blacklist.
	assert!(node.network.blacklisted.lock().unwrap().is_empty());
	// Balances were not moved.
	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	assert_eq!(chan_arc.lock().unwrap().local_state.amount_msat, 1_000_000);
}

#[tokio::test]
async fn test_update_fail_htlc_blacklists_failing_hop() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	let route =
		vec![route_edge(0x22, 0x31, 0, 0), route_edge(0x23, 0x32, 1000, 6), route_edge(0x24, 0x33, 1000, 6)];
	node.peer
		.attempted_routes
		.lock()
		.unwrap()
		.insert((chan_id, 7), RouteAttempt { route, session_key: [9u8; 32] });
	*node.router.failure.lock().unwrap() =
		Some(OnionFailure { code: 0x2002, data: vec![], sender_idx: 0 });

	let mut failures = node.peer.subscribe_failures(chan_id);
	node.remote
		.send(
			"update_fail_htlc",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("id", 7u64)
				.put("len", 2u16)
				.put("reason", vec![0xde, 0xad]),
		)
		.await;

	let reason = failures.recv().await.unwrap();
	assert_eq!(reason, "HTLC failure with code 8194 (categories [\"NODE\"])");
	// The hop after the reporting node carried the failing channel.
	assert_eq!(*node.network.blacklisted.lock().unwrap(), vec![[0x32u8; 8]]);
}

#[tokio::test]
async fn test_receive_payment_flow() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);

	let preimage = [0x77u8; 32];
	let payment_hash: [u8; 32] = sha256::Hash::hash(&preimage).to_byte_array();
	node.invoices.invoices.lock().unwrap().insert(
		payment_hash,
		crate::external::Invoice { payment_preimage: preimage, amount_msat: 50_000, min_final_cltv_expiry: 9 },
	);

	node.remote
		.send(
			"update_add_htlc",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("id", 0u64)
				.put("amount_msat", 50_000u64)
				.put("payment_hash", payment_hash)
				.put("cltv_expiry", 500_100u32)
				.put("onion_routing_packet", vec![0u8; 1366]),
		)
		.await;
	node.remote
		.send(
			"commitment_signed",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("signature", vec![0x11u8; 64])
				.put("num_htlcs", 1u16)
				.put("htlc_signature", vec![0x12u8; 64]),
		)
		.await;

	node.remote.expect("revoke_and_ack").await;
	let ours = node.remote.expect("commitment_signed").await;
	assert_eq!(ours.int("num_htlcs").unwrap(), 1);
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x75)).await;

	let fulfill = node.remote.expect("update_fulfill_htlc").await;
	assert_eq!(fulfill.bytes("payment_preimage").unwrap(), preimage);
	assert_eq!(fulfill.int("id").unwrap(), 0);

	let bare = node.remote.expect("commitment_signed").await;
	assert_eq!(bare.int("num_htlcs").unwrap(), 0);
	node.remote.send("revoke_and_ack", &revoke_fields(chan_id, 0x76)).await;

	node.remote
		.send(
			"commitment_signed",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("signature", vec![0x11u8; 64])
				.put("num_htlcs", 0u16),
		)
		.await;
	node.remote.expect("revoke_and_ack").await;

	node.barrier().await;
	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	let chan = chan_arc.lock().unwrap();
	assert_eq!(chan.local_state.amount_msat, 1_050_000);
	assert_eq!(chan.remote_state.amount_msat, 950_000);
	assert_eq!(chan.remote_state.next_htlc_id, 1);
}

#[tokio::test]
async fn test_incoming_htlc_without_invoice_is_fatal() {
	let mut node = build_node();
	let handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);

	node.remote
		.send(
			"update_add_htlc",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("id", 0u64)
				.put("amount_msat", 50_000u64)
				.put("payment_hash", [0x31u8; 32])
				.put("cltv_expiry", 500_100u32)
				.put("onion_routing_packet", vec![0u8; 1366]),
		)
		.await;

	let err = handle.await.unwrap().unwrap_err();
	assert_eq!(err.code, PeerErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn test_announcement_flow() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	let scid = [0u8, 0, 1, 0, 0, 2, 0, 3];

	node.peer.on_network_update(chan_id, scid, 6).unwrap();

	let ours = node.remote.expect("announcement_signatures").await;
	assert_eq!(ours.bytes("short_channel_id").unwrap(), scid);

	// Recompute the digest both sides must sign.
	let secp = Secp256k1::new();
	let our_node_id = node.peer.node_pubkey.serialize();
	let mut node_ids = [our_node_id, remote_pubkey().serialize()];
	let mut bitcoin_keys =
		[crate::keys::Keypair::new(&secp, secret(0x42)).pubkey.serialize(), pubkey(0x52).serialize()];
	if node_ids[0] > node_ids[1] {
		node_ids.swap(0, 1);
		bitcoin_keys.swap(0, 1);
	}
	let unsigned = WireSchema::bolt()
		.encode(
			"channel_announcement",
			&MessageFields::new()
				.put("len", 0u16)
				.put("chain_hash", CHAIN_HASH)
				.put("short_channel_id", scid)
				.put("node_id_1", node_ids[0])
				.put("node_id_2", node_ids[1])
				.put("bitcoin_key_1", bitcoin_keys[0])
				.put("bitcoin_key_2", bitcoin_keys[1]),
		)
		.unwrap();
	let digest = sha256d::Hash::hash(&unsigned[258..]).to_byte_array();
	let secp_msg = SecpMessage::from_digest(digest);

	// Our signatures verify against the digest.
	let our_node_sig =
		bitcoin::secp256k1::ecdsa::Signature::from_compact(ours.bytes("node_signature").unwrap())
			.unwrap();
	secp.verify_ecdsa(&secp_msg, &our_node_sig, &node.peer.node_pubkey).unwrap();

	// Answer with ours and expect the final announcement, keys sorted.
	let remote_node_sig = secp.sign_ecdsa(&secp_msg, &remote_secret()).serialize_compact();
	let remote_bitcoin_sig = secp.sign_ecdsa(&secp_msg, &secret(0x52)).serialize_compact();
	node.remote
		.send(
			"announcement_signatures",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("short_channel_id", scid)
				.put("node_signature", remote_node_sig)
				.put("bitcoin_signature", remote_bitcoin_sig),
		)
		.await;

	let announcement = node.remote.expect("channel_announcement").await;
	assert_eq!(announcement.bytes("node_id_1").unwrap(), node_ids[0]);
	assert_eq!(announcement.bytes("node_id_2").unwrap(), node_ids[1]);
	assert_eq!(announcement.bytes("bitcoin_key_1").unwrap(), bitcoin_keys[0]);
	assert_eq!(announcement.bytes("short_channel_id").unwrap(), scid);
	assert!(announcement.bytes("node_signatures_1").unwrap().iter().any(|&b| b != 0));

	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	assert!(chan_arc.lock().unwrap().local_state.was_announced);
}

#[tokio::test]
async fn test_gossip_messages_forwarded_to_channel_db() {
	let mut node = build_node();
	let _handle = node.start().await;

	node.remote
		.send(
			"channel_update",
			&MessageFields::new()
				.put("signature", vec![0u8; 64])
				.put("chain_hash", CHAIN_HASH)
				.put("short_channel_id", [1u8; 8])
				.put("timestamp", 700_000u32)
				.put("flags", 1u16)
				.put("cltv_expiry_delta", 144u16)
				.put("htlc_minimum_msat", 1000u64)
				.put("fee_base_msat", 1000u32)
				.put("fee_proportional_millionths", 1u32),
		)
		.await;
	node.barrier().await;
	assert_eq!(node.channel_db.updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_node_announcement_verified_and_forwarded() {
	let mut node = build_node();
	let _handle = node.start().await;

	let secp = Secp256k1::new();
	let announcer_secret = secret(0x99);
	let announcer = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &announcer_secret);
	let mut alias = vec![0u8; 32];
	alias[..5].copy_from_slice(b"alice");
	let addresses = vec![1u8, 127, 0, 0, 1, 0x26, 0x07];

	let fields = |signature: Vec<u8>| {
		MessageFields::new()
			.put("signature", signature)
			.put("flen", 0u16)
			.put("timestamp", 700_000u32)
			.put("node_id", announcer.serialize())
			.put("rgb_color", vec![1u8, 2, 3])
			.put("alias", alias.clone())
			.put("addrlen", 7u16)
			.put("addresses", addresses.clone())
	};
	let unsigned = WireSchema::bolt().encode("node_announcement", &fields(vec![0u8; 64])).unwrap();
	let digest = sha256d::Hash::hash(&unsigned[66..]).to_byte_array();
	let signature =
		secp.sign_ecdsa(&SecpMessage::from_digest(digest), &announcer_secret).serialize_compact();

	node.remote.send("node_announcement", &fields(signature.to_vec())).await;
	node.barrier().await;

	let nodes = node.channel_db.nodes.lock().unwrap();
	assert_eq!(nodes.len(), 1);
	assert_eq!(nodes[0].0, announcer);
	assert_eq!(nodes[0].1, "alice");
	assert_eq!(nodes[0].2, vec!["127.0.0.1:9735".parse().unwrap()]);
}

#[tokio::test]
async fn test_node_announcement_with_bad_signature_dropped() {
	let mut node = build_node();
	let _handle = node.start().await;

	let announcer = pubkey(0x99);
	node.remote
		.send(
			"node_announcement",
			&MessageFields::new()
				.put("signature", vec![1u8; 64])
				.put("flen", 0u16)
				.put("timestamp", 700_000u32)
				.put("node_id", announcer.serialize())
				.put("rgb_color", vec![1u8, 2, 3])
				.put("alias", vec![0u8; 32])
				.put("addrlen", 0u16),
		)
		.await;
	node.barrier().await;
	assert!(node.channel_db.nodes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_fee_applied() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);

	node.remote
		.send(
			"update_fee",
			&MessageFields::new().put("channel_id", chan_id).put("feerate_per_kw", 30_000u32),
		)
		.await;
	node.barrier().await;

	let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
	assert_eq!(chan_arc.lock().unwrap().local_state.feerate, 30_000);
}

#[tokio::test]
async fn test_response_for_unknown_channel_is_fatal() {
	let mut node = build_node();
	let handle = node.start().await;

	node.remote
		.send(
			"funding_signed",
			&MessageFields::new().put("channel_id", [0x66u8; 32]).put("signature", vec![0u8; 64]),
		)
		.await;

	let err = handle.await.unwrap().unwrap_err();
	assert_eq!(err.code, PeerErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn test_channel_persisted_through_save_sink() {
	let mut node = build_node();
	let _handle = node.start().await;
	let chan_id = node.seeded_channel(1_000_000, 1_000_000);
	{
		let chan_arc = node.peer.channels.lock().unwrap().get(&chan_id).cloned().unwrap();
		let mut chan = chan_arc.lock().unwrap();
		chan.local_state.funding_locked_received = false;
		chan.state = ChannelState::Opening;
	}

	node.remote
		.send(
			"funding_locked",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("next_per_commitment_point", pubkey(0x71).serialize()),
		)
		.await;
	node.barrier().await;

	assert_eq!(node.store.list(CHANNELS_PERSISTENCE_NAMESPACE).unwrap().len(), 1);
	let channels = crate::io::persist::load_channels(node.store.as_ref()).unwrap();
	assert_eq!(channels.len(), 1);
	assert_eq!(channels[0].channel_id, chan_id);
	assert!(channels[0].local_state.funding_locked_received);
	assert_eq!(channels[0].remote_state.next_per_commitment_point, pubkey(0x71));
}
