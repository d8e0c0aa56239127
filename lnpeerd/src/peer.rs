// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The per-peer protocol engine.
//!
//! One task per peer decodes inbound messages serially and dispatches them:
//! either to a synchronous handler or into the pending-exchange queue a
//! lifecycle flow is awaiting. Flows run as sibling tasks and share the
//! writing half of the transport; the dispatch loop is the only reader.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use bitcoin::secp256k1::{All, Message as SecpMessage, PublicKey, Secp256k1, SecretKey};
use lnpeerd_wire::{display_id, Message, MessageFields, WireErrorCode, WireSchema};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{Duration, Instant};

use crate::channel::{Channel, ChannelId, ChannelState, ShortChannelId};
use crate::error::{PeerError, PeerErrorCode};
use crate::external::{NodeContext, RouteEdge};
use crate::flows;
use crate::io::persist;
use crate::transport::{framed, handshake, MessageReader, MessageWriter, TransportKeys};

/// A ping is emitted after this much time without outbound traffic.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(120);

/// Funding depth at which a public channel is announced.
pub(crate) const ANNOUNCEMENT_DEPTH: u32 = 6;

/// Category bits of a BOLT 4 failure code.
const FAILURE_BADONION: u16 = 0x8000;
const FAILURE_PERM: u16 = 0x4000;
const FAILURE_NODE: u16 = 0x2000;
const FAILURE_UPDATE: u16 = 0x1000;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Message kinds that arrive as responses to an exchange a flow initiated,
/// keyed by (temporary) channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ResponseKind {
	AcceptChannel,
	FundingSigned,
	RevokeAndAck,
	CommitmentSigned,
	UpdateFulfillHtlc,
	AnnouncementSignatures,
}

/// A payment attempt we may have to decode an onion failure against.
#[derive(Clone)]
pub(crate) struct RouteAttempt {
	pub(crate) route: Vec<RouteEdge>,
	pub(crate) session_key: [u8; 32],
}

enum ReestablishSlot {
	Pending(oneshot::Sender<()>),
	Received,
}

pub struct Peer {
	pub(crate) host: String,
	pub(crate) remote_pubkey: PublicKey,
	pub(crate) node_secret: SecretKey,
	pub(crate) node_pubkey: PublicKey,
	pub(crate) chain_hash: [u8; 32],
	pub(crate) ctx: NodeContext,
	pub(crate) secp: Secp256k1<All>,
	pub(crate) channels: StdMutex<HashMap<ChannelId, Arc<StdMutex<Channel>>>>,
	pub(crate) attempted_routes: StdMutex<HashMap<(ChannelId, u64), RouteAttempt>>,
	writer: Mutex<MessageWriter<BoxedWriter>>,
	last_send: StdMutex<Instant>,
	queues: StdMutex<HashMap<(ResponseKind, ChannelId), mpsc::UnboundedSender<Message>>>,
	failure_queues: StdMutex<HashMap<ChannelId, mpsc::UnboundedSender<String>>>,
	reestablish_slots: StdMutex<HashMap<ChannelId, ReestablishSlot>>,
	announcement_backlog: StdMutex<HashMap<ChannelId, Message>>,
	// None until the init exchange completes, Some(true) afterwards,
	// Some(false) once the connection is torn down.
	initialized: watch::Sender<Option<bool>>,
	request_initial_sync: bool,
	weak_self: Weak<Peer>,
}

impl Peer {
	pub(crate) fn new(
		host: String, remote_pubkey: PublicKey, node_secret: SecretKey, chain_hash: [u8; 32],
		request_initial_sync: bool, ctx: NodeContext, writer: MessageWriter<BoxedWriter>,
	) -> Arc<Peer> {
		let secp = Secp256k1::new();
		let node_pubkey = PublicKey::from_secret_key(&secp, &node_secret);
		Arc::new_cyclic(|weak_self| Peer {
			host,
			remote_pubkey,
			node_secret,
			node_pubkey,
			chain_hash,
			ctx,
			secp,
			channels: StdMutex::new(HashMap::new()),
			attempted_routes: StdMutex::new(HashMap::new()),
			writer: Mutex::new(writer),
			last_send: StdMutex::new(Instant::now()),
			queues: StdMutex::new(HashMap::new()),
			failure_queues: StdMutex::new(HashMap::new()),
			reestablish_slots: StdMutex::new(HashMap::new()),
			announcement_backlog: StdMutex::new(HashMap::new()),
			initialized: watch::channel(None).0,
			request_initial_sync,
			weak_self: weak_self.clone(),
		})
	}

	/// A strong handle to ourselves, for spawning sibling flows.
	fn arc(&self) -> Arc<Peer> {
		// The weak handle always upgrades: methods only run while an owner
		// holds the Arc this was created with.
		self.weak_self.upgrade().expect("peer dropped while handling a message")
	}

	/// Dials the peer, runs the Noise handshake, and returns the engine
	/// together with the reading half its dispatch loop consumes.
	pub async fn connect(
		address: SocketAddr, remote_pubkey: PublicKey, node_secret: SecretKey, chain_hash: [u8; 32],
		request_initial_sync: bool, ctx: NodeContext,
	) -> Result<(Arc<Peer>, MessageReader<BoxedReader>), PeerError> {
		let mut stream = TcpStream::connect(address).await?;
		let secp = Secp256k1::new();
		let keys: TransportKeys =
			handshake::initiator_handshake(&mut stream, &secp, &node_secret, &remote_pubkey).await?;
		let (read_half, write_half) = stream.into_split();
		let (reader, writer) = framed(
			Box::new(read_half) as BoxedReader,
			Box::new(write_half) as BoxedWriter,
			keys,
		);
		let peer = Peer::new(
			address.to_string(),
			remote_pubkey,
			node_secret,
			chain_hash,
			request_initial_sync,
			ctx,
			writer,
		);
		Ok((peer, reader))
	}

	/// Runs the init exchange and then the dispatch loop until the
	/// connection dies. All in-flight flows are cancelled implicitly when
	/// their queue senders are dropped with `self`.
	pub async fn run(
		self: Arc<Self>, mut reader: MessageReader<BoxedReader>,
	) -> Result<(), PeerError> {
		let result = self.run_inner(&mut reader).await;
		// Tear down every pending exchange so in-flight flows observe the
		// close instead of waiting forever.
		self.queues.lock().unwrap().clear();
		self.failure_queues.lock().unwrap().clear();
		self.reestablish_slots.lock().unwrap().clear();
		self.initialized.send_replace(Some(false));
		if let Err(ref e) = result {
			error!("[{}] peer loop terminated: {}", self.host, e);
		}
		result
	}

	async fn run_inner(&self, reader: &mut MessageReader<BoxedReader>) -> Result<(), PeerError> {
		let localfeatures: u8 = if self.request_initial_sync { 0x08 } else { 0x00 };
		self.send_message(
			"init",
			&MessageFields::new().put("gflen", 0u16).put("lflen", 1u16).put(
				"localfeatures",
				localfeatures,
			),
		)
		.await?;

		let raw = reader.read_message().await?;
		match WireSchema::bolt().decode(&raw) {
			Ok(msg) => self.dispatch(msg, &raw).await?,
			Err(e) => return Err(e.into()),
		}
		self.initialized.send_replace(Some(true));

		loop {
			let deadline = *self.last_send.lock().unwrap() + PING_INTERVAL;
			tokio::select! {
				res = reader.read_message() => {
					let raw = res?;
					match WireSchema::bolt().decode(&raw) {
						Ok(msg) => self.dispatch(msg, &raw).await?,
						Err(e) if e.code == WireErrorCode::UnknownMessage => {
							debug!("[{}] ignoring message: {}", self.host, e.message);
						},
						Err(e) => return Err(e.into()),
					}
				},
				_ = tokio::time::sleep_until(deadline) => {
					self.send_message(
						"ping",
						&MessageFields::new().put("num_pong_bytes", 4u16).put("byteslen", 4u16),
					)
					.await?;
				},
			}
		}
	}

	async fn dispatch(&self, msg: Message, raw: &[u8]) -> Result<(), PeerError> {
		trace!("[{}] Received {}", self.host, msg.name.to_uppercase());
		match msg.name.as_str() {
			// Features are not negotiated.
			"init" => Ok(()),
			"error" => {
				error!(
					"[{}] peer sent error for channel {}: {}",
					self.host,
					display_id(msg.bytes("channel_id")?),
					String::from_utf8_lossy(msg.bytes("data")?)
				);
				Ok(())
			},
			"ping" => self.on_ping(&msg).await,
			"accept_channel" => {
				self.enqueue_response(ResponseKind::AcceptChannel, "temporary_channel_id", msg)
			},
			"funding_signed" => self.enqueue_response(ResponseKind::FundingSigned, "channel_id", msg),
			"revoke_and_ack" => self.enqueue_response(ResponseKind::RevokeAndAck, "channel_id", msg),
			"update_fulfill_htlc" => {
				self.enqueue_response(ResponseKind::UpdateFulfillHtlc, "channel_id", msg)
			},
			"commitment_signed" => self.on_commitment_signed(msg),
			"announcement_signatures" => self.on_announcement_signatures(msg).await,
			"update_fail_htlc" => self.on_update_fail_htlc(&msg),
			"update_fail_malformed_htlc" => {
				error!(
					"[{}] peer failed malformed HTLC {} with code {}",
					self.host,
					msg.int("id")?,
					msg.int("failure_code")?
				);
				Ok(())
			},
			"update_add_htlc" => self.on_update_add_htlc(msg),
			"channel_reestablish" => self.on_channel_reestablish(&msg),
			"node_announcement" => self.on_node_announcement(&msg, raw),
			"channel_announcement" => {
				self.ctx.channel_db.on_channel_announcement(&msg);
				Ok(())
			},
			"channel_update" => {
				self.ctx.channel_db.on_channel_update(&msg);
				Ok(())
			},
			"funding_locked" => self.on_funding_locked(&msg),
			"update_fee" => self.on_update_fee(&msg),
			name => {
				debug!("[{}] ignoring unhandled message {}", self.host, name);
				Ok(())
			},
		}
	}

	// -- Transport plumbing --------------------------------------------------

	pub(crate) async fn send_message(
		&self, name: &str, fields: &MessageFields,
	) -> Result<(), PeerError> {
		let bytes = WireSchema::bolt().encode(name, fields)?;
		debug!("[{}] Sending {}", self.host, name.to_uppercase());
		let mut writer = self.writer.lock().await;
		writer.write_message(&bytes).await?;
		*self.last_send.lock().unwrap() = Instant::now();
		Ok(())
	}

	/// Suspends until the init exchange completed.
	pub(crate) async fn await_initialized(&self) -> Result<(), PeerError> {
		let mut rx = self.initialized.subscribe();
		let closed = || {
			PeerError::new(PeerErrorCode::TransportClosed, "connection closed before init")
		};
		let ready = *rx.wait_for(|state| state.is_some()).await.map_err(|_| closed())?;
		if ready == Some(true) {
			Ok(())
		} else {
			Err(closed())
		}
	}

	// -- Pending exchanges ---------------------------------------------------

	/// Registers the single consumer for `kind` responses under `key`. Must
	/// be called before the request that solicits the response is sent.
	pub(crate) fn subscribe(
		&self, kind: ResponseKind, key: ChannelId,
	) -> mpsc::UnboundedReceiver<Message> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.queues.lock().unwrap().insert((kind, key), tx);
		rx
	}

	pub(crate) fn subscribe_failures(&self, key: ChannelId) -> mpsc::UnboundedReceiver<String> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.failure_queues.lock().unwrap().insert(key, tx);
		rx
	}

	fn enqueue_response(
		&self, kind: ResponseKind, key_field: &str, msg: Message,
	) -> Result<(), PeerError> {
		let key: ChannelId = msg.array(key_field)?;
		let name = msg.name.clone();
		let queues = self.queues.lock().unwrap();
		match queues.get(&(kind, key)) {
			Some(tx) if tx.send(msg).is_ok() => Ok(()),
			_ => Err(PeerError::new(
				PeerErrorCode::ProtocolViolation,
				format!("Got unknown {}", name),
			)),
		}
	}

	// -- Channel records -----------------------------------------------------

	pub(crate) fn get_channel(&self, chan_id: &ChannelId) -> Option<Arc<StdMutex<Channel>>> {
		self.channels.lock().unwrap().get(chan_id).cloned()
	}

	pub(crate) fn channel_or_violation(
		&self, chan_id: &ChannelId, context: &str,
	) -> Result<Arc<StdMutex<Channel>>, PeerError> {
		self.get_channel(chan_id).ok_or_else(|| {
			PeerError::new(
				PeerErrorCode::ProtocolViolation,
				format!("{} for unknown channel {}", context, display_id(chan_id)),
			)
		})
	}

	/// Registers a previously persisted channel with this peer session, e.g.
	/// ahead of reestablishment after a reconnect.
	pub fn adopt_channel(&self, chan: Channel) {
		self.insert_channel(chan);
	}

	pub(crate) fn insert_channel(&self, chan: Channel) -> Arc<StdMutex<Channel>> {
		let chan_id = chan.channel_id;
		let arc = Arc::new(StdMutex::new(chan));
		self.channels.lock().unwrap().insert(chan_id, Arc::clone(&arc));
		arc
	}

	pub(crate) fn save_channel_record(&self, chan: &Channel) -> Result<(), PeerError> {
		persist::save_channel(self.ctx.store.as_ref(), chan).map_err(|e| {
			PeerError::new(PeerErrorCode::InternalError, format!("failed to persist channel: {}", e))
		})
	}

	/// Transitions the channel to OPEN once funding is locked on both sides,
	/// surfaces the event, and seeds the channel database with our own
	/// announcement and default policies.
	pub(crate) fn mark_open(&self, chan_arc: &Arc<StdMutex<Channel>>) -> Result<(), PeerError> {
		let (chan_id, short_channel_id) = {
			let mut chan = chan_arc.lock().unwrap();
			if chan.state == ChannelState::Open {
				return Ok(());
			}
			if !chan.local_state.funding_locked_received {
				return Err(PeerError::new(
					PeerErrorCode::ProtocolViolation,
					"cannot open channel before counterparty funding_locked",
				));
			}
			let scid = chan.short_channel_id.ok_or_else(|| {
				PeerError::new(
					PeerErrorCode::ProtocolViolation,
					"cannot open channel before the funding transaction is buried",
				)
			})?;
			chan.state = ChannelState::Open;
			(chan.channel_id, scid)
		};
		self.ctx.network.channel_event(&chan_arc.lock().unwrap());

		let mut node_ids = [self.remote_pubkey.serialize(), self.node_pubkey.serialize()];
		node_ids.sort();
		self.ctx.channel_db.on_channel_announcement(&Message::synthetic(
			"channel_announcement",
			&[
				("short_channel_id", short_channel_id.to_vec()),
				("node_id_1", node_ids[0].to_vec()),
				("node_id_2", node_ids[1].to_vec()),
			],
		));
		for flags in [1u8, 0u8] {
			self.ctx.channel_db.on_channel_update(&Message::synthetic(
				"channel_update",
				&[
					("short_channel_id", short_channel_id.to_vec()),
					("flags", vec![0, flags]),
					("cltv_expiry_delta", vec![0x00, 0x90]),
					("htlc_minimum_msat", 1000u64.to_be_bytes().to_vec()),
					("fee_base_msat", 1000u32.to_be_bytes().to_vec()),
					("fee_proportional_millionths", 1u32.to_be_bytes().to_vec()),
				],
			));
		}
		info!("[{}] channel {} opening completed", self.host, display_id(&chan_id));
		Ok(())
	}

	/// Called by the chain observer when the funding transaction's depth
	/// changes. Records the short channel id and kicks off announcement once
	/// the funding output is buried deep enough.
	pub fn on_network_update(
		&self, chan_id: ChannelId, short_channel_id: ShortChannelId, depth: u32,
	) -> Result<(), PeerError> {
		let chan_arc = self.channel_or_violation(&chan_id, "network update")?;
		{
			let mut chan = chan_arc.lock().unwrap();
			if chan.short_channel_id.is_none() {
				chan.short_channel_id = Some(short_channel_id);
				self.save_channel_record(&chan)?;
			}
		}
		let wants_announce = {
			let chan = chan_arc.lock().unwrap();
			depth >= ANNOUNCEMENT_DEPTH && !chan.local_state.was_announced
		};
		if wants_announce {
			// Subscribe before flipping `was_announced`: once the flag is up,
			// the dispatch loop routes inbound signatures into this queue.
			let signatures_rx = self.subscribe(ResponseKind::AnnouncementSignatures, chan_id);
			{
				let mut chan = chan_arc.lock().unwrap();
				chan.local_state.was_announced = true;
				self.save_channel_record(&chan)?;
			}
			let peer = self.arc();
			tokio::spawn(async move {
				if let Err(e) =
					flows::announce::handle_announcements(&peer, chan_id, signatures_rx).await
				{
					// An invalid announcement only aborts the announcement.
					error!("[{}] channel announcement aborted: {}", peer.host, e);
				}
			});
		}
		Ok(())
	}

	// -- Handlers ------------------------------------------------------------

	async fn on_ping(&self, msg: &Message) -> Result<(), PeerError> {
		let num_pong_bytes = msg.int("num_pong_bytes")?;
		self.send_message("pong", &MessageFields::new().put("byteslen", num_pong_bytes)).await
	}

	fn on_commitment_signed(&self, msg: Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		let chan_arc = self.channel_or_violation(&chan_id, "commitment_signed")?;
		{
			let mut chan = chan_arc.lock().unwrap();
			chan.local_state.current_commitment_signature = Some(msg.bytes("signature")?.to_vec());
			self.save_channel_record(&chan)?;
		}
		self.enqueue_response(ResponseKind::CommitmentSigned, "channel_id", msg)
	}

	async fn on_announcement_signatures(&self, msg: Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		let chan_arc = self.channel_or_violation(&chan_id, "announcement_signatures")?;
		let was_announced = chan_arc.lock().unwrap().local_state.was_announced;
		if was_announced {
			// The announce flow is (or was) running and consumes the queue.
			self.enqueue_response(ResponseKind::AnnouncementSignatures, "channel_id", msg)
		} else {
			// The counterparty reached announcement depth first: answer with
			// our signatures and keep theirs for our own announce flow.
			self.send_announcement_signatures(&chan_arc).await?;
			self.announcement_backlog.lock().unwrap().insert(chan_id, msg);
			Ok(())
		}
	}

	/// Signs the unsigned channel announcement with the node key and the
	/// funding multisig key and sends `announcement_signatures`. Returns the
	/// digest both parties must sign and our two compact signatures.
	pub(crate) async fn send_announcement_signatures(
		&self, chan_arc: &Arc<StdMutex<Channel>>,
	) -> Result<([u8; 32], Vec<u8>, Vec<u8>), PeerError> {
		let (chan_id, short_channel_id, multisig_privkey, local_bitcoin_key) = {
			let chan = chan_arc.lock().unwrap();
			let scid = chan.short_channel_id.ok_or_else(|| {
				PeerError::new(
					PeerErrorCode::ProtocolViolation,
					"cannot announce a channel without a short channel id",
				)
			})?;
			(
				chan.channel_id,
				scid,
				chan.local_config.multisig_key.privkey,
				chan.local_config.multisig_key.pubkey,
			)
		};

		let mut node_ids = [self.node_pubkey.serialize(), self.remote_pubkey.serialize()];
		let mut bitcoin_keys = [
			local_bitcoin_key.serialize(),
			chan_arc.lock().unwrap().remote_config.multisig_key.serialize(),
		];
		if node_ids[0] > node_ids[1] {
			node_ids.swap(0, 1);
			bitcoin_keys.swap(0, 1);
		}

		let unsigned = WireSchema::bolt().encode(
			"channel_announcement",
			&MessageFields::new()
				.put("len", 0u16)
				.put("chain_hash", self.chain_hash)
				.put("short_channel_id", short_channel_id)
				.put("node_id_1", node_ids[0])
				.put("node_id_2", node_ids[1])
				.put("bitcoin_key_1", bitcoin_keys[0])
				.put("bitcoin_key_2", bitcoin_keys[1]),
		)?;
		// The announcement digest covers the serialization from byte 258:
		// everything after the type prefix and the four signature slots.
		let digest = sha256d::Hash::hash(&unsigned[258..]).to_byte_array();
		let secp_msg = SecpMessage::from_digest(digest);
		let node_signature =
			self.secp.sign_ecdsa(&secp_msg, &self.node_secret).serialize_compact().to_vec();
		let bitcoin_signature =
			self.secp.sign_ecdsa(&secp_msg, &multisig_privkey).serialize_compact().to_vec();

		self.send_message(
			"announcement_signatures",
			&MessageFields::new()
				.put("channel_id", chan_id)
				.put("short_channel_id", short_channel_id)
				.put("node_signature", node_signature.as_slice())
				.put("bitcoin_signature", bitcoin_signature.as_slice()),
		)
		.await?;

		Ok((digest, node_signature, bitcoin_signature))
	}

	pub(crate) fn take_announcement_backlog(&self, chan_id: &ChannelId) -> Option<Message> {
		self.announcement_backlog.lock().unwrap().remove(chan_id)
	}

	pub(crate) fn verify_announcement_signature(
		&self, pubkey: &PublicKey, sig64: &[u8], digest: &[u8; 32], what: &str,
	) -> Result<(), PeerError> {
		let sig = EcdsaSignature::from_compact(sig64).map_err(|_| {
			PeerError::new(
				PeerErrorCode::SignatureInvalid,
				format!("{} is not a valid compact signature", what),
			)
		})?;
		self.secp.verify_ecdsa(&SecpMessage::from_digest(*digest), &sig, pubkey).map_err(|_| {
			PeerError::new(
				PeerErrorCode::SignatureInvalid,
				format!("{} invalid in announcement_signatures", what),
			)
		})
	}

	fn on_update_fail_htlc(&self, msg: &Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		let htlc_id = msg.int("id")?;
		let attempt = self
			.attempted_routes
			.lock()
			.unwrap()
			.remove(&(chan_id, htlc_id))
			.ok_or_else(|| {
				PeerError::new(
					PeerErrorCode::ProtocolViolation,
					format!("update_fail_htlc for unknown HTLC {}", htlc_id),
				)
			})?;

		let hop_nodes: Vec<PublicKey> = attempt.route.iter().map(|edge| edge.node_id).collect();
		let failure = self.ctx.router.decode_onion_error(
			msg.bytes("reason")?,
			&hop_nodes,
			&attempt.session_key,
		)?;

		let mut categories = Vec::new();
		if failure.code & FAILURE_BADONION != 0 {
			categories.push("BADONION");
		}
		if failure.code & FAILURE_PERM != 0 {
			categories.push("PERM");
		}
		if failure.code & FAILURE_NODE != 0 {
			categories.push("NODE");
		}
		if failure.code & FAILURE_UPDATE != 0 {
			categories.push("UPDATE");
		}

		// The hop after the reporting node carried the failing channel; when
		// the destination itself reported, there is nothing to blacklist.
		match attempt.route.get(failure.sender_idx + 1) {
			Some(edge) => self.ctx.network.blacklist(edge.short_channel_id),
			None => info!("[{}] payment destination reported error", self.host),
		}

		let reason =
			format!("HTLC failure with code {} (categories {:?})", failure.code, categories);
		warn!("[{}] {}", self.host, reason);
		let queues = self.failure_queues.lock().unwrap();
		match queues.get(&chan_id) {
			Some(tx) if tx.send(reason).is_ok() => Ok(()),
			_ => Err(PeerError::new(
				PeerErrorCode::ProtocolViolation,
				"Got unknown update_fail_htlc",
			)),
		}
	}

	fn on_update_add_htlc(&self, msg: Message) -> Result<(), PeerError> {
		// No onion forwarding: we only accept HTLCs paying one of our own
		// invoices, matched by payment hash.
		let payment_hash: [u8; 32] = msg.array("payment_hash")?;
		let invoice = self.ctx.invoices.find_by_payment_hash(&payment_hash).ok_or_else(|| {
			PeerError::new(
				PeerErrorCode::ProtocolViolation,
				format!("no invoice for incoming HTLC {}", display_id(&payment_hash)),
			)
		})?;
		let chan_id: ChannelId = msg.array("channel_id")?;
		self.channel_or_violation(&chan_id, "update_add_htlc")?;

		// Subscribe inside the dispatch turn so the counterparty's follow-up
		// messages cannot race the spawned flow.
		let commitment_rx = self.subscribe(ResponseKind::CommitmentSigned, chan_id);
		let revoke_rx = self.subscribe(ResponseKind::RevokeAndAck, chan_id);
		let peer = self.arc();
		tokio::spawn(async move {
			if let Err(e) = flows::receive::receive_commitment_revoke_ack(
				&peer,
				msg,
				invoice,
				commitment_rx,
				revoke_rx,
			)
			.await
			{
				error!("[{}] inbound payment failed: {}", peer.host, e);
			}
		});
		Ok(())
	}

	fn on_channel_reestablish(&self, msg: &Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		debug!("[{}] Received channel_reestablish {}", self.host, display_id(&chan_id));
		let chan_arc = match self.get_channel(&chan_id) {
			Some(chan) => chan,
			None => {
				warn!("[{}] received unknown channel_reestablish {}", self.host, display_id(&chan_id));
				return Ok(());
			},
		};

		{
			let chan = chan_arc.lock().unwrap();
			let remote_ctn = msg.int("next_local_commitment_number")? as i64;
			if remote_ctn != chan.remote_state.ctn + 1 {
				return Err(PeerError::new(
					PeerErrorCode::ProtocolViolation,
					format!("expected remote ctn {}, got {}", chan.remote_state.ctn + 1, remote_ctn),
				));
			}
			let local_ctn = msg.int("next_remote_revocation_number")? as i64;
			if local_ctn != chan.local_state.ctn {
				return Err(PeerError::new(
					PeerErrorCode::ProtocolViolation,
					format!("expected local ctn {}, got {}", chan.local_state.ctn, local_ctn),
				));
			}
			let their_point = msg.bytes("my_current_per_commitment_point")?;
			let our_point = chan
				.remote_state
				.current_per_commitment_point
				.unwrap_or(chan.remote_state.next_per_commitment_point);
			if their_point != our_point.serialize() {
				return Err(PeerError::new(
					PeerErrorCode::ProtocolViolation,
					format!(
						"remote per-commitment point mismatch: {} {}",
						display_id(&our_point.serialize()),
						display_id(their_point)
					),
				));
			}
		}

		let mut slots = self.reestablish_slots.lock().unwrap();
		match slots.remove(&chan_id) {
			Some(ReestablishSlot::Pending(tx)) => {
				let _ = tx.send(());
			},
			_ => {
				slots.insert(chan_id, ReestablishSlot::Received);
			},
		}
		Ok(())
	}

	/// Registers interest in the counterparty's `channel_reestablish`.
	/// Returns `None` if it already arrived.
	pub(crate) fn expect_reestablish(&self, chan_id: ChannelId) -> Option<oneshot::Receiver<()>> {
		let mut slots = self.reestablish_slots.lock().unwrap();
		match slots.remove(&chan_id) {
			Some(ReestablishSlot::Received) => None,
			_ => {
				let (tx, rx) = oneshot::channel();
				slots.insert(chan_id, ReestablishSlot::Pending(tx));
				Some(rx)
			},
		}
	}

	fn on_node_announcement(&self, msg: &Message, raw: &[u8]) -> Result<(), PeerError> {
		let node_id = PublicKey::from_slice(msg.bytes("node_id")?).map_err(|_| {
			PeerError::new(PeerErrorCode::MalformedMessage, "invalid node_announcement node_id")
		})?;
		// The signature covers everything after the type prefix and the
		// signature itself.
		let digest = sha256d::Hash::hash(&raw[66..]).to_byte_array();
		let signature = match EcdsaSignature::from_compact(msg.bytes("signature")?) {
			Ok(sig) => sig,
			Err(_) => {
				warn!("[{}] node_announcement carries a malformed signature", self.host);
				return Ok(());
			},
		};
		if self
			.secp
			.verify_ecdsa(&SecpMessage::from_digest(digest), &signature, &node_id)
			.is_err()
		{
			warn!("[{}] node_announcement signature invalid", self.host);
			return Ok(());
		}

		let addresses = parse_node_addresses(msg.bytes("addresses")?);
		let alias_bytes = msg.bytes("alias")?;
		let alias_end = alias_bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
		let alias = String::from_utf8_lossy(&alias_bytes[..alias_end]).into_owned();

		debug!("[{}] node announcement {} {:?}", self.host, node_id, addresses);
		self.ctx.channel_db.on_node_announcement(&node_id, &alias, &addresses);
		Ok(())
	}

	fn on_funding_locked(&self, msg: &Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		let chan_arc = self.channel_or_violation(&chan_id, "funding_locked")?;
		{
			let mut chan = chan_arc.lock().unwrap();
			if !chan.local_state.funding_locked_received {
				let their_next =
					PublicKey::from_slice(msg.bytes("next_per_commitment_point")?).map_err(|_| {
						PeerError::new(
							PeerErrorCode::MalformedMessage,
							"invalid next_per_commitment_point in funding_locked",
						)
					})?;
				let our_view_of_current = chan.remote_state.next_per_commitment_point;
				chan.remote_state.current_per_commitment_point = Some(our_view_of_current);
				chan.remote_state.next_per_commitment_point = their_next;
				chan.local_state.funding_locked_received = true;
				self.save_channel_record(&chan)?;
			}
		}
		if chan_arc.lock().unwrap().short_channel_id.is_some() {
			self.mark_open(&chan_arc)?;
		}
		Ok(())
	}

	fn on_update_fee(&self, msg: &Message) -> Result<(), PeerError> {
		let chan_id: ChannelId = msg.array("channel_id")?;
		let chan_arc = self.channel_or_violation(&chan_id, "update_fee")?;
		let feerate = msg.int("feerate_per_kw")? as u32;
		let mut chan = chan_arc.lock().unwrap();
		self.ctx.commitment.update_fee(&mut chan, feerate);
		Ok(())
	}
}

/// Parses the address block of a `node_announcement`. Type 1 is IPv4 plus
/// port, type 2 is IPv6 plus port, type 0 is padding. An unknown type byte
/// has no known length, so parsing stops there.
fn parse_node_addresses(data: &[u8]) -> Vec<SocketAddr> {
	let mut addresses = Vec::new();
	let mut idx = 0;
	while idx < data.len() {
		let address_type = data[idx];
		idx += 1;
		match address_type {
			0 => {},
			1 => {
				if idx + 6 > data.len() {
					break;
				}
				let ip: [u8; 4] = data[idx..idx + 4].try_into().expect("slice is 4 bytes");
				let port = u16::from_be_bytes([data[idx + 4], data[idx + 5]]);
				addresses.push(SocketAddr::from((Ipv4Addr::from(ip), port)));
				idx += 6;
			},
			2 => {
				if idx + 18 > data.len() {
					break;
				}
				let ip: [u8; 16] = data[idx..idx + 16].try_into().expect("slice is 16 bytes");
				let port = u16::from_be_bytes([data[idx + 16], data[idx + 17]]);
				addresses.push(SocketAddr::from((Ipv6Addr::from(ip), port)));
				idx += 18;
			},
			_ => break,
		}
	}
	addresses
}
