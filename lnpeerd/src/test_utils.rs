// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Mock collaborators and a scripted-counterparty harness: the remote side
//! of the duplex stream speaks the real wire protocol with mirrored
//! transport keys, so engine tests exercise framing, codec and dispatch
//! end to end.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};
use lnpeerd_wire::{Message, MessageFields, WireSchema};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

use crate::channel::{
	channel_id_from_funding_tx, Channel, ChannelConstraints, ChannelId, ChannelState,
	FundingOutpoint, Htlc, LocalConfig, LocalState, RemoteConfig, RemoteState, Revocation,
	ShortChannelId,
};
use crate::error::{PeerError, PeerErrorCode};
use crate::external::{
	ChannelDatabase, CommitmentEngine, HopData, Invoice, InvoiceStore, NetworkGateway,
	NodeContext, OnionFailure, RouteEdge, Router, Wallet,
};
use crate::io::persist::KVStore;
use crate::keys::{
	per_commitment_secret_from_seed, secret_to_pubkey, KeyFamily, Keypair,
	FIRST_PER_COMMITMENT_INDEX,
};
use crate::peer::{BoxedReader, BoxedWriter, Peer};
use crate::transport::{framed, mirrored, MessageReader, MessageWriter, TransportKeys};

pub(crate) const CHAIN_HASH: [u8; 32] = [0x43; 32];

pub(crate) fn secret(byte: u8) -> SecretKey {
	SecretKey::from_slice(&[byte; 32]).unwrap()
}

pub(crate) fn pubkey(byte: u8) -> PublicKey {
	PublicKey::from_secret_key(&Secp256k1::new(), &secret(byte))
}

// -- Mock collaborators ------------------------------------------------------

pub(crate) struct MockWallet {
	secp: Secp256k1<All>,
}

#[async_trait]
impl Wallet for MockWallet {
	async fn make_funding_tx(
		&self, output_script: ScriptBuf, value_sat: u64, _feerate: u32,
	) -> Result<Transaction, PeerError> {
		// A change output first, so the funding output index is nonzero.
		Ok(Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![],
			output: vec![
				TxOut { value: Amount::from_sat(4321), script_pubkey: ScriptBuf::new() },
				TxOut { value: Amount::from_sat(value_sat), script_pubkey: output_script },
			],
		})
	}

	fn get_keypair(&self, family: KeyFamily, index: u32) -> Result<Keypair, PeerError> {
		let mut bytes = [0u8; 32];
		bytes[0] = family as u8 + 1;
		bytes[31] = index as u8 + 1;
		Ok(Keypair::new(&self.secp, SecretKey::from_slice(&bytes).unwrap()))
	}
}

/// Book-keeps balances and counters plausibly enough for the flows'
/// assertions; produces fixed dummy signatures.
#[derive(Default)]
pub(crate) struct MockEngine {
	pub(crate) pending_htlcs: StdMutex<Vec<Htlc>>,
}

impl CommitmentEngine for MockEngine {
	fn sign_next_commitment(
		&self, _chan: &mut Channel,
	) -> Result<(Vec<u8>, Vec<Vec<u8>>), PeerError> {
		let pending = self.pending_htlcs.lock().unwrap();
		Ok((vec![0xAB; 64], pending.iter().map(|_| vec![0xCD; 64]).collect()))
	}

	fn receive_new_commitment(
		&self, _chan: &mut Channel, _signature: &[u8], _htlc_signatures: &[Vec<u8>],
	) -> Result<(), PeerError> {
		Ok(())
	}

	fn revoke_current_commitment(&self, chan: &mut Channel) -> Result<Revocation, PeerError> {
		chan.local_state.ctn += 1;
		let seed = chan.local_state.per_commitment_secret_seed;
		let index = FIRST_PER_COMMITMENT_INDEX - chan.local_state.ctn as u64;
		let secp = Secp256k1::new();
		let next_secret = per_commitment_secret_from_seed(&seed, index.saturating_sub(1));
		Ok(Revocation {
			per_commitment_secret: per_commitment_secret_from_seed(&seed, index),
			next_per_commitment_point: secret_to_pubkey(&secp, &next_secret).unwrap(),
		})
	}

	fn receive_revocation(
		&self, chan: &mut Channel, revocation: &Revocation,
	) -> Result<(), PeerError> {
		chan.remote_state.ctn += 1;
		chan.remote_state.current_per_commitment_point =
			Some(chan.remote_state.next_per_commitment_point);
		chan.remote_state.next_per_commitment_point = revocation.next_per_commitment_point;
		Ok(())
	}

	fn add_htlc(&self, chan: &mut Channel, htlc: &Htlc) -> Result<u64, PeerError> {
		let id = chan.local_state.next_htlc_id;
		chan.local_state.next_htlc_id += 1;
		self.pending_htlcs.lock().unwrap().push(htlc.clone());
		Ok(id)
	}

	fn receive_htlc(&self, chan: &mut Channel, htlc: &Htlc) -> Result<(), PeerError> {
		chan.remote_state.next_htlc_id += 1;
		self.pending_htlcs.lock().unwrap().push(htlc.clone());
		Ok(())
	}

	fn settle_htlc(
		&self, chan: &mut Channel, _preimage: &[u8; 32], _htlc_id: u64,
	) -> Result<(), PeerError> {
		let htlc = self.pending_htlcs.lock().unwrap().pop().ok_or_else(no_htlc)?;
		chan.local_state.amount_msat += htlc.amount_msat;
		chan.remote_state.amount_msat -= htlc.amount_msat;
		Ok(())
	}

	fn receive_htlc_settle(
		&self, chan: &mut Channel, _preimage: &[u8; 32], _htlc_id: u64,
	) -> Result<(), PeerError> {
		let htlc = self.pending_htlcs.lock().unwrap().pop().ok_or_else(no_htlc)?;
		let total = htlc.amount_msat + htlc.total_fee;
		chan.local_state.amount_msat -= total;
		chan.remote_state.amount_msat += total;
		Ok(())
	}

	fn fail_htlc(&self, _chan: &mut Channel, _htlc: &Htlc) -> Result<(), PeerError> {
		self.pending_htlcs.lock().unwrap().pop().ok_or_else(no_htlc)?;
		Ok(())
	}

	fn make_commitment(
		&self, _chan: &Channel, _ctn: i64, _remote: bool, _per_commitment_point: &PublicKey,
		_remote_msat: u64, _local_msat: u64,
	) -> Result<Transaction, PeerError> {
		Ok(Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![],
			output: vec![],
		})
	}

	fn sign_commitment_transaction(
		&self, _chan: &Channel, _tx: &Transaction,
	) -> Result<Vec<u8>, PeerError> {
		Ok(vec![0xEF; 64])
	}

	fn update_fee(&self, chan: &mut Channel, feerate_per_kw: u32) {
		chan.local_state.feerate = feerate_per_kw;
		chan.remote_state.feerate = feerate_per_kw;
	}
}

fn no_htlc() -> PeerError {
	PeerError::new(PeerErrorCode::InternalError, "no pending HTLC in mock engine")
}

pub(crate) struct MockNetwork {
	pub(crate) height: u32,
	pub(crate) broadcasts: StdMutex<Vec<Txid>>,
	pub(crate) blacklisted: StdMutex<Vec<ShortChannelId>>,
	pub(crate) channel_events: StdMutex<usize>,
}

#[async_trait]
impl NetworkGateway for MockNetwork {
	async fn broadcast(&self, tx: &Transaction) -> Result<Txid, PeerError> {
		let txid = tx.compute_txid();
		self.broadcasts.lock().unwrap().push(txid);
		Ok(txid)
	}

	fn local_height(&self) -> u32 {
		self.height
	}

	fn blacklist(&self, short_channel_id: ShortChannelId) {
		self.blacklisted.lock().unwrap().push(short_channel_id);
	}

	fn channel_event(&self, _chan: &Channel) {
		*self.channel_events.lock().unwrap() += 1;
	}
}

#[derive(Default)]
pub(crate) struct MockRouter {
	pub(crate) route: StdMutex<Vec<RouteEdge>>,
	pub(crate) failure: StdMutex<Option<OnionFailure>>,
}

impl Router for MockRouter {
	fn create_route_from_path(
		&self, _path: &[PublicKey], _self_pubkey: &PublicKey,
	) -> Result<Vec<RouteEdge>, PeerError> {
		Ok(self.route.lock().unwrap().clone())
	}

	fn new_onion_packet(
		&self, _hop_nodes: &[PublicKey], _session_key: &[u8; 32], _hops_data: &[HopData],
		_associated_data: &[u8; 32],
	) -> Result<Vec<u8>, PeerError> {
		Ok(vec![0u8; 1366])
	}

	fn decode_onion_error(
		&self, _reason: &[u8], _hop_nodes: &[PublicKey], _session_key: &[u8; 32],
	) -> Result<OnionFailure, PeerError> {
		self.failure.lock().unwrap().take().ok_or_else(|| {
			PeerError::new(PeerErrorCode::InternalError, "mock router has no failure configured")
		})
	}
}

#[derive(Default)]
pub(crate) struct MockChannelDb {
	pub(crate) announcements: StdMutex<Vec<Message>>,
	pub(crate) updates: StdMutex<Vec<Message>>,
	pub(crate) nodes: StdMutex<Vec<(PublicKey, String, Vec<SocketAddr>)>>,
}

impl ChannelDatabase for MockChannelDb {
	fn on_channel_announcement(&self, msg: &Message) {
		self.announcements.lock().unwrap().push(msg.clone());
	}

	fn on_channel_update(&self, msg: &Message) {
		self.updates.lock().unwrap().push(msg.clone());
	}

	fn on_node_announcement(&self, node_id: &PublicKey, alias: &str, addresses: &[SocketAddr]) {
		self.nodes.lock().unwrap().push((*node_id, alias.to_string(), addresses.to_vec()));
	}
}

#[derive(Default)]
pub(crate) struct MockInvoices {
	pub(crate) invoices: StdMutex<HashMap<[u8; 32], Invoice>>,
}

impl InvoiceStore for MockInvoices {
	fn find_by_payment_hash(&self, payment_hash: &[u8; 32]) -> Option<Invoice> {
		self.invoices.lock().unwrap().get(payment_hash).copied()
	}
}

#[derive(Default)]
pub(crate) struct MemoryStore {
	data: StdMutex<HashMap<(String, String), Vec<u8>>>,
}

impl KVStore for MemoryStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error> {
		self.data
			.lock()
			.unwrap()
			.get(&(namespace.to_string(), key.to_string()))
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found"))
	}

	fn write(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), io::Error> {
		self.data
			.lock()
			.unwrap()
			.insert((namespace.to_string(), key.to_string()), value.to_vec());
		Ok(())
	}

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		let mut keys: Vec<String> = self
			.data
			.lock()
			.unwrap()
			.keys()
			.filter(|(ns, _)| ns == namespace)
			.map(|(_, key)| key.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}
}

// -- Scripted counterparty ---------------------------------------------------

/// The remote end of the connection: real frames, mirrored keys.
pub(crate) struct ScriptedPeer {
	reader: MessageReader<ReadHalf<DuplexStream>>,
	writer: MessageWriter<WriteHalf<DuplexStream>>,
}

impl ScriptedPeer {
	/// Reads the next message and asserts its schema name.
	pub(crate) async fn expect(&mut self, name: &str) -> Message {
		let raw = self.reader.read_message().await.unwrap();
		let msg = WireSchema::bolt().decode(&raw).unwrap();
		assert_eq!(msg.name, name, "expected {} but peer sent {}", name, msg.name);
		msg
	}

	pub(crate) async fn send(&mut self, name: &str, fields: &MessageFields) {
		let bytes = WireSchema::bolt().encode(name, fields).unwrap();
		self.writer.write_message(&bytes).await.unwrap();
	}

	pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
		self.writer.write_message(bytes).await.unwrap();
	}
}

pub(crate) struct TestNode {
	pub(crate) peer: Arc<Peer>,
	pub(crate) engine: Arc<MockEngine>,
	pub(crate) network: Arc<MockNetwork>,
	pub(crate) router: Arc<MockRouter>,
	pub(crate) channel_db: Arc<MockChannelDb>,
	pub(crate) invoices: Arc<MockInvoices>,
	pub(crate) store: Arc<MemoryStore>,
	pub(crate) remote: ScriptedPeer,
	reader: Option<MessageReader<BoxedReader>>,
}

/// Our node key and the counterparty's.
pub(crate) fn node_secret() -> SecretKey {
	secret(0x21)
}

pub(crate) fn remote_secret() -> SecretKey {
	secret(0x22)
}

pub(crate) fn remote_pubkey() -> PublicKey {
	PublicKey::from_secret_key(&Secp256k1::new(), &remote_secret())
}

pub(crate) fn build_node() -> TestNode {
	let (local_io, remote_io) = duplex(1 << 20);
	let (local_read, local_write) = split(local_io);
	let (remote_read, remote_write) = split(remote_io);
	let keys = TransportKeys { sk: [1u8; 32], rk: [2u8; 32], s_ck: [3u8; 32], r_ck: [4u8; 32] };
	let (local_reader, local_writer) = framed(
		Box::new(local_read) as BoxedReader,
		Box::new(local_write) as BoxedWriter,
		keys,
	);
	let (remote_reader, remote_writer) = framed(remote_read, remote_write, mirrored(&keys));

	let engine = Arc::new(MockEngine::default());
	let network = Arc::new(MockNetwork {
		height: 500_000,
		broadcasts: StdMutex::new(Vec::new()),
		blacklisted: StdMutex::new(Vec::new()),
		channel_events: StdMutex::new(0),
	});
	let router = Arc::new(MockRouter::default());
	let channel_db = Arc::new(MockChannelDb::default());
	let invoices = Arc::new(MockInvoices::default());
	let store = Arc::new(MemoryStore::default());
	let ctx = NodeContext {
		wallet: Arc::new(MockWallet { secp: Secp256k1::new() }),
		network: Arc::clone(&network) as Arc<dyn NetworkGateway>,
		router: Arc::clone(&router) as Arc<dyn Router>,
		channel_db: Arc::clone(&channel_db) as Arc<dyn ChannelDatabase>,
		invoices: Arc::clone(&invoices) as Arc<dyn InvoiceStore>,
		commitment: Arc::clone(&engine) as Arc<dyn CommitmentEngine>,
		store: Arc::clone(&store) as Arc<dyn KVStore>,
	};
	let peer = Peer::new(
		"test-peer".to_string(),
		remote_pubkey(),
		node_secret(),
		CHAIN_HASH,
		false,
		ctx,
		local_writer,
	);

	TestNode {
		peer,
		engine,
		network,
		router,
		channel_db,
		invoices,
		store,
		remote: ScriptedPeer { reader: remote_reader, writer: remote_writer },
		reader: Some(local_reader),
	}
}

impl TestNode {
	/// Spawns the dispatch loop and completes the init exchange.
	pub(crate) async fn start(&mut self) -> tokio::task::JoinHandle<Result<(), PeerError>> {
		let reader = self.reader.take().expect("start called twice");
		let handle = tokio::spawn(Arc::clone(&self.peer).run(reader));
		self.remote.expect("init").await;
		self.remote
			.send(
				"init",
				&MessageFields::new().put("gflen", 0u16).put("lflen", 1u16).put("localfeatures", 0u8),
			)
			.await;
		handle
	}

	/// Round-trips a ping so every previously sent message has been
	/// dispatched before the test continues.
	pub(crate) async fn barrier(&mut self) {
		self.remote
			.send("ping", &MessageFields::new().put("num_pong_bytes", 1u16).put("byteslen", 1u16))
			.await;
		self.remote.expect("pong").await;
	}

	/// Installs an already-open channel with deterministic keys, as left
	/// behind by a completed open flow.
	pub(crate) fn seeded_channel(&self, local_msat: u64, remote_msat: u64) -> ChannelId {
		let secp = Secp256k1::new();
		let seed = [0x07u8; 32];
		let first_point = secret_to_pubkey(
			&secp,
			&per_commitment_secret_from_seed(&seed, FIRST_PER_COMMITMENT_INDEX),
		)
		.unwrap();
		let txid = Txid::from_byte_array([0x44u8; 32]);
		let (channel_id, _) = channel_id_from_funding_tx(&txid, 0);
		let chan = Channel {
			node_id: remote_pubkey(),
			channel_id,
			short_channel_id: Some([0, 0, 1, 0, 0, 2, 0, 3]),
			funding_outpoint: FundingOutpoint { txid, output_index: 0 },
			local_config: LocalConfig {
				payment_basepoint: Keypair::new(&secp, secret(0x41)),
				multisig_key: Keypair::new(&secp, secret(0x42)),
				htlc_basepoint: Keypair::new(&secp, secret(0x43)),
				delayed_basepoint: Keypair::new(&secp, secret(0x44)),
				revocation_basepoint: Keypair::new(&secp, secret(0x45)),
				to_self_delay: 143,
				dust_limit_sat: 10,
				max_htlc_value_in_flight_msat: u64::MAX,
				max_accepted_htlcs: 5,
			},
			remote_config: RemoteConfig {
				payment_basepoint: pubkey(0x51),
				multisig_key: pubkey(0x52),
				htlc_basepoint: pubkey(0x53),
				delayed_basepoint: pubkey(0x54),
				revocation_basepoint: pubkey(0x55),
				to_self_delay: 144,
				dust_limit_sat: 500,
				max_htlc_value_in_flight_msat: 200_000_000,
				max_accepted_htlcs: 5,
			},
			local_state: LocalState {
				ctn: 0,
				per_commitment_secret_seed: seed,
				amount_msat: local_msat,
				next_htlc_id: 0,
				funding_locked_received: true,
				was_announced: false,
				current_commitment_signature: None,
				feerate: 20000,
			},
			remote_state: RemoteState {
				ctn: 0,
				next_per_commitment_point: first_point,
				current_per_commitment_point: None,
				amount_msat: remote_msat,
				next_htlc_id: 0,
				feerate: 20000,
			},
			constraints: ChannelConstraints {
				capacity_sat: (local_msat + remote_msat) / 1000,
				is_initiator: true,
				funding_txn_minimum_depth: 3,
			},
			state: ChannelState::Open,
		};
		self.peer.adopt_channel(chan);
		channel_id
	}
}
