use std::path::PathBuf;
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};
use clap::Parser;
use log::{debug, error, info, warn};

use lnpeerd::channel::{Channel, ShortChannelId};
use lnpeerd::error::{PeerError, PeerErrorCode};
use lnpeerd::external::{
	ChannelDatabase, CommitmentEngine, Invoice, InvoiceStore, NetworkGateway, NodeContext,
	OnionFailure, RouteEdge, Router, Wallet,
};
use lnpeerd::flows;
use lnpeerd::io::persist::{load_channels, KVStore, SqliteStore};
use lnpeerd::keys::{KeyFamily, Keypair};
use lnpeerd::peer::Peer;
use lnpeerd::util::config::{load_config, PeerTarget};

use async_trait::async_trait;
use lnpeerd_wire::Message;

#[derive(Parser, Debug)]
#[command(name = "lnpeerd", about = "Lightning peer daemon (transport and gossip mode)")]
struct Args {
	/// Path to the TOML configuration file.
	#[arg(short, long)]
	config: PathBuf,
}

/// Gossip sink used when running standalone: announcements are logged, not
/// indexed.
struct GossipLogger;

impl ChannelDatabase for GossipLogger {
	fn on_channel_announcement(&self, msg: &Message) {
		debug!("channel_announcement: {} fields", msg.fields.len());
	}

	fn on_channel_update(&self, msg: &Message) {
		debug!("channel_update: {} fields", msg.fields.len());
	}

	fn on_node_announcement(&self, node_id: &PublicKey, alias: &str, addresses: &[std::net::SocketAddr]) {
		info!("node announcement {} alias={:?} addresses={:?}", node_id, alias, addresses);
	}
}

/// Chain access used when running standalone: nothing to broadcast against,
/// channel events go to the log.
struct OfflineChain;

#[async_trait]
impl NetworkGateway for OfflineChain {
	async fn broadcast(&self, _tx: &Transaction) -> Result<Txid, PeerError> {
		Err(unavailable("no chain backend configured"))
	}

	fn local_height(&self) -> u32 {
		0
	}

	fn blacklist(&self, short_channel_id: ShortChannelId) {
		warn!("blacklisting channel {:?}", short_channel_id);
	}

	fn channel_event(&self, chan: &Channel) {
		info!("channel event: {:?} {:?}", chan.state, chan.short_channel_id);
	}
}

/// Wallet, router, invoice and commitment backends are not wired in
/// standalone mode; flows that need them fail with a clear error instead of
/// being reachable half-configured.
struct Unavailable;

#[async_trait]
impl Wallet for Unavailable {
	async fn make_funding_tx(
		&self, _output_script: ScriptBuf, _value_sat: u64, _feerate: u32,
	) -> Result<Transaction, PeerError> {
		Err(unavailable("no wallet backend configured"))
	}

	fn get_keypair(&self, _family: KeyFamily, _index: u32) -> Result<Keypair, PeerError> {
		Err(unavailable("no wallet backend configured"))
	}
}

impl Router for Unavailable {
	fn create_route_from_path(
		&self, _path: &[PublicKey], _self_pubkey: &PublicKey,
	) -> Result<Vec<RouteEdge>, PeerError> {
		Err(unavailable("no path finder configured"))
	}

	fn new_onion_packet(
		&self, _hop_nodes: &[PublicKey], _session_key: &[u8; 32], _hops_data: &[lnpeerd::external::HopData],
		_associated_data: &[u8; 32],
	) -> Result<Vec<u8>, PeerError> {
		Err(unavailable("no path finder configured"))
	}

	fn decode_onion_error(
		&self, _reason: &[u8], _hop_nodes: &[PublicKey], _session_key: &[u8; 32],
	) -> Result<OnionFailure, PeerError> {
		Err(unavailable("no path finder configured"))
	}
}

impl InvoiceStore for Unavailable {
	fn find_by_payment_hash(&self, _payment_hash: &[u8; 32]) -> Option<Invoice> {
		None
	}
}

impl CommitmentEngine for Unavailable {
	fn sign_next_commitment(
		&self, _chan: &mut Channel,
	) -> Result<(Vec<u8>, Vec<Vec<u8>>), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn receive_new_commitment(
		&self, _chan: &mut Channel, _signature: &[u8], _htlc_signatures: &[Vec<u8>],
	) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn revoke_current_commitment(
		&self, _chan: &mut Channel,
	) -> Result<lnpeerd::channel::Revocation, PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn receive_revocation(
		&self, _chan: &mut Channel, _revocation: &lnpeerd::channel::Revocation,
	) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn add_htlc(&self, _chan: &mut Channel, _htlc: &lnpeerd::channel::Htlc) -> Result<u64, PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn receive_htlc(
		&self, _chan: &mut Channel, _htlc: &lnpeerd::channel::Htlc,
	) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn settle_htlc(
		&self, _chan: &mut Channel, _preimage: &[u8; 32], _htlc_id: u64,
	) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn receive_htlc_settle(
		&self, _chan: &mut Channel, _preimage: &[u8; 32], _htlc_id: u64,
	) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn fail_htlc(&self, _chan: &mut Channel, _htlc: &lnpeerd::channel::Htlc) -> Result<(), PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn make_commitment(
		&self, _chan: &Channel, _ctn: i64, _remote: bool,
		_per_commitment_point: &bitcoin::secp256k1::PublicKey, _remote_msat: u64, _local_msat: u64,
	) -> Result<Transaction, PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn sign_commitment_transaction(
		&self, _chan: &Channel, _tx: &Transaction,
	) -> Result<Vec<u8>, PeerError> {
		Err(unavailable("no commitment engine configured"))
	}

	fn update_fee(&self, chan: &mut Channel, feerate_per_kw: u32) {
		chan.local_state.feerate = feerate_per_kw;
		chan.remote_state.feerate = feerate_per_kw;
	}
}

fn unavailable(what: &str) -> PeerError {
	PeerError::new(PeerErrorCode::InternalError, what)
}

async fn run_peer(
	target: PeerTarget, node_secret: bitcoin::secp256k1::SecretKey, chain_hash: [u8; 32],
	request_initial_sync: bool, ctx: NodeContext,
) {
	info!("connecting to {}@{}", target.pubkey, target.address);
	let (peer, reader) = match Peer::connect(
		target.address,
		target.pubkey,
		node_secret,
		chain_hash,
		request_initial_sync,
		ctx.clone(),
	)
	.await
	{
		Ok(established) => established,
		Err(e) => {
			error!("failed to connect to {}: {}", target.address, e);
			return;
		},
	};

	// Resume any channels persisted for this peer.
	match load_channels(ctx.store.as_ref()) {
		Ok(channels) => {
			for chan in channels.into_iter().filter(|c| c.node_id == target.pubkey) {
				let chan_id = chan.channel_id;
				peer.adopt_channel(chan);
				let peer = Arc::clone(&peer);
				tokio::spawn(async move {
					if let Err(e) = flows::reestablish::reestablish_channel(&peer, chan_id).await {
						error!("channel reestablish failed: {}", e);
					}
				});
			}
		},
		Err(e) => error!("failed to load persisted channels: {}", e),
	}

	if let Err(e) = peer.run(reader).await {
		error!("peer {} disconnected: {}", target.address, e);
	}
}

fn main() {
	let args = Args::parse();
	let config = match load_config(&args.config) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Invalid configuration file: {}", e);
			std::process::exit(-1);
		},
	};
	env_logger::Builder::new().filter_level(config.log_level).init();

	let store: Arc<dyn KVStore> =
		match SqliteStore::new(PathBuf::from(&config.storage_dir_path), None, None) {
			Ok(store) => Arc::new(store),
			Err(e) => {
				eprintln!("Failed to open storage: {}", e);
				std::process::exit(-1);
			},
		};

	let backend = Arc::new(Unavailable);
	let ctx = NodeContext {
		wallet: backend.clone(),
		network: Arc::new(OfflineChain),
		router: backend.clone(),
		channel_db: Arc::new(GossipLogger),
		invoices: backend.clone(),
		commitment: backend,
		store,
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => runtime,
		Err(e) => {
			eprintln!("Failed to setup tokio runtime: {}", e);
			std::process::exit(-1);
		},
	};

	runtime.block_on(async {
		let mut sigterm_stream =
			match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
				Ok(stream) => stream,
				Err(e) => {
					eprintln!("Failed to register for SIGTERM stream: {}", e);
					std::process::exit(-1);
				},
			};

		for target in config.peers.clone() {
			let ctx = ctx.clone();
			let node_secret = config.node_secret;
			let chain_hash = config.chain_hash;
			let request_initial_sync = config.request_initial_sync;
			tokio::spawn(async move {
				run_peer(target, node_secret, chain_hash, request_initial_sync, ctx).await;
			});
		}

		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("Received CTRL-C, shutting down.."),
			_ = sigterm_stream.recv() => info!("Received SIGTERM, shutting down.."),
		}
	});
	info!("Shutdown complete..");
}
