// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Contracts of the collaborators the peer engine drives but does not
//! implement: key custody and funding-transaction construction, the
//! commitment-transaction machine, path finding and onion handling, gossip
//! indexing, and channel persistence.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};
use lnpeerd_wire::Message;

use crate::channel::{Channel, Htlc, Revocation, ShortChannelId};
use crate::error::PeerError;
use crate::io::persist::KVStore;
use crate::keys::{KeyFamily, Keypair};

/// Forwarding policy of a route edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
	pub cltv_expiry_delta: u16,
	pub fee_base_msat: u64,
	pub fee_proportional_millionths: u64,
}

/// One hop of a payment route as produced by the path finder.
#[derive(Debug, Clone)]
pub struct RouteEdge {
	pub node_id: PublicKey,
	pub short_channel_id: ShortChannelId,
	pub policy: ChannelPolicy,
}

/// Per-hop payload handed to the onion wrapper.
#[derive(Debug, Clone)]
pub struct HopData {
	pub short_channel_id: ShortChannelId,
	pub amount_msat: u64,
	pub cltv_expiry: u32,
}

/// A decoded onion failure: the BOLT 4 failure code, its payload, and the
/// index of the reporting hop within the route.
#[derive(Debug, Clone)]
pub struct OnionFailure {
	pub code: u16,
	pub data: Vec<u8>,
	pub sender_idx: usize,
}

/// What we know about an invoice we issued, keyed by payment hash.
#[derive(Debug, Clone, Copy)]
pub struct Invoice {
	pub payment_preimage: [u8; 32],
	pub amount_msat: u64,
	pub min_final_cltv_expiry: u32,
}

/// Key custody and funding-transaction construction.
#[async_trait]
pub trait Wallet: Send + Sync {
	/// Builds (but does not broadcast) a transaction paying `value_sat` to
	/// `output_script`.
	async fn make_funding_tx(
		&self, output_script: ScriptBuf, value_sat: u64, feerate: u32,
	) -> Result<Transaction, PeerError>;

	/// A channel-level keypair from the keystore derivation family.
	fn get_keypair(&self, family: KeyFamily, index: u32) -> Result<Keypair, PeerError>;
}

/// Chain access, path blacklisting and user-facing event callbacks.
#[async_trait]
pub trait NetworkGateway: Send + Sync {
	async fn broadcast(&self, tx: &Transaction) -> Result<Txid, PeerError>;

	fn local_height(&self) -> u32;

	/// Excludes a channel from future route computation.
	fn blacklist(&self, short_channel_id: ShortChannelId);

	/// Surfaces a channel lifecycle transition to the user.
	fn channel_event(&self, chan: &Channel);
}

/// Route computation and onion packet handling.
pub trait Router: Send + Sync {
	fn create_route_from_path(
		&self, path: &[PublicKey], self_pubkey: &PublicKey,
	) -> Result<Vec<RouteEdge>, PeerError>;

	fn new_onion_packet(
		&self, hop_nodes: &[PublicKey], session_key: &[u8; 32], hops_data: &[HopData],
		associated_data: &[u8; 32],
	) -> Result<Vec<u8>, PeerError>;

	fn decode_onion_error(
		&self, reason: &[u8], hop_nodes: &[PublicKey], session_key: &[u8; 32],
	) -> Result<OnionFailure, PeerError>;
}

/// Gossip sink; absorbs announcements without feeding anything back.
pub trait ChannelDatabase: Send + Sync {
	fn on_channel_announcement(&self, msg: &Message);

	fn on_channel_update(&self, msg: &Message);

	fn on_node_announcement(&self, node_id: &PublicKey, alias: &str, addresses: &[SocketAddr]);
}

/// Lookup of invoices we issued, by payment hash.
pub trait InvoiceStore: Send + Sync {
	fn find_by_payment_hash(&self, payment_hash: &[u8; 32]) -> Option<Invoice>;
}

/// The commitment-transaction machine. Stateless from the peer's point of
/// view: every operation mutates the [`Channel`] record it is handed and the
/// engine never calls back into the peer.
pub trait CommitmentEngine: Send + Sync {
	/// Signs the counterparty's next commitment. Returns the 64-byte
	/// commitment signature and one signature per HTLC output.
	fn sign_next_commitment(&self, chan: &mut Channel)
		-> Result<(Vec<u8>, Vec<Vec<u8>>), PeerError>;

	/// Validates and applies the counterparty's signatures over our next
	/// commitment.
	fn receive_new_commitment(
		&self, chan: &mut Channel, signature: &[u8], htlc_signatures: &[Vec<u8>],
	) -> Result<(), PeerError>;

	/// Revokes our current commitment, yielding the material for an outbound
	/// `revoke_and_ack`.
	fn revoke_current_commitment(&self, chan: &mut Channel) -> Result<Revocation, PeerError>;

	/// Applies the counterparty's revocation of their current commitment.
	fn receive_revocation(&self, chan: &mut Channel, revocation: &Revocation)
		-> Result<(), PeerError>;

	/// Adds an outbound HTLC; returns the id it was assigned.
	fn add_htlc(&self, chan: &mut Channel, htlc: &Htlc) -> Result<u64, PeerError>;

	/// Records an inbound HTLC offered by the counterparty.
	fn receive_htlc(&self, chan: &mut Channel, htlc: &Htlc) -> Result<(), PeerError>;

	/// Settles an inbound HTLC we know the preimage for.
	fn settle_htlc(&self, chan: &mut Channel, preimage: &[u8; 32], htlc_id: u64)
		-> Result<(), PeerError>;

	/// Applies the counterparty's settlement of one of our outbound HTLCs.
	fn receive_htlc_settle(
		&self, chan: &mut Channel, preimage: &[u8; 32], htlc_id: u64,
	) -> Result<(), PeerError>;

	/// Removes a failed outbound HTLC.
	fn fail_htlc(&self, chan: &mut Channel, htlc: &Htlc) -> Result<(), PeerError>;

	/// Builds a bare commitment transaction at the given number and balances.
	fn make_commitment(
		&self, chan: &Channel, ctn: i64, remote: bool, per_commitment_point: &PublicKey,
		remote_msat: u64, local_msat: u64,
	) -> Result<Transaction, PeerError>;

	/// Signs a commitment transaction with the funding key, returning the
	/// 64-byte compact signature.
	fn sign_commitment_transaction(
		&self, chan: &Channel, tx: &Transaction,
	) -> Result<Vec<u8>, PeerError>;

	fn update_fee(&self, chan: &mut Channel, feerate_per_kw: u32);
}

/// Handles to every collaborator, shared by the engine and its flows.
#[derive(Clone)]
pub struct NodeContext {
	pub wallet: Arc<dyn Wallet>,
	pub network: Arc<dyn NetworkGateway>,
	pub router: Arc<dyn Router>,
	pub channel_db: Arc<dyn ChannelDatabase>,
	pub invoices: Arc<dyn InvoiceStore>,
	pub commitment: Arc<dyn CommitmentEngine>,
	pub store: Arc<dyn KVStore>,
}
