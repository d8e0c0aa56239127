// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::io;
use std::path::Path;
use std::str::FromStr;
use std::{fs, net::SocketAddr};

use bitcoin::secp256k1::{PublicKey, SecretKey};
use hex::FromHex;
use log::LevelFilter;
use serde::Deserialize;

/// Display-order hex of the Bitcoin mainnet genesis block hash.
const MAINNET_GENESIS: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

const DEFAULT_STORAGE_DIR: &str = "./lnpeerd";

/// Configuration for the peer daemon.
#[derive(Debug)]
pub struct Config {
	pub node_secret: SecretKey,
	pub peers: Vec<PeerTarget>,
	/// The genesis hash in wire order (reversed display hex), sent as
	/// `chain_hash` in channel and gossip messages.
	pub chain_hash: [u8; 32],
	pub storage_dir_path: String,
	pub log_level: LevelFilter,
	pub request_initial_sync: bool,
}

/// A remote node to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
	pub pubkey: PublicKey,
	pub address: SocketAddr,
}

#[derive(Deserialize)]
struct TomlConfig {
	node: NodeToml,
	peer: Option<Vec<PeerToml>>,
	chain: Option<ChainToml>,
	storage: Option<StorageToml>,
	log: Option<LogToml>,
}

#[derive(Deserialize)]
struct NodeToml {
	seed: String,
	request_initial_sync: Option<bool>,
}

#[derive(Deserialize)]
struct PeerToml {
	pubkey: String,
	address: String,
}

#[derive(Deserialize)]
struct ChainToml {
	genesis_hash: Option<String>,
}

#[derive(Deserialize)]
struct StorageToml {
	dir_path: Option<String>,
}

#[derive(Deserialize)]
struct LogToml {
	level: Option<String>,
}

/// Loads and validates the daemon configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, io::Error> {
	let contents = fs::read_to_string(path)?;
	parse_config(&contents)
}

fn parse_config(contents: &str) -> Result<Config, io::Error> {
	let toml_config: TomlConfig = toml::from_str(contents)
		.map_err(|e| invalid_input(format!("Config file contains invalid TOML format: {}", e)))?;

	let seed = <[u8; 32]>::from_hex(&toml_config.node.seed)
		.map_err(|_| invalid_input("node.seed must be 32 bytes of hex."))?;
	let node_secret = SecretKey::from_slice(&seed)
		.map_err(|_| invalid_input("node.seed is not a valid secp256k1 secret key."))?;

	let mut peers = Vec::new();
	for peer in toml_config.peer.unwrap_or_default() {
		let pubkey = PublicKey::from_str(&peer.pubkey)
			.map_err(|e| invalid_input(format!("Invalid peer pubkey configured: {}", e)))?;
		let address = peer
			.address
			.parse::<SocketAddr>()
			.map_err(|e| invalid_input(format!("Invalid peer address configured: {}", e)))?;
		peers.push(PeerTarget { pubkey, address });
	}

	let genesis_display = toml_config
		.chain
		.and_then(|c| c.genesis_hash)
		.unwrap_or_else(|| MAINNET_GENESIS.to_string());
	let genesis = <[u8; 32]>::from_hex(&genesis_display)
		.map_err(|_| invalid_input("chain.genesis_hash must be 32 bytes of hex."))?;
	let mut chain_hash = genesis;
	chain_hash.reverse();

	let storage_dir_path = toml_config
		.storage
		.and_then(|s| s.dir_path)
		.unwrap_or_else(|| DEFAULT_STORAGE_DIR.to_string());

	let log_level = match toml_config.log.and_then(|l| l.level) {
		Some(level) => LevelFilter::from_str(&level)
			.map_err(|_| invalid_input(format!("Invalid log level configured: {}", level)))?,
		None => LevelFilter::Info,
	};

	Ok(Config {
		node_secret,
		peers,
		chain_hash,
		storage_dir_path,
		log_level,
		request_initial_sync: toml_config.node.request_initial_sync.unwrap_or(false),
	})
}

fn invalid_input(message: impl Into<String>) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

#[cfg(test)]
mod tests {
	use super::*;

	const DEFAULT_CONFIG: &str = r#"
				[node]
				seed = "1111111111111111111111111111111111111111111111111111111111111111"
				request_initial_sync = true

				[[peer]]
				pubkey = "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7"
				address = "127.0.0.1:9735"

				[chain]
				genesis_hash = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"

				[storage]
				dir_path = "/tmp/lnpeerd"

				[log]
				level = "Debug"
				"#;

	#[test]
	fn test_config_from_toml() {
		let config = parse_config(DEFAULT_CONFIG).unwrap();
		assert_eq!(config.peers.len(), 1);
		assert_eq!(config.peers[0].address.port(), 9735);
		assert_eq!(config.storage_dir_path, "/tmp/lnpeerd");
		assert_eq!(config.log_level, LevelFilter::Debug);
		assert!(config.request_initial_sync);
		// chain_hash is the genesis hash reversed into wire order.
		assert_eq!(config.chain_hash[0], 0x6f);
		assert_eq!(config.chain_hash[31], 0x00);
	}

	#[test]
	fn test_defaults_applied() {
		let config = parse_config(
			r#"
				[node]
				seed = "1111111111111111111111111111111111111111111111111111111111111111"
				"#,
		)
		.unwrap();
		assert!(config.peers.is_empty());
		assert_eq!(config.storage_dir_path, DEFAULT_STORAGE_DIR);
		assert_eq!(config.log_level, LevelFilter::Info);
		assert!(!config.request_initial_sync);
	}

	#[test]
	fn test_invalid_seed_rejected() {
		let err = parse_config(
			r#"
				[node]
				seed = "beef"
				"#,
		)
		.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}

	#[test]
	fn test_invalid_peer_address_rejected() {
		let err = parse_config(
			r#"
				[node]
				seed = "1111111111111111111111111111111111111111111111111111111111111111"

				[[peer]]
				pubkey = "028d7500dd4c12685d1f568b4c2b5048e8534b873319f3a8daa612b469132ec7f7"
				address = "not-an-address"
				"#,
		)
		.unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
	}
}
