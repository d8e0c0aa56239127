// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

pub(crate) mod sqlite_store;

use std::io;

use hex::DisplayHex;

use crate::channel::Channel;

pub use sqlite_store::SqliteStore;

/// Channel records are persisted under this namespace.
pub(crate) const CHANNELS_PERSISTENCE_NAMESPACE: &str = "channels";

/// A namespaced key-value store. Writes must be atomic per key.
pub trait KVStore: Send + Sync {
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error>;

	fn write(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), io::Error>;

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error>;
}

/// Serializes a channel record into the store. This is the single mutation
/// sink: every lifecycle transition flushes through here.
pub fn save_channel(store: &dyn KVStore, chan: &Channel) -> Result<(), io::Error> {
	let value = serde_json::to_vec(chan)
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}", e)))?;
	store.write(CHANNELS_PERSISTENCE_NAMESPACE, &chan.channel_id.to_lower_hex_string(), &value)
}

/// Lists and deserializes every persisted channel record.
pub fn load_channels(store: &dyn KVStore) -> Result<Vec<Channel>, io::Error> {
	let keys = store.list(CHANNELS_PERSISTENCE_NAMESPACE)?;
	let mut channels = Vec::with_capacity(keys.len());
	for key in keys {
		let bytes = store.read(CHANNELS_PERSISTENCE_NAMESPACE, &key)?;
		let chan: Channel = serde_json::from_slice(&bytes).map_err(|e| {
			io::Error::new(io::ErrorKind::InvalidData, format!("Failed to decode channel: {}", e))
		})?;
		channels.push(chan);
	}
	Ok(channels)
}
