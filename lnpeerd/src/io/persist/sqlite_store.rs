// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{named_params, Connection};

use super::KVStore;

/// The default database file name.
const DEFAULT_SQLITE_DB_FILE_NAME: &str = "lnpeerd.sqlite";

/// The default table in which we store all data.
const DEFAULT_KV_TABLE_NAME: &str = "lnpeerd_data";

/// A [`KVStore`] implementation backed by a single SQLite database.
pub struct SqliteStore {
	connection: Arc<Mutex<Connection>>,
	kv_table_name: String,
}

impl SqliteStore {
	/// Opens (creating if necessary) the database under `data_dir`.
	pub fn new(
		data_dir: PathBuf, db_file_name: Option<String>, kv_table_name: Option<String>,
	) -> Result<SqliteStore, io::Error> {
		let db_file_name = db_file_name.unwrap_or_else(|| DEFAULT_SQLITE_DB_FILE_NAME.to_string());
		let kv_table_name = kv_table_name.unwrap_or_else(|| DEFAULT_KV_TABLE_NAME.to_string());

		fs::create_dir_all(&data_dir).map_err(|e| {
			io::Error::new(
				e.kind(),
				format!("Failed to create database parent directory: {}", e),
			)
		})?;
		let db_path = data_dir.join(db_file_name);
		let connection = Connection::open(db_path).map_err(from_sqlite_error)?;

		connection
			.execute(
				&format!(
					"CREATE TABLE IF NOT EXISTS {} (
						namespace TEXT NOT NULL,
						key TEXT NOT NULL CHECK (key <> ''),
						value BLOB,
						PRIMARY KEY (namespace, key)
					);",
					kv_table_name
				),
				[],
			)
			.map_err(from_sqlite_error)?;

		Ok(SqliteStore { connection: Arc::new(Mutex::new(connection)), kv_table_name })
	}
}

impl KVStore for SqliteStore {
	fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, io::Error> {
		let connection = self.connection.lock().unwrap();
		let sql = format!(
			"SELECT value FROM {} WHERE namespace=:namespace AND key=:key;",
			self.kv_table_name
		);
		let mut stmt = connection.prepare_cached(&sql).map_err(from_sqlite_error)?;
		stmt.query_row(named_params! { ":namespace": namespace, ":key": key }, |row| {
			row.get::<usize, Vec<u8>>(0)
		})
		.map_err(|e| match e {
			rusqlite::Error::QueryReturnedNoRows => io::Error::new(
				io::ErrorKind::NotFound,
				format!("Failed to read key {}/{}: not found", namespace, key),
			),
			e => from_sqlite_error(e),
		})
	}

	fn write(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), io::Error> {
		let connection = self.connection.lock().unwrap();
		let sql = format!(
			"INSERT OR REPLACE INTO {} (namespace, key, value) VALUES (:namespace, :key, :value);",
			self.kv_table_name
		);
		let mut stmt = connection.prepare_cached(&sql).map_err(from_sqlite_error)?;
		stmt.execute(named_params! { ":namespace": namespace, ":key": key, ":value": value })
			.map(|_| ())
			.map_err(from_sqlite_error)
	}

	fn list(&self, namespace: &str) -> Result<Vec<String>, io::Error> {
		let connection = self.connection.lock().unwrap();
		let sql =
			format!("SELECT key FROM {} WHERE namespace=:namespace ORDER BY key;", self.kv_table_name);
		let mut stmt = connection.prepare_cached(&sql).map_err(from_sqlite_error)?;
		let rows = stmt
			.query_map(named_params! { ":namespace": namespace }, |row| row.get::<usize, String>(0))
			.map_err(from_sqlite_error)?;
		let mut keys = Vec::new();
		for row in rows {
			keys.push(row.map_err(from_sqlite_error)?);
		}
		Ok(keys)
	}
}

fn from_sqlite_error(e: rusqlite::Error) -> io::Error {
	io::Error::new(io::ErrorKind::Other, format!("SQLite operation failed: {}", e))
}
