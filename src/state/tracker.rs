//! State Tracker
//!
//! Persistent cluster context backed by SQLite. The shared configuration
//! is mirrored in `state.db` so a restarted node resumes from the last
//! configuration it applied; the engine tables stand in for the storage
//! engine's own database catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{ClusterContext, SharedConfiguration};
use crate::error::{Error, Result};
use crate::id::{LogId, NodeIdentity, SessionOperationId};

struct Inner {
    conn: Connection,
    /// In-memory copy of the persisted configuration
    shared: SharedConfiguration,
}

/// Cluster context persisted in a SQLite database
pub struct SqliteClusterContext {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl SqliteClusterContext {
    /// Create or open `state.db` in the data directory.
    ///
    /// `default_quorum` is used only when the database is new.
    pub fn open(data_dir: &Path, default_quorum: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let path = data_dir.join("state.db");
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS shared_nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shared_databases (
                name TEXT PRIMARY KEY,
                db_type TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shared_sequentials (
                node_id TEXT PRIMARY KEY,
                sequential INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS engine_databases (
                name TEXT PRIMARY KEY,
                db_type TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO node_state (key, value_int) VALUES ('quorum', ?1)",
            params![default_quorum as i64],
        )?;

        let shared = load_shared(&conn)?;

        Ok(Self {
            inner: Mutex::new(Inner { conn, shared }),
            path,
        })
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the databases present in the storage engine
    pub fn engine_databases(&self) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT name FROM engine_databases ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::State("state tracker lock poisoned".into()))
    }
}

fn load_shared(conn: &Connection) -> Result<SharedConfiguration> {
    let quorum: Option<i64> = conn
        .query_row(
            "SELECT value_int FROM node_state WHERE key = 'quorum'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let last_update: Option<i64> = conn
        .query_row(
            "SELECT value_int FROM node_state WHERE key = 'last_update_id'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let mut shared = SharedConfiguration::new(quorum.unwrap_or(0).max(0) as usize);
    shared.set_last_update_id(last_update.map(|id| LogId::new(id as u64)));

    let mut stmt = conn.prepare("SELECT id, name FROM shared_nodes")?;
    let nodes = stmt.query_map([], |row| {
        Ok(NodeIdentity::new(
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
        ))
    })?;
    for node in nodes {
        shared.add_node(node?);
    }

    let mut stmt = conn.prepare("SELECT name, db_type, config FROM shared_databases")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (name, db_type, config) = row?;
        let config: BTreeMap<String, String> = serde_json::from_str(&config)
            .map_err(|e| Error::State(format!("Invalid config for database {}: {}", name, e)))?;
        shared.add_database(&name, &db_type, config);
    }

    let mut stmt = conn.prepare("SELECT node_id, sequential FROM shared_sequentials")?;
    let rows = stmt.query_map([], |row| {
        Ok(SessionOperationId::new(
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? as u64,
        ))
    })?;
    for row in rows {
        shared.record_applied(&row?);
    }

    Ok(shared)
}

fn store_shared(conn: &mut Connection, shared: &SharedConfiguration) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        INSERT INTO node_state (key, value_int) VALUES ('quorum', ?1)
        ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
        "#,
        params![shared.configured_quorum() as i64],
    )?;

    match shared.last_update_id() {
        Some(id) => {
            tx.execute(
                r#"
                INSERT INTO node_state (key, value_int) VALUES ('last_update_id', ?1)
                ON CONFLICT(key) DO UPDATE SET value_int = ?1, updated_at = CURRENT_TIMESTAMP
                "#,
                params![id.as_u64() as i64],
            )?;
        }
        None => {
            tx.execute("DELETE FROM node_state WHERE key = 'last_update_id'", [])?;
        }
    }

    tx.execute("DELETE FROM shared_nodes", [])?;
    for node in shared.nodes() {
        tx.execute(
            "INSERT INTO shared_nodes (id, name) VALUES (?1, ?2)",
            params![node.id, node.name],
        )?;
    }

    tx.execute("DELETE FROM shared_databases", [])?;
    for (name, descriptor) in shared.databases() {
        let config = serde_json::to_string(&descriptor.config)
            .map_err(|e| Error::State(format!("Failed to encode config: {}", e)))?;
        tx.execute(
            "INSERT INTO shared_databases (name, db_type, config) VALUES (?1, ?2, ?3)",
            params![name, descriptor.db_type, config],
        )?;
    }

    tx.execute("DELETE FROM shared_sequentials", [])?;
    for (node_id, sequential) in shared.applied_sequentials() {
        tx.execute(
            "INSERT INTO shared_sequentials (node_id, sequential) VALUES (?1, ?2)",
            params![node_id, *sequential as i64],
        )?;
    }

    tx.commit()?;
    Ok(())
}

impl ClusterContext for SqliteClusterContext {
    fn read_shared_configuration(&self) -> SharedConfiguration {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shared
            .clone()
    }

    fn modify_shared_configuration(
        &self,
        update: &mut dyn FnMut(&mut SharedConfiguration),
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let mut shared = inner.shared.clone();
        update(&mut shared);
        store_shared(&mut inner.conn, &shared)?;
        inner.shared = shared;
        Ok(())
    }

    fn replace_shared_configuration(&self, configuration: SharedConfiguration) -> Result<()> {
        let mut inner = self.lock()?;
        store_shared(&mut inner.conn, &configuration)?;
        inner.shared = configuration;
        Ok(())
    }

    fn internal_create_database(
        &self,
        name: &str,
        db_type: &str,
        _config: &BTreeMap<String, String>,
    ) -> Result<()> {
        let inner = self.lock()?;
        inner.conn.execute(
            r#"
            INSERT INTO engine_databases (name, db_type) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET db_type = ?2, created_at = CURRENT_TIMESTAMP
            "#,
            params![name, db_type],
        )?;
        Ok(())
    }

    fn internal_drop_database(&self, name: &str) -> Result<()> {
        let inner = self.lock()?;
        inner
            .conn
            .execute("DELETE FROM engine_databases WHERE name = ?1", params![name])?;
        Ok(())
    }
}
