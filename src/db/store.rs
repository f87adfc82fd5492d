//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("status {status_id} is {current}, transition rejected")]
    Conflict { status_id: i64, current: RowState },
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("artifact error: {0}")]
    Artifact(#[from] std::io::Error),
}

/// Filter criteria for listing clients.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub status: Option<ClientStatus>,
    pub os_type: Option<OsType>,
    /// Substring match on hostname or IP address.
    pub search: Option<String>,
}

/// Filter criteria for listing packages.
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    pub os_compatibility: Option<OsCompatibility>,
    pub is_active: Option<bool>,
    /// Substring match on name or version.
    pub search: Option<String>,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // --- Clients ---

    /// Register a client. A freshly registered client is online.
    pub fn add_client(&self, client: &NewClient, now: DateTime<Utc>) -> Result<ClientMachine, DbError> {
        let conn = self.conn()?;
        let now_str = fmt_db_time(&now);
        conn.execute(
            "INSERT INTO clients (hostname, ip_address, os_type, os_version, status, last_seen, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                client.hostname,
                client.ip_address,
                client.os_type,
                client.os_version,
                ClientStatus::Online,
                now_str,
            ],
        )
        .map_err(|e| unique_violation(e, format!("client {}", client.hostname)))?;
        let id = conn.last_insert_rowid();
        query_client(&conn, id)
    }

    /// Get a client by ID.
    pub fn get_client(&self, id: i64) -> Result<ClientMachine, DbError> {
        let conn = self.conn()?;
        query_client(&conn, id)
    }

    /// Get clients matching the filter, most recently seen first.
    pub fn get_clients(&self, filter: &ClientFilter) -> Result<Vec<ClientMachine>, DbError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM clients WHERE 1=1", CLIENT_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            args.push(Box::new(status));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(os_type) = filter.os_type {
            args.push(Box::new(os_type));
            sql.push_str(&format!(" AND os_type = ?{}", args.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            args.push(Box::new(like_pattern(search)));
            let n = args.len();
            sql.push_str(&format!(" AND (hostname LIKE ?{n} OR ip_address LIKE ?{n})"));
        }
        sql.push_str(" ORDER BY last_seen DESC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let clients = stmt
            .query_map(params_from_iter(args.iter()), |row| client_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clients)
    }

    /// Set a client's liveness status and bump `last_seen`.
    pub fn update_client_status(
        &self,
        id: i64,
        status: ClientStatus,
        now: DateTime<Utc>,
    ) -> Result<ClientMachine, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE clients SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status, fmt_db_time(&now), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        query_client(&conn, id)
    }

    /// Mark online clients not seen since `cutoff` as offline.
    ///
    /// `last_seen` is left untouched. Returns the number of clients changed.
    pub fn mark_stale_clients_offline(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE clients SET status = ?1 WHERE status = ?2 AND last_seen < ?3",
            params![ClientStatus::Offline, ClientStatus::Online, fmt_db_time(&cutoff)],
        )?;
        Ok(changed)
    }

    // --- Packages ---

    /// Add a package. `(name, version)` must be unique.
    pub fn add_package(&self, package: &NewPackage, now: DateTime<Utc>) -> Result<Package, DbError> {
        self.add_package_with(package, now, || Ok(()))
    }

    /// Add a package, running `place` after the insert and before commit.
    /// The row is rolled back if `place` fails, so a package is only ever
    /// visible once its artifact is in place.
    pub fn add_package_with<F>(&self, package: &NewPackage, now: DateTime<Utc>, place: F) -> Result<Package, DbError>
    where
        F: FnOnce() -> std::io::Result<()>,
    {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO packages (name, version, description, os_compatibility, size, checksum, artifact_ref, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                package.name,
                package.version,
                package.description,
                package.os_compatibility,
                package.size,
                package.checksum,
                package.artifact_ref,
                fmt_db_time(&now),
            ],
        )
        .map_err(|e| unique_violation(e, format!("package {} {}", package.name, package.version)))?;
        let id = tx.last_insert_rowid();
        let created = query_package(&tx, id)?;

        place()?;
        tx.commit()?;
        Ok(created)
    }

    /// Get a package by ID.
    pub fn get_package(&self, id: i64) -> Result<Package, DbError> {
        let conn = self.conn()?;
        query_package(&conn, id)
    }

    /// Get packages matching the filter, newest first.
    pub fn get_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>, DbError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {} FROM packages WHERE 1=1", PACKAGE_COLUMNS);
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(os) = filter.os_compatibility {
            args.push(Box::new(os));
            sql.push_str(&format!(" AND os_compatibility = ?{}", args.len()));
        }
        if let Some(active) = filter.is_active {
            args.push(Box::new(active));
            sql.push_str(&format!(" AND is_active = ?{}", args.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            args.push(Box::new(like_pattern(search)));
            let n = args.len();
            sql.push_str(&format!(" AND (name LIKE ?{n} OR version LIKE ?{n})"));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let packages = stmt
            .query_map(params_from_iter(args.iter()), |row| package_from_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(packages)
    }

    /// Toggle whether a package may be deployed.
    pub fn set_package_active(&self, id: i64, active: bool) -> Result<Package, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE packages SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        query_package(&conn, id)
    }
}

pub(super) const CLIENT_COLUMNS: &str =
    "id, hostname, ip_address, os_type, os_version, status, last_seen, registered_at";

pub(super) const PACKAGE_COLUMNS: &str =
    "id, name, version, description, os_compatibility, size, checksum, artifact_ref, is_active, created_at";

pub(super) fn query_client(conn: &Connection, id: i64) -> Result<ClientMachine, DbError> {
    conn.query_row(
        &format!("SELECT {} FROM clients WHERE id = ?1", CLIENT_COLUMNS),
        params![id],
        |row| client_from_row(row, 0),
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

pub(super) fn query_package(conn: &Connection, id: i64) -> Result<Package, DbError> {
    conn.query_row(
        &format!("SELECT {} FROM packages WHERE id = ?1", PACKAGE_COLUMNS),
        params![id],
        |row| package_from_row(row, 0),
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

/// Map a row to a client, reading `CLIENT_COLUMNS` starting at `at`.
pub(super) fn client_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<ClientMachine> {
    Ok(ClientMachine {
        id: row.get(at)?,
        hostname: row.get(at + 1)?,
        ip_address: row.get(at + 2)?,
        os_type: row.get(at + 3)?,
        os_version: row.get(at + 4)?,
        status: row.get(at + 5)?,
        last_seen: time_col(row, at + 6)?,
        registered_at: time_col(row, at + 7)?,
    })
}

/// Map a row to a package, reading `PACKAGE_COLUMNS` starting at `at`.
pub(super) fn package_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Package> {
    Ok(Package {
        id: row.get(at)?,
        name: row.get(at + 1)?,
        version: row.get(at + 2)?,
        description: row.get(at + 3)?,
        os_compatibility: row.get(at + 4)?,
        size: row.get(at + 5)?,
        checksum: row.get(at + 6)?,
        artifact_ref: row.get(at + 7)?,
        is_active: row.get(at + 8)?,
        created_at: time_col(row, at + 9)?,
    })
}

fn unique_violation(e: rusqlite::Error, what: String) -> DbError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::ConstraintViolation => {
            DbError::Duplicate(what)
        }
        other => DbError::Sqlite(other),
    }
}

fn like_pattern(search: &str) -> String {
    format!("%{}%", search.replace('%', "").replace('_', ""))
}

/// Format a timestamp for storage. Fixed width, so stored values order lexically.
pub(super) fn fmt_db_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

pub(super) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| bad_time(idx, &s))
}

pub(super) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => parse_db_time(&s).map(Some).ok_or_else(|| bad_time(idx, &s)),
        None => Ok(None),
    }
}

fn bad_time(idx: usize, s: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid timestamp: {}", s).into(),
    )
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
