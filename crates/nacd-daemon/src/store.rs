//! `SQLite`-backed lease store.
//!
//! The store is the single source of truth for "what does the DHCP daemon
//! currently believe about active leases", independent of the external
//! reservation database. It is durable so that state survives a restart of
//! this service; the hook protocol's `init` command exists specifically to
//! let a freshly restarted DHCP daemon re-learn this state without
//! re-issuing DHCP offers.
//!
//! # Invariants
//!
//! - At most one [`LeaseRecord`] per ip at any time (`ip` is the primary
//!   key). Upserts replace atomically.
//! - `upsert`, `delete`, and `snapshot` are linearizable: a single mutex
//!   guards the connection, and `snapshot` observes a consistent point in
//!   time. Throughput is bound by DHCP event rates, not store contention.
//! - Only hook events mutate the table; the reconciliation differ emits
//!   intents but never writes here directly.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use macaddr::MacAddr6;
use nacd_core::event::{LeaseCommand, LeaseEvent};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during lease store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A list-valued column failed to encode or decode.
    #[error("column encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored value could not be interpreted.
    #[error("corrupt {column} value {value:?} in lease table")]
    Corrupt {
        /// The offending column.
        column: &'static str,
        /// The stored value.
        value: String,
    },
}

/// One row of the lease store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Leased address; unique key of the store.
    pub ip: IpAddr,
    /// Client hardware address.
    pub mac: MacAddr6,
    /// Hostname associated with the lease.
    pub hostname: Option<String>,
    /// Hostname the client originally supplied.
    pub supplied_hostname: Option<String>,
    /// DNS domain of the lease.
    pub domain: Option<String>,
    /// Absolute expiry time.
    pub expires_at: DateTime<Utc>,
    /// DHCP client identifier, raw bytes.
    pub client_id: Option<Vec<u8>>,
    /// Relay the request came through.
    pub relay_ip: Option<IpAddr>,
    /// Agent circuit id, raw bytes.
    pub circuit_id: Option<Vec<u8>>,
    /// Subscriber id, raw bytes.
    pub subscriber_id: Option<Vec<u8>>,
    /// Agent remote id, raw bytes.
    pub remote_id: Option<Vec<u8>>,
    /// Vendor class identifier.
    pub vendor_class: Option<String>,
    /// Requested option codes, duplicates preserved.
    pub requested_options: Vec<u16>,
    /// User classes.
    pub user_classes: Vec<String>,
    /// Tags attached by the DHCP daemon.
    pub tags: Vec<String>,
    /// Time of the last mutation of this row.
    pub updated_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Build the record a lease event upserts.
    #[must_use]
    pub fn from_event(event: &LeaseEvent, updated_at: DateTime<Utc>) -> Self {
        Self {
            ip: event.ip,
            mac: event.mac,
            hostname: event.hostname.clone(),
            supplied_hostname: event.supplied_hostname.clone(),
            domain: event.domain.clone(),
            expires_at: event.expires_at,
            client_id: event.client_id.clone(),
            relay_ip: event.relay_ip,
            circuit_id: event.circuit_id.clone(),
            subscriber_id: event.subscriber_id.clone(),
            remote_id: event.remote_id.clone(),
            vendor_class: event.vendor_class.clone(),
            requested_options: event.requested_options.clone(),
            user_classes: event.user_classes.clone(),
            tags: event.tags.clone(),
            updated_at,
        }
    }

    /// Render this record as one line of the DHCP daemon's leasefile format:
    /// `<expiry-unix> <mac> <ip> <hostname|*> <client-id|*>`.
    #[must_use]
    pub fn leasefile_line(&self) -> String {
        let client_id = self
            .client_id
            .as_deref()
            .map_or_else(|| "*".to_owned(), format_colon_hex);
        format!(
            "{} {} {} {} {}\n",
            self.expires_at.timestamp(),
            format_mac(self.mac),
            self.ip,
            self.hostname.as_deref().unwrap_or("*"),
            client_id,
        )
    }
}

/// Lowercase colon-separated MAC rendering, as the DHCP daemon writes it.
#[must_use]
pub fn format_mac(mac: MacAddr6) -> String {
    let b = mac.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

fn format_colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The authoritative local table of active leases, keyed by ip.
#[derive(Debug)]
pub struct LeaseStore {
    conn: Mutex<Connection>,
}

impl LeaseStore {
    /// Open (or create) the lease store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the connection with schema and pragmas.
    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // rusqlite statements are transactional, so continuing is sound.
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Apply one lease event: Add and RenamedOrRenewed upsert, Delete
    /// removes.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying statement fails.
    pub fn apply_event(
        &self,
        event: &LeaseEvent,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match event.command {
            LeaseCommand::Add | LeaseCommand::RenamedOrRenewed => {
                self.upsert(&LeaseRecord::from_event(event, received_at))
            },
            LeaseCommand::Delete => {
                self.delete(event.ip)?;
                Ok(())
            },
        }
    }

    /// Insert or replace the record for its ip, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying statement fails.
    pub fn upsert(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT mac FROM dhcp_lease WHERE ip = ?1",
                params![record.ip.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(previous_mac) = existing {
            if previous_mac != format_mac(record.mac) {
                tracing::warn!(
                    ip = %record.ip,
                    previous_mac,
                    mac = %format_mac(record.mac),
                    "replacing existing lease with different mac"
                );
            }
        }
        conn.execute(
            "INSERT INTO dhcp_lease (
                ip, mac, hostname, supplied_hostname, domain, expires_at,
                client_id, relay_ip, circuit_id, subscriber_id, remote_id,
                vendor_class, requested_options, user_classes, tags, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16
            )
            ON CONFLICT (ip) DO UPDATE SET
                mac = excluded.mac,
                hostname = excluded.hostname,
                supplied_hostname = excluded.supplied_hostname,
                domain = excluded.domain,
                expires_at = excluded.expires_at,
                client_id = excluded.client_id,
                relay_ip = excluded.relay_ip,
                circuit_id = excluded.circuit_id,
                subscriber_id = excluded.subscriber_id,
                remote_id = excluded.remote_id,
                vendor_class = excluded.vendor_class,
                requested_options = excluded.requested_options,
                user_classes = excluded.user_classes,
                tags = excluded.tags,
                updated_at = excluded.updated_at",
            params![
                record.ip.to_string(),
                format_mac(record.mac),
                record.hostname,
                record.supplied_hostname,
                record.domain,
                record.expires_at.timestamp(),
                record.client_id,
                record.relay_ip.map(|ip| ip.to_string()),
                record.circuit_id,
                record.subscriber_id,
                record.remote_id,
                record.vendor_class,
                serde_json::to_string(&record.requested_options)?,
                serde_json::to_string(&record.user_classes)?,
                serde_json::to_string(&record.tags)?,
                record.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Remove the record for `ip` if present.
    ///
    /// Deleting an absent record is a no-op, not an error: DHCP daemons may
    /// send spurious deletes. Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying statement fails.
    pub fn delete(&self, ip: IpAddr) -> Result<bool, StoreError> {
        let removed = self.lock().execute(
            "DELETE FROM dhcp_lease WHERE ip = ?1",
            params![ip.to_string()],
        )?;
        if removed == 0 {
            tracing::debug!(%ip, "delete for unknown lease ignored");
        }
        Ok(removed > 0)
    }

    /// Fetch the record for `ip`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt.
    pub fn get(&self, ip: IpAddr) -> Result<Option<LeaseRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ip, mac, hostname, supplied_hostname, domain, expires_at,
                    client_id, relay_ip, circuit_id, subscriber_id, remote_id,
                    vendor_class, requested_options, user_classes, tags,
                    updated_at
             FROM dhcp_lease WHERE ip = ?1",
        )?;
        let row = stmt
            .query_row(params![ip.to_string()], row_to_raw)
            .optional()?;
        row.map(RawLeaseRow::into_record).transpose()
    }

    /// All current leases at a single consistent point in time, ordered by
    /// ip.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt.
    pub fn snapshot(&self) -> Result<Vec<LeaseRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT ip, mac, hostname, supplied_hostname, domain, expires_at,
                    client_id, relay_ip, circuit_id, subscriber_id, remote_id,
                    vendor_class, requested_options, user_classes, tags,
                    updated_at
             FROM dhcp_lease",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;
        let mut records = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(RawLeaseRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.ip);
        Ok(records)
    }

    /// The `(mac, ip)` occupancy of the store, for forced reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt.
    pub fn occupancy(&self) -> Result<Vec<(MacAddr6, IpAddr)>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .map(|r| (r.mac, r.ip))
            .collect())
    }

    /// Number of active leases.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.lock()
                .query_row("SELECT COUNT(*) FROM dhcp_lease", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Returns `true` if no lease is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Column values as stored, before domain-type interpretation.
struct RawLeaseRow {
    ip: String,
    mac: String,
    hostname: Option<String>,
    supplied_hostname: Option<String>,
    domain: Option<String>,
    expires_at: i64,
    client_id: Option<Vec<u8>>,
    relay_ip: Option<String>,
    circuit_id: Option<Vec<u8>>,
    subscriber_id: Option<Vec<u8>>,
    remote_id: Option<Vec<u8>>,
    vendor_class: Option<String>,
    requested_options: String,
    user_classes: String,
    tags: String,
    updated_at: i64,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLeaseRow> {
    Ok(RawLeaseRow {
        ip: row.get(0)?,
        mac: row.get(1)?,
        hostname: row.get(2)?,
        supplied_hostname: row.get(3)?,
        domain: row.get(4)?,
        expires_at: row.get(5)?,
        client_id: row.get(6)?,
        relay_ip: row.get(7)?,
        circuit_id: row.get(8)?,
        subscriber_id: row.get(9)?,
        remote_id: row.get(10)?,
        vendor_class: row.get(11)?,
        requested_options: row.get(12)?,
        user_classes: row.get(13)?,
        tags: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl RawLeaseRow {
    fn into_record(self) -> Result<LeaseRecord, StoreError> {
        let ip = self.ip.parse().map_err(|_| StoreError::Corrupt {
            column: "ip",
            value: self.ip.clone(),
        })?;
        let mac = self.mac.parse().map_err(|_| StoreError::Corrupt {
            column: "mac",
            value: self.mac.clone(),
        })?;
        let relay_ip = match &self.relay_ip {
            Some(raw) => Some(raw.parse().map_err(|_| StoreError::Corrupt {
                column: "relay_ip",
                value: raw.clone(),
            })?),
            None => None,
        };
        let expires_at = Utc
            .timestamp_opt(self.expires_at, 0)
            .single()
            .ok_or_else(|| StoreError::Corrupt {
                column: "expires_at",
                value: self.expires_at.to_string(),
            })?;
        let updated_at = Utc
            .timestamp_opt(self.updated_at, 0)
            .single()
            .ok_or_else(|| StoreError::Corrupt {
                column: "updated_at",
                value: self.updated_at.to_string(),
            })?;
        Ok(LeaseRecord {
            ip,
            mac,
            hostname: self.hostname,
            supplied_hostname: self.supplied_hostname,
            domain: self.domain,
            expires_at,
            client_id: self.client_id,
            relay_ip,
            circuit_id: self.circuit_id,
            subscriber_id: self.subscriber_id,
            remote_id: self.remote_id,
            vendor_class: self.vendor_class,
            requested_options: serde_json::from_str(&self.requested_options)?,
            user_classes: serde_json::from_str(&self.user_classes)?,
            tags: serde_json::from_str(&self.tags)?,
            updated_at,
        })
    }
}
