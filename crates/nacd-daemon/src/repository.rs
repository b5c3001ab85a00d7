//! Repository-style seams toward the external database collaborator.
//!
//! The reconciliation scheduler never talks to a concrete database; it
//! fetches snapshots through [`ReservationRepository`] and applies actions
//! through [`ActionSink`]. Production wires a `SQLite`-backed repository
//! reading the locally replicated reservation table and a sink that emits
//! DHCPRELEASE packets; tests substitute scripted fakes.

use std::path::Path;
use std::sync::Mutex;

use nacd_core::reconcile::{ReconciliationAction, Reservation, ReservationSnapshot};
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::store::StoreError;

/// Errors fetching a reservation snapshot.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value could not be interpreted.
    #[error("corrupt {column} value {value:?} in reservation table")]
    Corrupt {
        /// The offending column.
        column: &'static str,
        /// The stored value.
        value: String,
    },
}

/// Errors applying reconciliation actions.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The lease store could not be consulted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A release packet could not be sent.
    #[error("failed to send release packet: {0}")]
    Io(#[from] std::io::Error),
}

/// Read access to the declared host reservations.
///
/// One call returns the full set of bindings at one point in time; the
/// snapshot is owned exclusively by the reconciliation pass that fetched it.
pub trait ReservationRepository: Send + Sync {
    /// Fetch the current reservation snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database is unreachable or corrupt;
    /// the caller aborts the pass and retries later against the unchanged
    /// previous baseline.
    fn fetch_snapshot(&self) -> Result<ReservationSnapshot, RepositoryError>;
}

/// Consumer of the differ's corrective actions.
pub trait ActionSink: Send + Sync {
    /// Apply the ordered action set of one reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the actions could not be applied; the pass is
    /// treated as failed and the previous baseline is kept.
    fn apply(&self, actions: &[ReconciliationAction]) -> Result<(), SinkError>;
}

/// Repository over the locally replicated `dhcp_reservation` table.
pub struct SqliteReservationRepository {
    conn: Mutex<Connection>,
}

impl SqliteReservationRepository {
    /// Open the repository on the given database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ReservationRepository for SqliteReservationRepository {
    fn fetch_snapshot(&self) -> Result<ReservationSnapshot, RepositoryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT mac, ip, hostname FROM dhcp_reservation",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut reservations = Vec::new();
        for row in rows {
            let (mac, ip, hostname) = row?;
            let mac = mac.parse().map_err(|_| RepositoryError::Corrupt {
                column: "mac",
                value: mac.clone(),
            })?;
            let ip = ip.parse().map_err(|_| RepositoryError::Corrupt {
                column: "ip",
                value: ip.clone(),
            })?;
            reservations.push(Reservation::new(mac, ip, hostname));
        }
        Ok(ReservationSnapshot::new(reservations))
    }
}
