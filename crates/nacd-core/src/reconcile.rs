//! Reservation snapshots and the reconciliation differ.
//!
//! A reservation is an operator-declared `(mac, ip, hostname)` binding from
//! the external database; a snapshot is the full set of such bindings at one
//! point in time. The differ compares two snapshots and computes the minimum
//! set of corrective actions: revoke leases whose reservation disappeared,
//! grant bindings that appeared.
//!
//! # Identity
//!
//! A reservation is identified by the full `(mac, ip)` pair. Hostname is
//! metadata, never identity: a hostname-only change produces no lease
//! action, while a change to either half of the pair is a strict
//! remove-and-add. The differ applies no fuzzy "moved reservation"
//! matching.
//!
//! # Invariants
//!
//! - Output is deterministic: revokes ordered before grants, each sorted,
//!   so no contradictory claims on a single ip can interleave.
//! - Diffing the same pair of snapshots twice yields the same actions, and
//!   applying them twice has no additional effect.
//! - A snapshot never contains two entries for the same ip; conflicts are
//!   resolved deterministically at construction and surfaced as anomalies.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

/// One operator-declared host reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Hardware address of the host.
    pub mac: MacAddr6,
    /// Address reserved for the host.
    pub ip: IpAddr,
    /// Optional hostname published for the reservation.
    pub hostname: Option<String>,
}

impl Reservation {
    /// Create a reservation.
    #[must_use]
    pub fn new(mac: MacAddr6, ip: IpAddr, hostname: Option<String>) -> Self {
        Self { mac, ip, hostname }
    }

    /// The identity of this reservation: the full `(mac, ip)` pair.
    #[must_use]
    pub fn identity(&self) -> (IpAddr, MacAddr6) {
        (self.ip, self.mac)
    }
}

/// A data-consistency problem found while building a snapshot.
///
/// These indicate operator error or source-data inconsistency in the
/// external database. They never abort a reconciliation pass; the caller
/// logs them and the documented tie-break applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAnomaly {
    /// The same ip is reserved for two different macs. The entry with the
    /// lowest mac wins; the other is dropped from the snapshot.
    DuplicateIp {
        /// The contested address.
        ip: IpAddr,
        /// The mac that kept the reservation.
        kept: MacAddr6,
        /// The mac whose entry was dropped.
        dropped: MacAddr6,
    },
}

impl std::fmt::Display for SnapshotAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIp { ip, kept, dropped } => write!(
                f,
                "ip {ip} reserved for both {kept} and {dropped}; keeping {kept}"
            ),
        }
    }
}

/// An immutable set of reservations fetched at one point in time.
///
/// Owned exclusively by one reconciliation pass. Construction normalizes the
/// row set: exact duplicate rows are collapsed, and an ip claimed by several
/// macs keeps only the lowest mac (deterministic regardless of fetch order),
/// recording a [`SnapshotAnomaly`] per dropped entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationSnapshot {
    entries: Vec<Reservation>,
    anomalies: Vec<SnapshotAnomaly>,
}

impl ReservationSnapshot {
    /// Build a snapshot from raw database rows.
    #[must_use]
    pub fn new(rows: impl IntoIterator<Item = Reservation>) -> Self {
        // BTreeMap keyed by ip with ordered candidate lists gives the
        // lowest-mac tie-break for free.
        let mut by_ip: BTreeMap<IpAddr, Vec<Reservation>> = BTreeMap::new();
        for row in rows {
            let candidates = by_ip.entry(row.ip).or_default();
            if !candidates
                .iter()
                .any(|existing| existing.mac == row.mac)
            {
                candidates.push(row);
            }
        }

        let mut entries = Vec::with_capacity(by_ip.len());
        let mut anomalies = Vec::new();
        for (ip, mut candidates) in by_ip {
            candidates.sort_by_key(|r| r.mac);
            let mut candidates = candidates.into_iter();
            if let Some(winner) = candidates.next() {
                for loser in candidates {
                    anomalies.push(SnapshotAnomaly::DuplicateIp {
                        ip,
                        kept: winner.mac,
                        dropped: loser.mac,
                    });
                }
                entries.push(winner);
            }
        }

        Self { entries, anomalies }
    }

    /// An empty snapshot, the baseline of a first-ever sync.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The normalized reservations, ordered by ip.
    #[must_use]
    pub fn entries(&self) -> &[Reservation] {
        &self.entries
    }

    /// The anomalies recorded during normalization.
    #[must_use]
    pub fn anomalies(&self) -> &[SnapshotAnomaly] {
        &self.anomalies
    }

    /// Number of reservations after normalization.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the snapshot holds no reservations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if the exact `(mac, ip)` pair is reserved.
    #[must_use]
    pub fn contains(&self, mac: MacAddr6, ip: IpAddr) -> bool {
        self.identities().contains(&(ip, mac))
    }

    fn identities(&self) -> BTreeSet<(IpAddr, MacAddr6)> {
        self.entries.iter().map(Reservation::identity).collect()
    }
}

/// A corrective action computed by the differ.
///
/// Actions are intents: the differ never mutates lease state itself. An
/// unchanged pair produces no action at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationAction {
    /// Establish the binding for a reservation that appeared.
    Grant {
        /// Hardware address of the reservation.
        mac: MacAddr6,
        /// Reserved address.
        ip: IpAddr,
        /// Hostname to publish.
        hostname: Option<String>,
    },
    /// Invalidate any lease on `ip` because its reservation disappeared or
    /// changed identity.
    Revoke {
        /// The address whose lease must go.
        ip: IpAddr,
    },
}

/// Compute the corrective actions turning `previous` into `current`.
///
/// Strict set-difference on `(mac, ip)`:
///
/// - pairs only in `current` become [`ReconciliationAction::Grant`]s;
/// - pairs only in `previous` become [`ReconciliationAction::Revoke`]s, even
///   when another still-valid reservation claims the same ip or mac;
/// - pairs in both produce nothing, regardless of hostname changes.
///
/// Revokes are ordered before grants so that when an ip changes hands the
/// old claim is gone before the new one is applied.
#[must_use]
pub fn diff(
    previous: &ReservationSnapshot,
    current: &ReservationSnapshot,
) -> Vec<ReconciliationAction> {
    let previous_pairs = previous.identities();
    let current_pairs = current.identities();

    let mut actions: Vec<ReconciliationAction> = previous_pairs
        .difference(&current_pairs)
        .map(|&(ip, _)| ReconciliationAction::Revoke { ip })
        .collect();

    actions.extend(
        current
            .entries()
            .iter()
            .filter(|r| !previous_pairs.contains(&r.identity()))
            .map(|r| ReconciliationAction::Grant {
                mac: r.mac,
                ip: r.ip,
                hostname: r.hostname.clone(),
            }),
    );

    actions
}

/// Addresses of leases that match no reservation in `current`.
///
/// Used by forced reconciliation passes, which do not trust the previous
/// baseline: every lease whose `(mac, ip)` pair has no current reservation
/// is revoked outright.
#[must_use]
pub fn invalid_leases(
    current: &ReservationSnapshot,
    leases: impl IntoIterator<Item = (MacAddr6, IpAddr)>,
) -> Vec<IpAddr> {
    let reserved = current.identities();
    let invalid: BTreeSet<IpAddr> = leases
        .into_iter()
        .filter(|&(mac, ip)| !reserved.contains(&(ip, mac)))
        .map(|(_, ip)| ip)
        .collect();
    invalid.into_iter().collect()
}
