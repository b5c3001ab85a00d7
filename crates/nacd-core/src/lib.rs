//! Core library for the nacd network-access-control lease engine.
//!
//! This crate holds everything that is shared between the lease daemon and
//! the single-shot DHCP hook client:
//!
//! - [`wire`]: the binary envelope and descriptor-passing transport used to
//!   ship a `dnsmasq --dhcp-script` invocation across the privilege boundary
//!   between the DHCP daemon and the lease server.
//! - [`event`]: interpretation of a decoded invocation (`add`/`del`/`old`/
//!   `init` plus the `DNSMASQ_*` environment contract) into a typed
//!   [`event::LeaseEvent`].
//! - [`reconcile`]: reservation snapshots and the differ that computes the
//!   corrective action set between two snapshots.
//! - [`backoff`]: retry delay curves for failed reconciliation passes.
//! - [`config`]: the service configuration loaded once at startup.

pub mod backoff;
pub mod config;
pub mod event;
pub mod reconcile;
pub mod wire;

pub use event::{HookRequest, LeaseCommand, LeaseEvent};
pub use reconcile::{ReconciliationAction, Reservation, ReservationSnapshot};
