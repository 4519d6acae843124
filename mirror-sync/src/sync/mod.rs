//! Reconciliation of remote manifests against the local mirror

pub mod checksum;
pub mod delete;
pub mod diff;
pub mod timestamps;
pub mod transfer_set;

pub use transfer_set::{reconcile, ReconcileOptions, TransferSet};
