//! Table synchronization: coercion, reconciliation, writes and verification

pub mod audit;
pub mod coercion;
pub mod executor;
pub mod reconcile;
pub mod statements;
pub mod verify;

use std::fmt;

use serde::Serialize;

pub use audit::{AuditLog, AuditRecord};
pub use executor::{SyncExecutor, SyncMode, SyncReport, SyncStage};
pub use reconcile::{Reconciliation, reconcile};

/// Rows written by one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl SyncCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

impl fmt::Display for SyncCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} updated={} deleted={}",
            self.inserted, self.updated, self.deleted
        )
    }
}
