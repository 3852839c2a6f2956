//! Lease (oplock) revocation before conflicting writes.
//!
//! Lease state lives in the protocol layer. This module only tells it to
//! break level-II leases other clients hold on an object about to change.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::backend::NodeId;
use crate::handle::{OpenHandle, SessionId};

/// Hook into the lease state machine.
pub trait LeaseBreaker: Send + Sync {
    /// Break level-II leases on `node` held by anyone other than the handle
    /// `exclude_fid` of `session`. May block while other sessions acknowledge.
    fn break_level2(&self, session: SessionId, node: NodeId, exclude_fid: u64);
}

/// Breaker for deployments that never grant leases.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLeases;

impl LeaseBreaker for NoLeases {
    fn break_level2(&self, _session: SessionId, _node: NodeId, _exclude_fid: u64) {}
}

/// Serializes lease breaks under one process-wide lock.
pub struct LeaseTable {
    table_lock: Mutex<()>,
    breaker: Arc<dyn LeaseBreaker>,
    enabled: bool,
}

impl LeaseTable {
    pub fn new(breaker: Arc<dyn LeaseBreaker>, enabled: bool) -> Self {
        LeaseTable {
            table_lock: Mutex::new(()),
            breaker,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Break leases other clients hold on the handle's object. The table lock
    /// covers the breaker call only.
    pub fn break_conflicting<F>(&self, handle: &OpenHandle<F>) {
        if !self.enabled {
            return;
        }
        trace!("Breaking level-II leases on ino {}", handle.node().ino);
        let _guard = self.table_lock.lock();
        self.breaker
            .break_level2(handle.session(), handle.node(), handle.fid());
    }
}

impl std::fmt::Debug for LeaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseTable")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
