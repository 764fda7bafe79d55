//! Marshals consumer-group rebalance callbacks from the worker thread onto the
//! caller's runtime.
//!
//! The underlying client invokes its revoke/assign callbacks synchronously on
//! whatever thread is inside `poll` (the worker thread, for this crate). User
//! handlers must never run there: the client posts a [`RebalanceEvent`] onto an
//! unbounded channel instead, and [`run_dispatcher`] — a task on the caller's
//! runtime — consumes it and invokes whichever handler is registered at that
//! moment. Channel FIFO ordering preserves the revoke-then-assign pairing.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics_consts::{REBALANCE_EVENTS, REBALANCE_EVENTS_DROPPED};
use crate::stream::Handlers;
use crate::types::Partition;

/// A rebalance notification, carrying the affected partition set.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    /// Fired before reassignment with the partitions being given up.
    Revoked(Vec<Partition>),
    /// Fired after reassignment with the newly owned partitions.
    Assigned(Vec<Partition>),
}

pub type RebalanceSender = mpsc::UnboundedSender<RebalanceEvent>;
pub type RebalanceReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

pub fn channel() -> (RebalanceSender, RebalanceReceiver) {
    mpsc::unbounded_channel()
}

/// Consumes rebalance events until the stream closes (sender dropped with the
/// consumer). Events with no registered handler are dropped — no buffering or
/// replay.
pub(crate) async fn run_dispatcher(mut rx: RebalanceReceiver, handlers: Arc<Handlers>) {
    while let Some(event) = rx.recv().await {
        match event {
            RebalanceEvent::Revoked(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "kind" => "revoked").increment(1);
                let set: HashSet<Partition> = partitions.into_iter().collect();
                if !handlers.notify_revoked(set) {
                    debug!("Dropping revoke event: no handler registered");
                    metrics::counter!(REBALANCE_EVENTS_DROPPED, "kind" => "revoked").increment(1);
                }
            }
            RebalanceEvent::Assigned(partitions) => {
                metrics::counter!(REBALANCE_EVENTS, "kind" => "assigned").increment(1);
                let set: HashSet<Partition> = partitions.into_iter().collect();
                if !handlers.notify_assigned(set) {
                    debug!("Dropping assign event: no handler registered");
                    metrics::counter!(REBALANCE_EVENTS_DROPPED, "kind" => "assigned").increment(1);
                }
            }
        }
    }
    debug!("Rebalance dispatcher shutting down");
}
