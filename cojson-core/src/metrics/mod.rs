//! Metric descriptions
//!
//! Recording happens at the call sites through the `metrics` macros; with
//! no recorder installed they are no-ops. A binary that installs a
//! recorder calls `init_metrics` once so exporters get units and help text.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub fn init_metrics() {
    // Sync
    describe_counter!("cojson_sync_messages_sent_total", "Sync messages sent, by action");
    describe_counter!("cojson_sync_messages_received_total", "Sync messages received, by action");
    describe_counter!("cojson_sync_reconcile_batches_total", "Reconciliation batches sent to storage peers");
    describe_gauge!("cojson_sync_peers", "Currently connected peers");

    // Storage
    describe_counter!("cojson_storage_operations_total", "Storage operations, by op");
    describe_histogram!(
        "cojson_storage_operation_seconds",
        Unit::Seconds,
        "Storage operation duration, by op"
    );

    // Node
    describe_counter!("cojson_node_loads_total", "CoValue loads, by source and outcome");
    describe_counter!("cojson_node_transactions_total", "Local transactions committed");
    describe_counter!("cojson_gc_evictions_total", "CoValues unmounted by the garbage collector");
}
