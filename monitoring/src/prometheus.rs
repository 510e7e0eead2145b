//! Prometheus text exposition (text/plain; version=0.0.4) for a
//! [`MetricsSnapshot`](crate::MetricsSnapshot).

use crate::{HistogramSnapshot, MetricsSnapshot};

/// Render a snapshot into the Prometheus text format.
pub fn encode(snap: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    write_counter(
        &mut out,
        "strand_blocks_committed_total",
        "Total blocks committed by this node",
        snap.blocks_committed,
    );
    write_counter(
        &mut out,
        "strand_transactions_committed_total",
        "Total transactions inside committed blocks",
        snap.transactions_committed,
    );
    write_counter(
        &mut out,
        "strand_catchup_blocks_total",
        "Blocks acquired through catch-up",
        snap.catchup_blocks,
    );
    write_gauge(
        &mut out,
        "strand_last_committed_block",
        "Id of the last committed block",
        snap.last_committed_block,
    );
    write_gauge(
        &mut out,
        "strand_deferred_messages",
        "Envelopes parked in the deferred-message queue",
        snap.deferred_messages,
    );
    write_gauge(
        &mut out,
        "strand_delayed_sends",
        "Messages queued in the per-peer delayed-send FIFOs",
        snap.delayed_sends,
    );
    write_gauge(
        &mut out,
        "strand_pending_transactions",
        "Transactions waiting in the pending pool",
        snap.pending_transactions,
    );
    write_histogram(
        &mut out,
        "strand_block_finality_ms",
        "Commit-to-commit latency in milliseconds",
        &snap.block_finality_ms,
    );

    out
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    ));
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}

fn write_histogram(out: &mut String, name: &str, help: &str, hist: &HistogramSnapshot) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
    for (bound, count) in hist.bounds.iter().zip(&hist.counts) {
        out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {count}\n"));
    }
    out.push_str(&format!(
        "{name}_bucket{{le=\"+Inf\"}} {}\n{name}_sum {}\n{name}_count {}\n",
        hist.total, hist.sum, hist.total
    ));
}
