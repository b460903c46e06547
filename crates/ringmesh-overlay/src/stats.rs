//! Aggregation of per-node traffic summaries into a round report.

use ringmesh_types::NodeId;
use ringmesh_wire::TrafficSummary;
use std::collections::BTreeMap;
use std::fmt;

/// One node's counters for a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficRow {
    pub sent: i64,
    pub received: i64,
    pub relayed: i64,
    pub sum_sent: i64,
    pub sum_received: i64,
}

impl TrafficRow {
    fn add(&mut self, other: &TrafficRow) {
        self.sent += other.sent;
        self.received += other.received;
        self.relayed += other.relayed;
        self.sum_sent = self.sum_sent.wrapping_add(other.sum_sent);
        self.sum_received = self.sum_received.wrapping_add(other.sum_received);
    }
}

impl From<&TrafficSummary> for TrafficRow {
    fn from(s: &TrafficSummary) -> Self {
        Self {
            sent: i64::from(s.sent),
            received: i64::from(s.received),
            relayed: i64::from(s.relayed),
            sum_sent: s.sum_sent,
            sum_received: s.sum_received,
        }
    }
}

/// The aggregated result of a summary round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    pub rows: BTreeMap<NodeId, TrafficRow>,
    pub totals: TrafficRow,
}

impl TrafficReport {
    /// Whether every sent packet was received somewhere.
    pub fn is_lossless(&self) -> bool {
        self.totals.sent == self.totals.received
            && self.totals.sum_sent == self.totals.sum_received
    }
}

impl fmt::Display for TrafficReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:>10} {:>10} {:>10} {:>20} {:>20}",
            "Node", "Sent", "Received", "Relayed", "Sum sent", "Sum received"
        )?;
        let mut line = |label: &str, row: &TrafficRow| {
            writeln!(
                f,
                "{:<8} {:>10} {:>10} {:>10} {:>20} {:>20}",
                label, row.sent, row.received, row.relayed, row.sum_sent, row.sum_received
            )
        };
        for (id, row) in &self.rows {
            line(&id.to_string(), row)?;
        }
        line("Sum", &self.totals)
    }
}

/// Collects one summary per node for the current round.
///
/// A second report from the same node replaces the first.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    rows: BTreeMap<NodeId, TrafficRow>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: NodeId, summary: &TrafficSummary) {
        self.rows.insert(id, TrafficRow::from(summary));
    }

    /// Number of distinct nodes reported so far.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Build the report and clear the collector for the next round.
    pub fn finish(&mut self) -> TrafficReport {
        let rows = std::mem::take(&mut self.rows);
        let mut totals = TrafficRow::default();
        for row in rows.values() {
            totals.add(row);
        }
        TrafficReport { rows, totals }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
