//! Per-node traffic counters and the relay queue.

use ringmesh_types::NodeId;
use ringmesh_wire::{DataPacket, TrafficSummary};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Counters for one reporting round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub sent: i32,
    pub received: i32,
    pub relayed: i32,
    pub sum_sent: i64,
    pub sum_received: i64,
}

impl TrafficCounters {
    pub fn record_sent(&mut self, payload: i32) {
        self.sent = self.sent.wrapping_add(1);
        self.sum_sent = self.sum_sent.wrapping_add(i64::from(payload));
    }

    pub fn record_received(&mut self, payload: i32) {
        self.received = self.received.wrapping_add(1);
        self.sum_received = self.sum_received.wrapping_add(i64::from(payload));
    }

    pub fn record_relayed(&mut self) {
        self.relayed = self.relayed.wrapping_add(1);
    }

    /// Return the current values and reset to zero.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn to_summary(self, id: NodeId) -> TrafficSummary {
        TrafficSummary {
            id: id.as_wire(),
            sent: self.sent,
            relayed: self.relayed,
            sum_sent: self.sum_sent,
            received: self.received,
            sum_received: self.sum_received,
        }
    }
}

impl fmt::Display for TrafficCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} received={} relayed={} sum_sent={} sum_received={}",
            self.sent, self.received, self.relayed, self.sum_sent, self.sum_received
        )
    }
}

/// Unbounded FIFO of packets waiting to be forwarded.
///
/// Pushers wake the single consumer through a [`Notify`]; the consumer never
/// spins on an empty queue.
#[derive(Debug, Default)]
pub struct RelayQueue {
    packets: Mutex<VecDeque<DataPacket>>,
    ready: Notify,
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: DataPacket) {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<DataPacket> {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait for the next packet.
    pub async fn pop(&self) -> DataPacket {
        loop {
            let notified = self.ready.notified();
            if let Some(packet) = self.try_pop() {
                return packet;
            }
            notified.await;
        }
    }

    /// Drop every queued packet, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut packets = self.packets.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = packets.len();
        packets.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
