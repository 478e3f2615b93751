//! Interface and Node Statistics
//!
//! Lock-free counters for the receive and transmit paths. Every update is
//! mirrored to the `metrics` facade so an installed recorder sees it too.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxTx {
    Rx,
    Tx,
}

impl RxTx {
    pub fn as_str(self) -> &'static str {
        match self {
            RxTx::Rx => "rx",
            RxTx::Tx => "tx",
        }
    }
}

impl fmt::Display for RxTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-interface counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct InterfaceCounters {
    name: String,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
}

impl InterfaceCounters {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a round's packets and bytes
    pub fn record(&self, dir: RxTx, packets: u64, bytes: u64) {
        if packets == 0 && bytes == 0 {
            return;
        }
        let (p, b) = match dir {
            RxTx::Rx => (&self.rx_packets, &self.rx_bytes),
            RxTx::Tx => (&self.tx_packets, &self.tx_bytes),
        };
        p.fetch_add(packets, Ordering::Relaxed);
        b.fetch_add(bytes, Ordering::Relaxed);

        metrics::counter!(
            "vnet_interface_packets_total",
            "interface" => self.name.clone(),
            "direction" => dir.as_str()
        )
        .increment(packets);
        metrics::counter!(
            "vnet_interface_bytes_total",
            "interface" => self.name.clone(),
            "direction" => dir.as_str()
        )
        .increment(bytes);
    }

    pub fn snapshot(&self) -> InterfaceStatsSnapshot {
        InterfaceStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Dispatch counters of one node
#[derive(Debug, Default)]
pub struct NodeStats {
    calls: AtomicU64,
    refs: AtomicU64,
    faults: AtomicU64,
}

impl NodeStats {
    #[inline(always)]
    pub fn record_call(&self, refs: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.refs.fetch_add(refs as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            refs: self.refs.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    pub calls: u64,
    pub refs: u64,
    pub faults: u64,
}

impl NodeStatsSnapshot {
    /// Mean references per call
    pub fn vector_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.refs as f64 / self.calls as f64
    }
}
