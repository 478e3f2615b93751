//! Vector Packet-Processing Engine
//!
//! Moves batches of packet-buffer references through a graph of processing
//! nodes, from hardware receive rings to per-interface transmit workers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          DISPATCH THREAD                            │
//! │                                                                     │
//! │  ┌──────────────┐   RefOut    ┌──────────────┐   RefOut             │
//! │  │ RxDmaRing    │ ──────────► │ input-output │ ──────┬────────────┐ │
//! │  │ (input node) │             │ node         │       │            │ │
//! │  └──────────────┘             │  EnqueueOut  │       ▼            ▼ │
//! │                               └──────────────┘  ┌─────────┐ ┌──────┐│
//! │                                                 │ tx node │ │ drop ││
//! │        ErrorFabric ◄──── counts ────────────────┤         │ │      ││
//! │                                                 └────┬────┘ └──────┘│
//! └──────────────────────────────────────────────────────┼──────────────┘
//!                                                        │ bounded queue
//!                                                        ▼
//!                                               ┌─────────────────┐
//!                                               │ tx worker       │
//!                                               │ TxDriver        │
//!                                               └─────────────────┘
//! ```
//!
//! # Key Properties
//!
//! 1. **Batches, not packets**: nodes see vectors of [`Ref`] handles; payload
//!    never moves
//! 2. **Every ref forwarded once**: an input-output node's outputs never
//!    exceed its input (checked when `invariant_checks` is on)
//! 3. **Speculate, then correct**: the 4-wide redirect, receive and error
//!    counting paths fall back to the 1-wide path on any mismatch
//! 4. **Faults are contained**: a faulting node loses its batch, not the
//!    dispatch thread
//! 5. **Backpressure at the edge**: transmit nodes suspend when too many
//!    references are outstanding

pub mod buffer;
pub mod config;
pub mod counters;
pub mod enqueue;
pub mod error;
pub mod graph;
pub mod node;
pub mod regs;
pub mod rx_ring;
pub mod stats;
pub mod tx;
pub mod vector;

pub use buffer::{BufferPool, Ref, RefChain};
pub use config::DataplaneConfig;
pub use counters::{ErrorDropNode, ErrorFabric, ErrorRef, ErrorReport};
pub use enqueue::{Enqueue, EnqueueOut};
pub use error::{VnetError, VnetResult};
pub use graph::{Dispatch, Graph, DROP_NODE};
pub use node::{
    InputNode, InputOutputNode, NodeContext, NodeIndex, NodeKind, NodeRegistration, OutputNode,
};
pub use regs::{Reg32, Reg64};
pub use rx_ring::{RxDmaRefState, RxDmaRing, RxDmaRinger, RxDmaRingIndex, RxFlushStats};
pub use stats::{InterfaceCounters, NodeStats, RxTx};
pub use tx::{
    Backpressure, InterfaceOutputNode, SuspendLimits, TxDmaRing, TxDriver, TxInterface,
    TxRefVecIn, SUSPEND_LIMITS,
};
pub use vector::{RefIn, RefOut, RefVec};

/// Largest batch a node is handed at once
pub const MAX_VECTOR_LEN: usize = 256;

/// Outstanding transmit references before the producer suspends
pub const MAX_OUTSTANDING_TX_REFS: usize = 16 * MAX_VECTOR_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(MAX_VECTOR_LEN, 256);
        assert_eq!(MAX_OUTSTANDING_TX_REFS, 4096);
        assert!(SUSPEND_LIMITS.resume < SUSPEND_LIMITS.suspend);
    }
}
