//! Error types for the vector engine

use thiserror::Error;

/// Vector engine error type
///
/// Configuration faults and invariant violations are fatal: they propagate
/// out of registration and dispatch. Everything for which
/// [`VnetError::is_fault`] returns true is contained by the dispatch guard,
/// which logs it and drops the offending batch.
#[derive(Error, Debug)]
pub enum VnetError {
    /// Two nodes registered under the same name
    #[error("node `{0}` already registered")]
    DuplicateNode(String),

    /// Next edge names a node that was never registered
    #[error("node `{node}`: unknown next node `{next}`")]
    UnknownNext { node: String, next: String },

    /// Dependency names a node that was never registered
    #[error("node `{node}`: unknown dependency `{dep}`")]
    UnknownDependency { node: String, dep: String },

    /// Dependencies form a cycle
    #[error("dependency cycle through node `{0}`")]
    DependencyCycle(String),

    /// Node index does not name a registered node
    #[error("no node with index {0}")]
    UnknownNode(usize),

    /// Dispatch entry point does not match the registered node kind
    #[error("node `{node}` is {kind}, cannot dispatch as {wanted}")]
    KindMismatch {
        node: String,
        kind: &'static str,
        wanted: &'static str,
    },

    /// Local error index outside the node's declared errors
    #[error("node `{node}` has no error with index {index}")]
    UnknownError { node: String, index: usize },

    /// Node produced more references than it consumed
    #[error("out len {out_len} > in len {in_len}")]
    OutputOverflow { out_len: usize, in_len: usize },

    /// DMA ring index beyond the ring
    #[error("ring index {index} overflows ring of {len} slots")]
    RingOverflow { index: usize, len: usize },

    /// Batch references a thread that no longer exists
    #[error("stale batch: thread id not valid, probably deleted")]
    StaleThread,

    /// Reference names a buffer the pool does not own
    #[error("buffer {buffer} not in pool `{pool}`")]
    BadBuffer { buffer: u32, pool: String },

    /// Buffer pool has no free buffers
    #[error("buffer pool `{0}` exhausted")]
    PoolExhausted(String),

    /// Bounded queue closed by its consumer
    #[error("queue closed")]
    QueueClosed,

    /// Interface already administratively up
    #[error("interface `{0}` already up")]
    AlreadyUp(String),

    /// Failed to spawn a worker thread
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Node reported a fault while processing a batch
    #[error("node fault: {0}")]
    Fault(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VnetError {
    /// True for per-batch faults the dispatch guard contains.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            VnetError::StaleThread
                | VnetError::BadBuffer { .. }
                | VnetError::PoolExhausted(_)
                | VnetError::QueueClosed
                | VnetError::Fault(_)
        )
    }
}

/// Result type for the vector engine
pub type VnetResult<T> = Result<T, VnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert!(VnetError::StaleThread.is_fault());
        assert!(VnetError::Fault("gone".into()).is_fault());
        assert!(VnetError::BadBuffer { buffer: 9, pool: "p".into() }.is_fault());
        assert!(!VnetError::OutputOverflow { out_len: 3, in_len: 2 }.is_fault());
        assert!(!VnetError::DuplicateNode("x".into()).is_fault());
    }

    #[test]
    fn test_display() {
        let e = VnetError::OutputOverflow { out_len: 5, in_len: 4 };
        assert_eq!(e.to_string(), "out len 5 > in len 4");
    }
}
