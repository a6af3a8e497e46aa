//! pipr error types

/// pipr result type
pub type Result<T> = std::result::Result<T, Error>;

/// pipr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Pipeline configuration rejected by validation
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// Description of what went wrong
        reason: String,
    },

    /// Config file could not be read or parsed
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Batch container shape the pipeline cannot split or flatten
    #[error("unsupported batch: {reason}")]
    UnsupportedBatch {
        /// Description of what went wrong
        reason: String,
    },

    /// Batch is well-formed but cannot be divided as requested
    #[error("invalid batch: {reason}")]
    InvalidBatch {
        /// Description of what went wrong
        reason: String,
    },

    /// Partition graph failed validation
    #[error("invalid partition graph: {reason}")]
    InvalidGraph {
        /// Description of what went wrong
        reason: String,
    },

    /// Topology was resolved twice for the same stage
    #[error("stage {stage}: topology already resolved")]
    TopologyAlreadyResolved {
        /// Stage rank
        stage: usize,
    },

    /// Peer handles were injected twice for the same stage
    #[error("stage {stage}: peers already synchronized")]
    PeersAlreadySynced {
        /// Stage rank
        stage: usize,
    },

    /// Backward scheduled for a microbatch without a cached forward
    #[error("stage {stage}: no backward cache for microbatch {microbatch_id}")]
    MissingBackwardCache {
        /// Stage rank
        stage: usize,
        /// Microbatch id
        microbatch_id: usize,
    },

    /// Forward cached twice for the same microbatch
    #[error("stage {stage}: backward cache for microbatch {microbatch_id} already exists")]
    DuplicateBackwardCache {
        /// Stage rank
        stage: usize,
        /// Microbatch id
        microbatch_id: usize,
    },

    /// Work item of a phase the execution loop cannot run
    #[error("stage {stage}: unexpected phase {phase}")]
    UnexpectedPhase {
        /// Stage rank
        stage: usize,
        /// Phase name
        phase: String,
    },

    /// A peer published a payload of the wrong kind for the phase reading it
    #[error("stage {stage}: expected {expected} payload, got {found}")]
    UnexpectedPayload {
        /// Stage rank of the reader
        stage: usize,
        /// Payload kind the phase needs
        expected: &'static str,
        /// Payload kind received
        found: &'static str,
    },

    /// Single-assignment future resolved twice
    #[error("future already resolved")]
    FutureAlreadySet,

    /// Internal scheduler invariant violated
    #[error("invariant violated: {reason}")]
    Invariant {
        /// Description of what went wrong
        reason: String,
    },

    /// A remote call or work item failed on another stage
    #[error("remote failure on {origin}: {reason}")]
    Remote {
        /// Thread or stage that produced the failure
        origin: String,
        /// Description of what went wrong
        reason: String,
    },

    /// A blocking wait was aborted through the cancellation token
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the pipeline was cancelled
        reason: String,
    },

    /// Training/optimizer error
    #[error("training error: {reason}")]
    TrainingError {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    /// Whether this error came from cancellation rather than a fault of its own.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
