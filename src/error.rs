//! Error taxonomy for flowmesh-rt.
//!
//! Kinds follow the four-tier grouping of the spec: Capacity and Timing
//! errors are recoverable control-flow signals callers (particularly the
//! scheduler) are expected to handle; Identity and State errors indicate a
//! programming error at the call site and must never panic the process;
//! Integrity errors fail segment open/creation; Fatal errors abort only the
//! process that raised them.

use thiserror::Error;

/// Errors that can occur anywhere in the runtime core.
#[derive(Error, Debug)]
pub enum RuntimeError {
    // --- Capacity ---
    #[error("process table is full")]
    NoProcessSlot,
    #[error("block table is full")]
    NoBlockSlot,
    #[error("connection table is full")]
    NoConnectionSlot,
    #[error("pool table is full")]
    NoPoolSlot,
    #[error("buffer metadata table is full")]
    NoBufferSlot,
    #[error("queue has no free consumer slot")]
    NoConsumerSlot,
    #[error("queue is full")]
    QueueFull,
    #[error("pool has no free blocks")]
    PoolExhausted,

    // --- Identity ---
    #[error("unknown block {0}")]
    UnknownBlock(u64),
    #[error("unknown port {0} on block {1}")]
    UnknownPort(String, u64),
    #[error("unknown buffer {0}")]
    UnknownBuffer(u64),
    #[error("unknown pool {0}")]
    UnknownPool(u32),
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    // --- State ---
    #[error("queue is closed")]
    QueueClosed,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("port is not connected")]
    NotConnected,
    #[error("invalid state transition")]
    InvalidTransition,

    // --- Integrity ---
    #[error("bad magic number in shared-memory header")]
    BadMagic,
    #[error("incompatible segment version")]
    IncompatibleVersion,
    #[error("corrupt free-list detected")]
    CorruptFreeList,
    #[error("platform does not provide lock-free atomics required by this runtime")]
    NotLockFree,

    // --- Timing (control-flow signals) ---
    #[error("operation timed out")]
    Timeout,
    #[error("operation would block")]
    WouldBlock,
    #[error("insufficient input available")]
    InsufficientInput,
    #[error("output port is full")]
    OutputFull,

    // --- Fatal ---
    #[error("failed to create shared-memory segment: {0}")]
    ShmCreateFailed(String),
    #[error("failed to map shared-memory segment: {0}")]
    MapFailed(String),

    // --- Ambient ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type used throughout the runtime core.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
