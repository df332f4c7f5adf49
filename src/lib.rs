//! flowmesh-rt: a multi-process, zero-copy shared-memory stream-processing
//! runtime core.
//!
//! Independently running OS processes host processing *blocks* connected by
//! typed ports; data flows as references to fixed-size payload buffers
//! carved from shared-memory pools. A broadcast-style queue per input port
//! delivers every published buffer to every subscribed consumer.
//! Cross-process atomic reference counting returns buffers to their pool
//! when the last consumer, in any process, releases them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   register_block / add_connection   ┌──────────────┐
//! │  Process A   │ ───────────────────────────────────▶│  Process B   │
//! │  (Source)    │                                      │  (Sink)      │
//! └──────┬───────┘                                      └──────┬───────┘
//!        │ allocate_output / produce_output                    │ get_input
//!        ▼                                                     ▼
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                    Shared Memory (per-host namespace)               │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────────────────────┐ │
//! │  │  Registry  │  │ Buffer Pool│  │  Broadcast Port Queue          │ │
//! │  │ (tables)   │  │(free list) │  │ (tail + per-consumer cursors)  │ │
//! │  └────────────┘  └────────────┘  └──────────────────────────────┘ │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Data flow
//!
//! 1. Each process opens (or creates) the [`registry::Registry`] segment,
//!    registers itself with [`registry::Registry::register_process`], and
//!    registers its blocks and ports.
//! 2. A producing block calls [`block::BlockContext::allocate_output`] to
//!    carve a fixed-size block from a [`pool::Pool`]; the registry's buffer
//!    metadata table tracks it with refcount 1.
//! 3. [`block::BlockContext::produce_output`] pushes the buffer id into
//!    every downstream [`queue::PortQueue`], incrementing the refcount once
//!    per active consumer.
//! 4. Each consumer's [`block::BlockContext::get_input`] pops its own
//!    cursor and wraps the id in a [`handle::Handle`]; dropping the handle
//!    decrements the refcount, releasing the block back to its pool when it
//!    reaches zero.
//! 5. A [`lifecycle::Heartbeat`] keeps each process's liveness timestamp
//!    fresh; [`registry::Registry::reclaim_dead_processes`] (driven by
//!    [`lifecycle::run_reclaim_loop`] or called on demand) cleans up after a
//!    process that died without unregistering.
//!
//! # Scope
//!
//! This crate is the shared-memory substrate only: the Global Registry, the
//! Buffer Pool allocator, the buffer handle and its cross-process refcount,
//! the Broadcast Port Queue, the [`block::Block`] scheduling contract, and
//! the [`scheduler::Scheduler`] that drives it. Concrete block
//! implementations (sources, sinks, amplifiers), CLI tooling, and an
//! inter-process control-message bus are deliberately out of scope — they
//! are consumers of the interfaces defined here, not part of the core.
//!
//! # Platform support
//!
//! | Platform | Status |
//! |----------|--------|
//! | Linux / macOS | Implemented (POSIX `shm_open` + `pthread` process-shared primitives) |
//! | Windows | Stub — see [`shm::windows`] |

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod logging;
pub mod shm;

// The data-path modules (registry/pool/queue/handle/block/scheduler/
// lifecycle) all bottom out in `sync::ShmMutex`/`ShmCondvar`, which wrap
// POSIX `pthread_*` primitives — there is no Windows implementation yet
// (see `shm::windows`), so the whole path is gated the same way the
// teacher's own platform split works.
#[cfg(unix)]
pub mod block;
#[cfg(unix)]
pub mod handle;
#[cfg(unix)]
pub mod lifecycle;
#[cfg(unix)]
pub mod pool;
#[cfg(unix)]
pub mod queue;
#[cfg(unix)]
pub mod registry;
#[cfg(unix)]
pub mod scheduler;
#[cfg(unix)]
pub mod sync;

pub use config::Config;
pub use error::{RuntimeError, RuntimeResult};
pub use ids::{BlockId, ConnectionId, ProcessSlot, RawBufferId};

#[cfg(unix)]
pub use block::{Block, BlockContext, PortConfig, WorkStatus};
#[cfg(unix)]
pub use handle::Handle;
#[cfg(unix)]
pub use lifecycle::Heartbeat;
#[cfg(unix)]
pub use pool::Pool;
#[cfg(unix)]
pub use queue::{ConsumerId, PortQueue};
#[cfg(unix)]
pub use registry::{BlockKind, PortDirection, ProcessRole, Registry};
#[cfg(unix)]
pub use scheduler::Scheduler;

/// `true` on every platform this crate currently implements shared-memory
/// primitives for.
pub fn is_available() -> bool {
    #[cfg(unix)]
    {
        true
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_available_on_unix() {
        #[cfg(unix)]
        assert!(is_available());
    }
}
