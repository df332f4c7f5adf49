//! Block framework: the trait processing units implement, the control-flow
//! status `work()` reports back to the scheduler, and `BlockContext`, the
//! per-block handle blocks use to read input and publish output.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::Handle;
use crate::ids::{BlockId, ConnectionId};
use crate::pool::Pool;
use crate::queue::{ConsumerId, PortQueue};
use crate::registry::{BlockKind, PortDirection, Registry};

/// What a block reports back to the scheduler after one `work()` call.
#[derive(Debug)]
pub enum WorkStatus {
    /// Made progress; the scheduler should poll this block again soon.
    Progress,
    /// Blocked on missing input; back off per the `InsufficientInput` tier.
    InsufficientInput,
    /// Blocked on a full output queue; back off per the `OutputFull` tier.
    OutputFull,
    /// The block has permanently finished; remove it from the ready set.
    Done,
    /// The block failed; remove it from the ready set and log.
    Error(RuntimeError),
}

/// Declares one input or output port a block exposes, before it is wired
/// into the registry/queue layer.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub name: String,
    pub direction: PortDirection,
}

impl PortConfig {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::In,
        }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Out,
        }
    }
}

/// Everything `Block::work` needs to read from its input ports and publish
/// to its output ports, without touching the registry/queue plumbing
/// directly.
pub struct BlockContext {
    registry: Arc<Registry>,
    pool: Arc<Pool>,
    pool_id: u32,
    block_id: BlockId,
    creator_slot: crate::ids::ProcessSlot,
    input_ports: HashMap<String, (Arc<PortQueue>, ConsumerId)>,
    output_ports: HashMap<String, Vec<(Arc<PortQueue>, ConnectionId)>>,
}

impl BlockContext {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<Pool>,
        pool_id: u32,
        block_id: BlockId,
        creator_slot: crate::ids::ProcessSlot,
    ) -> Self {
        Self {
            registry,
            pool,
            pool_id,
            block_id,
            creator_slot,
            input_ports: HashMap::new(),
            output_ports: HashMap::new(),
        }
    }

    /// Bind an input port to a queue this block will consume from,
    /// registering a consumer cursor on it.
    pub fn add_input_port(&mut self, name: &str, queue: Arc<PortQueue>) -> RuntimeResult<()> {
        let consumer_id = queue.register_consumer()?;
        self.input_ports.insert(name.to_string(), (queue, consumer_id));
        Ok(())
    }

    /// Unbind an input port, unregistering its consumer and releasing the
    /// reference on every buffer still pending for it.
    pub fn unbind_input_port(&mut self, name: &str) -> RuntimeResult<()> {
        if let Some((queue, consumer_id)) = self.input_ports.remove(name) {
            Self::release_consumer_refs(&self.registry, &queue, consumer_id, name);
        }
        Ok(())
    }

    /// Unbind every input port this block is still bound to. Safe to call
    /// more than once; already-unbound ports are simply skipped.
    pub fn unbind_all_inputs(&mut self) {
        for (name, (queue, consumer_id)) in self.input_ports.drain() {
            Self::release_consumer_refs(&self.registry, &queue, consumer_id, &name);
        }
    }

    fn release_consumer_refs(registry: &Registry, queue: &PortQueue, consumer_id: ConsumerId, port: &str) {
        match queue.unregister_consumer(consumer_id) {
            Ok(pending) => {
                for buffer_id in pending {
                    if let Err(e) = registry.release_buffer_ref(buffer_id) {
                        warn!(port, buffer_id, error = %e, "failed to release pending buffer on unbind");
                    }
                }
            }
            Err(e) => warn!(port, error = %e, "failed to unregister consumer on unbind"),
        }
    }

    /// Bind an output port to one downstream queue, recording the connection
    /// in the registry's connection table. Calling this more than once for
    /// the same port name fans out to every queue added.
    pub fn add_output_port(
        &mut self,
        name: &str,
        queue: Arc<PortQueue>,
        dst_block: BlockId,
        dst_port: &str,
    ) -> RuntimeResult<()> {
        let connection_id = self.registry.add_connection(self.block_id, name, dst_block, dst_port)?;
        self.output_ports
            .entry(name.to_string())
            .or_default()
            .push((queue, connection_id));
        Ok(())
    }

    /// Non-blocking check for whether `port` has at least one buffer ready.
    pub fn has_input(&self, port: &str) -> RuntimeResult<bool> {
        Ok(self.input_size(port)? > 0)
    }

    /// Read the next buffer from `port`, blocking until one is available.
    pub fn get_input(&self, port: &str) -> RuntimeResult<Handle> {
        let (queue, consumer) = self
            .input_ports
            .get(port)
            .ok_or_else(|| RuntimeError::UnknownPort(port.to_string(), self.block_id))?;
        let buffer_id = queue.pop_with_timeout(*consumer, Some(std::time::Duration::from_millis(1)))?;
        Handle::open(self.registry.clone(), self.pool.clone(), buffer_id)
    }

    /// Number of buffers currently queued (not yet popped) on `port`.
    pub fn input_size(&self, port: &str) -> RuntimeResult<u32> {
        let (queue, consumer) = self
            .input_ports
            .get(port)
            .ok_or_else(|| RuntimeError::UnknownPort(port.to_string(), self.block_id))?;
        Ok(queue.pending(*consumer)? as u32)
    }

    /// Allocate a fresh output buffer of `size` bytes from this block's pool.
    pub fn allocate_output(&self, size: u32) -> RuntimeResult<Handle> {
        Handle::allocate(
            self.registry.clone(),
            self.pool.clone(),
            self.pool_id,
            self.creator_slot,
            size,
        )
    }

    /// Stamp this block's registry entry with the current time. The
    /// scheduler calls this once per `work()` invocation so
    /// `BlockEntry::last_work_ns` reflects real scheduling activity.
    pub fn touch_work(&self) {
        if let Some(slot) = self.registry.find_block_by_id(self.block_id) {
            self.registry.block_last_work_touch(slot);
        }
    }

    /// Publish `handle` on `port`, fanning out to every downstream queue
    /// bound to it and recording the transfer against each connection.
    pub fn produce_output(&self, port: &str, handle: Handle) -> RuntimeResult<()> {
        let queues = self
            .output_ports
            .get(port)
            .ok_or_else(|| RuntimeError::UnknownPort(port.to_string(), self.block_id))?;

        if queues.is_empty() {
            return Ok(());
        }

        let bytes = handle.len() as u64;
        for (queue, connection_id) in queues {
            let connection_id = *connection_id;
            queue.push(handle.buffer_id(), |n| handle.add_ref(n))?;
            if let Err(e) = self.registry.record_connection_transfer(connection_id, bytes) {
                warn!(port, connection_id, error = %e, "failed to record connection transfer");
            }
        }
        Ok(())
    }
}

impl Drop for BlockContext {
    /// Safety net for process-local teardown paths that don't call
    /// `unbind_all_inputs` explicitly (e.g. a block erroring out of the
    /// scheduler). Consumer slots in a dead process's own queues are
    /// reclaimed this way; a crashed process's queues are not reachable by
    /// anyone else, so cross-process reclaim cannot do this for it.
    fn drop(&mut self) {
        self.unbind_all_inputs();
    }
}

/// A processing unit scheduled by the worker pool.
///
/// Implementors are expected to be cheap to poll repeatedly: `work()` is
/// called in a loop by the scheduler and must not block longer than it
/// takes to make or fail to make progress once.
pub trait Block: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> BlockKind;

    /// Called once before the first `work()` call.
    fn initialize(&mut self, _ctx: &mut BlockContext) -> RuntimeResult<()> {
        Ok(())
    }

    /// Called once the scheduler has started polling this block.
    fn start(&mut self, _ctx: &mut BlockContext) -> RuntimeResult<()> {
        Ok(())
    }

    /// Do one unit of work: read at most what is needed from input ports,
    /// produce at most what fits in output ports, and report status.
    fn work(&mut self, ctx: &mut BlockContext) -> WorkStatus;

    /// Called once the scheduler has decided to stop polling this block.
    fn stop(&mut self, _ctx: &mut BlockContext) -> RuntimeResult<()> {
        Ok(())
    }

    /// Called once after `stop`, before the block is dropped.
    fn cleanup(&mut self, _ctx: &mut BlockContext) -> RuntimeResult<()> {
        Ok(())
    }

    /// Out-of-band control message delivery; the control-message bus itself
    /// is out of scope for this runtime core (callers wire their own).
    fn handle_message(&mut self, _ctx: &mut BlockContext, _message: &[u8]) -> RuntimeResult<()> {
        Ok(())
    }
}
