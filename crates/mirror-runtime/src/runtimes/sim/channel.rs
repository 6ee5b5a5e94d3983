//! FIFO operation queues of the simulated runtime

use crate::error::{MirrorError, Result, TransferDirection};
use crate::runtime::{BlockDim, ChannelId, DevicePtr, ExecutionContext, GridDim, HostPtr};
use std::collections::{BTreeMap, VecDeque};

/// Kernel body executed once per thread with the target allocation's bytes
pub(super) type KernelFn = Box<dyn FnMut(&ExecutionContext, &mut [u8]) + Send>;

/// Deferred work waiting on a channel
pub(super) enum Operation {
    Copy {
        direction: TransferDirection,
        host: HostPtr,
        device: DevicePtr,
        bytes: usize,
    },
    Kernel {
        name: String,
        grid: GridDim,
        block: BlockDim,
        target: DevicePtr,
        body: KernelFn,
    },
}

/// Every live channel and its pending operations
///
/// Channel ids are never reused; the default channel always exists.
pub(super) struct Channels {
    queues: BTreeMap<u64, VecDeque<Operation>>,
    next_id: u64,
}

impl Default for Channels {
    fn default() -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(ChannelId::DEFAULT.id(), VecDeque::new());
        Self { queues, next_id: 1 }
    }
}

impl Channels {
    pub(super) fn create(&mut self) -> ChannelId {
        let channel = ChannelId::new(self.next_id);
        self.next_id += 1;
        self.queues.insert(channel.id(), VecDeque::new());
        channel
    }

    /// Remove a drained channel
    pub(super) fn remove(&mut self, channel: ChannelId) -> Result<()> {
        if channel.is_default() {
            return Err(MirrorError::invalid_argument("the default channel cannot be destroyed"));
        }
        match self.queues.get(&channel.id()) {
            None => Err(MirrorError::invalid_argument(format!("unknown {channel}"))),
            Some(queue) if !queue.is_empty() => Err(MirrorError::invalid_state(format!(
                "{channel} still has {} pending operations",
                queue.len()
            ))),
            Some(_) => {
                self.queues.remove(&channel.id());
                Ok(())
            }
        }
    }

    pub(super) fn contains(&self, channel: ChannelId) -> bool {
        self.queues.contains_key(&channel.id())
    }

    pub(super) fn push(&mut self, channel: ChannelId, op: Operation) -> Result<()> {
        self.queues
            .get_mut(&channel.id())
            .map(|queue| queue.push_back(op))
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown {channel}")))
    }

    /// Take everything queued on `channel`, leaving it empty
    pub(super) fn take(&mut self, channel: ChannelId) -> Result<VecDeque<Operation>> {
        self.queues
            .get_mut(&channel.id())
            .map(std::mem::take)
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown {channel}")))
    }

    pub(super) fn ids(&self) -> Vec<ChannelId> {
        self.queues.keys().copied().map(ChannelId::new).collect()
    }

    pub(super) fn pending(&self, channel: ChannelId) -> usize {
        self.queues.get(&channel.id()).map_or(0, VecDeque::len)
    }
}
