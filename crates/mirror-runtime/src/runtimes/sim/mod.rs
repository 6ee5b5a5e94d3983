//! Simulated runtime
//!
//! Reference implementation of [`AcceleratorRuntime`] that keeps "device"
//! memory in host vectors. Copies and kernels are queued per channel and run
//! in FIFO order when the channel is synchronized, so ordering bugs show up
//! exactly as they would on hardware: data read back before a drain is stale.
//!
//! # Architecture
//!
//! ```text
//! SimRuntime
//! ├── HostMemory    - aligned allocations from the global allocator
//! ├── DeviceMemory  - synthetic 256-byte aligned addresses -> Vec<u8>
//! ├── Channels      - FIFO queues of deferred copies and kernels
//! ├── Textures      - linear bindings over device allocations
//! └── Event log     - every runtime call, for ordering assertions
//! ```
//!
//! # Usage
//!
//! ```rust
//! use mirror_runtime::{AcceleratorRuntime, BlockDim, ChannelId, GridDim, SimRuntime};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = SimRuntime::new();
//! let device = runtime.alloc_device(4)?;
//!
//! // One thread per byte: write its global index.
//! runtime.launch("iota", GridDim::linear(1), BlockDim::linear(4), ChannelId::DEFAULT, device, |ctx, bytes| {
//!     bytes[ctx.linear_global_id() as usize] = ctx.linear_global_id() as u8;
//! })?;
//! runtime.synchronize(ChannelId::DEFAULT)?;
//!
//! assert_eq!(runtime.device_bytes(device), Some(vec![0, 1, 2, 3]));
//! runtime.free_device(device)?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod memory;

use crate::device::{CapabilityDescriptor, DeviceInfo};
use crate::error::{MirrorError, Result, TransferDirection};
use crate::runtime::{
    AcceleratorRuntime, BlockDim, ChannelFormat, ChannelFormatKind, ChannelId, DevicePtr, ExecutionContext, GridDim,
    HostPtr, ReadMode, ResourceDesc, TextureDesc, TextureHandle,
};
use channel::{Channels, KernelFn, Operation};
use memory::{DeviceMemory, HostMemory};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Something the simulated runtime did, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    DeviceSelected { index: usize },
    HostAlloc { addr: usize, bytes: usize },
    HostFree { addr: usize },
    DeviceAlloc { ptr: DevicePtr, bytes: usize },
    DeviceFree { ptr: DevicePtr },
    ChannelCreated { channel: ChannelId },
    ChannelDestroyed { channel: ChannelId },
    CopyEnqueued { direction: TransferDirection, bytes: usize, channel: ChannelId },
    CopyCompleted { direction: TransferDirection, bytes: usize, channel: ChannelId },
    KernelCompleted { name: String, channel: ChannelId },
    Synchronized { channel: ChannelId },
    TextureCreated { handle: TextureHandle, ptr: DevicePtr },
    TextureDestroyed { handle: TextureHandle },
}

#[derive(Debug, Clone, Copy)]
struct TextureBinding {
    ptr: DevicePtr,
    size_bytes: usize,
    format: ChannelFormat,
    read_mode: ReadMode,
}

/// One-shot failures armed by the `fail_next_*` methods
#[derive(Debug, Default)]
struct FaultPlan {
    host_alloc: bool,
    device_alloc: bool,
    transfer: bool,
    execution: bool,
    binding: bool,
}

struct SimState {
    devices: Vec<DeviceInfo>,
    active: usize,
    host: HostMemory,
    device: DeviceMemory,
    channels: Channels,
    textures: HashMap<u64, TextureBinding>,
    next_texture: u64,
    faults: FaultPlan,
    events: Vec<RuntimeEvent>,
}

impl SimState {
    fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            active: 0,
            host: HostMemory::default(),
            device: DeviceMemory::default(),
            channels: Channels::default(),
            textures: HashMap::new(),
            next_texture: 1,
            faults: FaultPlan::default(),
            events: Vec::new(),
        }
    }

    fn device_info(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices.get(index).ok_or_else(|| {
            MirrorError::invalid_argument(format!("device index {index} out of range ({} devices)", self.devices.len()))
        })
    }

    /// Run everything queued on `channel`; a failure drops the rest of the queue
    fn drain(&mut self, channel: ChannelId) -> Result<()> {
        let mut queue = self.channels.take(channel)?;
        while let Some(op) = queue.pop_front() {
            if let Err(err) = self.execute(op, channel) {
                if !queue.is_empty() {
                    tracing::warn!(
                        channel = %channel,
                        discarded = queue.len(),
                        "discarding operations queued behind a failed one"
                    );
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drain every channel, reporting the first failure
    fn drain_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for channel in self.channels.ids() {
            if let Err(err) = self.drain(channel) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn execute(&mut self, op: Operation, channel: ChannelId) -> Result<()> {
        match op {
            Operation::Copy {
                direction,
                host,
                device,
                bytes,
            } => {
                if std::mem::take(&mut self.faults.execution) {
                    return Err(MirrorError::transfer(direction, "injected asynchronous failure"));
                }
                let region = self
                    .device
                    .get_mut(device)
                    .ok_or_else(|| MirrorError::transfer(direction, format!("{device} was freed before the copy ran")))?;
                if bytes > region.len() {
                    return Err(MirrorError::transfer(
                        direction,
                        format!("{bytes} bytes overrun the {}-byte allocation at {device}", region.len()),
                    ));
                }
                // SAFETY: the enqueueing caller guaranteed `host` covers `bytes` until
                // this drain; the device side was bounds-checked above.
                unsafe {
                    match direction {
                        TransferDirection::HostToDevice => {
                            std::ptr::copy_nonoverlapping(host.as_ptr(), region.as_mut_ptr(), bytes)
                        }
                        TransferDirection::DeviceToHost => {
                            std::ptr::copy_nonoverlapping(region.as_ptr(), host.as_ptr(), bytes)
                        }
                    }
                }
                self.events.push(RuntimeEvent::CopyCompleted {
                    direction,
                    bytes,
                    channel,
                });
            }
            Operation::Kernel {
                name,
                grid,
                block,
                target,
                body,
            } => {
                let region = self
                    .device
                    .get_mut(target)
                    .ok_or_else(|| MirrorError::invalid_state(format!("kernel `{name}` target {target} was freed")))?;
                run_kernel(grid, block, region, body);
                self.events.push(RuntimeEvent::KernelCompleted { name, channel });
            }
        }
        Ok(())
    }

    fn enqueue_copy(
        &mut self,
        direction: TransferDirection,
        host: HostPtr,
        device: DevicePtr,
        bytes: usize,
        channel: ChannelId,
    ) -> Result<()> {
        if std::mem::take(&mut self.faults.transfer) {
            return Err(MirrorError::transfer(direction, "injected enqueue failure"));
        }
        if !self.channels.contains(channel) {
            return Err(MirrorError::transfer(direction, format!("unknown {channel}")));
        }
        let len = self
            .device
            .get(device)
            .map(<[u8]>::len)
            .ok_or_else(|| MirrorError::transfer(direction, format!("{device} is not a live device allocation")))?;
        if bytes > len {
            return Err(MirrorError::transfer(
                direction,
                format!("{bytes} bytes overrun the {len}-byte allocation at {device}"),
            ));
        }

        self.channels.push(
            channel,
            Operation::Copy {
                direction,
                host,
                device,
                bytes,
            },
        )?;
        self.events.push(RuntimeEvent::CopyEnqueued {
            direction,
            bytes,
            channel,
        });
        Ok(())
    }
}

fn run_kernel(grid: GridDim, block: BlockDim, region: &mut [u8], mut body: KernelFn) {
    for gz in 0..grid.z {
        for gy in 0..grid.y {
            for gx in 0..grid.x {
                for tz in 0..block.z {
                    for ty in 0..block.y {
                        for tx in 0..block.x {
                            let ctx = ExecutionContext::new((gx, gy, gz), (tx, ty, tz), grid, block);
                            body(&ctx, region);
                        }
                    }
                }
            }
        }
    }
}

/// Texture element widths a linear binding accepts
fn validate_format(format: ChannelFormat, read_mode: ReadMode) -> Result<()> {
    let bits = format.bits_per_channel;
    if !matches!(bits, 8 | 16 | 32) {
        return Err(MirrorError::binding(format!(
            "{bits}-bit channels are not supported for linear textures"
        )));
    }
    if format.kind == ChannelFormatKind::Float && bits == 8 {
        return Err(MirrorError::binding("8-bit float channels do not exist"));
    }
    if read_mode == ReadMode::NormalizedFloat && (format.kind == ChannelFormatKind::Float || bits == 32) {
        return Err(MirrorError::binding(
            "normalized reads need an 8- or 16-bit integer channel",
        ));
    }
    Ok(())
}

/// Host-memory runtime with deferred, FIFO-ordered channels
///
/// Cloning shares the same simulated device, which is how tests keep a handle
/// for inspection while a buffer owns an `Arc<dyn AcceleratorRuntime>`.
#[derive(Clone)]
pub struct SimRuntime {
    state: Arc<Mutex<SimState>>,
}

impl SimRuntime {
    /// Name reported for the default simulated device
    pub const DEFAULT_DEVICE_NAME: &'static str = "sim-0";

    /// One device with 6 units of 2048 threads and groups of up to 256 threads
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceInfo::new(
            Self::DEFAULT_DEVICE_NAME,
            CapabilityDescriptor::new(2048, 6, 256),
            false,
        )])
    }

    /// Simulate a specific set of devices
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(devices))),
        }
    }

    /// Enqueue a kernel on `channel` that runs `body` once per thread over the
    /// bytes of `target`
    ///
    /// The body runs during [`synchronize`](AcceleratorRuntime::synchronize)
    /// with the runtime locked; it must not call back into the runtime.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty grid or block, a block larger than the
    /// active device allows, an unknown channel, or a `target` that is not a
    /// live allocation.
    pub fn launch<F>(
        &self,
        name: &str,
        grid: GridDim,
        block: BlockDim,
        channel: ChannelId,
        target: DevicePtr,
        body: F,
    ) -> Result<()>
    where
        F: FnMut(&ExecutionContext, &mut [u8]) + Send + 'static,
    {
        let mut state = self.state.lock();

        if grid.total_groups() == 0 || block.total_threads() == 0 {
            return Err(MirrorError::invalid_argument(format!(
                "kernel `{name}` launched with grid {grid} and block {block}"
            )));
        }
        let limit = state.device_info(state.active)?.capability.max_threads_per_group;
        if block.total_threads() > u64::from(limit) {
            return Err(MirrorError::invalid_argument(format!(
                "kernel `{name}` block {block} exceeds {limit} threads per group"
            )));
        }
        if !state.device.contains(target) {
            return Err(MirrorError::invalid_argument(format!(
                "kernel `{name}` target {target} is not a live device allocation"
            )));
        }

        state.channels.push(
            channel,
            Operation::Kernel {
                name: name.to_string(),
                grid,
                block,
                target,
                body: Box::new(body),
            },
        )
    }

    /// Read element `index` through a texture, like `tex1Dfetch`
    ///
    /// Out-of-range indices read as zero.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an unknown handle or a `T` whose width differs
    ///   from the bound channel format
    /// - `InvalidState` if the viewed memory has been freed underneath the texture
    pub fn texture_fetch<T: bytemuck::Pod>(&self, handle: TextureHandle, index: usize) -> Result<T> {
        let state = self.state.lock();
        let binding = state
            .textures
            .get(&handle.id())
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown texture {handle}")))?;

        let width = binding.format.bytes_per_element();
        if std::mem::size_of::<T>() != width {
            return Err(MirrorError::invalid_argument(format!(
                "{handle} holds {width}-byte elements, fetched as {}-byte {}",
                std::mem::size_of::<T>(),
                std::any::type_name::<T>()
            )));
        }

        let region = state
            .device
            .get(binding.ptr)
            .ok_or_else(|| MirrorError::invalid_state(format!("{handle} views freed memory at {}", binding.ptr)))?;

        let start = index.saturating_mul(width);
        match start.checked_add(width) {
            Some(end) if end <= binding.size_bytes => Ok(bytemuck::pod_read_unaligned(&region[start..end])),
            _ => Ok(T::zeroed()),
        }
    }

    /// Read element `index` of a normalized-float texture as `f32`
    ///
    /// # Errors
    ///
    /// As [`texture_fetch`](Self::texture_fetch), plus `InvalidArgument` when
    /// the texture was not created with [`ReadMode::NormalizedFloat`].
    pub fn texture_fetch_normalized(&self, handle: TextureHandle, index: usize) -> Result<f32> {
        let binding = {
            let state = self.state.lock();
            *state
                .textures
                .get(&handle.id())
                .ok_or_else(|| MirrorError::invalid_argument(format!("unknown texture {handle}")))?
        };
        if binding.read_mode != ReadMode::NormalizedFloat {
            return Err(MirrorError::invalid_argument(format!("{handle} reads element values, not normalized floats")));
        }

        let value = match (binding.format.kind, binding.format.bits_per_channel) {
            (ChannelFormatKind::Unsigned, 8) => f32::from(self.texture_fetch::<u8>(handle, index)?) / f32::from(u8::MAX),
            (ChannelFormatKind::Unsigned, _) => f32::from(self.texture_fetch::<u16>(handle, index)?) / f32::from(u16::MAX),
            (_, 8) => (f32::from(self.texture_fetch::<i8>(handle, index)?) / f32::from(i8::MAX)).max(-1.0),
            _ => (f32::from(self.texture_fetch::<i16>(handle, index)?) / f32::from(i16::MAX)).max(-1.0),
        };
        Ok(value)
    }

    /// Copy of a device allocation's current contents
    pub fn device_bytes(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.state.lock().device.get(ptr).map(<[u8]>::to_vec)
    }

    /// Everything the runtime has done since creation or the last [`clear_events`](Self::clear_events)
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Operations waiting on `channel`
    pub fn pending_operations(&self, channel: ChannelId) -> usize {
        self.state.lock().channels.pending(channel)
    }

    pub fn live_host_allocations(&self) -> usize {
        self.state.lock().host.live()
    }

    pub fn live_device_allocations(&self) -> usize {
        self.state.lock().device.live()
    }

    pub fn device_bytes_in_use(&self) -> usize {
        self.state.lock().device.used_bytes()
    }

    pub fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }

    /// Cap total device memory; `None` removes the cap
    pub fn set_device_memory_limit(&self, limit_bytes: Option<usize>) {
        self.state.lock().device.set_limit(limit_bytes);
    }

    /// Make the next host allocation fail
    pub fn fail_next_host_alloc(&self) {
        self.state.lock().faults.host_alloc = true;
    }

    /// Make the next device allocation fail
    pub fn fail_next_device_alloc(&self) {
        self.state.lock().faults.device_alloc = true;
    }

    /// Make the next copy be rejected when it is enqueued
    pub fn fail_next_transfer(&self) {
        self.state.lock().faults.transfer = true;
    }

    /// Make the next queued copy fail when its channel is drained
    pub fn fail_next_execution(&self) {
        self.state.lock().faults.execution = true;
    }

    /// Make the next texture creation fail
    pub fn fail_next_binding(&self) {
        self.state.lock().faults.binding = true;
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorRuntime for SimRuntime {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.state.lock().devices.len())
    }

    fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        self.state.lock().device_info(index).cloned()
    }

    fn set_active_device(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.device_info(index)?;
        state.active = index;
        state.events.push(RuntimeEvent::DeviceSelected { index });
        Ok(())
    }

    fn active_device(&self) -> usize {
        self.state.lock().active
    }

    fn alloc_host(&self, bytes: usize, align: usize) -> Result<HostPtr> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.faults.host_alloc) {
            return Err(MirrorError::allocation(crate::Region::Host, bytes, "injected failure"));
        }
        let ptr = state.host.allocate(bytes, align)?;
        state.events.push(RuntimeEvent::HostAlloc { addr: ptr.addr(), bytes });
        tracing::trace!(ptr = %ptr, bytes, align, "host allocation");
        Ok(ptr)
    }

    unsafe fn free_host(&self, ptr: HostPtr, bytes: usize, align: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.host.contains(ptr) {
            return Err(MirrorError::invalid_argument(format!("host pointer {ptr} is not a live allocation")));
        }
        let drained = state.drain_all();
        // SAFETY: every channel is empty, so no queued copy references `ptr`;
        // the caller vouches for size and alignment.
        unsafe { state.host.free(ptr, bytes, align)? };
        state.events.push(RuntimeEvent::HostFree { addr: ptr.addr() });
        drained
    }

    fn alloc_device(&self, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.faults.device_alloc) {
            return Err(MirrorError::allocation(crate::Region::Device, bytes, "injected failure"));
        }
        let ptr = state.device.allocate(bytes)?;
        state.events.push(RuntimeEvent::DeviceAlloc { ptr, bytes });
        tracing::trace!(ptr = %ptr, bytes, "device allocation");
        Ok(ptr)
    }

    fn free_device(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        if !state.device.contains(ptr) {
            return Err(MirrorError::invalid_argument(format!("device pointer {ptr} is not a live allocation")));
        }
        let drained = state.drain_all();
        state.device.free(ptr)?;
        state.events.push(RuntimeEvent::DeviceFree { ptr });
        drained
    }

    fn create_channel(&self) -> Result<ChannelId> {
        let mut state = self.state.lock();
        let channel = state.channels.create();
        state.events.push(RuntimeEvent::ChannelCreated { channel });
        Ok(channel)
    }

    fn destroy_channel(&self, channel: ChannelId) -> Result<()> {
        let mut state = self.state.lock();
        if channel.is_default() {
            return Err(MirrorError::invalid_argument("the default channel cannot be destroyed"));
        }
        let drained = state.drain(channel);
        state.channels.remove(channel)?;
        state.events.push(RuntimeEvent::ChannelDestroyed { channel });
        drained
    }

    unsafe fn copy_host_to_device(&self, dst: DevicePtr, src: HostPtr, bytes: usize, channel: ChannelId) -> Result<()> {
        self.state
            .lock()
            .enqueue_copy(TransferDirection::HostToDevice, src, dst, bytes, channel)
    }

    unsafe fn copy_device_to_host(&self, dst: HostPtr, src: DevicePtr, bytes: usize, channel: ChannelId) -> Result<()> {
        self.state
            .lock()
            .enqueue_copy(TransferDirection::DeviceToHost, dst, src, bytes, channel)
    }

    fn synchronize(&self, channel: ChannelId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.channels.contains(channel) {
            return Err(MirrorError::invalid_argument(format!("unknown {channel}")));
        }
        state.drain(channel)?;
        state.events.push(RuntimeEvent::Synchronized { channel });
        Ok(())
    }

    fn create_texture(&self, resource: &ResourceDesc, texture: &TextureDesc) -> Result<TextureHandle> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.faults.binding) {
            return Err(MirrorError::binding("injected failure"));
        }

        let ResourceDesc::Linear { ptr, size_bytes, format } = *resource;
        validate_format(format, texture.read_mode)?;
        let len = state
            .device
            .get(ptr)
            .map(<[u8]>::len)
            .ok_or_else(|| MirrorError::binding(format!("{ptr} is not a live device allocation")))?;
        if size_bytes == 0 || size_bytes > len {
            return Err(MirrorError::binding(format!(
                "cannot view {size_bytes} bytes of the {len}-byte allocation at {ptr}"
            )));
        }
        if size_bytes % format.bytes_per_element() != 0 {
            return Err(MirrorError::binding(format!(
                "{size_bytes} bytes is not a whole number of {}-byte elements",
                format.bytes_per_element()
            )));
        }

        let handle = TextureHandle::new(state.next_texture);
        state.next_texture += 1;
        state.textures.insert(
            handle.id(),
            TextureBinding {
                ptr,
                size_bytes,
                format,
                read_mode: texture.read_mode,
            },
        );
        state.events.push(RuntimeEvent::TextureCreated { handle, ptr });
        Ok(handle)
    }

    fn destroy_texture(&self, handle: TextureHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .textures
            .remove(&handle.id())
            .ok_or_else(|| MirrorError::invalid_argument(format!("unknown texture {handle}")))?;
        state.events.push(RuntimeEvent::TextureDestroyed { handle });
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
