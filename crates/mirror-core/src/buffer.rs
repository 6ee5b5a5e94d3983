//! Host/device buffer pairs
//!
//! A [`MirroredBuffer<T>`] owns one host allocation and one device allocation
//! of the same byte size and moves data between them on a transfer channel.
//! Both regions exist together or not at all, and are freed together exactly
//! once: by [`release`](MirroredBuffer::release) or when the buffer is dropped.
//!
//! After an asynchronous pop the host region belongs to the runtime until
//! [`synchronize`](MirroredBuffer::synchronize) returns; host views fail with
//! `InvalidState` in the meantime.
//!
//! # Example
//!
//! ```rust
//! use mirror_core::{MirroredBuffer, SimRuntime, Transfer};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(SimRuntime::new());
//! let mut buffer = MirroredBuffer::<u32>::new(runtime, 4)?;
//!
//! buffer.host_mut()?.copy_from_slice(&[1, 2, 3, 4]);
//! buffer.push(Transfer::Sync)?;
//! buffer.host_mut()?.fill(0);
//! buffer.pop(Transfer::Sync)?;
//! assert_eq!(buffer.host()?, &[1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

use mirror_runtime::{AcceleratorRuntime, ChannelId, DevicePtr, HostPtr, MirrorError, Result, TransferDirection};
use mirror_tracing::performance::{record_allocation, record_transfer};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Whether a transfer waits for its channel to drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transfer {
    /// Use the buffer's `async_default`
    #[default]
    Inherit,
    /// Block until the channel has drained
    Sync,
    /// Only enqueue; the caller synchronizes before touching the destination
    Async,
}

impl Transfer {
    fn is_async(self, async_default: bool) -> bool {
        match self {
            Transfer::Inherit => async_default,
            Transfer::Sync => false,
            Transfer::Async => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Regions {
    host: HostPtr,
    device: DevicePtr,
}

/// Matching host and device allocations of `len` elements of `T`
pub struct MirroredBuffer<T: bytemuck::Pod> {
    runtime: Arc<dyn AcceleratorRuntime>,
    len: usize,
    byte_size: usize,
    channel: ChannelId,
    async_default: bool,
    regions: Option<Regions>,
    /// An enqueued device-to-host copy may still write the host region
    pending_pop: bool,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> MirroredBuffer<T> {
    /// Allocate `len` elements on the default channel with blocking transfers
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>, len: usize) -> Result<Self> {
        Self::with_options(runtime, len, ChannelId::DEFAULT, false)
    }

    /// Allocate `len` elements that transfer on `channel`
    ///
    /// A zero-length buffer is valid but holds no regions; transfers on it
    /// fail with `InvalidState`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the byte size overflows
    /// - `AllocationFailure` if either region cannot be allocated (nothing
    ///   stays allocated in that case)
    #[tracing::instrument(skip(runtime), fields(
        runtime = runtime.name(),
        type_name = std::any::type_name::<T>()
    ))]
    pub fn with_options(
        runtime: Arc<dyn AcceleratorRuntime>,
        len: usize,
        channel: ChannelId,
        async_default: bool,
    ) -> Result<Self> {
        let byte_size = len.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            MirrorError::invalid_argument(format!(
                "{len} elements of {} overflow the address space",
                std::any::type_name::<T>()
            ))
        })?;

        let mut buffer = Self {
            runtime,
            len,
            byte_size,
            channel,
            async_default,
            regions: None,
            pending_pop: false,
            _marker: PhantomData,
        };
        buffer.allocate()?;
        Ok(buffer)
    }

    /// Allocate both regions if they are not allocated yet
    ///
    /// Re-allocates after [`release`](Self::release); new regions start zeroed
    /// and usually live at new addresses.
    pub fn allocate(&mut self) -> Result<()> {
        if self.regions.is_some() || self.byte_size == 0 {
            return Ok(());
        }
        let align = std::mem::align_of::<T>();

        let start = Instant::now();
        let host = self.runtime.alloc_host(self.byte_size, align)?;
        record_allocation(self.byte_size, "host", align, start.elapsed().as_micros() as u64);

        let start = Instant::now();
        let device = match self.runtime.alloc_device(self.byte_size) {
            Ok(device) => device,
            Err(err) => {
                // SAFETY: allocated just above with this size and alignment, never shared.
                if let Err(rollback) = unsafe { self.runtime.free_host(host, self.byte_size, align) } {
                    tracing::warn!(error = %rollback, "rolling back host region failed");
                }
                return Err(err);
            }
        };
        record_allocation(self.byte_size, "device", align, start.elapsed().as_micros() as u64);

        self.regions = Some(Regions { host, device });
        Ok(())
    }

    fn regions(&self) -> Result<Regions> {
        self.regions.ok_or_else(|| {
            if self.byte_size == 0 {
                MirrorError::invalid_state("buffer has zero bytes")
            } else {
                MirrorError::invalid_state("buffer regions are not allocated")
            }
        })
    }

    /// Copy the host region to the device region
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the buffer holds no regions
    /// - `TransferFailure` if the runtime rejects the copy or a queued
    ///   operation fails while waiting
    #[tracing::instrument(skip(self), fields(bytes = self.byte_size, channel = %self.channel))]
    pub fn push(&mut self, mode: Transfer) -> Result<()> {
        let regions = self.regions()?;
        let start = Instant::now();

        // SAFETY: the host region stays allocated until `release`, which drains
        // every channel before freeing it.
        unsafe {
            self.runtime
                .copy_host_to_device(regions.device, regions.host, self.byte_size, self.channel)?;
        }
        self.finish_transfer(mode, TransferDirection::HostToDevice, start)
    }

    /// Copy the device region to the host region
    ///
    /// After an asynchronous pop the host region is only valid once
    /// [`synchronize`](Self::synchronize) has returned; until then
    /// [`host`](Self::host) and friends return `InvalidState`.
    ///
    /// # Errors
    ///
    /// As [`push`](Self::push).
    #[tracing::instrument(skip(self), fields(bytes = self.byte_size, channel = %self.channel))]
    pub fn pop(&mut self, mode: Transfer) -> Result<()> {
        let regions = self.regions()?;
        let start = Instant::now();

        // SAFETY: as in `push`; `&mut self` keeps host slices from being held
        // across the call.
        unsafe {
            self.runtime
                .copy_device_to_host(regions.host, regions.device, self.byte_size, self.channel)?;
        }
        self.finish_transfer(mode, TransferDirection::DeviceToHost, start)
    }

    fn finish_transfer(&mut self, mode: Transfer, direction: TransferDirection, start: Instant) -> Result<()> {
        if mode.is_async(self.async_default) {
            if direction == TransferDirection::DeviceToHost {
                self.pending_pop = true;
            }
            tracing::trace!(%direction, "transfer enqueued");
            return Ok(());
        }
        self.synchronize()?;
        record_transfer(self.byte_size, direction, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Block until everything queued on the buffer's channel has completed
    ///
    /// Hands the host region back to the caller even when the drain fails,
    /// since a failed drain discards whatever was still queued.
    pub fn synchronize(&mut self) -> Result<()> {
        let drained = self.runtime.synchronize(self.channel);
        self.pending_pop = false;
        drained
    }

    fn check_no_pending_pop(&self) -> Result<()> {
        if self.pending_pop {
            return Err(MirrorError::invalid_state(
                "host region is the target of an unsynchronized pop",
            ));
        }
        Ok(())
    }

    /// Whether an asynchronous pop has not been synchronized yet
    pub fn has_pending_pop(&self) -> bool {
        self.pending_pop
    }

    /// Free both regions; a no-op when nothing is allocated
    ///
    /// Both regions are gone afterwards even if the runtime reports an error.
    pub fn release(&mut self) -> Result<()> {
        let Some(regions) = self.regions.take() else {
            return Ok(());
        };
        self.pending_pop = false;
        let ((host, device), duration_us) = mirror_tracing::timed_block!("buffer_release", {
            // SAFETY: allocated in `allocate` with exactly this size and alignment;
            // `take` above guarantees it is freed once.
            let host = unsafe {
                self.runtime
                    .free_host(regions.host, self.byte_size, std::mem::align_of::<T>())
            };
            (host, self.runtime.free_device(regions.device))
        });
        tracing::debug!(
            bytes = self.byte_size,
            host = %regions.host,
            device = %regions.device,
            duration_us,
            "released mirrored buffer"
        );
        host.and(device)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn async_default(&self) -> bool {
        self.async_default
    }

    pub fn set_async_default(&mut self, async_default: bool) {
        self.async_default = async_default;
    }

    pub fn is_allocated(&self) -> bool {
        self.regions.is_some()
    }

    pub fn host_ptr(&self) -> Option<HostPtr> {
        self.regions.map(|r| r.host)
    }

    /// Device address to hand to kernels, `None` when not allocated
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.regions.map(|r| r.device)
    }

    pub fn runtime(&self) -> &Arc<dyn AcceleratorRuntime> {
        &self.runtime
    }

    /// Typed view of the host region
    ///
    /// # Errors
    ///
    /// `InvalidState` after [`release`](Self::release), or while an
    /// asynchronous pop is pending.
    pub fn host(&self) -> Result<&[T]> {
        if self.len == 0 {
            return Ok(&[]);
        }
        self.check_no_pending_pop()?;
        let regions = self.regions()?;
        // SAFETY: `len` elements, aligned for `T`, zero-initialised at
        // allocation and only ever written as `T` or raw bytes of a Pod type.
        Ok(unsafe { std::slice::from_raw_parts(regions.host.as_ptr().cast::<T>(), self.len) })
    }

    /// Mutable typed view of the host region
    pub fn host_mut(&mut self) -> Result<&mut [T]> {
        if self.len == 0 {
            return Ok(&mut []);
        }
        self.check_no_pending_pop()?;
        let regions = self.regions()?;
        // SAFETY: as in `host`; `&mut self` makes the view exclusive.
        Ok(unsafe { std::slice::from_raw_parts_mut(regions.host.as_ptr().cast::<T>(), self.len) })
    }

    /// Fill the host region from `src` (no transfer)
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `src.len() != self.len()`.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() != self.len {
            return Err(MirrorError::invalid_argument(format!(
                "expected {} elements, got {}",
                self.len,
                src.len()
            )));
        }
        self.host_mut()?.copy_from_slice(src);
        Ok(())
    }

    /// Copy of the host region (no transfer)
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.host()?.to_vec())
    }
}

impl<T: bytemuck::Pod> Drop for MirroredBuffer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "releasing mirrored buffer during drop failed");
        }
    }
}

impl<T: bytemuck::Pod> fmt::Debug for MirroredBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirroredBuffer")
            .field("len", &self.len)
            .field("byte_size", &self.byte_size)
            .field("channel", &self.channel)
            .field("async_default", &self.async_default)
            .field("pending_pop", &self.pending_pop)
            .field("host", &self.host_ptr())
            .field("device", &self.device_ptr())
            .finish()
    }
}

impl<T: bytemuck::Pod> fmt::Display for MirroredBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "( elements = {}, bytes = {}, element size = {}, host = ",
            self.len,
            self.byte_size,
            std::mem::size_of::<T>()
        )?;
        match self.regions {
            Some(r) => write!(f, "{}, device = {} )", r.host, r.device),
            None => f.write_str("null, device = null )"),
        }
    }
}
