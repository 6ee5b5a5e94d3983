//! Host and device allocations of the simulated runtime
//!
//! Host memory comes from the global allocator with the requested alignment.
//! Device memory lives in heap vectors keyed by synthetic, 256-byte aligned
//! addresses that never overlap and are never reused.

use crate::error::{MirrorError, Region, Result};
use crate::runtime::{DevicePtr, HostPtr};
use std::alloc::{self, Layout};
use std::collections::HashMap;

/// Alignment of simulated device allocations (matches CUDA's guarantee)
pub(super) const DEVICE_ALIGNMENT: u64 = 256;

/// First simulated device address; far away from anything a host pointer could be
const DEVICE_BASE_ADDRESS: u64 = 0x7f00_0000_0000;

/// Live host allocations and the layouts needed to free them
#[derive(Default)]
pub(super) struct HostMemory {
    allocations: HashMap<usize, Layout>,
}

impl HostMemory {
    pub(super) fn allocate(&mut self, bytes: usize, align: usize) -> Result<HostPtr> {
        if bytes == 0 {
            return Err(MirrorError::invalid_argument("host allocation of 0 bytes"));
        }
        let layout = Layout::from_size_align(bytes, align)
            .map_err(|e| MirrorError::invalid_argument(format!("host layout {bytes}B/{align}: {e}")))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = HostPtr::new(raw).ok_or_else(|| MirrorError::allocation(Region::Host, bytes, "allocator returned null"))?;

        self.allocations.insert(ptr.addr(), layout);
        Ok(ptr)
    }

    pub(super) fn contains(&self, ptr: HostPtr) -> bool {
        self.allocations.contains_key(&ptr.addr())
    }

    /// # Safety
    ///
    /// No queued operation may still reference `ptr`.
    pub(super) unsafe fn free(&mut self, ptr: HostPtr, bytes: usize, align: usize) -> Result<()> {
        let layout = *self
            .allocations
            .get(&ptr.addr())
            .ok_or_else(|| MirrorError::invalid_argument(format!("host pointer {ptr} is not a live allocation")))?;
        if layout.size() != bytes || layout.align() != align {
            return Err(MirrorError::invalid_argument(format!(
                "host pointer {ptr} was allocated as {}B/{} but freed as {bytes}B/{align}",
                layout.size(),
                layout.align()
            )));
        }
        self.allocations.remove(&ptr.addr());
        // SAFETY: allocated by `allocate` with exactly this layout and removed from the map.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    pub(super) fn live(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        for (addr, layout) in self.allocations.drain() {
            // SAFETY: every entry is a live allocation made with its layout.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Simulated accelerator memory
pub(super) struct DeviceMemory {
    allocations: HashMap<u64, Vec<u8>>,
    next_address: u64,
    used_bytes: usize,
    limit_bytes: Option<usize>,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self {
            allocations: HashMap::new(),
            next_address: DEVICE_BASE_ADDRESS,
            used_bytes: 0,
            limit_bytes: None,
        }
    }
}

impl DeviceMemory {
    pub(super) fn allocate(&mut self, bytes: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(MirrorError::invalid_argument("device allocation of 0 bytes"));
        }
        if let Some(limit) = self.limit_bytes {
            if self.used_bytes.saturating_add(bytes) > limit {
                return Err(MirrorError::allocation(
                    Region::Device,
                    bytes,
                    format!("out of memory ({} of {limit} bytes in use)", self.used_bytes),
                ));
            }
        }

        let mut region = Vec::new();
        region
            .try_reserve_exact(bytes)
            .map_err(|e| MirrorError::allocation(Region::Device, bytes, e))?;
        region.resize(bytes, 0);

        let ptr = DevicePtr::new(self.next_address);
        let span = (bytes as u64).div_ceil(DEVICE_ALIGNMENT) * DEVICE_ALIGNMENT;
        self.next_address += span;
        self.used_bytes += bytes;
        self.allocations.insert(ptr.addr(), region);
        Ok(ptr)
    }

    pub(super) fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        let region = self
            .allocations
            .remove(&ptr.addr())
            .ok_or_else(|| MirrorError::invalid_argument(format!("device pointer {ptr} is not a live allocation")))?;
        self.used_bytes -= region.len();
        Ok(())
    }

    pub(super) fn get(&self, ptr: DevicePtr) -> Option<&[u8]> {
        self.allocations.get(&ptr.addr()).map(Vec::as_slice)
    }

    pub(super) fn get_mut(&mut self, ptr: DevicePtr) -> Option<&mut [u8]> {
        self.allocations.get_mut(&ptr.addr()).map(Vec::as_mut_slice)
    }

    pub(super) fn contains(&self, ptr: DevicePtr) -> bool {
        self.allocations.contains_key(&ptr.addr())
    }

    pub(super) fn set_limit(&mut self, limit_bytes: Option<usize>) {
        self.limit_bytes = limit_bytes;
    }

    pub(super) fn live(&self) -> usize {
        self.allocations.len()
    }

    pub(super) fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn host_allocation_is_zeroed_and_aligned() {
        let mut host = HostMemory::default();
        let ptr = host.allocate(64, 64).unwrap();
        assert_eq!(ptr.addr() % 64, 0);
        // SAFETY: 64 bytes were just allocated.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { host.free(ptr, 64, 64).unwrap() };
        assert_eq!(host.live(), 0);
    }

    #[test]
    fn host_free_checks_layout() {
        let mut host = HostMemory::default();
        let ptr = host.allocate(32, 8).unwrap();
        assert!(unsafe { host.free(ptr, 16, 8) }.is_err());
        assert!(host.contains(ptr));
        unsafe { host.free(ptr, 32, 8).unwrap() };
        assert!(unsafe { host.free(ptr, 32, 8) }.is_err());
    }

    #[test]
    fn host_rejects_zero_bytes_and_bad_alignment() {
        let mut host = HostMemory::default();
        assert!(matches!(host.allocate(0, 8), Err(MirrorError::InvalidArgument(_))));
        assert!(matches!(host.allocate(8, 3), Err(MirrorError::InvalidArgument(_))));
    }

    #[test]
    fn device_allocations_do_not_overlap() {
        let mut device = DeviceMemory::default();
        let a = device.allocate(1).unwrap();
        let b = device.allocate(300).unwrap();
        let c = device.allocate(16).unwrap();
        assert_eq!(a.addr() % DEVICE_ALIGNMENT, 0);
        assert!(b.addr() >= a.addr() + 1);
        assert!(c.addr() >= b.addr() + 300);
        assert_eq!(c.addr() % DEVICE_ALIGNMENT, 0);
        assert_eq!(device.used_bytes(), 317);
    }

    #[test]
    fn device_limit_is_enforced() {
        let mut device = DeviceMemory::default();
        device.set_limit(Some(100));
        let a = device.allocate(60).unwrap();
        let err = device.allocate(60).unwrap_err();
        assert!(matches!(err, MirrorError::AllocationFailure { region: Region::Device, bytes: 60, .. }));
        device.free(a).unwrap();
        assert!(device.allocate(60).is_ok());
    }

    #[test]
    fn device_double_free_is_rejected() {
        let mut device = DeviceMemory::default();
        let a = device.allocate(8).unwrap();
        device.free(a).unwrap();
        assert!(matches!(device.free(a), Err(MirrorError::InvalidArgument(_))));
        assert!(!device.contains(a));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Alloc(usize),
        Free(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![(1usize..2048).prop_map(Step::Alloc), any::<usize>().prop_map(Step::Free)]
    }

    proptest! {
        #[test]
        fn prop_live_device_ranges_are_disjoint_and_aligned(steps in proptest::collection::vec(step(), 1..64)) {
            let mut device = DeviceMemory::default();
            let mut live: Vec<(DevicePtr, usize)> = Vec::new();

            for step in steps {
                match step {
                    Step::Alloc(bytes) => live.push((device.allocate(bytes).unwrap(), bytes)),
                    Step::Free(pick) if !live.is_empty() => {
                        let (ptr, _) = live.swap_remove(pick % live.len());
                        device.free(ptr).unwrap();
                    }
                    Step::Free(_) => {}
                }

                let mut ranges: Vec<(u64, u64)> = live.iter().map(|&(p, n)| (p.addr(), p.addr() + n as u64)).collect();
                ranges.sort_unstable();
                prop_assert!(ranges.iter().all(|&(start, _)| start % DEVICE_ALIGNMENT == 0));
                prop_assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
                prop_assert_eq!(device.used_bytes(), live.iter().map(|&(_, n)| n).sum::<usize>());
                prop_assert_eq!(device.live(), live.len());
            }
        }
    }
}
