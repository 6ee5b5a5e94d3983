//! Handles, texture descriptors and launch dimensions

use std::fmt;
use std::ptr::NonNull;

/// Host memory handed out by [`AcceleratorRuntime::alloc_host`](super::AcceleratorRuntime::alloc_host)
///
/// A plain address: it neither owns nor frees the memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(NonNull<u8>);

// The pointer is only an address; every dereference goes through an unsafe
// runtime call whose contract covers synchronisation.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    /// Wrap a raw pointer, `None` when null
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Display for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Address of accelerator memory; never dereferenced on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const fn new(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Ordered queue of transfers and launches on the accelerator (a stream)
///
/// Operations on the same channel run in enqueue order. Channel 0 is the
/// process-wide default channel and always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// The process-wide default channel
    pub const DEFAULT: ChannelId = ChannelId(0);

    pub const fn new(id: u64) -> Self {
        ChannelId(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub const fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("default-channel")
        } else {
            write!(f, "channel{}", self.0)
        }
    }
}

/// Opaque handle to a read-only, cached texture view over device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

impl TextureHandle {
    pub const fn new(id: u64) -> Self {
        TextureHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex{}", self.0)
    }
}

/// How texture fetches interpret channel bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFormatKind {
    Signed,
    Unsigned,
    Float,
}

/// Single-channel element format of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelFormat {
    pub bits_per_channel: u32,
    pub kind: ChannelFormatKind,
}

impl ChannelFormat {
    pub const fn new(bits_per_channel: u32, kind: ChannelFormatKind) -> Self {
        Self { bits_per_channel, kind }
    }

    /// Unsigned channel as wide as `T`
    pub const fn unsigned_for<T>() -> Self {
        Self::new(8 * std::mem::size_of::<T>() as u32, ChannelFormatKind::Unsigned)
    }

    pub const fn bytes_per_element(&self) -> usize {
        (self.bits_per_channel / 8) as usize
    }
}

/// Memory a texture is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResourceDesc {
    /// Plain linear device memory (no array/pitch layout)
    Linear {
        ptr: DevicePtr,
        size_bytes: usize,
        format: ChannelFormat,
    },
}

impl ResourceDesc {
    pub const fn linear(ptr: DevicePtr, size_bytes: usize, format: ChannelFormat) -> Self {
        ResourceDesc::Linear { ptr, size_bytes, format }
    }

    pub const fn ptr(&self) -> DevicePtr {
        match self {
            ResourceDesc::Linear { ptr, .. } => *ptr,
        }
    }
}

/// What a fetch returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadMode {
    /// The raw element type
    #[default]
    ElementType,
    /// Integers normalised to `[0, 1]` / `[-1, 1]` floats
    NormalizedFloat,
}

/// Sampling side of a texture binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureDesc {
    pub read_mode: ReadMode,
}

/// Grid dimensions for a kernel launch (groups in each dimension)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_groups(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Threads in one group, per dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_threads(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Position of one thread inside a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub group_idx: (u32, u32, u32),
    pub thread_idx: (u32, u32, u32),
    pub grid_dim: GridDim,
    pub block_dim: BlockDim,
}

impl ExecutionContext {
    pub const fn new(
        group_idx: (u32, u32, u32),
        thread_idx: (u32, u32, u32),
        grid_dim: GridDim,
        block_dim: BlockDim,
    ) -> Self {
        Self {
            group_idx,
            thread_idx,
            grid_dim,
            block_dim,
        }
    }

    /// Linear index of the group within the grid
    pub const fn linear_group_id(&self) -> u64 {
        let (bx, by, bz) = self.group_idx;
        (bz as u64 * self.grid_dim.y as u64 + by as u64) * self.grid_dim.x as u64 + bx as u64
    }

    /// Linear index of the thread within its group
    pub const fn linear_thread_id(&self) -> u64 {
        let (tx, ty, tz) = self.thread_idx;
        (tz as u64 * self.block_dim.y as u64 + ty as u64) * self.block_dim.x as u64 + tx as u64
    }

    /// Linear index of the thread across the whole launch
    pub const fn linear_global_id(&self) -> u64 {
        self.linear_group_id() * self.block_dim.total_threads() + self.linear_thread_id()
    }

    /// Total threads in the launch, i.e. the stride of a grid-stride loop
    pub const fn grid_size(&self) -> u64 {
        self.grid_dim.total_groups() * self.block_dim.total_threads()
    }
}
