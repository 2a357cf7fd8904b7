//! Device memory descriptors.

use std::fmt;

/// Address in device memory.
///
/// Device addresses are opaque to the host; they are only meaningful to the
/// HAL that produced them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw device address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw device address.
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// Placement policy for device allocations.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MallocPolicy {
    /// Prefer huge pages, fall back to normal pages.
    HugeFirst = 0,
    /// Huge pages only.
    HugeOnly = 1,
    /// Normal pages only.
    NormalOnly = 2,
}

impl MallocPolicy {
    /// Decode the C ABI value.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::HugeFirst),
            1 => Some(Self::HugeOnly),
            2 => Some(Self::NormalOnly),
            _ => None,
        }
    }
}

/// Direction of a memory copy.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemcpyKind {
    /// Host to host.
    HostToHost = 0,
    /// Host to device.
    HostToDevice = 1,
    /// Device to host.
    DeviceToHost = 2,
    /// Device to device.
    DeviceToDevice = 3,
}

impl MemcpyKind {
    /// Decode the C ABI value.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::HostToHost),
            1 => Some(Self::HostToDevice),
            2 => Some(Self::DeviceToHost),
            3 => Some(Self::DeviceToDevice),
            _ => None,
        }
    }
}

/// Memory class queried by `mem_info`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAttr {
    /// Normal-page device memory.
    Normal = 0,
    /// Huge-page device memory.
    Huge = 1,
    /// Everything.
    All = 2,
}

impl MemAttr {
    /// Decode the C ABI value.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Normal),
            1 => Some(Self::Huge),
            2 => Some(Self::All),
            _ => None,
        }
    }
}

/// Free / total bytes of one memory class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemInfo {
    /// Bytes not currently allocated.
    pub free: u64,
    /// Bytes managed by the device.
    pub total: u64,
}
