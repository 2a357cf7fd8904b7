//! Driver error codes.
//!
//! Every HAL entry point returns exactly one value of this closed
//! enumeration. The numeric values are fixed by the driver ABI; `0` (no
//! error) is represented by `Ok` and therefore has no variant.

use std::fmt;

/// Result of a HAL call.
pub type DrvResult<T> = std::result::Result<T, DrvError>;

/// Closed set of driver error codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DrvError {
    /// No valid device.
    NoDevice = 1,
    /// Invalid device.
    InvalidDevice = 2,
    /// Invalid value.
    InvalidValue = 3,
    /// Invalid handle.
    InvalidHandle = 4,
    /// Invalid malloc type.
    InvalidMallocType = 5,
    /// Out of memory.
    OutOfMemory = 6,
    /// Driver internal error.
    InnerError = 7,
    /// Wrong parameter passed to the driver.
    ParaError = 8,
    /// Driver not initialized.
    Uninit = 9,
    /// Driver initialized twice.
    RepeatedInit = 10,
    /// Resource does not exist.
    NotExist = 11,
    /// Task already running.
    Busy = 13,
    /// Driver short of resources.
    NoResources = 14,
    /// Wait timed out.
    WaitTimeout = 16,
    /// Ioctl failed.
    IoctlFail = 17,
    /// PCIe bus down, heartbeat lost.
    BusDown = 33,
    /// Device not ready.
    DeviceNotReady = 34,
    /// Over a driver limit.
    OverLimit = 37,
    /// Host allocation inside the driver failed.
    MallocFail = 40,
    /// The queue already has a subscriber of this kind.
    RepeatedSubscribed = 41,
    /// Owning process exited.
    ProcessExit = 42,
    /// Device-side process hang.
    DevProcessHang = 43,
    /// Operation not permitted.
    OperNotPermitted = 46,
    /// No stream (queue) resources left.
    NoStreamResources = 48,
    /// Try again.
    TryAgain = 51,
    /// Operation not supported by this driver.
    NotSupport = 0xfffe,
}

impl DrvError {
    /// Every variant, sorted by numeric code.
    pub const ALL: [Self; 26] = [
        Self::NoDevice,
        Self::InvalidDevice,
        Self::InvalidValue,
        Self::InvalidHandle,
        Self::InvalidMallocType,
        Self::OutOfMemory,
        Self::InnerError,
        Self::ParaError,
        Self::Uninit,
        Self::RepeatedInit,
        Self::NotExist,
        Self::Busy,
        Self::NoResources,
        Self::WaitTimeout,
        Self::IoctlFail,
        Self::BusDown,
        Self::DeviceNotReady,
        Self::OverLimit,
        Self::MallocFail,
        Self::RepeatedSubscribed,
        Self::ProcessExit,
        Self::DevProcessHang,
        Self::OperNotPermitted,
        Self::NoStreamResources,
        Self::TryAgain,
        Self::NotSupport,
    ];

    /// Numeric driver code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decode a numeric driver code. `0` and unknown codes yield `None`.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL
            .binary_search_by_key(&code, |e| e.code())
            .ok()
            .map(|idx| Self::ALL[idx])
    }

    /// Short description used in log lines.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoDevice => "no valid device",
            Self::InvalidDevice => "invalid device",
            Self::InvalidValue => "invalid value",
            Self::InvalidHandle => "invalid handle",
            Self::InvalidMallocType => "invalid malloc type",
            Self::OutOfMemory => "out of memory",
            Self::InnerError => "driver inner error",
            Self::ParaError => "driver parameter error",
            Self::Uninit => "driver uninitialized",
            Self::RepeatedInit => "driver repeated init",
            Self::NotExist => "resource does not exist",
            Self::Busy => "busy",
            Self::NoResources => "no resources",
            Self::WaitTimeout => "wait timeout",
            Self::IoctlFail => "ioctl failed",
            Self::BusDown => "bus down",
            Self::DeviceNotReady => "device not ready",
            Self::OverLimit => "over limit",
            Self::MallocFail => "malloc failed",
            Self::RepeatedSubscribed => "repeated subscribe",
            Self::ProcessExit => "process exited",
            Self::DevProcessHang => "device process hang",
            Self::OperNotPermitted => "operation not permitted",
            Self::NoStreamResources => "no stream resources",
            Self::TryAgain => "try again",
            Self::NotSupport => "not supported",
        }
    }
}

impl fmt::Display for DrvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (drv {})", self.description(), self.code())
    }
}

impl std::error::Error for DrvError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_sorted_by_code() {
        assert!(DrvError::ALL.windows(2).all(|w| w[0].code() < w[1].code()));
    }

    #[test]
    fn from_code_resolves_known_codes() {
        assert_eq!(DrvError::from_code(16), Some(DrvError::WaitTimeout));
        assert_eq!(DrvError::from_code(0xfffe), Some(DrvError::NotSupport));
    }

    #[test]
    fn from_code_rejects_success_and_gaps() {
        assert_eq!(DrvError::from_code(0), None);
        assert_eq!(DrvError::from_code(12), None);
        assert_eq!(DrvError::from_code(-1), None);
    }
}
