//! Fixed limits and sentinels shared by the runtime and every HAL.

/// Maximum number of devices the runtime addresses.
pub const MAX_DEVICE_NUM: u32 = 1;

/// Submit-queue id meaning "no queue allocated".
pub const SQ_ID_NONE: u32 = u32::MAX;

/// Thread id stored in a stream's subscriber slot when nobody is subscribed.
pub const THREAD_ID_UNSUBSCRIBED: u64 = u64::MAX;

/// Where the runtime executes relative to the device.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Host program runs on the device's control CPU.
    Offline = 0,
    /// Host program runs on a separate host, device attached over PCIe.
    Online = 1,
    /// Host program is scheduled by the device-side AI CPU scheduler.
    AicpuSched = 2,
}

impl RunMode {
    /// Numeric value exposed through the C ABI.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}
