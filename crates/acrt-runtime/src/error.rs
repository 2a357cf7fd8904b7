//! Error types for runtime operations
//!
//! Every public operation fails with exactly one [`RtError`]. Each variant
//! carries a stable numeric status that the C ABI returns unchanged:
//!
//! | Range | Class |
//! |-------|-------|
//! | `1xxxxx` | caller passed something wrong |
//! | `2xxxxx` | a resource ran out or is unsupported |
//! | `5xxxxx` | the runtime or driver failed internally |
//!
//! Driver errors are translated through a static table sorted by driver
//! code. Codes the table does not know become [`RtError::DriverInternal`],
//! which still carries the raw driver code for logging.

use acrt_drv::DrvError;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RtError>;

/// Status returned by the C ABI on success.
pub const RT_SUCCESS: i32 = 0;

/// Errors that can occur during runtime operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RtError {
    /// Invalid argument
    #[error("invalid parameter")]
    InvalidParam,

    /// Device id out of range or not present
    #[error("invalid device id")]
    InvalidDeviceId,

    /// No usable context (none current, destroyed, or stale handle)
    #[error("context is null")]
    ContextNull,

    /// Stream belongs to another context
    #[error("stream does not belong to the current context")]
    StreamContextMismatch,

    /// A thread is already subscribed to this stream for this report kind
    #[error("stream already subscribed")]
    StreamAlreadySubscribed,

    /// Unsubscribing thread is not the registered subscriber
    #[error("stream subscriber mismatch")]
    StreamSubscribeMismatch,

    /// Launching host work on a stream nobody subscribed to
    #[error("no callback thread registered for the stream")]
    StreamNoCallbackRegistered,

    /// Driver rejected a handle
    #[error("invalid handle")]
    InvalidHandle,

    /// Unknown allocation policy
    #[error("invalid malloc type")]
    InvalidMallocType,

    /// Stream synchronization did not complete in time
    #[error("wait timeout")]
    WaitTimeout,

    /// Stream handle does not refer to a live stream
    #[error("stream is null")]
    StreamNull,

    /// Operation unsupported by the driver or platform
    #[error("feature not supported")]
    FeatureNotSupported,

    /// Memory or pool allocation failed
    #[error("memory allocation failed")]
    MemoryAllocation,

    /// Driver has no queue left for a new stream
    #[error("no stream resources")]
    StreamResourceExhausted,

    /// Runtime internal error
    #[error("internal error")]
    Internal,

    /// Device stopped answering
    #[error("device heartbeat lost")]
    LostHeartbeat,

    /// No report arrived before the timeout
    #[error("report timeout")]
    ReportTimeout,

    /// Device-side process hung
    #[error("device process hang")]
    DeviceProcessHang,

    /// Device could not be brought up
    #[error("device setup failed")]
    DevSetup,

    /// `rtInit` has not been called, or `rtDeinit` already ran
    #[error("runtime not initialized")]
    NotInitialized,

    /// Driver error without a dedicated translation
    #[error("driver internal error: {drv}")]
    DriverInternal {
        /// Raw driver error
        drv: DrvError,
    },
}

/// Driver-to-runtime translation, sorted by driver code.
const DRV_ERROR_MAP: [(DrvError, RtError); 15] = [
    (DrvError::NoDevice, RtError::InvalidDeviceId),
    (DrvError::InvalidDevice, RtError::InvalidDeviceId),
    (DrvError::InvalidValue, RtError::InvalidParam),
    (DrvError::InvalidHandle, RtError::InvalidHandle),
    (DrvError::InvalidMallocType, RtError::InvalidMallocType),
    (DrvError::OutOfMemory, RtError::MemoryAllocation),
    (DrvError::ParaError, RtError::InvalidParam),
    (DrvError::WaitTimeout, RtError::ReportTimeout),
    (DrvError::BusDown, RtError::LostHeartbeat),
    (DrvError::MallocFail, RtError::MemoryAllocation),
    (DrvError::RepeatedSubscribed, RtError::StreamAlreadySubscribed),
    (DrvError::DevProcessHang, RtError::DeviceProcessHang),
    (DrvError::OperNotPermitted, RtError::FeatureNotSupported),
    (DrvError::NoStreamResources, RtError::StreamResourceExhausted),
    (DrvError::NotSupport, RtError::FeatureNotSupported),
];

impl RtError {
    /// Translate a driver error.
    #[must_use]
    pub fn from_drv(drv: DrvError) -> Self {
        DRV_ERROR_MAP
            .binary_search_by_key(&drv.code(), |(d, _)| d.code())
            .map_or(Self::DriverInternal { drv }, |idx| DRV_ERROR_MAP[idx].1)
    }

    /// Numeric status returned through the C ABI.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidParam => 107_000,
            Self::InvalidDeviceId => 107_001,
            Self::ContextNull => 107_002,
            Self::StreamContextMismatch => 107_003,
            Self::StreamAlreadySubscribed => 107_011,
            Self::StreamSubscribeMismatch => 107_012,
            Self::StreamNoCallbackRegistered => 107_015,
            Self::InvalidHandle => 107_017,
            Self::InvalidMallocType => 107_018,
            Self::WaitTimeout => 107_019,
            Self::StreamNull => 107_022,
            Self::FeatureNotSupported => 207_000,
            Self::MemoryAllocation => 207_001,
            Self::StreamResourceExhausted => 207_004,
            Self::Internal => 507_000,
            Self::LostHeartbeat => 507_010,
            Self::ReportTimeout => 507_012,
            Self::DeviceProcessHang => 507_017,
            Self::DevSetup => 507_033,
            Self::NotInitialized => 507_036,
            Self::DriverInternal { .. } => 507_899,
        }
    }

    /// Raw driver error behind this status, if it came from the driver
    /// untranslated.
    #[must_use]
    pub const fn driver_error(&self) -> Option<DrvError> {
        match self {
            Self::DriverInternal { drv } => Some(*drv),
            _ => None,
        }
    }
}

impl From<DrvError> for RtError {
    fn from(drv: DrvError) -> Self {
        Self::from_drv(drv)
    }
}

/// Collapse a result into a C ABI status, logging failures.
pub(crate) fn status<T>(api: &str, result: &Result<T>) -> i32 {
    match result {
        Ok(_) => RT_SUCCESS,
        Err(e) => {
            tracing::error!("{api} failed: {e} (status {})", e.code());
            e.code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_table_is_sorted() {
        assert!(DRV_ERROR_MAP
            .windows(2)
            .all(|w| w[0].0.code() < w[1].0.code()));
    }

    #[test]
    fn known_driver_codes_translate() {
        assert_eq!(RtError::from_drv(DrvError::OutOfMemory), RtError::MemoryAllocation);
        assert_eq!(RtError::from_drv(DrvError::WaitTimeout), RtError::ReportTimeout);
        assert_eq!(RtError::from_drv(DrvError::NotSupport), RtError::FeatureNotSupported);
        assert_eq!(
            RtError::from_drv(DrvError::RepeatedSubscribed),
            RtError::StreamAlreadySubscribed
        );
    }

    #[test]
    fn unknown_driver_codes_keep_raw_code() {
        let err = RtError::from_drv(DrvError::IoctlFail);
        assert_eq!(err, RtError::DriverInternal { drv: DrvError::IoctlFail });
        assert_eq!(err.code(), 507_899);
        assert_eq!(err.driver_error(), Some(DrvError::IoctlFail));
    }

    #[test]
    fn every_driver_code_has_a_status() {
        for drv in DrvError::ALL {
            assert_ne!(RtError::from_drv(drv).code(), RT_SUCCESS);
        }
    }
}
