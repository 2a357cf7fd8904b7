//! Device slots
//!
//! Each device id owns one [`RefObj`]. The first retain opens the device on
//! the HAL and the last release closes it; retains in between share the
//! same [`Device`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, RtError};
use crate::hal::Hal;
use crate::ref_obj::{AcquireError, RefObj, Released, ReleaseError};
use crate::spin::SpinPolicy;

/// An opened device
#[derive(Debug)]
pub struct Device {
    id: u32,
    hal: Arc<dyn Hal>,
    open: AtomicBool,
}

impl Device {
    fn open(id: u32, hal: &Arc<dyn Hal>) -> Result<Self> {
        let count = hal.device_count().map_err(RtError::from_drv)?;
        if id >= count {
            return Err(RtError::InvalidDeviceId);
        }
        hal.device_open(id).map_err(RtError::from_drv)?;
        info!("Opened device {id} on {} HAL", hal.hal_type());
        Ok(Self {
            id,
            hal: Arc::clone(hal),
            open: AtomicBool::new(true),
        })
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.hal.device_close(self.id) {
            Ok(()) => info!("Closed device {}", self.id),
            Err(e) => warn!("Closing device {} failed: {e}", self.id),
        }
    }

    /// Device id
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// HAL the device was opened on
    pub fn hal(&self) -> &dyn Hal {
        self.hal.as_ref()
    }

    /// Whether the device is still open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Fixed array of reference-counted device slots
#[derive(Debug)]
pub struct DeviceTable {
    slots: Box<[RefObj<Device>]>,
    hal: Arc<dyn Hal>,
}

impl DeviceTable {
    /// `max_devices` empty slots over `hal`.
    pub fn new(hal: Arc<dyn Hal>, max_devices: u32, spin: SpinPolicy) -> Self {
        Self {
            slots: (0..max_devices)
                .map(|_| RefObj::with_spin_policy(spin))
                .collect(),
            hal,
        }
    }

    fn slot(&self, id: u32) -> Result<&RefObj<Device>> {
        self.slots
            .get(id as usize)
            .ok_or(RtError::InvalidDeviceId)
    }

    /// Take a reference to device `id`, opening it on first use.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceId` for an id outside the table or the driver's device
    /// count; the translated driver error if opening fails.
    pub fn retain(&self, id: u32) -> Result<Arc<Device>> {
        self.slot(id)?
            .acquire(|| Device::open(id, &self.hal))
            .map_err(|e| match e {
                AcquireError::Create(e) => e,
                AcquireError::Overflow | AcquireError::RetryExhausted => {
                    warn!("Retaining device {id} failed: {e}");
                    RtError::Internal
                }
            })
    }

    /// Drop a reference to device `id`, closing it on last release.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceId` for an id outside the table, `InvalidParam` if the
    /// device is not retained.
    pub fn release(&self, id: u32) -> Result<()> {
        match self.slot(id)?.release(|device| device.close()) {
            Ok(Released::Decremented | Released::Destroyed) => Ok(()),
            Err(ReleaseError::NotAcquired) => {
                warn!("Release of device {id} without a matching retain");
                Err(RtError::InvalidParam)
            }
            Err(ReleaseError::RetryExhausted) => Err(RtError::Internal),
        }
    }

    /// Live reference count of device `id` (zero for an unknown id).
    pub fn ref_count(&self, id: u32) -> u64 {
        self.slot(id).map_or(0, RefObj::ref_count)
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Release every outstanding reference, closing open devices.
    pub(crate) fn release_all(&self) {
        for (id, slot) in (0u32..).zip(self.slots.iter()) {
            let mut released = 0u64;
            while slot.ref_count() > 0 && slot.release(|device| device.close()).is_ok() {
                released += 1;
            }
            if released > 0 {
                warn!("Dropped {released} outstanding reference(s) to device {id}");
            }
        }
    }
}
