//! Bus device handles and the driver interface.

use crate::controller::{ControllerShared, DEFAULT_COMMAND_TIMEOUT};
use crate::phy::Phy;
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Driver side of a bus device. The controller calls into this once per
/// polling iteration.
pub trait FunctionalDevice: Send {
    /// Perform one unit of periodic work. Return `false` when the device
    /// stopped answering so the controller disconnects it. An error
    /// terminates the controller run loop.
    fn access(&mut self) -> Result<bool, Error>;

    /// Called once when the controller removes the device from the bus.
    fn disconnected(&mut self) -> Result<(), Error>;
}

/// Handle to an enumerated device, used by drivers to exchange commands
/// with it. Cheap to clone.
#[derive(Clone)]
pub struct BusDevice {
    inner: Arc<BusDeviceInner>,
}

struct BusDeviceInner {
    phy: Arc<Phy>,
    shared: Arc<ControllerShared>,
    serial: [u8; 10],
    address: u8,
    closed: AtomicBool,
}

impl BusDevice {
    pub(crate) fn new(
        phy: Arc<Phy>,
        shared: Arc<ControllerShared>,
        serial: [u8; 10],
        address: u8,
    ) -> Self {
        Self {
            inner: Arc::new(BusDeviceInner {
                phy,
                shared,
                serial,
                address,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The serial number identifying the device.
    pub fn serial(&self) -> &[u8; 10] {
        &self.inner.serial
    }

    /// The bus address the controller assigned to the device.
    pub fn address(&self) -> u8 {
        self.inner.address
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send `payload` to the device and wait until `deadline` for its
    /// response. `scratch` is reused as the response buffer. `Ok(None)`
    /// means the device did not answer in time, which is distinct from a
    /// transport error.
    pub fn command_exec(
        &self,
        deadline: Instant,
        payload: &[u8],
        scratch: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        if self.is_closed() {
            return Err(Error::DeviceClosed);
        }
        self.inner.shared.command_exec(
            &self.inner.phy,
            self.inner.address,
            self.inner.address,
            payload,
            scratch,
            deadline,
        )
    }

    /// Like [`BusDevice::command_exec`] with a relative timeout. A zero
    /// timeout selects the bus default of 150 ms.
    pub fn command_exec_timeout(
        &self,
        timeout: Duration,
        payload: &[u8],
        scratch: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let timeout = if timeout.is_zero() {
            DEFAULT_COMMAND_TIMEOUT
        } else {
            timeout
        };
        self.command_exec(Instant::now() + timeout, payload, scratch)
    }
}

/// Installed when the device factory declines a device. Keeps the device
/// enumerated without talking to it.
pub(crate) struct DummyDevice;

impl FunctionalDevice for DummyDevice {
    fn access(&mut self) -> Result<bool, Error> {
        Ok(true)
    }

    fn disconnected(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
