//! Bus controller: device enumeration, address assignment and the polling
//! loop.
//!
//! The controller is the single bus master. It installs the PHY callbacks,
//! keeps the device table and the address bitmap, and funnels every
//! outgoing command through a single in-flight slot so at most one frame is
//! on the wire at a time.

use crate::device::{BusDevice, DummyDevice, FunctionalDevice};
use crate::phy::Phy;
use crate::slot::CommandSlot;
use crate::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Bus address of the controller itself.
const HOST_ADDRESS: u8 = 0x01;
/// Destination for enumeration commands.
const BROADCAST_ADDRESS: u8 = 0x00;
/// Command byte for both the broadcast ping and the address assignment.
const CMD_ADDRESS: u8 = 0x02;
/// Reply byte devices answer address commands with.
const REPLY_ADDRESS: u8 = 0x03;

/// How long a command waits for its response when the caller does not say.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(150);

/// Quiet period after bus activity before adaptive scanning slows down.
const RESCAN_HOLDOFF: Duration = Duration::from_secs(20);
/// In adaptive mode, scan only every this many iterations once the device
/// count is back at its maximum.
const RESCAN_DIVIDER: u32 = 10;
/// Break length used to reset devices before scanning an empty bus.
const SCAN_BREAK: Duration = Duration::from_millis(200);
/// Settle time between the scan break and the broadcast ping.
const SCAN_BREAK_SETTLE: Duration = Duration::from_millis(30);

/// State shared between the polling loop, the PHY callbacks and the bus
/// device handles.
pub(crate) struct ControllerShared {
    pub(crate) slot: CommandSlot,
    pub(crate) scan_deadline: Mutex<Instant>,
    pub(crate) devices_max: AtomicU32,
}

impl ControllerShared {
    pub(crate) fn new() -> Self {
        Self {
            slot: CommandSlot::new(),
            scan_deadline: Mutex::new(Instant::now()),
            devices_max: AtomicU32::new(0),
        }
    }

    /// Push the adaptive rescan deadline out; called on any bus activity.
    fn rearm_scan(&self) {
        *self.scan_deadline.lock().unwrap() = Instant::now() + RESCAN_HOLDOFF;
    }

    /// Execute one command: acquire the slot, arm it for `response_addr`,
    /// transmit, and wait for the response or the deadline. `Ok(None)`
    /// means no response arrived in time (including when the slot could
    /// not be acquired before the deadline).
    pub(crate) fn command_exec(
        &self,
        phy: &Phy,
        dst: u8,
        response_addr: u8,
        payload: &[u8],
        scratch: Vec<u8>,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, Error> {
        let Some(guard) = self.slot.acquire(deadline) else {
            return Ok(None);
        };
        guard.activate(response_addr, scratch);
        phy.send_packet(HOST_ADDRESS, dst, payload)?;
        Ok(guard.wait(deadline))
    }
}

struct DeviceEntry {
    bus: BusDevice,
    driver: Box<dyn FunctionalDevice>,
}

/// The bus master. One per bus; see [`Controller::run`].
pub struct Controller {
    phy: Arc<Phy>,
    shared: Arc<ControllerShared>,
    factory: Box<dyn FnMut(BusDevice) -> Option<Box<dyn FunctionalDevice>> + Send>,
    devices: HashMap<[u8; 10], DeviceEntry>,
    devices_number: i32,
    address_used: [u64; 4],
    scan_count: u32,
}

impl Controller {
    /// Create a controller on top of `phy`.
    ///
    /// `num_devices` selects the scan policy: a positive count stops
    /// scanning once that many devices are known, `0` scans on every
    /// polling iteration, and `-1` scans adaptively, rescanning when bus
    /// activity suggests an unknown device is present.
    ///
    /// `factory` builds a driver for each newly enumerated device; returning
    /// `None` installs a placeholder driver that keeps the device
    /// enumerated.
    pub fn new<F>(mut phy: Phy, num_devices: i32, factory: F) -> Self
    where
        F: FnMut(BusDevice) -> Option<Box<dyn FunctionalDevice>> + Send + 'static,
    {
        let shared = Arc::new(ControllerShared::new());

        let rx_shared = shared.clone();
        phy.set_packet_handler(move |src, dst, payload| {
            if dst != HOST_ADDRESS {
                return Ok(());
            }
            rx_shared.slot.post(src, payload);
            Ok(())
        });

        if num_devices < 0 {
            let presence_shared = shared.clone();
            phy.set_presence_handler(move |_byte| {
                presence_shared.rearm_scan();
                Ok(())
            });
        }

        let mut controller = Self {
            phy: Arc::new(phy),
            shared,
            factory: Box::new(factory),
            devices: HashMap::new(),
            devices_number: num_devices,
            address_used: [0; 4],
            scan_count: 0,
        };

        controller.address_set_used(BROADCAST_ADDRESS, true);
        controller.address_set_used(HOST_ADDRESS, true);
        controller.address_set_used(0xAA, true); // frame start marker, never assignable

        controller
    }

    /// A cloneable handle for stopping the controller and reading bus
    /// statistics from other threads.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            phy: self.phy.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Highest number of devices ever seen on the bus.
    pub fn max_devices(&self) -> usize {
        self.shared.devices_max.load(Ordering::Relaxed) as usize
    }

    fn address_set_used(&mut self, address: u8, used: bool) {
        let mask = 1u64 << (address % 64);
        if used {
            self.address_used[usize::from(address) / 64] |= mask;
        } else {
            self.address_used[usize::from(address) / 64] &= !mask;
        }
    }

    /// Claim the lowest free bus address, or `None` when the pool is
    /// exhausted.
    fn address_find_free(&mut self) -> Option<u8> {
        for address in 0u16..254 {
            let mask = 1u64 << (address % 64);
            if self.address_used[usize::from(address) / 64] & mask == 0 {
                self.address_set_used(address as u8, true);
                return Some(address as u8);
            }
        }
        None
    }

    /// One enumeration pass: decide whether to scan, ping the broadcast
    /// address, and assign an address to whichever unconfigured device
    /// answered. Colliding answers corrupt the frame and are retried on a
    /// later pass.
    fn detect_and_configure(&mut self) -> Result<(), Error> {
        let devices_max = self.shared.devices_max.load(Ordering::Relaxed) as usize;
        if self.devices.len() > devices_max {
            self.shared
                .devices_max
                .store(self.devices.len() as u32, Ordering::Relaxed);
        }

        if self.devices_number >= 0 {
            if self.devices_number > 0 && self.devices.len() >= self.devices_number as usize {
                return Ok(());
            }
        } else {
            let scan_deadline = *self.shared.scan_deadline.lock().unwrap();
            if self.devices.len() >= devices_max
                && devices_max > 0
                && Instant::now() > scan_deadline
            {
                self.scan_count += 1;
                if self.scan_count >= RESCAN_DIVIDER {
                    self.scan_count = 0;
                } else {
                    return Ok(());
                }
            }
        }

        if self.devices.is_empty() {
            // Reset devices that may be stuck mid-frame before pinging.
            let _ = self.phy.send_break(SCAN_BREAK);
            thread::sleep(SCAN_BREAK_SETTLE);
        }

        let mut ping = [0u8; 12];
        ping[0] = CMD_ADDRESS;
        let response = self.shared.command_exec(
            &self.phy,
            BROADCAST_ADDRESS,
            BROADCAST_ADDRESS,
            &ping,
            Vec::new(),
            Instant::now() + DEFAULT_COMMAND_TIMEOUT,
        )?;

        let Some(response) = response else {
            return Ok(());
        };
        if response.len() != 11 || response[0] != REPLY_ADDRESS {
            return Ok(());
        }

        let mut serial = [0u8; 10];
        serial.copy_from_slice(&response[1..11]);

        let address = match self.devices.get(&serial) {
            Some(entry) => entry.bus.address(),
            None => {
                let Some(address) = self.address_find_free() else {
                    log::warn!("address pool exhausted, ignoring device {serial:02X?}");
                    return Ok(());
                };
                log::info!("device {serial:02X?} answered, assigning address {address:#04X}");
                let bus = BusDevice::new(self.phy.clone(), self.shared.clone(), serial, address);
                let driver =
                    (self.factory)(bus.clone()).unwrap_or_else(|| Box::new(DummyDevice));
                self.devices.insert(serial, DeviceEntry { bus, driver });
                address
            }
        };

        let mut assign = [0u8; 12];
        assign[0] = CMD_ADDRESS;
        assign[1] = address;
        assign[2..12].copy_from_slice(&serial);
        let ack = self.shared.command_exec(
            &self.phy,
            BROADCAST_ADDRESS,
            address,
            &assign,
            Vec::new(),
            Instant::now() + DEFAULT_COMMAND_TIMEOUT,
        )?;

        let acked = matches!(&ack, Some(r) if r.len() == 11 && r[0] == REPLY_ADDRESS);
        if !acked {
            log::debug!("device {serial:02X?} did not accept address {address:#04X}");
            if let Some(entry) = self.devices.get(&serial) {
                entry.bus.close();
            }
        }

        Ok(())
    }

    /// One pass over the device table: reap closed devices, poll the rest.
    fn poll_devices(&mut self) -> Result<(), Error> {
        let serials: Vec<[u8; 10]> = self.devices.keys().copied().collect();
        for serial in serials {
            if self.devices[&serial].bus.is_closed() {
                let mut entry = self.devices.remove(&serial).unwrap();
                log::info!(
                    "device {serial:02X?} left the bus, freeing address {:#04X}",
                    entry.bus.address()
                );
                let result = entry.driver.disconnected();
                self.address_set_used(entry.bus.address(), false);
                result?;
                continue;
            }

            let entry = self.devices.get_mut(&serial).unwrap();
            let active = entry.driver.access()?;
            if !active {
                entry.bus.close();
            }
        }
        Ok(())
    }

    /// Run the controller until a fatal error occurs or
    /// [`ControllerHandle::close`] is called. Starts the PHY receive loop
    /// on a background thread; errors from it (port failures, callback
    /// errors) are surfaced here unchanged.
    pub fn run(&mut self) -> Result<(), Error> {
        let rx_result: Arc<Mutex<Option<Result<(), Error>>>> = Arc::new(Mutex::new(None));
        let rx_done = Arc::new(AtomicBool::new(false));

        let reader = {
            let phy = self.phy.clone();
            let rx_result = rx_result.clone();
            let rx_done = rx_done.clone();
            thread::Builder::new().name("bus-rx".into()).spawn(move || {
                let result = phy.run();
                if let Err(err) = &result {
                    log::error!("receive loop failed: {err}");
                }
                *rx_result.lock().unwrap() = Some(result);
                rx_done.store(true, Ordering::Release);
            })?
        };

        self.shared.rearm_scan();

        let result = loop {
            if rx_done.load(Ordering::Acquire) {
                break rx_result.lock().unwrap().take().unwrap_or(Ok(()));
            }
            if let Err(err) = self.detect_and_configure() {
                break Err(err);
            }
            if let Err(err) = self.poll_devices() {
                break Err(err);
            }
        };

        self.phy.close();
        let _ = reader.join();
        result
    }
}

/// Cloneable companion to a [`Controller`], usable while `run` blocks.
#[derive(Clone)]
pub struct ControllerHandle {
    phy: Arc<Phy>,
    shared: Arc<ControllerShared>,
}

impl ControllerHandle {
    /// Stop a running controller; its `run` call returns shortly after.
    pub fn close(&self) {
        self.phy.close();
    }

    /// Highest number of devices ever seen on the bus.
    pub fn max_devices(&self) -> usize {
        self.shared.devices_max.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{device_frame, ScriptedLink};
    use std::sync::atomic::AtomicUsize;

    const SERIAL: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    fn ping_reply() -> Vec<u8> {
        let mut payload = vec![REPLY_ADDRESS];
        payload.extend_from_slice(&SERIAL);
        device_frame(0x00, HOST_ADDRESS, &payload, 0x21)
    }

    fn assign_ack(address: u8) -> Vec<u8> {
        let mut payload = vec![REPLY_ADDRESS];
        payload.extend_from_slice(&SERIAL);
        device_frame(address, HOST_ADDRESS, &payload, 0x42)
    }

    fn start<F>(
        link: &ScriptedLink,
        num_devices: i32,
        factory: F,
    ) -> (Controller, thread::JoinHandle<Result<(), Error>>)
    where
        F: FnMut(BusDevice) -> Option<Box<dyn FunctionalDevice>> + Send + 'static,
    {
        let phy = Phy::new(Box::new(link.clone())).unwrap();
        let controller = Controller::new(phy, num_devices, factory);
        let reader = {
            let phy = controller.phy.clone();
            thread::spawn(move || phy.run())
        };
        (controller, reader)
    }

    fn stop(controller: &Controller, reader: thread::JoinHandle<Result<(), Error>>) {
        controller.phy.close();
        reader.join().unwrap().unwrap();
    }

    #[test]
    fn enumeration_assigns_the_lowest_free_address() {
        let link = ScriptedLink::new();
        link.push_reply(ping_reply());
        link.push_reply(assign_ack(0x02));

        let factory_calls = Arc::new(AtomicUsize::new(0));
        let calls = factory_calls.clone();
        let (mut controller, reader) = start(&link, 0, move |_device| {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        });

        controller.detect_and_configure().unwrap();

        assert_eq!(controller.devices.len(), 1);
        let entry = &controller.devices[&SERIAL];
        assert_eq!(entry.bus.address(), 0x02);
        assert!(!entry.bus.is_closed());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

        // The same serial answering again must not create a second record.
        link.push_reply(ping_reply());
        link.push_reply(assign_ack(0x02));
        controller.detect_and_configure().unwrap();

        assert_eq!(controller.devices.len(), 1);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.max_devices(), 1);

        stop(&controller, reader);
    }

    #[test]
    fn rejected_assignment_closes_the_record() {
        let link = ScriptedLink::new();
        link.push_reply(ping_reply());
        // No assignment ack scripted: the command times out.

        let (mut controller, reader) = start(&link, 0, |_device| None);
        controller.detect_and_configure().unwrap();

        assert_eq!(controller.devices.len(), 1);
        assert!(controller.devices[&SERIAL].bus.is_closed());

        stop(&controller, reader);
    }

    struct RefusingDevice {
        accesses: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    impl FunctionalDevice for RefusingDevice {
        fn access(&mut self) -> Result<bool, Error> {
            self.accesses.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        fn disconnected(&mut self) -> Result<(), Error> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn failing_device_is_disconnected_and_reaped() {
        let link = ScriptedLink::new();
        link.push_reply(ping_reply());
        link.push_reply(assign_ack(0x02));

        let accesses = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let (a, d, f) = (accesses.clone(), disconnects.clone(), factory_calls.clone());
        let (mut controller, reader) = start(&link, 0, move |_device| {
            f.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(RefusingDevice {
                accesses: a.clone(),
                disconnects: d.clone(),
            }))
        });

        controller.detect_and_configure().unwrap();
        assert_eq!(controller.devices.len(), 1);

        // First pass: the driver refuses, the record is marked closed.
        controller.poll_devices().unwrap();
        assert_eq!(accesses.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert!(controller.devices[&SERIAL].bus.is_closed());

        // Second pass: reaped exactly once, address freed.
        controller.poll_devices().unwrap();
        assert!(controller.devices.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(controller.address_used[0] & (1 << 0x02), 0);

        // The same pack coming back gets an address and a fresh driver.
        link.push_reply(ping_reply());
        link.push_reply(assign_ack(0x02));
        controller.detect_and_configure().unwrap();
        assert_eq!(controller.devices.len(), 1);
        assert_eq!(controller.devices[&SERIAL].bus.address(), 0x02);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 2);

        stop(&controller, reader);
    }

    #[test]
    fn timeout_and_transport_error_are_distinct() {
        let link = ScriptedLink::new();
        let (controller, reader) = start(&link, 1, |_device| None);

        let started = Instant::now();
        let response = controller
            .shared
            .command_exec(
                &controller.phy,
                0x05,
                0x05,
                &[0x4A],
                Vec::new(),
                Instant::now() + DEFAULT_COMMAND_TIMEOUT,
            )
            .unwrap();
        assert!(response.is_none());
        assert!(started.elapsed() >= DEFAULT_COMMAND_TIMEOUT);

        link.fail_writes();
        let err = controller
            .shared
            .command_exec(
                &controller.phy,
                0x05,
                0x05,
                &[0x4A],
                Vec::new(),
                Instant::now() + DEFAULT_COMMAND_TIMEOUT,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        stop(&controller, reader);
    }

    #[test]
    fn fixed_count_mode_stops_scanning_when_satisfied() {
        let link = ScriptedLink::new();
        link.push_reply(ping_reply());
        link.push_reply(assign_ack(0x02));

        let (mut controller, reader) = start(&link, 1, |_device| None);
        controller.detect_and_configure().unwrap();
        assert_eq!(controller.devices.len(), 1);
        let writes_after_first = link.written().len();

        // The declared count is reached: no further frames go out.
        controller.detect_and_configure().unwrap();
        assert_eq!(link.written().len(), writes_after_first);

        stop(&controller, reader);
    }

    #[test]
    fn allocated_addresses_avoid_reserved_values() {
        let link = ScriptedLink::new();
        let phy = Phy::new(Box::new(link)).unwrap();
        let mut controller = Controller::new(phy, 1, |_device| None);

        let mut previous = 0u8;
        let mut seen = std::collections::HashSet::new();
        while let Some(address) = controller.address_find_free() {
            assert!(![0x00, 0x01, 0xAA].contains(&address));
            assert!(address > previous);
            assert!(seen.insert(address));
            previous = address;
        }
        // 254 candidates minus the three reserved values.
        assert_eq!(seen.len(), 251);
    }

    #[test]
    fn freed_addresses_are_reused_lowest_first() {
        let link = ScriptedLink::new();
        let phy = Phy::new(Box::new(link)).unwrap();
        let mut controller = Controller::new(phy, 1, |_device| None);

        assert_eq!(controller.address_find_free(), Some(0x02));
        assert_eq!(controller.address_find_free(), Some(0x03));
        assert_eq!(controller.address_find_free(), Some(0x04));

        controller.address_set_used(0x03, false);
        assert_eq!(controller.address_find_free(), Some(0x03));
        assert_eq!(controller.address_find_free(), Some(0x05));
    }

    #[test]
    fn run_returns_cleanly_after_close() {
        let link = ScriptedLink::new();
        let phy = Phy::new(Box::new(link.clone())).unwrap();
        let mut controller = Controller::new(phy, 1, |_device| None);
        let handle = controller.handle();

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.close();
        });

        controller.run().unwrap();
        closer.join().unwrap();
    }
}
