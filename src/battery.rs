//! Battery pack driver.
//!
//! Reads the pack's binary records round-robin, decodes them into
//! engineering units and publishes snapshot updates through a lossy
//! single-slot channel. One driver instance is created per enumerated pack
//! by the device factory handed to the controller.

use crate::device::{BusDevice, FunctionalDevice};
use crate::Error;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::{Duration, SystemTime};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
mod util {
    use serde::ser::SerializeSeq;
    use serde::Serializer;

    pub fn f32_3_digits<S>(x: &f32, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64((*x as f64 * 1000.0).round() / 1000.0)
    }

    pub fn vec_f32_3_digits<S>(vec: &Vec<f32>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(vec.len()))?;
        for e in vec {
            let val = (*e as f64 * 1000.0).round() / 1000.0;
            seq.serialize_element(&val)?;
        }
        seq.end()
    }
}

/// Chemistry of a battery pack, as reported in its factory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BatteryType {
    #[default]
    LiHv,
    LiPo,
    LiIon,
    LiFe,
    Pb,
    NiMH,
    /// A chemistry code this library does not know.
    Other(u8),
}

impl From<u8> for BatteryType {
    fn from(value: u8) -> Self {
        match value {
            0 => BatteryType::LiHv,
            1 => BatteryType::LiPo,
            2 => BatteryType::LiIon,
            3 => BatteryType::LiFe,
            5 => BatteryType::Pb,
            6 => BatteryType::NiMH,
            other => BatteryType::Other(other),
        }
    }
}

/// Decoded snapshot of a battery pack.
///
/// Written by the driver one record at a time; read it through
/// [`BatteryHandle::data`]. Fields default to zero until the corresponding
/// record has been read at least once.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatteryData {
    /// Whether the pack is still answering on the bus.
    pub connected: bool,
    /// When the live state record was last decoded.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub last_data: Option<SystemTime>,

    /// Address the controller assigned to the pack.
    pub bus_address: u8,
    /// Hex-encoded bus serial.
    pub serial: String,
    /// Manufacturer name from the serial record.
    pub manufacturer_name: String,

    /// Pack chemistry.
    pub battery_type: BatteryType,
    /// Per-cell discharge cutoff voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_discharge_cutoff_v: f32,
    /// Per-cell nominal discharge voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_discharge_normal_v: f32,
    /// Per-cell maximum charge voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_charge_max_v: f32,
    /// Per-cell factory default storage voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_storage_default_v: f32,
    /// Cell capacity in ampere-hours.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_capacity_ah: f32,
    /// Maximum charge current, derived from the factory C-rate and capacity.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub battery_charge_max_current_a: f32,
    /// Maximum discharge current, derived from the factory C-rate and
    /// capacity.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub battery_discharge_max_current_a: f32,
    /// Lowest operating temperature, degrees Celsius.
    pub temp_use_low_c: i8,
    /// Highest operating temperature, degrees Celsius.
    pub temp_use_high_c: i8,
    /// Lowest storage temperature, degrees Celsius.
    pub temp_storage_low_c: i8,
    /// Highest storage temperature, degrees Celsius.
    pub temp_storage_high_c: i8,
    /// Whether the pack can discharge itself to the storage voltage.
    pub battery_has_auto_discharge: bool,
    /// Number of cells in series.
    pub battery_number_of_cells: usize,

    /// User-preferred charge current.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub battery_preferred_charge_current_a: f32,
    /// User-preferred per-cell storage voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_preferred_storage_voltage_v: f32,
    /// User-preferred per-cell maximum voltage.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::f32_3_digits"))]
    pub cell_preferred_max_voltage_v: f32,
    /// Whether automatic self discharge is enabled.
    pub battery_self_discharge_enabled: bool,
    /// Hours before self discharge starts; meaningless when disabled.
    pub battery_self_discharge_hours: u8,

    /// Number of charge cycles.
    pub battery_charge_cycles: u16,
    /// Times the pack was over-charged.
    pub battery_error_over_charged: u16,
    /// Times the pack was over-discharged.
    pub battery_error_over_discharged: u16,
    /// Times the pack was over temperature.
    pub battery_error_over_temperature: u16,

    /// Current pack temperature, degrees Celsius.
    pub temp_current_c: i8,
    /// Per-cell voltages.
    #[cfg_attr(feature = "serde", serde(serialize_with = "util::vec_f32_3_digits"))]
    pub cell_voltage_v: Vec<f32>,
}

struct BatteryShared {
    bus: BusDevice,
    data: RwLock<BatteryData>,
}

/// Consumer-side view of a battery: snapshot access and configuration
/// writes. Delivered on the update channel whenever the snapshot changes.
#[derive(Clone)]
pub struct BatteryHandle {
    shared: Arc<BatteryShared>,
}

impl BatteryHandle {
    /// Read access to the decoded snapshot. The snapshot is consistent for
    /// as long as the guard is held; do not hold it across blocking calls.
    pub fn data(&self) -> RwLockReadGuard<'_, BatteryData> {
        self.shared.data.read().unwrap()
    }

    /// Write the user-adjustable configuration to the pack. Self discharge
    /// is disabled when `discharge_hours` is negative. Returns whether the
    /// pack acknowledged the write.
    pub fn set_configuration(
        &self,
        charge_current_a: f32,
        storage_voltage_v: f32,
        max_voltage_v: f32,
        discharge_hours: f32,
    ) -> Result<bool, Error> {
        let request = build_configuration(
            charge_current_a,
            storage_voltage_v,
            max_voltage_v,
            discharge_hours,
        );
        let response =
            self.shared
                .bus
                .command_exec_timeout(Duration::from_secs(1), &request, Vec::new())?;
        Ok(matches!(response, Some(r) if r.len() == 2 && r[0] == 0x47))
    }
}

fn build_configuration(
    charge_current_a: f32,
    storage_voltage_v: f32,
    max_voltage_v: f32,
    discharge_hours: f32,
) -> [u8; 9] {
    let mut buf = [0u8; 9];
    buf[0] = 0x46;
    buf[1..5].copy_from_slice(&((charge_current_a * 1000.0) as u32).to_le_bytes());
    // The storage voltage overlaps the top byte of the charge current: the
    // pack reads the current as 24 bits.
    buf[4..6].copy_from_slice(&((storage_voltage_v * 1000.0) as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&((max_voltage_v * 1000.0) as u16).to_le_bytes());
    buf[8] = if discharge_hours < 0.0 {
        0xFF
    } else {
        discharge_hours as u8
    };
    buf
}

#[derive(Clone, Copy)]
enum Record {
    State,
    Cycle,
    User,
    Serial,
    Factory,
}

#[derive(Default)]
struct RecordCaches {
    current_state: Vec<u8>,
    cycle_info: Vec<u8>,
    user_settings: Vec<u8>,
    serial: Vec<u8>,
    factory_info: Vec<u8>,
}

/// The driver the controller polls. Each `access` call reads one record;
/// five calls make a full refresh cycle.
pub struct Battery {
    shared: Arc<BatteryShared>,
    updates: SyncSender<BatteryHandle>,
    caches: RecordCaches,
    scratch: Vec<u8>,
    read_index: i32,
}

impl Battery {
    /// Create a battery driver for `device`. A [`BatteryHandle`] is sent on
    /// `updates` whenever the decoded snapshot changes; the send never
    /// blocks and is dropped when the channel is full.
    pub fn new(device: BusDevice, updates: SyncSender<BatteryHandle>) -> Self {
        let data = BatteryData {
            connected: true,
            bus_address: device.address(),
            serial: device.serial().iter().map(|b| format!("{b:02x}")).collect(),
            ..Default::default()
        };
        Self {
            shared: Arc::new(BatteryShared {
                bus: device,
                data: RwLock::new(data),
            }),
            updates,
            caches: RecordCaches::default(),
            scratch: Vec::new(),
            read_index: 0,
        }
    }

    /// Consumer-side handle to this battery.
    pub fn handle(&self) -> BatteryHandle {
        BatteryHandle {
            shared: self.shared.clone(),
        }
    }

    fn signal_update(&self) {
        // Single-buffer channel: a slow consumer loses updates instead of
        // stalling the polling loop.
        let _ = self.updates.try_send(self.handle());
    }

    /// Read one record: send `cmd`, compare the reply against the cached
    /// copy and decode it on change. Returns whether the pack is still
    /// answering.
    fn read_record(&mut self, cmd: &[u8], expected_reply: u8, record: Record) -> Result<bool, Error> {
        let response = self.shared.bus.command_exec_timeout(
            Duration::ZERO,
            cmd,
            std::mem::take(&mut self.scratch),
        )?;
        let Some(response) = response else {
            // No answer within the bus timeout: report inactive so the
            // controller disconnects us.
            return Ok(false);
        };

        if response.first() != Some(&expected_reply) {
            log::debug!(
                "battery {:#04X}: ignoring reply {:02X?} to command {:02X?}",
                self.shared.bus.address(),
                response.first(),
                cmd
            );
            self.scratch = response;
            return Ok(true);
        }

        let cache = match record {
            Record::State => &mut self.caches.current_state,
            Record::Cycle => &mut self.caches.cycle_info,
            Record::User => &mut self.caches.user_settings,
            Record::Serial => &mut self.caches.serial,
            Record::Factory => &mut self.caches.factory_info,
        };
        if *cache != response {
            cache.clear();
            cache.extend_from_slice(&response);
            let changed = {
                let mut data = self.shared.data.write().unwrap();
                match record {
                    Record::State => decode_state(&mut data, cache),
                    Record::Cycle => decode_cycle(&mut data, cache),
                    Record::User => decode_user_settings(&mut data, cache),
                    Record::Serial => decode_serial(&mut data, cache, self.shared.bus.serial()),
                    Record::Factory => decode_factory(&mut data, cache),
                }
            };
            if changed {
                self.signal_update();
            }
        }

        self.scratch = response;
        Ok(true)
    }
}

impl FunctionalDevice for Battery {
    fn access(&mut self) -> Result<bool, Error> {
        self.read_index += 1;
        match self.read_index {
            0 => {
                let cells = self.shared.data.read().unwrap().battery_number_of_cells;
                // Until the factory record arrives the cell count is zero
                // and this byte wraps to 0xFF; packs tolerate it and the
                // request corrects itself on the next cycle.
                let cmd = [0x44, 0x00, (cells as u8).wrapping_sub(1)];
                let result = self.read_record(&cmd, 0x45, Record::State);
                self.signal_update();
                result
            }
            1 => self.read_record(&[0x4A], 0x4B, Record::Cycle),
            2 => self.read_record(&[0x42], 0x43, Record::User),
            3 => self.read_record(&[0x84], 0x85, Record::Serial),
            _ => {
                self.read_index = -1;
                self.read_record(&[0x88], 0x89, Record::Factory)
            }
        }
    }

    fn disconnected(&mut self) -> Result<(), Error> {
        self.shared.data.write().unwrap().connected = false;
        self.signal_update();
        Ok(())
    }
}

fn decode_state(data: &mut BatteryData, raw: &[u8]) -> bool {
    if raw.len() < 6 || raw[1] != 0 {
        return false;
    }

    let cells = usize::from(raw[2]) + 1;
    if data.cell_voltage_v.len() != cells {
        data.cell_voltage_v = vec![0.0; cells];
    }
    if raw.len() < 3 + 1 + 2 * cells {
        return false;
    }

    let mut index = 3;
    for cell in data.cell_voltage_v.iter_mut() {
        *cell = f32::from(u16::from_le_bytes([raw[index], raw[index + 1]])) / 1000.0;
        index += 2;
    }
    data.temp_current_c = raw[index] as i8;
    data.last_data = Some(SystemTime::now());
    true
}

fn decode_factory(data: &mut BatteryData, raw: &[u8]) -> bool {
    if raw.len() < 24 {
        return false;
    }

    data.battery_type = BatteryType::from(raw[1]);
    data.cell_discharge_cutoff_v = f32::from(u16::from_le_bytes([raw[2], raw[3]])) / 1000.0;
    data.cell_discharge_normal_v = f32::from(u16::from_le_bytes([raw[4], raw[5]])) / 1000.0;
    data.cell_charge_max_v = f32::from(u16::from_le_bytes([raw[6], raw[7]])) / 1000.0;
    data.cell_storage_default_v = f32::from(u16::from_le_bytes([raw[8], raw[9]])) / 1000.0;
    data.cell_capacity_ah =
        u32::from_le_bytes([raw[10], raw[11], raw[12], raw[13]]) as f32 / 1000.0;
    // The current limits are stored as tenths of a C-rate.
    data.battery_charge_max_current_a =
        f32::from(u16::from_le_bytes([raw[14], raw[15]])) / 10.0 * data.cell_capacity_ah;
    data.battery_discharge_max_current_a =
        f32::from(u16::from_le_bytes([raw[16], raw[17]])) / 10.0 * data.cell_capacity_ah;
    data.temp_use_low_c = raw[18] as i8;
    data.temp_use_high_c = raw[19] as i8;
    data.temp_storage_low_c = raw[20] as i8;
    data.temp_storage_high_c = raw[21] as i8;
    data.battery_has_auto_discharge = raw[22] > 0;
    data.battery_number_of_cells = usize::from(raw[23]);
    true
}

fn decode_user_settings(data: &mut BatteryData, raw: &[u8]) -> bool {
    if raw.len() < 9 {
        return false;
    }

    // The charge current is 24 bits; its top byte is shared with the
    // storage voltage field.
    let charge = u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]) & 0x00FF_FFFF;
    data.battery_preferred_charge_current_a = charge as f32 / 1000.0;
    data.cell_preferred_storage_voltage_v = f32::from(u16::from_le_bytes([raw[4], raw[5]])) / 1000.0;
    data.cell_preferred_max_voltage_v = f32::from(u16::from_le_bytes([raw[6], raw[7]])) / 1000.0;
    data.battery_self_discharge_enabled = raw[8] != 0xFF;
    data.battery_self_discharge_hours = raw[8];
    true
}

fn decode_cycle(data: &mut BatteryData, raw: &[u8]) -> bool {
    if raw.len() < 12 {
        return false;
    }

    data.battery_charge_cycles = u16::from_le_bytes([raw[1], raw[2]]);
    data.battery_error_over_temperature = u16::from_le_bytes([raw[6], raw[7]]);
    data.battery_error_over_charged = u16::from_le_bytes([raw[8], raw[9]]);
    data.battery_error_over_discharged = u16::from_le_bytes([raw[10], raw[11]]);
    true
}

fn decode_serial(data: &mut BatteryData, raw: &[u8], bus_serial: &[u8; 10]) -> bool {
    if raw.len() < 11 || raw[1..11] != bus_serial[..] {
        return false;
    }

    let name = &raw[11..];
    let name = &name[..name.iter().position(|&b| b == 0).unwrap_or(name.len())];
    if data.manufacturer_name.as_bytes() != name {
        data.manufacturer_name = String::from_utf8_lossy(name).into_owned();
    }
    true
}
