//! The sensor model: PID descriptors, decode formulas, frequency
//! dividers, and change detection.

use log::{debug, warn};
use std::fmt;
use std::time::Instant;

use crate::error::{DecodeError, KernelError};
use crate::response;

/// A parameter identifier: mode byte plus parameter byte, e.g. `010C`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid {
    mode: u8,
    param: u8,
}

impl Pid {
    pub fn new(mode: u8, param: u8) -> Self {
        Pid { mode, param }
    }

    /// Parse a 4-hex-character PID such as `"010C"`. Case-insensitive.
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 4 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mode = u8::from_str_radix(&text[..2], 16).ok()?;
        let param = u8::from_str_radix(&text[2..], 16).ok()?;
        Some(Pid { mode, param })
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn param(&self) -> u8 {
        self.param
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.mode, self.param)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({self})")
    }
}

/// Unit a sensor reports its value in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Unit {
    Mph,
    Rpm,
    DegC,
    Percent,
    KPa,
    Volts,
    Seconds,
    Minutes,
    GramsPerSec,
    None,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Unit::Mph => "mph",
            Unit::Rpm => "rpm",
            Unit::DegC => "°C",
            Unit::Percent => "%",
            Unit::KPa => "kPa",
            Unit::Volts => "V",
            Unit::Seconds => "s",
            Unit::Minutes => "min",
            Unit::GramsPerSec => "g/s",
            Unit::None => "",
        };
        f.write_str(label)
    }
}

/// What a round of servicing a sensor produced.
#[derive(Debug, PartialEq)]
pub enum SensorUpdate {
    /// The raw response matched the cached one; nothing to report.
    Unchanged,
    /// A new in-range value was decoded.
    Changed(f64),
    /// The decoded value just crossed out of the safe range.
    OutOfRange { value: f64, message: String },
}

/// A typed descriptor for one PID, plus its live polling state.
pub struct Sensor {
    pid: Pid,
    name: &'static str,
    unit: Unit,
    expected_bytes: u8,
    min: f64,
    max: f64,
    decode: fn(&[u8]) -> f64,
    divider: u32,
    turn: u32,
    supported: bool,
    raw: Option<String>,
    value: Option<f64>,
    change_count: u64,
    was_out_of_range: bool,
    last_serviced: Option<Instant>,
    refresh_rate: f64,
}

impl Sensor {
    fn new(
        pid: Pid,
        name: &'static str,
        unit: Unit,
        expected_bytes: u8,
        min: f64,
        max: f64,
        decode: fn(&[u8]) -> f64,
    ) -> Self {
        Sensor {
            pid,
            name,
            unit,
            expected_bytes,
            min,
            max,
            decode,
            divider: 1,
            turn: 1,
            supported: false,
            raw: None,
            value: None,
            change_count: 0,
            was_out_of_range: false,
            last_serviced: None,
            refresh_rate: 0.0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn expected_bytes(&self) -> u8 {
        self.expected_bytes
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub(crate) fn set_supported(&mut self, supported: bool) {
        self.supported = supported;
    }

    pub fn divider(&self) -> u32 {
        self.divider
    }

    /// Set how many poller rotations pass between services of this
    /// sensor. Slow-moving quantities like coolant temperature do not
    /// need the bus as often as engine RPM.
    pub(crate) fn set_divider(&mut self, divider: u32) {
        self.divider = divider.max(1);
        if self.turn > self.divider {
            self.turn = 1;
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Smoothed service rate in Hz. Observational only.
    pub fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }

    /// The request line for this sensor, hint included when one is set.
    pub(crate) fn request_text(&self) -> String {
        if self.expected_bytes == 0 {
            self.pid.to_string()
        } else {
            format!("{} {}", self.pid, self.expected_bytes)
        }
    }

    /// Whether this rotation is the sensor's turn on the bus.
    ///
    /// With divider *k* the sensor is serviced once every *k* calls. On a
    /// serviced turn the instantaneous refresh rate is folded into a
    /// running average.
    pub(crate) fn is_turn(&mut self) -> bool {
        if self.turn < self.divider {
            self.turn += 1;
            return false;
        }
        self.turn = 1;

        let now = Instant::now();
        if let Some(last) = self.last_serviced {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.refresh_rate = if self.refresh_rate == 0.0 {
                    inst
                } else {
                    (inst + self.refresh_rate) / 2.0
                };
            }
        }
        self.last_serviced = Some(now);
        true
    }

    /// Take a raw adapter response and update the cached value.
    ///
    /// The value is re-decoded only when the raw response differs from
    /// the cached one or no update has landed yet. Range checking is
    /// edge-triggered: the first excursion produces
    /// [`SensorUpdate::OutOfRange`], the return to range is silent.
    pub(crate) fn accept(&mut self, raw: &str) -> Result<SensorUpdate, DecodeError> {
        if self.raw.as_deref() == Some(raw) && self.change_count > 0 {
            return Ok(SensorUpdate::Unchanged);
        }

        let bytes = response::parse_bytes(raw)?;
        // skip the echoed mode + PID
        if bytes.len() < 2 {
            return Err(DecodeError::NoData);
        }
        let data = &bytes[2..];
        if data.len() < usize::from(self.expected_bytes) {
            return Err(DecodeError::NoData);
        }

        self.raw = Some(raw.to_owned());
        let value = (self.decode)(data);
        self.value = Some(value);
        debug!("{} decoded to {value}", self.name);

        if value < self.min || value > self.max {
            if !self.was_out_of_range {
                self.was_out_of_range = true;
                warn!("{} out of range: {value}", self.name);
                return Ok(SensorUpdate::OutOfRange {
                    value,
                    message: format!(
                        "The value obtained for {} is in an unsafe range",
                        self.name
                    ),
                });
            }
            return Ok(SensorUpdate::Unchanged);
        }

        self.was_out_of_range = false;
        self.change_count += 1;
        Ok(SensorUpdate::Changed(value))
    }

    /// Forget everything learned while polling, so a later activation
    /// starts from first-update semantics again.
    pub(crate) fn reset(&mut self) {
        self.raw = None;
        self.value = None;
        self.change_count = 0;
        self.was_out_of_range = false;
        self.last_serviced = None;
        self.refresh_rate = 0.0;
        self.turn = 1;
    }

    /// A read-only copy of the sensor's descriptor and live state.
    pub(crate) fn snapshot(&self, active: bool) -> SensorSnapshot {
        SensorSnapshot {
            pid: self.pid,
            name: self.name,
            unit: self.unit,
            supported: self.supported,
            active,
            divider: self.divider,
            value: self.value,
            change_count: self.change_count,
            refresh_rate: self.refresh_rate,
        }
    }
}

/// A point-in-time copy of one sensor, safe to hand across threads.
#[derive(Clone, Debug)]
pub struct SensorSnapshot {
    pub pid: Pid,
    pub name: &'static str,
    pub unit: Unit,
    pub supported: bool,
    pub active: bool,
    pub divider: u32,
    pub value: Option<f64>,
    pub change_count: u64,
    pub refresh_rate: f64,
}

fn decode_coolant_temp(b: &[u8]) -> f64 {
    f64::from(b[0]) - 40.0
}

fn decode_fuel_pressure(b: &[u8]) -> f64 {
    f64::from(b[0]) * 3.0
}

fn decode_engine_rpm(b: &[u8]) -> f64 {
    (f64::from(b[0]) * 256.0 + f64::from(b[1])) / 4.0
}

fn decode_vehicle_speed(b: &[u8]) -> f64 {
    f64::from(b[0])
}

fn decode_maf_rate(b: &[u8]) -> f64 {
    (f64::from(b[0]) * 256.0 + f64::from(b[1])) / 100.0
}

fn decode_scaled_percent(b: &[u8]) -> f64 {
    f64::from(b[0]) * 100.0 / 255.0
}

fn decode_run_time(b: &[u8]) -> f64 {
    f64::from(b[0]) * 256.0 + f64::from(b[1])
}

fn decode_o2_voltage(b: &[u8]) -> f64 {
    f64::from(b[0]) * 0.005
}

/// The sensor inventory and the ordered active set.
///
/// The active set keeps insertion order so the poller's rotation is
/// predictable; the kernel owns the registry and the poller borrows it
/// under the polling lock.
pub struct Registry {
    sensors: Vec<Sensor>,
    active: Vec<Pid>,
}

impl Registry {
    /// Build the registry with the built-in sensor inventory.
    pub fn with_builtin() -> Self {
        let sensors = vec![
            Sensor::new(
                Pid::new(0x01, 0x05),
                "Engine coolant temperature",
                Unit::DegC,
                1,
                -40.0,
                215.0,
                decode_coolant_temp,
            ),
            Sensor::new(
                Pid::new(0x01, 0x0A),
                "Fuel pressure",
                Unit::KPa,
                1,
                0.0,
                765.0,
                decode_fuel_pressure,
            ),
            Sensor::new(
                Pid::new(0x01, 0x0C),
                "Engine RPM",
                Unit::Rpm,
                2,
                0.0,
                12000.0,
                decode_engine_rpm,
            ),
            Sensor::new(
                Pid::new(0x01, 0x0D),
                "Vehicle speed",
                Unit::Mph,
                1,
                0.0,
                255.0,
                decode_vehicle_speed,
            ),
            Sensor::new(
                Pid::new(0x01, 0x10),
                "MAF air flow rate",
                Unit::GramsPerSec,
                2,
                0.0,
                655.35,
                decode_maf_rate,
            ),
            Sensor::new(
                Pid::new(0x01, 0x11),
                "Throttle position",
                Unit::Percent,
                1,
                0.0,
                100.0,
                decode_scaled_percent,
            ),
            Sensor::new(
                Pid::new(0x01, 0x14),
                "O2 voltage bank 1 sensor 1",
                Unit::Volts,
                2,
                0.0,
                1.275,
                decode_o2_voltage,
            ),
            Sensor::new(
                Pid::new(0x01, 0x1F),
                "Engine run time",
                Unit::Seconds,
                2,
                0.0,
                65535.0,
                decode_run_time,
            ),
            Sensor::new(
                Pid::new(0x01, 0x2C),
                "Commanded EGR",
                Unit::Percent,
                1,
                0.0,
                100.0,
                decode_scaled_percent,
            ),
            Sensor::new(
                Pid::new(0x01, 0x2F),
                "Fuel level input",
                Unit::Percent,
                1,
                0.0,
                100.0,
                decode_scaled_percent,
            ),
        ];
        Registry {
            sensors,
            active: Vec::new(),
        }
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn get(&self, pid: Pid) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.pid == pid)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.pid == pid)
    }

    /// The active set, in insertion order.
    pub fn active(&self) -> &[Pid] {
        &self.active
    }

    pub fn is_active(&self, pid: Pid) -> bool {
        self.active.contains(&pid)
    }

    /// Add a sensor to the active set. Unsupported sensors are refused
    /// so the bus never wastes a round on a `NO DATA` answer.
    pub(crate) fn activate(&mut self, pid: Pid) -> Result<(), KernelError> {
        let sensor = self
            .get(pid)
            .ok_or_else(|| KernelError::UnknownPid(pid.to_string()))?;
        if !sensor.is_supported() {
            return Err(KernelError::Unsupported(pid));
        }
        if !self.active.contains(&pid) {
            self.active.push(pid);
        }
        Ok(())
    }

    /// Remove a sensor from the active set and reset its polling state.
    pub(crate) fn deactivate(&mut self, pid: Pid) -> Result<(), KernelError> {
        self.active.retain(|p| *p != pid);
        let sensor = self
            .get_mut(pid)
            .ok_or_else(|| KernelError::UnknownPid(pid.to_string()))?;
        sensor.reset();
        Ok(())
    }

    pub(crate) fn clear_active(&mut self) {
        for pid in std::mem::take(&mut self.active) {
            if let Some(sensor) = self.get_mut(pid) {
                sensor.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(pid: &str) -> Sensor {
        let pid = Pid::parse(pid).unwrap();
        let mut registry = Registry::with_builtin();
        let idx = registry
            .sensors
            .iter()
            .position(|s| s.pid == pid)
            .expect("sensor in inventory");
        registry.sensors.swap_remove(idx)
    }

    #[test]
    fn pid_parsing() {
        let pid = Pid::parse("010c").unwrap();
        assert_eq!(pid.mode(), 0x01);
        assert_eq!(pid.param(), 0x0C);
        assert_eq!(pid.to_string(), "010C");
        assert!(Pid::parse("01").is_none());
        assert!(Pid::parse("01XY").is_none());
    }

    #[test]
    fn rpm_decode() {
        let mut s = sensor("010C");
        let update = s.accept("41 0C 1A F8 \r\r>").unwrap();
        assert_eq!(update, SensorUpdate::Changed(1726.0));
        assert_eq!(s.value(), Some(1726.0));
    }

    #[test]
    fn speed_decode() {
        let mut s = sensor("010D");
        assert_eq!(
            s.accept("41 0D 50 \r>").unwrap(),
            SensorUpdate::Changed(80.0)
        );
    }

    #[test]
    fn coolant_decode() {
        let mut s = sensor("0105");
        assert_eq!(
            s.accept("41 05 7B \r>").unwrap(),
            SensorUpdate::Changed(83.0)
        );
    }

    #[test]
    fn throttle_decode() {
        let mut s = sensor("0111");
        let SensorUpdate::Changed(v) = s.accept("41 11 FF\r>").unwrap() else {
            panic!("expected a change");
        };
        assert!((v - 100.0).abs() < 1e-9);
    }

    #[test]
    fn o2_voltage_decode() {
        let mut s = sensor("0114");
        let SensorUpdate::Changed(v) = s.accept("41 14 C8 00\r>").unwrap() else {
            panic!("expected a change");
        };
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn identical_response_reports_unchanged() {
        let mut s = sensor("010D");
        assert_eq!(
            s.accept("41 0D 50\r>").unwrap(),
            SensorUpdate::Changed(80.0)
        );
        assert_eq!(s.accept("41 0D 50\r>").unwrap(), SensorUpdate::Unchanged);
        assert_eq!(s.change_count(), 1);
        assert_eq!(
            s.accept("41 0D 51\r>").unwrap(),
            SensorUpdate::Changed(81.0)
        );
        assert_eq!(s.change_count(), 2);
    }

    #[test]
    fn boundary_values_are_in_range() {
        let mut fp = sensor("010A");
        // 0xFF * 3 = 765, right at the ceiling
        assert!(matches!(
            fp.accept("41 0A FF\r>").unwrap(),
            SensorUpdate::Changed(_)
        ));
        let mut ct = sensor("0105");
        // 0x00 - 40 = -40, right at the floor
        assert!(matches!(
            ct.accept("41 05 00\r>").unwrap(),
            SensorUpdate::Changed(_)
        ));
    }

    #[test]
    fn out_of_range_edge_on_rpm() {
        let mut s = sensor("010C");
        // 0xC000 / 4 = 12288 rpm, above the 12000 ceiling
        let update = s.accept("41 0C C0 00\r>").unwrap();
        match update {
            SensorUpdate::OutOfRange { value, message } => {
                assert_eq!(value, 12288.0);
                assert!(message.contains("Engine RPM"));
            }
            other => panic!("expected an excursion, got {other:?}"),
        }
        assert_eq!(s.change_count(), 0);

        // a different but still-excessive reading stays silent
        assert_eq!(
            s.accept("41 0C C1 00\r>").unwrap(),
            SensorUpdate::Unchanged
        );

        // return to range emits a normal change, not an event
        assert_eq!(
            s.accept("41 0C 1A F8\r>").unwrap(),
            SensorUpdate::Changed(1726.0)
        );

        // and a second excursion fires again
        assert!(matches!(
            s.accept("41 0C C0 00\r>").unwrap(),
            SensorUpdate::OutOfRange { .. }
        ));
    }

    #[test]
    fn short_payload_is_refused() {
        let mut s = sensor("010C");
        assert!(matches!(
            s.accept("41 0C\r>"),
            Err(DecodeError::NoData)
        ));
    }

    #[test]
    fn divider_services_every_kth_rotation() {
        let mut s = sensor("010D");
        s.set_divider(3);
        let mut serviced = 0;
        for _ in 0..12 {
            if s.is_turn() {
                serviced += 1;
            }
        }
        assert_eq!(serviced, 4);
    }

    #[test]
    fn divider_one_services_every_rotation() {
        let mut s = sensor("010D");
        for _ in 0..5 {
            assert!(s.is_turn());
        }
    }

    #[test]
    fn request_text_carries_hint() {
        let s = sensor("010C");
        assert_eq!(s.request_text(), "010C 2");
        let s = sensor("010D");
        assert_eq!(s.request_text(), "010D 1");
    }

    #[test]
    fn activation_requires_support() {
        let mut registry = Registry::with_builtin();
        let pid = Pid::parse("010C").unwrap();
        assert!(matches!(
            registry.activate(pid),
            Err(KernelError::Unsupported(_))
        ));
        registry.get_mut(pid).unwrap().set_supported(true);
        registry.activate(pid).unwrap();
        assert!(registry.is_active(pid));
        // activating twice does not duplicate the entry
        registry.activate(pid).unwrap();
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn deactivation_resets_state() {
        let mut registry = Registry::with_builtin();
        let pid = Pid::parse("010D").unwrap();
        registry.get_mut(pid).unwrap().set_supported(true);
        registry.activate(pid).unwrap();
        registry
            .get_mut(pid)
            .unwrap()
            .accept("41 0D 50\r>")
            .unwrap();
        assert_eq!(registry.get(pid).unwrap().change_count(), 1);

        registry.deactivate(pid).unwrap();
        assert!(!registry.is_active(pid));
        assert_eq!(registry.get(pid).unwrap().change_count(), 0);
        assert_eq!(registry.get(pid).unwrap().value(), None);
    }
}
