//! PID support discovery.
//!
//! OBD-II does not require a vehicle to implement every PID. Mode 01
//! PID `00` answers with four bytes whose bits, MSB first, say which of
//! PIDs `01`–`20` the ECU supports; if the last bit is set the same
//! question can be asked about the next range with PID `20`.

use log::{debug, info};
use std::time::Duration;

use crate::error::{DecodeError, KernelError};
use crate::response;
use crate::sensor::{Pid, Registry};
use crate::transport::Transport;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which mode-01 PIDs the connected vehicle supports.
pub struct CapabilityMap {
    low: u32,
    high: Option<u32>,
}

impl CapabilityMap {
    /// Ask the ECU for its support bitmaps.
    pub fn query(transport: &mut Transport) -> Result<Self, KernelError> {
        let raw = transport.send_and_read("0100", QUERY_TIMEOUT)?;
        let low = bitmap_from(&response::parse_bytes(&raw)?)?;
        debug!("capability bitmap 01-20: {low:032b}");

        // the last bit advertises the 21-40 range
        let high = if low & 1 != 0 {
            let raw = transport.send_and_read("0120", QUERY_TIMEOUT)?;
            let map = bitmap_from(&response::parse_bytes(&raw)?)?;
            debug!("capability bitmap 21-40: {map:032b}");
            Some(map)
        } else {
            None
        };

        Ok(CapabilityMap { low, high })
    }

    /// Whether the vehicle supports `pid`.
    pub fn supports(&self, pid: Pid) -> bool {
        if pid.mode() != 0x01 {
            return false;
        }
        match pid.param() {
            0 => false,
            p @ 1..=0x20 => bit_set(self.low, p),
            p @ 0x21..=0x40 => self
                .high
                .map(|map| bit_set(map, p - 0x20))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Mark every sensor in the registry supported or not.
    pub fn apply(&self, registry: &mut Registry) {
        let pids: Vec<Pid> = registry.sensors().iter().map(|s| s.pid()).collect();
        for pid in pids {
            let supported = self.supports(pid);
            if let Some(sensor) = registry.get_mut(pid) {
                sensor.set_supported(supported);
            }
            if supported {
                info!("sensor {pid} supported by vehicle");
            }
        }
    }
}

/// Bytes A-D after the echoed mode and PID, concatenated MSB first.
fn bitmap_from(bytes: &[u8]) -> Result<u32, DecodeError> {
    if bytes.len() < 6 {
        return Err(DecodeError::NoData);
    }
    let quad: [u8; 4] = bytes[2..6].try_into().map_err(|_| DecodeError::NoData)?;
    Ok(u32::from_be_bytes(quad))
}

/// `position` is 1-based from the most significant bit.
fn bit_set(map: u32, position: u8) -> bool {
    map & (1u32 << (32 - u32::from(position))) != 0
}
