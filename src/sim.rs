//! A simulated vehicle for demos and development without hardware.
//!
//! Implements [`Link`] with an in-memory ELM327-class adapter bolted to
//! a pretend engine: sensor values drift deterministically from poll to
//! poll, one trouble code sits stored until a mode 04 clears it, and
//! the AT configuration commands behave the way the real chip does.

use std::collections::VecDeque;

use crate::error::TransportError;
use crate::transport::Link;

const SIM_VIN: &str = "OZENELEKTRONIK123";

/// An adapter plus vehicle that lives entirely in memory.
pub struct SimulatedVehicle {
    written: Vec<u8>,
    out: VecDeque<u8>,
    echo: bool,
    headers: bool,
    tick: u32,
    mil_on: bool,
    stored_code: bool,
}

impl SimulatedVehicle {
    pub fn new() -> Self {
        SimulatedVehicle {
            written: Vec::new(),
            out: VecDeque::new(),
            // the chip powers up with echo on
            echo: true,
            headers: false,
            tick: 0,
            mil_on: true,
            stored_code: true,
        }
    }

    fn respond(&mut self, command: &str) -> String {
        let upper = command.trim().to_uppercase();
        let body = match upper.as_str() {
            "ATZ" => {
                self.echo = true;
                self.headers = false;
                "ELM327 v1.5".to_owned()
            }
            "ATE0" => {
                self.echo = false;
                "OK".to_owned()
            }
            "ATE1" => {
                self.echo = true;
                "OK".to_owned()
            }
            "ATH1" => {
                self.headers = true;
                "OK".to_owned()
            }
            "ATH0" => {
                self.headers = false;
                "OK".to_owned()
            }
            "ATPC" | "ATAT0" | "ATAT1" | "ATAT2" => "OK".to_owned(),
            "ATI" => "ELM327 v1.5".to_owned(),
            "ATRV" => format!("{:.1}V", 12.0 + f64::from(self.tick % 10) / 10.0),
            "ATDP" => "ISO 9141-2".to_owned(),
            "03" => self.mode3(),
            "04" => {
                self.mil_on = false;
                self.stored_code = false;
                "44".to_owned()
            }
            other => self
                .mode1(other)
                .or_else(|| self.mode9(other))
                .unwrap_or_else(|| "?".to_owned()),
        };

        let echo = if self.echo { command } else { "" };
        format!("{echo}\r{body}\r\r>")
    }

    /// Current-data requests; the hint suffix the poller appends is
    /// ignored, just like the real adapter ignores everything it only
    /// uses to cut the wait short.
    fn mode1(&mut self, request: &str) -> Option<String> {
        let pid = request.split(' ').next()?;
        if pid.len() != 4 || !pid.starts_with("01") {
            return None;
        }
        self.tick = self.tick.wrapping_add(1);
        let t = self.tick;

        let data: Vec<u8> = match &pid[2..] {
            "00" => vec![0x08, 0x59, 0x90, 0x03],
            "20" => vec![0x00, 0x12, 0x00, 0x00],
            "01" => {
                let count = u8::from(self.stored_code);
                let a = if self.mil_on { 0x80 | count } else { count };
                vec![a, 0x07, 0xFF, 0x00]
            }
            "1C" => vec![0x01],
            "05" => {
                // coolant warms from 20 °C toward 90 °C and holds
                let celsius = (20 + t.min(70)) as u8;
                vec![celsius + 40]
            }
            "0A" => vec![((30 + t * 11 % 200) / 3) as u8],
            "0C" => {
                // idle-to-redline sweep and back, 800..5600 rpm
                let swing = (t * 97) % 9600;
                let rpm = 800 + if swing > 4800 { 9600 - swing } else { swing };
                let quarters = rpm * 4;
                vec![(quarters / 256) as u8, (quarters % 256) as u8]
            }
            "0D" => vec![((t * 13) % 120) as u8],
            "10" => {
                let centigrams = 500 + (t * 31) % 2000;
                vec![(centigrams / 256) as u8, (centigrams % 256) as u8]
            }
            "11" => vec![((t * 23) % 255) as u8],
            "14" => vec![((t * 17) % 200) as u8, 0x00],
            "1F" => vec![(t / 256) as u8, (t % 256) as u8],
            "2C" => vec![((t * 7) % 255) as u8],
            "2F" => vec![(200 - t.min(150)) as u8],
            _ => return None,
        };

        let mut line = format!("41 {}", &pid[2..]);
        for byte in data {
            line.push_str(&format!(" {byte:02X}"));
        }
        Some(line)
    }

    fn mode9(&mut self, request: &str) -> Option<String> {
        if request != "0902" {
            return None;
        }
        // five lines, each 49 02 0n then four VIN bytes, front-padded
        // with zeros to 20 data bytes total
        let ascii: Vec<u8> = SIM_VIN.bytes().collect();
        let mut padded = vec![0u8; 20 - ascii.len()];
        padded.extend(ascii);

        let mut lines = Vec::new();
        for (i, quad) in padded.chunks(4).enumerate() {
            let mut line = format!("49 02 {:02X}", i + 1);
            for byte in quad {
                line.push_str(&format!(" {byte:02X}"));
            }
            lines.push(line);
        }
        Some(lines.join("\r"))
    }

    /// One stored code (an oxygen sensor complaint) echoed by two ECUs,
    /// the way a headers-on mode 03 looks on a K-line car.
    fn mode3(&mut self) -> String {
        if !self.stored_code {
            return "48 6B 10 43 00 00 00 00 00 00 C5".to_owned();
        }
        if self.headers {
            "48 6B 10 43 01 33 00 00 00 00 FF\r48 6B 10 43 01 33 00 00 00 00 FF"
                .to_owned()
        } else {
            "43 01 33 00 00 00 00".to_owned()
        }
    }
}

impl Default for SimulatedVehicle {
    fn default() -> Self {
        SimulatedVehicle::new()
    }
}

impl Link for SimulatedVehicle {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.written.extend_from_slice(data);
        while let Some(pos) = self.written.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = self.written.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            let response = self.respond(&command);
            self.out.extend(response.bytes());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut n = 0;
        while n < buf.len() {
            match self.out.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        self.out.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response;
    use crate::session::Session;
    use crate::transport::Transport;
    use std::time::Duration;

    fn transport() -> Transport {
        Transport::new(Box::new(SimulatedVehicle::new()))
    }

    #[test]
    fn init_sequence_succeeds() {
        let mut transport = transport();
        let mut session = Session::new();
        session.set_grace(Duration::from_millis(1));
        session.initialise(&mut transport).unwrap();
    }

    #[test]
    fn echo_stops_after_ate0() {
        let mut transport = transport();
        let echoed = transport
            .send_and_read("ATI", Duration::from_secs(1))
            .unwrap();
        assert!(echoed.contains("ATI"));

        transport
            .send_and_read("ATE0", Duration::from_secs(1))
            .unwrap();
        let quiet = transport
            .send_and_read("ATI", Duration::from_secs(1))
            .unwrap();
        assert!(!quiet.contains("ATI"));
    }

    #[test]
    fn rpm_sweeps_inside_its_range() {
        let mut transport = transport();
        transport
            .send_and_read("ATE0", Duration::from_secs(1))
            .unwrap();

        for _ in 0..50 {
            let raw = transport
                .send_and_read("010C 2", Duration::from_secs(1))
                .unwrap();
            let bytes = response::parse_bytes(&raw).unwrap();
            let rpm = (f64::from(bytes[2]) * 256.0 + f64::from(bytes[3])) / 4.0;
            assert!((800.0..=5600.0).contains(&rpm), "rpm {rpm} out of sweep");
        }
    }

    #[test]
    fn vin_reads_back() {
        let mut transport = transport();
        transport
            .send_and_read("ATE0", Duration::from_secs(1))
            .unwrap();

        let mut session = Session::new();
        session.set_grace(Duration::from_millis(1));
        assert_eq!(session.vin(&mut transport).unwrap(), SIM_VIN);
    }

    #[test]
    fn clearing_codes_turns_the_lamp_off() {
        let mut transport = transport();
        transport
            .send_and_read("ATE0", Duration::from_secs(1))
            .unwrap();

        let raw = transport
            .send_and_read("0101", Duration::from_secs(1))
            .unwrap();
        let bytes = response::parse_bytes(&raw).unwrap();
        assert_eq!(bytes[2] & 0x80, 0x80);

        transport.send_and_read("04", Duration::from_secs(1)).unwrap();

        let raw = transport
            .send_and_read("0101", Duration::from_secs(1))
            .unwrap();
        let bytes = response::parse_bytes(&raw).unwrap();
        assert_eq!(bytes[2], 0x00);
    }
}
