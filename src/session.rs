//! Adapter negotiation and vehicle introspection.
//!
//! The session brings the adapter and the ECU bus into a state where
//! sensor PIDs can be queried, and answers one-off questions about the
//! adapter and the vehicle between polling runs.

use log::{debug, info};
use std::{
    sync::RwLock,
    thread,
    time::Duration,
};

use crate::error::{SessionError, TransportError};
use crate::response;
use crate::transport::Transport;

/// Default timeout for one-off introspection commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const PING_TIMEOUT: Duration = Duration::from_secs(1);

type Result<T> = std::result::Result<T, SessionError>;

/// Where the session currently is in its lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// No adapter attached.
    Idle,
    /// The init sequence is running.
    Connecting,
    /// The bus is up; introspection and DTC operations may run.
    Ready,
    /// The poller owns the transport.
    Polling,
    /// Something fatal happened; only a disconnect clears this.
    Failed,
}

/// Shared session state with transition validation.
pub struct StateCell {
    inner: RwLock<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            inner: RwLock::new(SessionState::Idle),
        }
    }

    pub fn get(&self) -> SessionState {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(_) => SessionState::Failed,
        }
    }

    /// Attempt a transition, returning whether it was legal.
    pub(crate) fn move_to(&self, to: SessionState) -> bool {
        let Ok(mut guard) = self.inner.write() else {
            return false;
        };
        let from = *guard;
        let legal = match to {
            SessionState::Idle => true,
            SessionState::Failed => true,
            SessionState::Connecting => from == SessionState::Idle,
            SessionState::Ready => {
                from == SessionState::Connecting || from == SessionState::Polling
            }
            SessionState::Polling => from == SessionState::Ready,
        };
        if legal {
            *guard = to;
        }
        legal
    }

    /// How the poller reports its exit: fatal failures stick, a clean
    /// exit hands the session back to `Ready`.
    pub(crate) fn settle(&self, failed: bool) {
        if failed {
            self.move_to(SessionState::Failed);
        } else if self.get() == SessionState::Polling {
            self.move_to(SessionState::Ready);
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}

/// Negotiates the adapter and memoises what the vehicle tells us.
pub struct Session {
    grace: Duration,
    vin: Option<String>,
    version: Option<String>,
    protocol: Option<String>,
    standard: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            grace: Duration::from_secs(1),
            vin: None,
            version: None,
            protocol: None,
            standard: None,
        }
    }

    /// Shorten the inter-command grace sleeps; meant for bench rigs and
    /// simulated adapters that do not need settling time.
    pub(crate) fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    /// Check the adapter is listening at all. `ATPC` is harmless and
    /// answers `OK` on every ELM327-class chip.
    pub fn ping(&self, transport: &mut Transport) -> Result<bool> {
        match transport.send_and_read("ATPC", PING_TIMEOUT) {
            Ok(raw) => Ok(raw.contains("OK")),
            Err(TransportError::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the init sequence: reset, echo off, aggressive adaptive
    /// timing, then wake the OBD bus. Each step waits for the prompt and
    /// is followed by a grace sleep so commands do not collide inside
    /// the adapter.
    pub fn initialise(&mut self, transport: &mut Transport) -> Result<()> {
        info!("resetting adapter");
        self.step(transport, "ATZ")?;

        info!("disabling command echo");
        self.step(transport, "ATE0")?;

        info!("enabling adaptive timing");
        self.step(transport, "ATAT2")?;

        info!("waking the OBD bus");
        thread::sleep(self.grace);
        let raw = transport
            .send_and_read("0100", DEFAULT_TIMEOUT)
            .map_err(|e| match e {
                TransportError::Timeout => SessionError::BusInit,
                other => SessionError::Transport(other),
            })?;
        let cleaned = response::clean(&raw);
        if cleaned.contains("UNABLETOCONNECT") || !cleaned.ends_with('>') {
            return Err(SessionError::BusInit);
        }

        info!("bus initialised");
        Ok(())
    }

    fn step(&self, transport: &mut Transport, command: &'static str) -> Result<()> {
        let raw = transport
            .send_and_read(command, DEFAULT_TIMEOUT)
            .map_err(|e| match e {
                TransportError::Timeout => SessionError::AdapterUnresponsive(command),
                other => SessionError::Transport(other),
            })?;
        debug!("{command} answered {raw:?}");
        thread::sleep(self.grace);
        Ok(())
    }

    /// Battery voltage as reported by the adapter, e.g. `"12.6V"`.
    /// Never memoised; it moves with the engine.
    pub fn voltage(&self, transport: &mut Transport) -> Result<String> {
        let raw = transport.send_and_read("ATRV", DEFAULT_TIMEOUT)?;
        Ok(response::clean_text(&raw))
    }

    /// Adapter identification string, e.g. `"ELM327 v1.5"`.
    pub fn adapter_version(&mut self, transport: &mut Transport) -> Result<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        let raw = transport.send_and_read("ATI", DEFAULT_TIMEOUT)?;
        let version = response::clean_text(&raw);
        self.version = Some(version.clone());
        Ok(version)
    }

    /// The bus protocol the adapter negotiated, e.g. `"ISO 9141-2"`.
    pub fn protocol(&mut self, transport: &mut Transport) -> Result<String> {
        if let Some(protocol) = &self.protocol {
            return Ok(protocol.clone());
        }
        let raw = transport.send_and_read("ATDP", DEFAULT_TIMEOUT)?;
        let protocol = response::clean_text(&raw);
        self.protocol = Some(protocol.clone());
        Ok(protocol)
    }

    /// Which OBD standard the vehicle declares (mode 01 PID 1C).
    pub fn obd_standard(&mut self, transport: &mut Transport) -> Result<String> {
        if let Some(standard) = &self.standard {
            return Ok(standard.clone());
        }
        let raw = transport.send_and_read("011C", DEFAULT_TIMEOUT)?;
        let bytes = response::parse_bytes(&raw)?;
        let standard = match bytes.get(2).copied() {
            Some(1) => "OBD-II as defined by the CARB",
            Some(2) => "OBD as defined by the EPA",
            Some(3) => "OBD and OBD-II",
            Some(4) => "OBD-I",
            Some(5) => "Not meant to comply with any OBD standard",
            Some(6) => "EOBD (European Protocol)",
            _ => "Unknown OBD standard",
        }
        .to_owned();
        self.standard = Some(standard.clone());
        Ok(standard)
    }

    /// The 17-character vehicle identification number (mode 09 PID 02).
    ///
    /// The answer spans five lines; each starts with `49 02 0n`, the
    /// rest is ASCII with `00` padding.
    pub fn vin(&mut self, transport: &mut Transport) -> Result<String> {
        if let Some(vin) = &self.vin {
            return Ok(vin.clone());
        }

        let raw = transport.send_and_read("0902", DEFAULT_TIMEOUT)?;
        let mut vin = String::new();
        for line in raw.split('\r') {
            let line: String = line.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let Some(payload) = line.strip_prefix("4902") else {
                continue;
            };
            // drop the line-order byte, then decode ASCII skipping padding
            let payload = payload.get(2..).unwrap_or("");
            if payload.len() % 2 != 0 {
                return Err(SessionError::AdapterUnresponsive("0902"));
            }
            for i in (0..payload.len()).step_by(2) {
                let byte = u8::from_str_radix(&payload[i..i + 2], 16)
                    .map_err(|_| SessionError::AdapterUnresponsive("0902"))?;
                if byte != 0 {
                    vin.push(char::from(byte));
                }
            }
        }

        if vin.len() != 17 {
            return Err(SessionError::AdapterUnresponsive("0902"));
        }
        self.vin = Some(vin.clone());
        Ok(vin)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
