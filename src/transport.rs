//! Serial transport to the adapter.
//!
//! The transport owns the serial link and provides one synchronous
//! operation: write a command terminated by a single CR, then read until
//! the adapter prints its `>` prompt or a deadline passes.

use log::trace;
use std::{
    thread,
    time::{Duration, Instant},
};

use crate::error::TransportError;

/// Baud rate every ELM327-class adapter defaults to.
pub const BAUD_RATE: u32 = 38_400;

/// The prompt byte the adapter prints when it is ready for a command.
pub const PROMPT: u8 = b'>';

type Result<T> = std::result::Result<T, TransportError>;

/// A byte pipe to the adapter.
///
/// Implementations must be non-blocking in spirit: `read` returns `Ok(0)`
/// when nothing has arrived yet, and only errors when the device is gone.
pub trait Link: Send {
    /// Write all of `data` to the device.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discard anything pending in the input buffer.
    fn drain(&mut self) -> Result<()>;
}

/// Owner of the serial link for one session.
pub struct Transport {
    link: Box<dyn Link>,
}

impl Transport {
    pub fn new(link: Box<dyn Link>) -> Self {
        Transport { link }
    }

    /// Open the named serial port at 38400 8N1.
    #[cfg(feature = "serialport_comm")]
    pub fn open(path: &str) -> Result<Self> {
        Ok(Transport::new(Box::new(SerialPortLink::open(path)?)))
    }

    /// Send `text` (a CR is appended) and read until the prompt.
    ///
    /// The returned buffer includes the terminating `>` so callers can
    /// validate the framing themselves. On timeout, any residual input is
    /// drained before [`TransportError::Timeout`] is returned.
    pub fn send_and_read(&mut self, text: &str, timeout: Duration) -> Result<String> {
        trace!("send_and_read: sending {:?}", text);

        self.link.write_all(text.as_bytes())?;
        self.link.write_all(b"\r")?;

        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 64];

        loop {
            let n = self.link.read(&mut chunk)?;
            if n > 0 {
                buf.extend_from_slice(&chunk[..n]);
                if chunk[..n].contains(&PROMPT) {
                    break;
                }
            } else if Instant::now() >= deadline {
                trace!("send_and_read: deadline passed, draining input");
                self.link.drain()?;
                return Err(TransportError::Timeout);
            } else {
                // input buffer briefly empty, give the UART a moment
                thread::sleep(Duration::from_millis(1));
            }
        }

        let response = String::from_utf8_lossy(&buf).into_owned();
        trace!("send_and_read: got {:?}", response);
        Ok(response)
    }

    /// Discard whatever is sitting in the input buffer.
    pub fn drain(&mut self) -> Result<()> {
        self.link.drain()
    }
}

/// [`Link`] over a platform serial port via the serialport library.
///
/// `/dev/tty*` or similar on unix-like systems, COM devices on Windows.
#[cfg(feature = "serialport_comm")]
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serialport_comm")]
impl SerialPortLink {
    /// Open the port at 38400 8N1, no flow control.
    ///
    /// The native read timeout is kept short; the transport applies its
    /// own per-command deadline on top.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(Duration::from_millis(10))
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(SerialPortLink { port })
    }
}

#[cfg(feature = "serialport_comm")]
impl Link for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, data)
            .map_err(|e| TransportError::IoClosed(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match std::io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(TransportError::IoClosed(e.to_string())),
        }
    }

    fn drain(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::IoClosed(e.to_string()))
    }
}

/// [`Link`] over a USB-to-serial FTDI device via the FTDI library.
#[cfg(feature = "ftdi_comm")]
pub struct FtdiLink {
    device: ftdi::Device,
}

#[cfg(feature = "ftdi_comm")]
impl FtdiLink {
    /// Find and open the adapter's FT232R converter.
    pub fn open() -> Result<Self> {
        let mut device = ftdi::find_by_vid_pid(0x0403, 0x6001)
            .interface(ftdi::Interface::A)
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{:?}", e)))?;

        device
            .set_baud_rate(BAUD_RATE)
            .and_then(|_| device.configure(ftdi::Bits::Eight, ftdi::StopBits::One, ftdi::Parity::None))
            .and_then(|_| device.usb_reset())
            .map_err(|e| TransportError::OpenFailed(format!("{:?}", e)))?;

        Ok(FtdiLink { device })
    }
}

#[cfg(feature = "ftdi_comm")]
impl Link for FtdiLink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.device, data)
            .map_err(|e| TransportError::IoClosed(e.to_string()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        std::io::Read::read(&mut self.device, buf)
            .map_err(|e| TransportError::IoClosed(e.to_string()))
    }

    fn drain(&mut self) -> Result<()> {
        self.device
            .usb_purge_buffers()
            .map_err(|e| TransportError::IoClosed(format!("{:?}", e)))
    }
}
