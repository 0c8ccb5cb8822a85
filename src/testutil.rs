//! A scripted in-memory [`Link`](crate::transport::Link) used by unit
//! tests in place of a serial port.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::error::TransportError;
use crate::transport::Link;

type Responder = Box<dyn FnMut(&str) -> String + Send>;

/// Pretends to be an adapter on the other end of the wire.
///
/// Written bytes are buffered until a CR arrives, at which point the
/// completed command is logged and handed to the responder; the
/// responder's output is queued for subsequent reads.
pub(crate) struct MockLink {
    written: Vec<u8>,
    out: VecDeque<u8>,
    chunks: VecDeque<Vec<u8>>,
    armed: bool,
    responder: Option<Responder>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockLink {
    /// Answer every command through `responder`.
    pub(crate) fn with_responses(
        responder: impl FnMut(&str) -> String + Send + 'static,
    ) -> Self {
        MockLink {
            written: Vec::new(),
            out: VecDeque::new(),
            chunks: VecDeque::new(),
            armed: false,
            responder: Some(Box::new(responder)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Never answer anything; reads always report an empty buffer.
    pub(crate) fn silent() -> Self {
        MockLink {
            written: Vec::new(),
            out: VecDeque::new(),
            chunks: VecDeque::new(),
            armed: false,
            responder: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// After the first command, release the response one chunk per read.
    pub(crate) fn chunked(chunks: Vec<Vec<u8>>) -> Self {
        MockLink {
            written: Vec::new(),
            out: VecDeque::new(),
            chunks: chunks.into(),
            armed: false,
            responder: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The commands received so far, CRs stripped.
    pub(crate) fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }
}

impl Link for MockLink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.written.extend_from_slice(data);
        while let Some(pos) = self.written.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = self.written.drain(..=pos).collect();
            let cmd = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Ok(mut log) = self.log.lock() {
                log.push(cmd.clone());
            }
            self.armed = true;
            if let Some(responder) = self.responder.as_mut() {
                let response = responder(&cmd);
                self.out.extend(response.bytes());
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.out.is_empty() && self.armed {
            if let Some(chunk) = self.chunks.pop_front() {
                self.out.extend(chunk);
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.out.pop_front() {
                Some(b) => {
                    buf[n] = b;
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
