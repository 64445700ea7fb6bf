//! Byte-stream transports.
//!
//! The protocol core only ever sees this trait: a non-blocking byte source
//! and a whole-buffer write. The host keeps the RS-485 driver in TX mode
//! around `write`; no flush semantics are assumed.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::config::SerialConfig;
use crate::errors::TransportError;

pub trait Transport: Send {
    /// Bytes ready to read without blocking.
    fn available(&mut self) -> usize;

    /// Pop one byte; `None` when the line is idle.
    fn read_byte(&mut self) -> Option<u8>;

    /// Write as much of `buf` as the line accepts, returning the count.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
}

/// Real serial port behind the [`Transport`] trait.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, TransportError> {
        let port = serialport::new(&config.device, config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .timeout(Duration::from_millis(1))
            .open()?;

        info!("Opened serial port {}", config.serial_port_info());

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn available(&mut self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        Ok(self.port.write(buf)?)
    }
}

/// In-memory half-duplex bus for simulations and tests.
///
/// A [`BusHub`] owns one broadcast domain; every [`MemoryBus`] endpoint
/// hears what all the others transmit, like transceivers sharing a pair of
/// wires. A sender does not hear its own bytes.
#[derive(Clone, Default)]
pub struct BusHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    queues: Vec<VecDeque<u8>>,
}

impl BusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> MemoryBus {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queues.push(VecDeque::new());
        MemoryBus {
            hub: self.inner.clone(),
            index: inner.queues.len() - 1,
        }
    }
}

pub struct MemoryBus {
    hub: Arc<Mutex<HubInner>>,
    index: usize,
}

impl Transport for MemoryBus {
    fn available(&mut self) -> usize {
        let inner = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        inner.queues[self.index].len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut inner = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        inner.queues[self.index].pop_front()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut inner = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        let sender = self.index;
        for (index, queue) in inner.queues.iter_mut().enumerate() {
            if index != sender {
                queue.extend(buf.iter().copied());
            }
        }
        Ok(buf.len())
    }
}

/// Loopback reader over a canned byte sequence, handy in unit tests.
pub struct ReplayTransport {
    rx: VecDeque<u8>,
    pub written: Vec<u8>,
}

impl ReplayTransport {
    pub fn new(rx: impl Into<VecDeque<u8>>) -> Self {
        Self {
            rx: rx.into(),
            written: Vec::new(),
        }
    }
}

impl Transport for ReplayTransport {
    fn available(&mut self) -> usize {
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_broadcasts_to_everyone_but_the_sender() {
        let hub = BusHub::new();
        let mut a = hub.endpoint();
        let mut b = hub.endpoint();
        let mut c = hub.endpoint();

        a.write(&[1, 2, 3]).unwrap();

        assert_eq!(a.available(), 0);
        assert_eq!(b.available(), 3);
        assert_eq!(c.available(), 3);
        assert_eq!(b.read_byte(), Some(1));
        assert_eq!(b.read_byte(), Some(2));
        assert_eq!(b.read_byte(), Some(3));
        assert_eq!(b.read_byte(), None);
    }

    #[test]
    fn replay_transport_records_writes() {
        let mut transport = ReplayTransport::new(vec![9]);
        assert_eq!(transport.read_byte(), Some(9));
        assert_eq!(transport.read_byte(), None);
        transport.write(&[4, 5]).unwrap();
        assert_eq!(transport.written, vec![4, 5]);
    }
}
