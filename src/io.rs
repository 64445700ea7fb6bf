//! Double-buffered bus I/O.
//!
//! Ingest side: bytes append into the primary buffer, a fresh SOF resets
//! the write index (resynchronization after line noise), and after each
//! drain any CRC-valid prefix is lifted into a bounded queue of complete
//! frames. The processing side hands out one frame at a time, decoupling
//! parsing from ingest.
//!
//! Transmit side: a frame goes out whole, and only after the bus has been
//! silent for the configured interframe gap.

use std::collections::VecDeque;

use tracing::trace;

use crate::errors::TransportError;
use crate::events::{ErrorKind, EventSink};
use crate::frame;
use crate::transport::Transport;

pub const MAX_RX_BUFFER: usize = 512;
pub const FRAME_QUEUE_CAPACITY: usize = 5;

pub struct BusIo {
    primary: Vec<u8>,
    complete: VecDeque<Vec<u8>>,
    interframe_gap_us: u64,
    last_activity_us: u64,
}

impl BusIo {
    pub fn new(interframe_gap_us: u64) -> Self {
        Self {
            primary: Vec::with_capacity(MAX_RX_BUFFER),
            complete: VecDeque::with_capacity(FRAME_QUEUE_CAPACITY),
            interframe_gap_us,
            last_activity_us: 0,
        }
    }

    /// Drain the transport, then lift every CRC-valid prefix out of the
    /// primary buffer into the complete-frame queue.
    pub fn poll(&mut self, transport: &mut dyn Transport, now_us: u64, sink: &mut EventSink) {
        let mut activity = false;
        while transport.available() > 0 {
            let Some(byte) = transport.read_byte() else {
                break;
            };
            activity = true;

            if byte == frame::SOF {
                // Resync: a start byte always begins a fresh frame
                self.primary.clear();
            }
            if self.primary.len() >= MAX_RX_BUFFER {
                sink.report(ErrorKind::BufferOverflow, "rx buffer full, byte dropped");
                continue;
            }
            self.primary.push(byte);
        }

        if activity {
            self.last_activity_us = now_us;
        }

        while let Some(len) = frame::valid_prefix_len(&self.primary) {
            let extracted: Vec<u8> = self.primary.drain(..len).collect();
            trace!("rx frame: {}", hex::encode(&extracted));
            if self.complete.len() >= FRAME_QUEUE_CAPACITY {
                sink.report(ErrorKind::BufferOverflow, "frame queue full, frame dropped");
                continue;
            }
            sink.count_frame_received();
            self.complete.push_back(extracted);
        }

        // A full buffer that still verifies nowhere is line garbage; flush
        // it instead of waiting for the next SOF to force the resync.
        if self.primary.len() >= MAX_RX_BUFFER {
            sink.report(ErrorKind::CrcError, "rx buffer exhausted without a valid frame");
            self.primary.clear();
        }
    }

    /// Move the next complete frame into the processing stage.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.complete.pop_front()
    }

    pub fn is_tx_ready(&self, now_us: u64) -> bool {
        now_us.saturating_sub(self.last_activity_us) >= self.interframe_gap_us
    }

    /// Transmit a whole frame. Partial writes count as failure; the caller
    /// retries on a later tick.
    pub fn send_frame(
        &mut self,
        transport: &mut dyn Transport,
        frame_bytes: &[u8],
        now_us: u64,
        sink: &mut EventSink,
    ) -> Result<(), TransportError> {
        if !self.is_tx_ready(now_us) {
            return Err(TransportError::NotReady);
        }

        let written = transport.write(frame_bytes)?;
        self.last_activity_us = now_us;
        if written != frame_bytes.len() {
            return Err(TransportError::IncompleteWrite {
                written,
                expected: frame_bytes.len(),
            });
        }

        trace!("tx frame: {}", hex::encode(frame_bytes));
        sink.count_frame_sent();
        Ok(())
    }

    /// Leftover unparsed bytes, exposed for diagnostics.
    pub fn pending_bytes(&self) -> usize {
        self.primary.len()
    }

    pub fn queued_frames(&self) -> usize {
        self.complete.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplayTransport;

    fn io() -> (BusIo, EventSink) {
        (BusIo::new(5_000), EventSink::new())
    }

    #[test]
    fn extracts_whole_frames_from_stream() {
        let (mut io, mut sink) = io();
        let mut stream = frame::build_token(5, 7);
        stream.extend_from_slice(&frame::build_presence(3));
        let mut transport = ReplayTransport::new(stream);

        io.poll(&mut transport, 0, &mut sink);

        assert_eq!(io.queued_frames(), 2);
        let first = io.next_frame().unwrap();
        assert!(frame::is_token_frame(&first));
        let second = io.next_frame().unwrap();
        assert!(frame::is_presence_frame(&second));
        assert!(io.next_frame().is_none());
        assert_eq!(sink.stats().frames_received, 2);
    }

    #[test]
    fn sof_resynchronizes_mid_garbage() {
        let (mut io, mut sink) = io();
        let mut stream = vec![0x12, 0x34, 0x56]; // noise before the frame
        stream.extend_from_slice(&frame::build_token(5, 7));
        let mut transport = ReplayTransport::new(stream);

        io.poll(&mut transport, 0, &mut sink);

        assert_eq!(io.queued_frames(), 1);
        assert!(frame::is_token_frame(&io.next_frame().unwrap()));
    }

    #[test]
    fn truncated_frame_waits_for_the_rest() {
        let (mut io, mut sink) = io();
        let full = frame::build_token(5, 7);
        let mut transport = ReplayTransport::new(full[..4].to_vec());
        io.poll(&mut transport, 0, &mut sink);
        assert_eq!(io.queued_frames(), 0);
        assert_eq!(io.pending_bytes(), 4);

        let mut transport = ReplayTransport::new(full[4..].to_vec());
        io.poll(&mut transport, 100, &mut sink);
        assert_eq!(io.queued_frames(), 1);
        assert_eq!(io.pending_bytes(), 0);
    }

    #[test]
    fn corrupted_frame_is_not_extracted() {
        let (mut io, mut sink) = io();
        let mut bad = frame::build_token(5, 7);
        bad[5] ^= 0xFF;
        let mut transport = ReplayTransport::new(bad);
        io.poll(&mut transport, 0, &mut sink);
        assert_eq!(io.queued_frames(), 0);
        assert_eq!(sink.stats().frames_received, 0);
    }

    #[test]
    fn frame_queue_overflow_drops_newest() {
        let (mut io, mut sink) = io();
        let mut stream = Vec::new();
        for _ in 0..FRAME_QUEUE_CAPACITY + 2 {
            stream.extend_from_slice(&frame::build_presence(3));
        }
        let mut transport = ReplayTransport::new(stream);
        io.poll(&mut transport, 0, &mut sink);
        assert_eq!(io.queued_frames(), FRAME_QUEUE_CAPACITY);
        assert!(sink.stats().errors >= 2);
    }

    #[test]
    fn interframe_gap_gates_transmit() {
        let (mut io, mut sink) = io();
        let mut transport = ReplayTransport::new(Vec::<u8>::new());
        let token = frame::build_token(1, 2);

        // One gap of silence after boot opens the transmit window
        assert!(!io.is_tx_ready(0));
        assert!(io.is_tx_ready(5_000));
        io.send_frame(&mut transport, &token, 10_000, &mut sink).unwrap();

        // Just transmitted: gap not yet open again
        assert!(!io.is_tx_ready(12_000));
        assert!(matches!(
            io.send_frame(&mut transport, &token, 12_000, &mut sink),
            Err(TransportError::NotReady)
        ));

        assert!(io.is_tx_ready(15_000));
        io.send_frame(&mut transport, &token, 15_000, &mut sink).unwrap();
        assert_eq!(sink.stats().frames_sent, 2);
    }

    #[test]
    fn rx_activity_delays_tx() {
        let (mut io, mut sink) = io();
        let mut transport = ReplayTransport::new(frame::build_presence(4));
        io.poll(&mut transport, 100_000, &mut sink);
        assert!(!io.is_tx_ready(104_000));
        assert!(io.is_tx_ready(105_000));
    }
}
