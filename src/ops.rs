//! Pending remote operations and queued read replies.
//!
//! A remote read or write becomes a [`PendingOp`] that waits for the next
//! token turn. Reads stay queued until the matching response arrives or
//! their retry budget runs out; writes are fire-and-forget and retire as
//! soon as they hit the wire. Locally-produced read replies wait in the
//! response queue for the same token turn.
//!
//! Write payloads are not captured at enqueue time: the wire value is
//! packed from the bound variable when the frame is built.

use tracing::debug;

use crate::errors::{ModbeeError, ProtocolErrorKind};
use crate::events::{ErrorKind, EventSink};
use crate::modbus::pdu::{self, FunctionCode, ModbusPdu};
use crate::vars::{BitHandle, RegHandle, VarArena};

/// Storage a fulfilled response decodes into, or a write packs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStorage {
    Bits(BitHandle),
    Regs(RegHandle),
}

/// Terminal state reported to an operation's completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Fulfilled,
    Failed,
    TimedOut,
    Failsafe,
}

pub type CompletionHandler = Box<dyn FnMut(OpOutcome) + Send>;

pub struct PendingOp {
    pub dest: u8,
    pub src: u8,
    pub function: FunctionCode,
    pub start: u16,
    pub quantity: u16,
    pub storage: OpStorage,
    pub timestamp_ms: u64,
    pub retries: u8,
    /// Set once the request has been emitted; cleared when a timeout
    /// grants a retry so the next token turn sends it again.
    pub sent: bool,
    pub on_complete: Option<CompletionHandler>,
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("dest", &self.dest)
            .field("function", &self.function)
            .field("start", &self.start)
            .field("quantity", &self.quantity)
            .field("retries", &self.retries)
            .field("sent", &self.sent)
            .finish()
    }
}

impl PendingOp {
    pub fn new(
        dest: u8,
        src: u8,
        function: FunctionCode,
        start: u16,
        quantity: u16,
        storage: OpStorage,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            dest,
            src,
            function,
            start,
            quantity,
            storage,
            timestamp_ms,
            retries: 0,
            sent: false,
            on_complete: None,
        }
    }

    pub fn with_completion(mut self, handler: CompletionHandler) -> Self {
        self.on_complete = Some(handler);
        self
    }

    pub fn is_read(&self) -> bool {
        self.function.is_read()
    }

    fn same_target(&self, other: &PendingOp) -> bool {
        self.dest == other.dest
            && self.function == other.function
            && self.start == other.start
            && self.quantity == other.quantity
    }

    /// A response matches when source, function and address line up and the
    /// payload size is what this operation's quantity implies.
    fn matches_response(&self, response: &ModbusPdu, src: u8) -> bool {
        if self.dest != src || self.function != response.function || self.start != response.start {
            return false;
        }
        let expected = if self.function.is_bit_function() {
            pdu::bit_payload_len(self.quantity)
        } else {
            self.quantity as usize * 2
        };
        response.payload.len() == expected
    }

    /// Serialize the request, packing write payloads from live storage.
    pub fn encode_request(&self, arena: &VarArena) -> Option<Vec<u8>> {
        let pdu = if self.is_read() {
            ModbusPdu::read_request(self.function, self.start, self.quantity)
        } else {
            let payload = match self.storage {
                OpStorage::Bits(handle) => pdu::pack_bits(arena.bits(handle)),
                OpStorage::Regs(handle) => pdu::pack_regs(arena.regs(handle)),
            };
            ModbusPdu::write_request(self.function, self.start, self.quantity, payload)
        };
        pdu.encode()
    }

    fn complete(&mut self, outcome: OpOutcome) {
        if let Some(handler) = self.on_complete.as_mut() {
            handler(outcome);
        }
    }
}

/// A locally-produced read reply awaiting its token turn.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub dest: u8,
    pub pdu: Vec<u8>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperationStats {
    pub pending: u16,
    pub responses: u16,
    pub completed: u64,
    pub retried: u64,
    pub timed_out: u64,
}

pub struct Operations {
    pending_ops: Vec<PendingOp>,
    pending_responses: Vec<PendingResponse>,
    capacity: usize,
    completed: u64,
    retried: u64,
    timed_out: u64,
}

impl Operations {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending_ops: Vec::new(),
            pending_responses: Vec::new(),
            capacity,
            completed: 0,
            retried: 0,
            timed_out: 0,
        }
    }

    /// Queue a remote operation. Duplicates of a live `(dest, function,
    /// start, quantity)` tuple are rejected without refreshing the original.
    pub fn enqueue_op(&mut self, op: PendingOp) -> Result<(), ModbeeError> {
        if self.pending_ops.iter().any(|existing| existing.same_target(&op)) {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::DuplicateOperation,
                format!(
                    "{} start={} qty={} for node {} already queued",
                    op.function, op.start, op.quantity, op.dest
                ),
            ));
        }
        if self.pending_ops.len() >= self.capacity {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::QueueFull,
                format!("{} pending operations", self.pending_ops.len()),
            ));
        }
        debug!("queued {:?}", op);
        self.pending_ops.push(op);
        Ok(())
    }

    pub fn enqueue_response(
        &mut self,
        dest: u8,
        pdu: Vec<u8>,
        timestamp_ms: u64,
        sink: &mut EventSink,
    ) {
        if self.pending_responses.len() >= self.capacity {
            sink.report(ErrorKind::OperationError, "response queue full, reply dropped");
            return;
        }
        self.pending_responses.push(PendingResponse {
            dest,
            pdu,
            timestamp_ms,
        });
    }

    pub fn ops(&self) -> &[PendingOp] {
        &self.pending_ops
    }

    pub fn responses(&self) -> &[PendingResponse] {
        &self.pending_responses
    }

    /// Drop the first `count` responses after they were bundled into a frame.
    pub fn retire_responses(&mut self, count: usize) {
        self.pending_responses.drain(..count.min(self.pending_responses.len()));
    }

    /// Mark emitted operations: reads stay queued awaiting their response,
    /// writes complete immediately.
    pub fn mark_emitted(&mut self, indices: &[usize], sink: &mut EventSink) {
        let mut removed = Vec::new();
        for &index in indices {
            let op = &mut self.pending_ops[index];
            op.sent = true;
            sink.count_request_sent();
            if !op.is_read() {
                op.complete(OpOutcome::Fulfilled);
                removed.push(index);
            }
        }
        removed.sort_unstable_by(|a, b| b.cmp(a));
        for index in removed {
            self.pending_ops.remove(index);
            self.completed += 1;
        }
    }

    /// Decode a matched response into the caller's storage and retire the
    /// operation. Returns false when nothing matches.
    pub fn match_and_fulfill(
        &mut self,
        arena: &mut VarArena,
        response: &ModbusPdu,
        src: u8,
        sink: &mut EventSink,
    ) -> bool {
        let Some(index) = self
            .pending_ops
            .iter()
            .position(|op| op.matches_response(response, src))
        else {
            return false;
        };

        let mut op = self.pending_ops.remove(index);
        match op.storage {
            OpStorage::Bits(handle) => {
                let bits = pdu::unpack_bits(&response.payload, op.quantity);
                arena.bits_mut(handle).copy_from_slice(&bits);
            }
            OpStorage::Regs(handle) => {
                let regs = pdu::unpack_regs(&response.payload);
                arena.regs_mut(handle).copy_from_slice(&regs);
            }
        }
        op.complete(OpOutcome::Fulfilled);
        self.completed += 1;
        sink.count_response_received();
        debug!("fulfilled {:?} from node {}", op, src);
        true
    }

    /// Retire the operation an exception response refers to.
    pub fn fail_on_exception(&mut self, response: &ModbusPdu, src: u8, sink: &mut EventSink) -> bool {
        let Some(index) = self.pending_ops.iter().position(|op| {
            op.dest == src && op.function == response.function && op.start == response.start
        }) else {
            return false;
        };

        let mut op = self.pending_ops.remove(index);
        let code = response.exception.unwrap_or(0);
        let reason = match ProtocolErrorKind::from_exception_code(code) {
            Some(kind) => kind.to_string(),
            None => format!("exception {:#04X}", code),
        };
        sink.report(
            ErrorKind::OperationError,
            &format!(
                "node {} rejected {} start={}: {}",
                src, op.function, op.start, reason
            ),
        );
        op.complete(OpOutcome::Failed);
        true
    }

    /// Age out expired operations and stale responses. An expired operation
    /// earns a retry until the budget is spent, then drops.
    pub fn cleanup(
        &mut self,
        now_ms: u64,
        op_expiry_ms: u64,
        response_expiry_ms: u64,
        max_retries: u8,
        sink: &mut EventSink,
    ) {
        let mut index = 0;
        while index < self.pending_ops.len() {
            let op = &mut self.pending_ops[index];
            if now_ms.saturating_sub(op.timestamp_ms) <= op_expiry_ms {
                index += 1;
                continue;
            }
            if op.retries < max_retries {
                op.retries += 1;
                op.timestamp_ms = now_ms;
                op.sent = false;
                self.retried += 1;
                debug!("retrying {:?}", op);
                index += 1;
            } else {
                let mut op = self.pending_ops.remove(index);
                sink.report(
                    ErrorKind::OperationTimeout,
                    &format!(
                        "{} start={} for node {} dropped after {} retries",
                        op.function, op.start, op.dest, op.retries
                    ),
                );
                op.complete(OpOutcome::TimedOut);
                self.timed_out += 1;
            }
        }

        self.pending_responses
            .retain(|response| now_ms.saturating_sub(response.timestamp_ms) <= response_expiry_ms);
    }

    /// Zero the storage of in-flight reads targeting `node`, then drop every
    /// operation aimed at it.
    pub fn apply_failsafe_for_node(&mut self, arena: &mut VarArena, node: u8, sink: &mut EventSink) {
        let mut affected = 0usize;
        let mut index = 0;
        while index < self.pending_ops.len() {
            if self.pending_ops[index].dest != node {
                index += 1;
                continue;
            }
            let mut op = self.pending_ops.remove(index);
            if op.is_read() {
                match op.storage {
                    OpStorage::Bits(handle) => arena.zero_bits(handle),
                    OpStorage::Regs(handle) => arena.zero_regs(handle),
                }
            }
            op.complete(OpOutcome::Failsafe);
            affected += 1;
        }
        if affected > 0 {
            sink.report(
                ErrorKind::OperationError,
                &format!("failsafe cleared {} operations for node {}", affected, node),
            );
        }
    }

    /// Drop operations and queued replies tied to `node`, without touching
    /// their storage.
    pub fn clear_node(&mut self, node: u8) {
        self.pending_ops.retain(|op| op.dest != node);
        self.pending_responses.retain(|response| response.dest != node);
    }

    pub fn clear_all(&mut self) {
        self.pending_ops.clear();
        self.pending_responses.clear();
    }

    pub fn has_ops_for_node(&self, node: u8) -> bool {
        self.pending_ops.iter().any(|op| op.dest == node)
    }

    pub fn op_count(&self) -> usize {
        self.pending_ops.len()
    }

    pub fn response_count(&self) -> usize {
        self.pending_responses.len()
    }

    pub fn stats(&self) -> OperationStats {
        OperationStats {
            pending: self.pending_ops.len() as u16,
            responses: self.pending_responses.len() as u16,
            completed: self.completed,
            retried: self.retried,
            timed_out: self.timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn read_op(arena: &mut VarArena, dest: u8, start: u16, quantity: u16) -> PendingOp {
        let handle = arena.alloc_regs(quantity);
        PendingOp::new(
            dest,
            1,
            FunctionCode::ReadHoldingRegisters,
            start,
            quantity,
            OpStorage::Regs(handle),
            0,
        )
    }

    #[test]
    fn duplicate_tuple_is_rejected() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        ops.enqueue_op(read_op(&mut arena, 5, 0, 2)).unwrap();

        let err = ops.enqueue_op(read_op(&mut arena, 5, 0, 2)).unwrap_err();
        assert!(matches!(
            err,
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::DuplicateOperation,
                ..
            }
        ));

        // Different quantity is a different operation
        ops.enqueue_op(read_op(&mut arena, 5, 0, 3)).unwrap();
        assert_eq!(ops.op_count(), 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(2);
        ops.enqueue_op(read_op(&mut arena, 5, 0, 1)).unwrap();
        ops.enqueue_op(read_op(&mut arena, 5, 1, 1)).unwrap();
        let err = ops.enqueue_op(read_op(&mut arena, 5, 2, 1)).unwrap_err();
        assert!(matches!(
            err,
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::QueueFull,
                ..
            }
        ));
    }

    #[test]
    fn fulfilment_decodes_into_storage() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();

        let handle = arena.alloc_regs(2);
        ops.enqueue_op(PendingOp::new(
            5,
            1,
            FunctionCode::ReadHoldingRegisters,
            10,
            2,
            OpStorage::Regs(handle),
            0,
        ))
        .unwrap();

        let response = ModbusPdu::response(
            FunctionCode::ReadHoldingRegisters,
            10,
            0,
            pdu::pack_regs(&[42, -9]),
        );
        assert!(ops.match_and_fulfill(&mut arena, &response, 5, &mut sink));
        assert_eq!(arena.regs(handle), &[42, -9]);
        assert_eq!(ops.op_count(), 0);
        assert_eq!(ops.stats().completed, 1);

        // Nothing left to match
        assert!(!ops.match_and_fulfill(&mut arena, &response, 5, &mut sink));
    }

    #[test]
    fn wrong_source_does_not_match() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();
        ops.enqueue_op(read_op(&mut arena, 5, 10, 1)).unwrap();

        let response = ModbusPdu::response(
            FunctionCode::ReadHoldingRegisters,
            10,
            0,
            pdu::pack_regs(&[1]),
        );
        assert!(!ops.match_and_fulfill(&mut arena, &response, 6, &mut sink));
        assert_eq!(ops.op_count(), 1);
    }

    #[test]
    fn coil_bits_unpack_into_storage() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();

        let handle = arena.alloc_bits(3);
        ops.enqueue_op(PendingOp::new(
            2,
            1,
            FunctionCode::ReadCoils,
            0,
            3,
            OpStorage::Bits(handle),
            0,
        ))
        .unwrap();

        let response = ModbusPdu::response(
            FunctionCode::ReadCoils,
            0,
            0,
            pdu::pack_bits(&[true, false, true]),
        );
        assert!(ops.match_and_fulfill(&mut arena, &response, 2, &mut sink));
        assert_eq!(arena.bits(handle), &[true, false, true]);
    }

    #[test]
    fn timeout_retries_then_drops() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();
        ops.enqueue_op(read_op(&mut arena, 5, 0, 1)).unwrap();

        // Not yet expired
        ops.cleanup(1_000, 2_000, 100, 2, &mut sink);
        assert_eq!(ops.op_count(), 1);
        assert_eq!(ops.ops()[0].retries, 0);

        // First and second expiries grant retries
        ops.cleanup(3_000, 2_000, 100, 2, &mut sink);
        assert_eq!(ops.ops()[0].retries, 1);
        assert!(!ops.ops()[0].sent);
        ops.cleanup(6_000, 2_000, 100, 2, &mut sink);
        assert_eq!(ops.ops()[0].retries, 2);

        // Budget exhausted: dropped with an event
        ops.cleanup(9_000, 2_000, 100, 2, &mut sink);
        assert_eq!(ops.op_count(), 0);
        assert_eq!(ops.stats().timed_out, 1);
        assert_eq!(sink.stats().errors, 1);
    }

    #[test]
    fn emitted_writes_retire_reads_stay() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();

        let reg = arena.alloc_regs(1);
        arena.set_reg(reg, 123);
        ops.enqueue_op(PendingOp::new(
            5,
            1,
            FunctionCode::WriteSingleRegister,
            0,
            1,
            OpStorage::Regs(reg),
            0,
        ))
        .unwrap();
        ops.enqueue_op(read_op(&mut arena, 5, 7, 1)).unwrap();

        // Write payload reflects storage at encode time
        arena.set_reg(reg, 456);
        let encoded = ops.ops()[0].encode_request(&arena).unwrap();
        assert_eq!(&encoded[3..5], &456i16.to_be_bytes());

        ops.mark_emitted(&[0, 1], &mut sink);
        assert_eq!(ops.op_count(), 1);
        assert!(ops.ops()[0].is_read());
        assert!(ops.ops()[0].sent);
        assert_eq!(sink.stats().requests_sent, 2);
    }

    #[test]
    fn failsafe_zeroes_read_storage() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();

        let handle = arena.alloc_regs(2);
        arena.regs_mut(handle).copy_from_slice(&[11, 22]);
        ops.enqueue_op(PendingOp::new(
            3,
            1,
            FunctionCode::ReadHoldingRegisters,
            0,
            2,
            OpStorage::Regs(handle),
            0,
        ))
        .unwrap();
        ops.enqueue_op(read_op(&mut arena, 4, 0, 1)).unwrap();

        ops.apply_failsafe_for_node(&mut arena, 3, &mut sink);
        assert_eq!(arena.regs(handle), &[0, 0]);
        assert!(!ops.has_ops_for_node(3));
        assert!(ops.has_ops_for_node(4));
    }

    #[test]
    fn completion_handler_fires_once() {
        let mut arena = VarArena::new();
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handle = arena.alloc_regs(1);
        ops.enqueue_op(
            PendingOp::new(
                5,
                1,
                FunctionCode::ReadHoldingRegisters,
                0,
                1,
                OpStorage::Regs(handle),
                0,
            )
            .with_completion(Box::new(move |outcome| {
                assert_eq!(outcome, OpOutcome::Fulfilled);
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let response = ModbusPdu::response(
            FunctionCode::ReadHoldingRegisters,
            0,
            0,
            pdu::pack_regs(&[5]),
        );
        ops.match_and_fulfill(&mut arena, &response, 5, &mut sink);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_responses_age_out() {
        let mut ops = Operations::new(10);
        let mut sink = EventSink::new();
        ops.enqueue_response(5, vec![0x03, 0, 0, 2, 0, 1], 0, &mut sink);
        ops.cleanup(50, 1_000, 100, 2, &mut sink);
        assert_eq!(ops.response_count(), 1);
        ops.cleanup(200, 1_000, 100, 2, &mut sink);
        assert_eq!(ops.response_count(), 0);
    }
}
