//! Token possession, passing and reclaim bookkeeping.
//!
//! The transmit half of a token turn lives here: bundling queued responses
//! and operations into one outbound frame, and tracking an unconfirmed pass
//! until the successor is heard from (or evicted).

use crate::frame::{FrameBuilder, JOIN_SENTINEL, TX_SAFETY_MARGIN};
use crate::ops::Operations;
use crate::vars::VarArena;

pub struct TokenEngine {
    last_token_seen_ms: u64,
    pub target: u8,
    pub pass_time_ms: u64,
    pub retries: u8,
    pub confirmed: bool,
    pub token_for_us: bool,
}

impl TokenEngine {
    pub fn new() -> Self {
        Self {
            last_token_seen_ms: 0,
            target: 0,
            pass_time_ms: 0,
            retries: 0,
            confirmed: false,
            token_for_us: false,
        }
    }

    pub fn note_token_seen(&mut self, now_ms: u64) {
        self.last_token_seen_ms = now_ms;
    }

    pub fn token_silence_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_token_seen_ms)
    }

    pub fn begin_pass(&mut self, target: u8, now_ms: u64) {
        self.target = target;
        self.pass_time_ms = now_ms;
        self.retries = 0;
        self.confirmed = false;
        self.last_token_seen_ms = now_ms;
    }

    pub fn note_retry(&mut self, now_ms: u64) {
        self.retries += 1;
        self.pass_time_ms = now_ms;
    }

    pub fn pass_overdue(&self, now_ms: u64, retry_after_ms: u64) -> bool {
        !self.confirmed && now_ms.saturating_sub(self.pass_time_ms) > retry_after_ms
    }
}

impl Default for TokenEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// One outbound frame's worth of queued traffic.
pub struct AssembledFrame {
    pub bytes: Vec<u8>,
    /// Indices into the pending-op queue that made it into the frame.
    pub op_indices: Vec<usize>,
    /// How many queued responses (a prefix of the queue) were bundled.
    pub response_count: usize,
}

/// Bundle pending responses, then as many pending operations as fit, into a
/// single frame handing the token to `successor`. Write payloads are packed
/// from live storage here, at build time. A safety margin below the TX
/// buffer limit is always kept free.
pub fn assemble_turn(
    src: u8,
    successor: u8,
    invite: Option<u8>,
    ops: &Operations,
    arena: &VarArena,
) -> AssembledFrame {
    let (add_node, remove_node) = match invite {
        Some(candidate) => (candidate, JOIN_SENTINEL),
        None => (0, 0),
    };
    let mut builder = FrameBuilder::new(src, successor, add_node, remove_node);

    let mut response_count = 0;
    for response in ops.responses() {
        if !fits(&builder, response.pdu.len()) {
            break;
        }
        builder.push_section(response.dest, &response.pdu);
        response_count += 1;
    }

    let mut op_indices = Vec::new();
    for (index, op) in ops.ops().iter().enumerate() {
        if op.sent {
            continue; // in flight, awaiting its response or a retry grant
        }
        let Some(pdu) = op.encode_request(arena) else {
            continue;
        };
        if !fits(&builder, pdu.len()) {
            break;
        }
        builder.push_section(op.dest, &pdu);
        op_indices.push(index);
    }

    AssembledFrame {
        bytes: builder.finish(),
        op_indices,
        response_count,
    }
}

fn fits(builder: &FrameBuilder, pdu_len: usize) -> bool {
    // DELIM + target + pdu, plus the reserved margin
    builder.remaining() >= pdu_len + 2 + TX_SAFETY_MARGIN
}
