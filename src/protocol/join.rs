//! Coordinator-driven join protocol.
//!
//! The coordinator (lowest live node ID) walks the ID space `[1, max_nodes]`
//! minus the known set, emitting one join invitation per cycle and leaving a
//! short response window open after each. The candidate pointer advances
//! every cycle whether or not the invitation made it onto the wire. A build
//! phase ends when the walk wraps around to its first candidate or the
//! overall build timeout expires.

pub struct JoinEngine {
    pub is_coordinator: bool,
    building: bool,
    build_start_ms: u64,
    last_cycle_ms: Option<u64>,
    cursor: u8,
    cycle_complete: bool,
    outstanding: Option<u8>,
    invite_sent_ms: u64,
}

impl JoinEngine {
    pub fn new() -> Self {
        Self {
            is_coordinator: false,
            building: false,
            build_start_ms: 0,
            last_cycle_ms: None,
            cursor: 0,
            cycle_complete: false,
            outstanding: None,
            invite_sent_ms: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn start_building(&mut self, now_ms: u64) {
        self.is_coordinator = true;
        self.building = true;
        self.build_start_ms = now_ms;
        self.last_cycle_ms = None;
        self.cursor = 0;
        self.cycle_complete = false;
        self.outstanding = None;
    }

    pub fn stop_building(&mut self) {
        self.building = false;
    }

    pub fn is_building(&self) -> bool {
        self.building
    }

    pub fn build_complete(&self, now_ms: u64, build_timeout_ms: u64) -> bool {
        self.cycle_complete || now_ms.saturating_sub(self.build_start_ms) >= build_timeout_ms
    }

    /// Time for the next invitation cycle?
    pub fn should_cycle(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_cycle_ms {
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
            None => true,
        }
    }

    /// Next absent ID after the cursor, wrapping over `[1, max_nodes]`.
    pub fn next_candidate(&self, known: &[u8], max_nodes: u8) -> Option<u8> {
        let mut absent = |id: &u8| !known.contains(id);
        (self.cursor.saturating_add(1)..=max_nodes)
            .find(&mut absent)
            .or_else(|| (1..=self.cursor.min(max_nodes)).find(&mut absent))
    }

    /// Advance the cycle. `None` (no absent IDs left) or the candidate
    /// wrapping back below the cursor both complete the sweep.
    pub fn note_cycle(&mut self, candidate: Option<u8>, now_ms: u64) {
        self.last_cycle_ms = Some(now_ms);
        match candidate {
            Some(candidate) => {
                if candidate <= self.cursor {
                    self.cycle_complete = true;
                }
                self.cursor = candidate;
            }
            None => self.cycle_complete = true,
        }
    }

    /// Record an invitation actually sent, opening its response window.
    pub fn open_invite(&mut self, candidate: u8, now_ms: u64) {
        self.outstanding = Some(candidate);
        self.invite_sent_ms = now_ms;
    }

    /// A join response from `node` closes the matching window.
    pub fn response_received(&mut self, node: u8) {
        if self.outstanding == Some(node) {
            self.outstanding = None;
        }
    }

    pub fn expire_invite(&mut self, now_ms: u64, response_timeout_ms: u64) {
        if self.outstanding.is_some()
            && now_ms.saturating_sub(self.invite_sent_ms) >= response_timeout_ms
        {
            self.outstanding = None;
        }
    }

    /// True while an invitation's response window is still open; the
    /// coordinator delays taking a returned token for this long.
    pub fn awaiting_response(&self, now_ms: u64, response_timeout_ms: u64) -> bool {
        self.outstanding.is_some()
            && now_ms.saturating_sub(self.invite_sent_ms) < response_timeout_ms
    }

    pub fn outstanding(&self) -> Option<u8> {
        self.outstanding
    }
}

impl Default for JoinEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_skip_known_and_wrap() {
        let mut join = JoinEngine::new();
        join.start_building(0);

        let known = vec![2u8, 7];
        assert_eq!(join.next_candidate(&known, 10), Some(1));
        join.note_cycle(Some(1), 0);
        assert_eq!(join.next_candidate(&known, 10), Some(3));
        join.note_cycle(Some(3), 50);
        for expected in [4u8, 5, 6, 8, 9, 10] {
            assert_eq!(join.next_candidate(&known, 10), Some(expected));
            join.note_cycle(Some(expected), 100);
        }

        // Wrap back to the first candidate: the cycle is complete
        assert_eq!(join.next_candidate(&known, 10), Some(1));
        join.note_cycle(Some(1), 500);
        assert!(join.build_complete(500, 10_000));
    }

    #[test]
    fn full_ring_completes_immediately() {
        let mut join = JoinEngine::new();
        join.start_building(0);
        let known: Vec<u8> = (1..=4).collect();
        assert_eq!(join.next_candidate(&known, 4), None);
        join.note_cycle(None, 0);
        assert!(join.build_complete(0, 10_000));
    }

    #[test]
    fn build_timeout_is_a_backstop() {
        let mut join = JoinEngine::new();
        join.start_building(1_000);
        assert!(!join.build_complete(1_500, 1_050));
        assert!(join.build_complete(2_050, 1_050));
    }

    #[test]
    fn cycle_interval_gating() {
        let mut join = JoinEngine::new();
        join.start_building(0);
        assert!(join.should_cycle(0, 50)); // first cycle is immediate
        join.note_cycle(Some(1), 0);
        assert!(!join.should_cycle(30, 50));
        assert!(join.should_cycle(50, 50));
    }

    #[test]
    fn response_window() {
        let mut join = JoinEngine::new();
        join.start_building(0);
        join.open_invite(4, 100);
        assert!(join.awaiting_response(110, 20));
        assert!(!join.awaiting_response(120, 20));

        join.open_invite(5, 200);
        join.response_received(5);
        assert!(!join.awaiting_response(205, 20));

        // A response from someone else leaves the window open
        join.open_invite(6, 300);
        join.response_received(9);
        assert!(join.awaiting_response(305, 20));
        join.expire_invite(320, 20);
        assert_eq!(join.outstanding(), None);
    }
}
