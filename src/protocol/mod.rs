//! ModBee protocol core.
//!
//! A [`ModbeeNode`] is the whole protocol instance: framing buffers, data
//! map, operation queues and the membership/token state machine, driven by
//! periodic [`ModbeeNode::tick`] calls from the host. Nothing in here
//! blocks; time comes exclusively from the injected clock, and every
//! outbound frame waits for the interframe gap.
//!
//! Per tick the pipeline runs once: drain the bus and extract frames,
//! dispatch each frame (Modbus sections first, then the control sentinels
//! of the same frame), age the operation queues, then let the current
//! state act. While a frame is being dispatched the token logic only
//! records flags; transitions happen in the state step, so a tick always
//! observes a consistent view.

mod join;
mod membership;
mod token;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::ModbeeConfig;
use crate::data_map::DataMap;
use crate::errors::{ModbeeError, ProtocolErrorKind, TransportError};
use crate::events::{DebugHandler, ErrorHandler, ErrorKind, EventCategory, EventSink, EventStats};
use crate::frame;
use crate::io::BusIo;
use crate::modbus::pdu::{self, FunctionCode};
use crate::modbus::processor;
use crate::ops::{OpStorage, Operations, OperationStats, PendingOp};
use crate::transport::Transport;
use crate::vars::{BitHandle, RegHandle, VarArena};

pub use join::JoinEngine;
pub use membership::Membership;
pub use token::{assemble_turn, AssembledFrame, TokenEngine};

/// Protocol states. Exactly one node in a healthy ring is in `HaveToken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    InitialListen,
    CoordinatorBuilding,
    WaitingForInvite,
    Connecting,
    Idle,
    HaveToken,
    PassingToken,
    Disconnecting,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::InitialListen => "INITIAL_LISTEN",
            Self::CoordinatorBuilding => "COORDINATOR_BUILDING",
            Self::WaitingForInvite => "WAITING_FOR_JOIN_INVITATION",
            Self::Connecting => "CONNECTING",
            Self::Idle => "IDLE",
            Self::HaveToken => "HAVE_TOKEN",
            Self::PassingToken => "PASSING_TOKEN",
            Self::Disconnecting => "DISCONNECTING",
        };
        write!(f, "{}", name)
    }
}

pub struct ModbeeNode {
    config: ModbeeConfig,
    clock: Box<dyn Clock + Send>,
    transport: Option<Box<dyn Transport>>,

    io: BusIo,
    arena: VarArena,
    map: DataMap,
    ops: Operations,
    membership: Membership,
    join: JoinEngine,
    token: TokenEngine,
    sink: EventSink,

    state: NodeState,
    state_entered_ms: u64,
    listen_deadline_ms: u64,
    activity_seen: bool,
    collision_seen: bool,
    last_tx_failure_ms: Option<u64>,
    rng: SmallRng,
}

impl ModbeeNode {
    pub fn new(config: ModbeeConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock::new()))
    }

    /// Build a node around an explicit clock; simulations hand every node
    /// the same [`crate::clock::SimClock`].
    pub fn with_clock(config: ModbeeConfig, clock: Box<dyn Clock + Send>) -> Self {
        let node_id = config.node.node_id;
        let io = BusIo::new(config.timing.interframe_gap_us());
        let ops = Operations::new(config.limits.max_pending_ops);
        Self {
            config,
            clock,
            transport: None,
            io,
            arena: VarArena::new(),
            map: DataMap::new(),
            ops,
            membership: Membership::new(node_id),
            join: JoinEngine::new(),
            token: TokenEngine::new(),
            sink: EventSink::new(),
            state: NodeState::Disconnected,
            state_entered_ms: 0,
            listen_deadline_ms: 0,
            activity_seen: false,
            collision_seen: false,
            last_tx_failure_ms: None,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Bind the transport and ring identity. Fails when already bound.
    pub fn begin(
        &mut self,
        transport: Box<dyn Transport>,
        node_id: u8,
    ) -> Result<(), ModbeeError> {
        if self.transport.is_some() {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::AlreadyInitialized,
                "begin() called twice",
            ));
        }
        if node_id == 0 || node_id == frame::JOIN_SENTINEL || node_id > self.config.limits.max_nodes
        {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::InvalidNodeId,
                format!("node id {} outside [1, {}]", node_id, self.config.limits.max_nodes),
            ));
        }
        self.config.node.node_id = node_id;
        self.membership.set_self_id(node_id);
        self.transport = Some(transport);
        info!("ModBee node {} bound to transport", node_id);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.is_some()
    }

    pub fn node_id(&self) -> u8 {
        self.membership.self_id()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            NodeState::Idle
                | NodeState::HaveToken
                | NodeState::PassingToken
                | NodeState::Disconnecting
        )
    }

    pub fn is_node_known(&self, node: u8) -> bool {
        self.membership.contains(node)
    }

    pub fn known_nodes(&self) -> Vec<u8> {
        self.membership.nodes().to_vec()
    }

    pub fn on_error(&mut self, handler: ErrorHandler) {
        self.sink.on_error(handler);
    }

    pub fn on_debug(&mut self, handler: DebugHandler) {
        self.sink.on_debug(handler);
    }

    pub fn statistics(&self) -> (OperationStats, EventStats) {
        (self.ops.stats(), self.sink.stats())
    }

    pub fn pending_op_count(&self) -> usize {
        self.ops.op_count()
    }

    pub fn clear_pending_ops(&mut self) {
        self.ops.clear_all();
    }

    pub fn clear_node_operations(&mut self, node: u8) {
        self.ops.clear_node(node);
    }

    // ------------------------------------------------------------------
    // Bound-variable storage
    // ------------------------------------------------------------------

    pub fn alloc_bits(&mut self, len: u16) -> BitHandle {
        self.arena.alloc_bits(len)
    }

    pub fn alloc_regs(&mut self, len: u16) -> RegHandle {
        self.arena.alloc_regs(len)
    }

    pub fn bits(&self, handle: BitHandle) -> &[bool] {
        self.arena.bits(handle)
    }

    pub fn bits_mut(&mut self, handle: BitHandle) -> &mut [bool] {
        self.arena.bits_mut(handle)
    }

    pub fn regs(&self, handle: RegHandle) -> &[i16] {
        self.arena.regs(handle)
    }

    pub fn regs_mut(&mut self, handle: RegHandle) -> &mut [i16] {
        self.arena.regs_mut(handle)
    }

    // ------------------------------------------------------------------
    // Local data map
    // ------------------------------------------------------------------

    pub fn bind_coil(&mut self, address: u16, handle: BitHandle) -> Result<(), ModbeeError> {
        Self::bound(self.map.bind_coil(address, handle))
    }

    pub fn bind_ists(&mut self, address: u16, handle: BitHandle) -> Result<(), ModbeeError> {
        Self::bound(self.map.bind_ists(address, handle))
    }

    pub fn bind_hreg(&mut self, address: u16, handle: RegHandle) -> Result<(), ModbeeError> {
        Self::bound(self.map.bind_hreg(address, handle))
    }

    pub fn bind_ireg(&mut self, address: u16, handle: RegHandle) -> Result<(), ModbeeError> {
        Self::bound(self.map.bind_ireg(address, handle))
    }

    fn bound(ok: bool) -> Result<(), ModbeeError> {
        if ok {
            Ok(())
        } else {
            Err(ModbeeError::protocol(
                ProtocolErrorKind::InvalidDataValue,
                "bindings take single-slot handles",
            ))
        }
    }

    pub fn get_coil(&self, address: u16) -> Option<bool> {
        self.map.get_coil(&self.arena, address)
    }

    pub fn get_ists(&self, address: u16) -> Option<bool> {
        self.map.get_ists(&self.arena, address)
    }

    pub fn get_hreg(&self, address: u16) -> Option<i16> {
        self.map.get_hreg(&self.arena, address)
    }

    pub fn get_ireg(&self, address: u16) -> Option<i16> {
        self.map.get_ireg(&self.arena, address)
    }

    pub fn set_coil(&mut self, address: u16, value: bool) -> bool {
        self.map.set_coil(&mut self.arena, address, value, 0)
    }

    pub fn set_ists(&mut self, address: u16, value: bool) -> bool {
        self.map.set_ists(&mut self.arena, address, value)
    }

    pub fn set_hreg(&mut self, address: u16, value: i16) -> bool {
        self.map.set_hreg(&mut self.arena, address, value, 0)
    }

    pub fn set_ireg(&mut self, address: u16, value: i16) -> bool {
        self.map.set_ireg(&mut self.arena, address, value)
    }

    pub fn remove_coil(&mut self, address: u16) -> bool {
        self.map.remove_coil(address)
    }

    pub fn remove_ists(&mut self, address: u16) -> bool {
        self.map.remove_ists(address)
    }

    pub fn remove_hreg(&mut self, address: u16) -> bool {
        self.map.remove_hreg(address)
    }

    pub fn remove_ireg(&mut self, address: u16) -> bool {
        self.map.remove_ireg(address)
    }

    /// Zero every writable bound entry, regardless of who wrote it.
    pub fn clear_all_linked(&mut self) {
        self.map.clear_all_linked(&mut self.arena);
    }

    // ------------------------------------------------------------------
    // Reads and writes, local or remote
    // ------------------------------------------------------------------

    /// Read holding registers. Local reads complete synchronously; remote
    /// reads queue an operation that fills `handle` on a later tick.
    pub fn read_hreg(
        &mut self,
        node: u8,
        offset: u16,
        handle: RegHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            return self.local_read_regs(offset, handle, DataMap::get_hreg);
        }
        self.enqueue(
            node,
            FunctionCode::ReadHoldingRegisters,
            offset,
            handle.len(),
            OpStorage::Regs(handle),
        )
    }

    pub fn read_ireg(
        &mut self,
        node: u8,
        offset: u16,
        handle: RegHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            return self.local_read_regs(offset, handle, DataMap::get_ireg);
        }
        self.enqueue(
            node,
            FunctionCode::ReadInputRegisters,
            offset,
            handle.len(),
            OpStorage::Regs(handle),
        )
    }

    pub fn read_coil(
        &mut self,
        node: u8,
        offset: u16,
        handle: BitHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            return self.local_read_bits(offset, handle, DataMap::get_coil);
        }
        self.enqueue(
            node,
            FunctionCode::ReadCoils,
            offset,
            handle.len(),
            OpStorage::Bits(handle),
        )
    }

    pub fn read_ists(
        &mut self,
        node: u8,
        offset: u16,
        handle: BitHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            return self.local_read_bits(offset, handle, DataMap::get_ists);
        }
        self.enqueue(
            node,
            FunctionCode::ReadDiscreteInputs,
            offset,
            handle.len(),
            OpStorage::Bits(handle),
        )
    }

    /// Write holding registers from `handle`. Remote writes pack the
    /// payload when the frame is built, not now.
    pub fn write_hreg(
        &mut self,
        node: u8,
        offset: u16,
        handle: RegHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            let values = self.arena.regs(handle).to_vec();
            for index in 0..values.len() as u16 {
                if !self.map.has_hreg(offset + index) {
                    return Err(self.missing(offset + index));
                }
            }
            for (index, value) in values.iter().enumerate() {
                self.map
                    .set_hreg(&mut self.arena, offset + index as u16, *value, 0);
            }
            return Ok(());
        }
        let function = if handle.len() == 1 {
            FunctionCode::WriteSingleRegister
        } else {
            FunctionCode::WriteMultipleRegisters
        };
        self.enqueue(node, function, offset, handle.len(), OpStorage::Regs(handle))
    }

    pub fn write_coil(
        &mut self,
        node: u8,
        offset: u16,
        handle: BitHandle,
    ) -> Result<(), ModbeeError> {
        if node == self.node_id() {
            let values = self.arena.bits(handle).to_vec();
            for index in 0..values.len() as u16 {
                if !self.map.has_coil(offset + index) {
                    return Err(self.missing(offset + index));
                }
            }
            for (index, value) in values.iter().enumerate() {
                self.map
                    .set_coil(&mut self.arena, offset + index as u16, *value, 0);
            }
            return Ok(());
        }
        let function = if handle.len() == 1 {
            FunctionCode::WriteSingleCoil
        } else {
            FunctionCode::WriteMultipleCoils
        };
        self.enqueue(node, function, offset, handle.len(), OpStorage::Bits(handle))
    }

    fn missing(&self, address: u16) -> ModbeeError {
        ModbeeError::protocol(
            ProtocolErrorKind::InvalidDataAddress,
            format!("address {} not bound", address),
        )
    }

    fn local_read_regs(
        &mut self,
        offset: u16,
        handle: RegHandle,
        get: fn(&DataMap, &VarArena, u16) -> Option<i16>,
    ) -> Result<(), ModbeeError> {
        let mut values = Vec::with_capacity(handle.len() as usize);
        for index in 0..handle.len() {
            match get(&self.map, &self.arena, offset + index) {
                Some(value) => values.push(value),
                None => return Err(self.missing(offset + index)),
            }
        }
        self.arena.regs_mut(handle).copy_from_slice(&values);
        Ok(())
    }

    fn local_read_bits(
        &mut self,
        offset: u16,
        handle: BitHandle,
        get: fn(&DataMap, &VarArena, u16) -> Option<bool>,
    ) -> Result<(), ModbeeError> {
        let mut values = Vec::with_capacity(handle.len() as usize);
        for index in 0..handle.len() {
            match get(&self.map, &self.arena, offset + index) {
                Some(value) => values.push(value),
                None => return Err(self.missing(offset + index)),
            }
        }
        self.arena.bits_mut(handle).copy_from_slice(&values);
        Ok(())
    }

    fn enqueue(
        &mut self,
        node: u8,
        function: FunctionCode,
        offset: u16,
        quantity: u16,
        storage: OpStorage,
    ) -> Result<(), ModbeeError> {
        if !function.quantity_ok(quantity) {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::InvalidDataValue,
                format!("quantity {} outside {} limit", quantity, function),
            ));
        }
        if !self.membership.contains(node) {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::UnknownNode,
                format!("node {} is not in the ring", node),
            ));
        }
        let now_ms = self.clock.now_ms();
        self.ops.enqueue_op(PendingOp::new(
            node,
            self.node_id(),
            function,
            offset,
            quantity,
            storage,
            now_ms,
        ))
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    /// Start joining: listen first, then either get invited or assume the
    /// coordinator role when the bus stays silent.
    pub fn connect(&mut self) -> Result<(), ModbeeError> {
        if self.transport.is_none() {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::NotInitialized,
                "begin() must bind a transport first",
            ));
        }
        if self.state != NodeState::Disconnected {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::InvalidState,
                format!("connect() while {}", self.state),
            ));
        }
        let now_ms = self.clock.now_ms();
        self.arm_listen(now_ms);
        self.transition(NodeState::InitialListen, now_ms);
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), ModbeeError> {
        if !self.is_connected() {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::InvalidState,
                format!("disconnect() while {}", self.state),
            ));
        }
        let now_ms = self.clock.now_ms();
        self.transition(NodeState::Disconnecting, now_ms);
        Ok(())
    }

    fn arm_listen(&mut self, now_ms: u64) {
        // A little extra jitter on top of the ID stagger keeps identical
        // nodes restarted by the same supervisor from colliding
        let jitter: u64 = self.rng.gen_range(0..50);
        self.listen_deadline_ms =
            now_ms + self.config.timing.listen_window_ms(self.node_id()) + jitter;
        self.activity_seen = false;
    }

    // ------------------------------------------------------------------
    // Tick pipeline
    // ------------------------------------------------------------------

    /// Drive one iteration: ingest, dispatch, age queues, act on state.
    pub fn tick(&mut self) -> Result<(), ModbeeError> {
        let now_ms = self.clock.now_ms();
        let now_us = self.clock.now_us();

        let Some(transport) = self.transport.as_mut() else {
            return Err(ModbeeError::protocol(
                ProtocolErrorKind::NotInitialized,
                "tick() before begin()",
            ));
        };
        self.io.poll(transport.as_mut(), now_us, &mut self.sink);

        while let Some(frame_bytes) = self.io.next_frame() {
            self.handle_frame(&frame_bytes, now_ms);
        }

        self.ops.cleanup(
            now_ms,
            self.config.timing.operation_expiry_ms(self.config.limits.max_nodes),
            self.config.timing.response_expiry_ms(),
            self.config.timing.max_retries,
            &mut self.sink,
        );

        self.step(now_ms, now_us);
        Ok(())
    }

    fn transition(&mut self, next: NodeState, now_ms: u64) {
        if self.state == next {
            return;
        }
        debug!("node {}: {} -> {}", self.node_id(), self.state, next);
        self.sink
            .report(ErrorKind::StateChange, &format!("{} -> {}", self.state, next));
        self.state = next;
        self.state_entered_ms = now_ms;

        match next {
            NodeState::HaveToken => {
                self.token.token_for_us = false;
                self.token.note_token_seen(now_ms);
            }
            NodeState::Idle => {
                self.token.note_token_seen(now_ms);
            }
            NodeState::WaitingForInvite => {
                self.token.token_for_us = false;
            }
            NodeState::InitialListen => {
                // Cold (re)start: whatever ring view we held is stale
                self.membership.reset();
                self.ops.clear_all();
                self.join.reset();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Frame dispatch
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, frame_bytes: &[u8], now_ms: u64) {
        let header = match frame::parse_header(frame_bytes) {
            Ok(header) => header,
            Err(err) => {
                self.sink
                    .report(ErrorKind::FrameError, &format!("unparseable frame: {}", err));
                return;
            }
        };
        if header.src == self.node_id() {
            return; // transceiver echo of our own transmission
        }
        if self.state == NodeState::Disconnected {
            return; // off the ring, the bus is none of our business
        }

        self.activity_seen = true;
        // A connected node treats any heard source as a live ring member;
        // that is how a fresh joiner learns the rest of the ring within one
        // token rotation. Outside the ring we only refresh liveness stamps.
        match self.state {
            NodeState::Connecting
            | NodeState::Idle
            | NodeState::HaveToken
            | NodeState::PassingToken => {
                if self.membership.add(header.src, now_ms) {
                    self.sink.report(
                        ErrorKind::NodeAdded,
                        &format!("node {} joined the ring", header.src),
                    );
                }
            }
            _ => self.membership.touch(header.src, now_ms),
        }

        // Someone broke the silence while we were waiting for the pass to
        // be confirmed. The source is deliberately not checked against the
        // successor; any traffic proves the token moved on.
        if self.state == NodeState::PassingToken {
            self.token.confirmed = true;
        }

        // A foreign frame during coordinator building means another
        // coordinator is alive; back off unless it is a join response.
        if self.state == NodeState::CoordinatorBuilding
            && !frame::is_connection_frame(frame_bytes)
        {
            self.collision_seen = true;
        }

        // Modbus payload first: mirrored I/O must not lag behind the
        // membership side effects of the same frame
        self.handle_sections(frame_bytes, header.src, now_ms);

        self.handle_control(&header, now_ms);
    }

    fn handle_sections(&mut self, frame_bytes: &[u8], src: u8, now_ms: u64) {
        for section in frame::find_sections(frame_bytes) {
            let (target, pdu_bytes) = frame::extract_section(frame_bytes, section);
            if target != self.node_id() {
                continue;
            }

            // Response first: a five-byte read request and a one-byte read
            // response are indistinguishable on the wire, and only the
            // pending queue can break the tie
            let mut handled = false;
            if pdu::looks_like_response(pdu_bytes) {
                if let Some(response) = pdu::parse_response(pdu_bytes) {
                    if response.is_exception() {
                        handled = self.ops.fail_on_exception(&response, src, &mut self.sink);
                        if !handled {
                            self.sink.report(
                                ErrorKind::ProtocolError,
                                &format!("unmatched exception response from node {}", src),
                            );
                            handled = true;
                        }
                    } else {
                        handled =
                            self.ops
                                .match_and_fulfill(&mut self.arena, &response, src, &mut self.sink);
                    }
                }
            }
            if handled {
                continue;
            }

            if pdu::looks_like_response(pdu_bytes) && pdu::parse_request(pdu_bytes).is_err() {
                self.sink.report(
                    ErrorKind::ProtocolError,
                    &format!("unmatched response from node {}", src),
                );
                continue;
            }

            if let Some(reply) =
                processor::execute(&mut self.map, &mut self.arena, pdu_bytes, src, &mut self.sink)
            {
                self.ops.enqueue_response(src, reply, now_ms, &mut self.sink);
            }
        }
    }

    fn handle_control(&mut self, header: &frame::FrameHeader, now_ms: u64) {
        if header.is_join_invitation() {
            if header.add_node == self.node_id() {
                match self.state {
                    NodeState::InitialListen | NodeState::WaitingForInvite => {
                        // Joining fresh: only the inviting coordinator is
                        // known until the ring teaches us more
                        self.membership.reset();
                        self.ops.clear_all();
                        self.membership.add(header.src, now_ms);
                        self.transition(NodeState::Connecting, now_ms);
                    }
                    _ => {
                        self.sink.debug(
                            EventCategory::Membership,
                            &format!("join invitation ignored: not ready in {}", self.state),
                        );
                    }
                }
            }
        } else if header.add_node != 0 && header.add_node != self.node_id() {
            // Join response (or piggy-backed announcement): everyone learns
            // the new member
            if self.membership.add(header.add_node, now_ms) {
                self.sink.report(
                    ErrorKind::NodeAdded,
                    &format!("node {} joined the ring", header.add_node),
                );
            }
            self.join.response_received(header.add_node);
        }

        if let Some(removed) = header.removal() {
            if removed == self.node_id() {
                self.sink.report(
                    ErrorKind::ProtocolViolation,
                    &format!("node {} asked us to remove ourselves", header.src),
                );
            } else {
                self.evict(removed, "removed by peer broadcast");
            }
        }

        if header.next_master != 0 {
            self.token.note_token_seen(now_ms);
            if header.next_master == self.node_id()
                && matches!(self.state, NodeState::Idle | NodeState::PassingToken)
            {
                self.token.token_for_us = true;
            }
        }
    }

    fn evict(&mut self, node: u8, reason: &str) {
        if !self.membership.remove(node) {
            return;
        }
        self.sink.report(
            ErrorKind::NodeRemoved,
            &format!("node {} left the ring: {}", node, reason),
        );
        if self.config.node.failsafe {
            self.map.clear_registers_for_node(&mut self.arena, node);
            self.ops
                .apply_failsafe_for_node(&mut self.arena, node, &mut self.sink);
        }
        self.ops.clear_node(node);
    }

    fn check_node_timeouts(&mut self, now_ms: u64) {
        let horizon = self
            .config
            .timing
            .node_expiry_ms(self.config.limits.max_nodes);
        for node in self.membership.expired(now_ms, horizon) {
            self.sink.report(
                ErrorKind::NodeTimeout,
                &format!("node {} silent past {} ms", node, horizon),
            );
            self.evict(node, "liveness timeout");
        }
    }

    fn send(&mut self, frame_bytes: &[u8], now_us: u64) -> Result<(), TransportError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::NotReady);
        };
        self.io
            .send_frame(transport.as_mut(), frame_bytes, now_us, &mut self.sink)
    }

    /// Hard TX failures are retried no faster than the configured delay.
    fn tx_retry_due(&self, now_ms: u64) -> bool {
        match self.last_tx_failure_ms {
            Some(failed_at) => {
                now_ms.saturating_sub(failed_at)
                    >= self.config.timing.retry_delay.as_millis() as u64
            }
            None => true,
        }
    }

    fn note_tx_failure(&mut self, now_ms: u64, err: &TransportError) {
        self.last_tx_failure_ms = Some(now_ms);
        self.sink
            .report(ErrorKind::FrameError, &format!("frame TX failed: {}", err));
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn step(&mut self, now_ms: u64, now_us: u64) {
        match self.state {
            NodeState::Disconnected => {}
            NodeState::InitialListen => self.step_initial_listen(now_ms),
            NodeState::CoordinatorBuilding => self.step_coordinator_building(now_ms, now_us),
            NodeState::WaitingForInvite => self.step_waiting_for_invite(now_ms),
            NodeState::Connecting => self.step_connecting(now_ms, now_us),
            NodeState::Idle => self.step_idle(now_ms),
            NodeState::HaveToken => self.step_have_token(now_ms, now_us),
            NodeState::PassingToken => self.step_passing_token(now_ms, now_us),
            NodeState::Disconnecting => self.step_disconnecting(now_ms, now_us),
        }
    }

    fn step_initial_listen(&mut self, now_ms: u64) {
        if self.activity_seen {
            // A live network exists; wait to be invited
            self.transition(NodeState::WaitingForInvite, now_ms);
        } else if now_ms >= self.listen_deadline_ms {
            // Quiet bus and the staggered window elapsed: the lowest ID
            // gets here first and assumes the coordinator role
            self.join.start_building(now_ms);
            self.collision_seen = false;
            self.transition(NodeState::CoordinatorBuilding, now_ms);
        }
    }

    fn step_coordinator_building(&mut self, now_ms: u64, now_us: u64) {
        if self.collision_seen {
            self.collision_seen = false;
            self.join.reset();
            self.sink.report(
                ErrorKind::ProtocolViolation,
                "coordinator collision, falling back to join wait",
            );
            self.transition(NodeState::WaitingForInvite, now_ms);
            return;
        }

        let build_timeout = self
            .config
            .timing
            .network_build_timeout_ms(self.config.limits.max_nodes);
        let cycle_interval = self.config.timing.join_cycle_interval_ms();
        if self.join.build_complete(now_ms, build_timeout) {
            self.join.stop_building();
            self.transition(NodeState::HaveToken, now_ms);
            return;
        }

        if self.join.should_cycle(now_ms, cycle_interval) {
            let candidate = self
                .join
                .next_candidate(self.membership.nodes(), self.config.limits.max_nodes);
            if let Some(candidate) = candidate {
                let invitation = frame::build_join_invitation(self.node_id(), candidate);
                if self.send(&invitation, now_us).is_ok() {
                    self.join.open_invite(candidate, now_ms);
                }
            }
            // The candidate pointer advances whether or not the invitation
            // made it out
            self.join.note_cycle(candidate, now_ms);
        }
    }

    fn step_waiting_for_invite(&mut self, now_ms: u64) {
        let wait_ms = self.config.timing.initial_listen_period.as_millis() as u64;
        if now_ms.saturating_sub(self.state_entered_ms) >= wait_ms {
            self.arm_listen(now_ms);
            self.transition(NodeState::InitialListen, now_ms);
        }
    }

    fn step_connecting(&mut self, now_ms: u64, now_us: u64) {
        if !self.tx_retry_due(now_ms) {
            return;
        }
        let response = frame::build_connection(self.node_id(), self.node_id());
        match self.send(&response, now_us) {
            Ok(()) => self.transition(NodeState::Idle, now_ms),
            Err(TransportError::NotReady) => {}
            Err(err) => self.note_tx_failure(now_ms, &err),
        }
    }

    fn step_idle(&mut self, now_ms: u64) {
        self.check_node_timeouts(now_ms);

        if self.membership.len() == 1 {
            // Everyone else is gone; go back to looking for a network
            self.transition(NodeState::WaitingForInvite, now_ms);
            return;
        }

        let response_window = self.config.timing.join_response_timeout_ms();
        self.join.expire_invite(now_ms, response_window);

        if self.token.token_for_us {
            // A coordinator holds the join window open before taking the
            // token back, so a fresh join response is not cut off
            if self.join.is_coordinator && self.join.awaiting_response(now_ms, response_window) {
                return;
            }
            self.transition(NodeState::HaveToken, now_ms);
            return;
        }

        let reclaim_after = self
            .config
            .timing
            .token_reclaim_after_ms(self.config.limits.max_nodes);
        if self.token.token_silence_ms(now_ms) > reclaim_after {
            if self.membership.is_lowest() {
                self.sink.report(
                    ErrorKind::TokenReclaim,
                    &format!("token silent for {} ms, reclaiming", reclaim_after),
                );
                self.join.is_coordinator = true;
                self.transition(NodeState::HaveToken, now_ms);
            } else {
                // Only the lowest ID may self-promote; everyone else steps
                // aside and waits to be re-invited
                self.transition(NodeState::WaitingForInvite, now_ms);
            }
        }
    }

    fn step_have_token(&mut self, now_ms: u64, now_us: u64) {
        self.check_node_timeouts(now_ms);

        let cycle_interval = self.config.timing.join_cycle_interval_ms();
        let successor = self.membership.successor();

        if successor == self.node_id() {
            // Alone with the token: keep the network open by inviting
            self.join.is_coordinator = true;
            if self.join.should_cycle(now_ms, cycle_interval) {
                let candidate = self
                    .join
                    .next_candidate(self.membership.nodes(), self.config.limits.max_nodes);
                if let Some(candidate) = candidate {
                    let invitation = frame::build_join_invitation(self.node_id(), candidate);
                    if self.send(&invitation, now_us).is_ok() {
                        self.join.open_invite(candidate, now_ms);
                    }
                }
                self.join.note_cycle(candidate, now_ms);
            }
            return;
        }

        if !self.io.is_tx_ready(now_us) {
            return;
        }

        let invite = if self.join.is_coordinator
            && self.join.should_cycle(now_ms, cycle_interval)
        {
            self.join
                .next_candidate(self.membership.nodes(), self.config.limits.max_nodes)
        } else {
            None
        };

        let assembled = assemble_turn(self.node_id(), successor, invite, &self.ops, &self.arena);
        match self.send(&assembled.bytes, now_us) {
            Ok(()) => {
                self.ops.mark_emitted(&assembled.op_indices, &mut self.sink);
                self.ops.retire_responses(assembled.response_count);
                if let Some(candidate) = invite {
                    self.join.open_invite(candidate, now_ms);
                    self.join.note_cycle(Some(candidate), now_ms);
                }
                self.sink.report(
                    ErrorKind::TokenPass,
                    &format!("token to node {}", successor),
                );
                self.token.begin_pass(successor, now_ms);
                self.transition(NodeState::PassingToken, now_ms);
            }
            Err(TransportError::NotReady) => {}
            Err(err) => self.note_tx_failure(now_ms, &err),
        }
    }

    fn step_passing_token(&mut self, now_ms: u64, now_us: u64) {
        self.check_node_timeouts(now_ms);

        if self.token.confirmed {
            self.transition(NodeState::Idle, now_ms);
            return;
        }

        // The successor may have been evicted under us by a timeout check
        let target_gone = !self.membership.contains(self.token.target);

        let retry_after = self.config.timing.pass_retry_after_ms();
        if !target_gone && !self.token.pass_overdue(now_ms, retry_after) {
            return;
        }

        if !target_gone && self.token.retries < self.config.timing.max_retries {
            let token_frame = frame::build_token(self.node_id(), self.token.target);
            if self.send(&token_frame, now_us).is_ok() {
                self.token.note_retry(now_ms);
                self.sink.report(
                    ErrorKind::Timeout,
                    &format!(
                        "token pass to node {} unconfirmed, retry {}",
                        self.token.target, self.token.retries
                    ),
                );
            }
            return;
        }

        // Retries exhausted (or the target vanished): evict and re-pass
        let evicted = self.token.target;
        self.evict(evicted, "token pass retries exhausted");

        let successor = self.membership.successor();
        if successor == self.node_id() {
            // The evicted node was the only peer; keep the token and serve
            // invitations again
            self.transition(NodeState::HaveToken, now_ms);
            return;
        }

        let handoff = frame::build_control(self.node_id(), successor, 0, evicted);
        if self.send(&handoff, now_us).is_ok() {
            self.sink.report(
                ErrorKind::TokenPass,
                &format!("token to node {} after evicting {}", successor, evicted),
            );
            self.token.begin_pass(successor, now_ms);
        }
        // On TX failure the missing target re-triggers this path next tick
    }

    fn step_disconnecting(&mut self, now_ms: u64, now_us: u64) {
        if !self.tx_retry_due(now_ms) {
            return;
        }
        let farewell = frame::build_disconnection(self.node_id(), self.node_id());
        match self.send(&farewell, now_us) {
            Ok(()) => {
                self.membership.reset();
                self.ops.clear_all();
                self.join.reset();
                self.transition(NodeState::Disconnected, now_ms);
            }
            Err(TransportError::NotReady) => {}
            Err(err) => self.note_tx_failure(now_ms, &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::transport::{BusHub, ReplayTransport};

    fn test_config(node_id: u8) -> ModbeeConfig {
        let mut config = ModbeeConfig::default();
        config.node.node_id = node_id;
        config
    }

    fn node_on_hub(node_id: u8, hub: &BusHub, clock: &SimClock) -> ModbeeNode {
        let mut node = ModbeeNode::with_clock(test_config(node_id), Box::new(clock.clone()));
        node.begin(Box::new(hub.endpoint()), node_id).unwrap();
        node
    }

    #[test]
    fn begin_is_idempotent_failure() {
        let clock = SimClock::new();
        let mut node = ModbeeNode::with_clock(test_config(1), Box::new(clock.clone()));
        node.begin(Box::new(ReplayTransport::new(Vec::<u8>::new())), 1)
            .unwrap();
        let err = node
            .begin(Box::new(ReplayTransport::new(Vec::<u8>::new())), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::AlreadyInitialized,
                ..
            }
        ));
    }

    #[test]
    fn begin_rejects_reserved_ids() {
        let clock = SimClock::new();
        for bad in [0u8, 255, 11] {
            let mut node = ModbeeNode::with_clock(test_config(1), Box::new(clock.clone()));
            let err = node
                .begin(Box::new(ReplayTransport::new(Vec::<u8>::new())), bad)
                .unwrap_err();
            assert!(matches!(
                err,
                ModbeeError::Protocol {
                    kind: ProtocolErrorKind::InvalidNodeId,
                    ..
                }
            ));
        }
    }

    #[test]
    fn tick_requires_begin() {
        let clock = SimClock::new();
        let mut node = ModbeeNode::with_clock(test_config(1), Box::new(clock.clone()));
        assert!(matches!(
            node.tick().unwrap_err(),
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::NotInitialized,
                ..
            }
        ));
    }

    #[test]
    fn local_read_write_is_synchronous() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);

        let bound = node.alloc_regs(1);
        node.bind_hreg(5, bound).unwrap();
        node.set_hreg(5, 42);

        let out = node.alloc_regs(1);
        node.read_hreg(3, 5, out).unwrap();
        assert_eq!(node.regs(out), &[42]);

        let input = node.alloc_regs(1);
        node.regs_mut(input)[0] = -7;
        node.write_hreg(3, 5, input).unwrap();
        assert_eq!(node.get_hreg(5), Some(-7));
    }

    #[test]
    fn local_read_of_unbound_address_fails() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);
        let out = node.alloc_regs(1);
        assert!(matches!(
            node.read_hreg(3, 9, out).unwrap_err(),
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::InvalidDataAddress,
                ..
            }
        ));
    }

    #[test]
    fn remote_ops_require_known_nodes() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);
        let out = node.alloc_regs(1);
        assert!(matches!(
            node.read_hreg(7, 0, out).unwrap_err(),
            ModbeeError::Protocol {
                kind: ProtocolErrorKind::UnknownNode,
                ..
            }
        ));
    }

    #[test]
    fn lone_node_becomes_coordinator_with_token() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);

        node.connect().unwrap();
        assert_eq!(node.state(), NodeState::InitialListen);

        for _ in 0..3_000 {
            clock.advance_ms(1);
            node.tick().unwrap();
        }

        assert_eq!(node.state(), NodeState::HaveToken);
        assert_eq!(node.known_nodes(), vec![3]);
    }

    #[test]
    fn rx_during_listen_defers_to_existing_network() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(7, &hub, &clock);
        let mut foreign = hub.endpoint();

        node.connect().unwrap();
        // Traffic from an existing ring member
        foreign
            .write(&crate::frame::build_token(2, 4))
            .unwrap();
        clock.advance_ms(10);
        node.tick().unwrap();
        assert_eq!(node.state(), NodeState::WaitingForInvite);
    }

    #[test]
    fn invitation_while_connected_is_ignored() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);
        let mut foreign = hub.endpoint();

        node.connect().unwrap();
        for _ in 0..3_000 {
            clock.advance_ms(1);
            node.tick().unwrap();
        }
        assert_eq!(node.state(), NodeState::HaveToken);

        // A stray invitation addressed to us must not restart the join
        foreign
            .write(&crate::frame::build_join_invitation(1, 3))
            .unwrap();
        clock.advance_ms(1);
        node.tick().unwrap();
        assert_ne!(node.state(), NodeState::Connecting);
    }

    #[test]
    fn self_removal_is_rejected() {
        let clock = SimClock::new();
        let hub = BusHub::new();
        let mut node = node_on_hub(3, &hub, &clock);
        let mut foreign = hub.endpoint();

        node.connect().unwrap();
        for _ in 0..3_000 {
            clock.advance_ms(1);
            node.tick().unwrap();
        }

        foreign
            .write(&crate::frame::build_disconnection(9, 3))
            .unwrap();
        clock.advance_ms(1);
        node.tick().unwrap();
        assert!(node.is_node_known(3));
        let (_, events) = node.statistics();
        assert!(events.errors > 0);
    }
}
