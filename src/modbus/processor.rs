//! Inbound request execution.
//!
//! Runs a PDU received for this node against the local data map. Reads
//! produce a response PDU (or an exception PDU); writes update bound
//! variables and never answer, so a failed write surfaces only through the
//! event sink. Unknown function codes are answered with an exception
//! because the receiver cannot tell whether a read or a write was meant.

use tracing::debug;

use crate::data_map::DataMap;
use crate::errors::ProtocolErrorKind;
use crate::events::{ErrorKind, EventSink};
use crate::modbus::pdu::{self, FunctionCode, ModbusPdu, EXCEPTION_FLAG};
use crate::vars::VarArena;

/// Execute `pdu_bytes` from node `src`; returns the encoded response for
/// read traffic, `None` for writes and unanswerable garbage.
pub fn execute(
    map: &mut DataMap,
    arena: &mut VarArena,
    pdu_bytes: &[u8],
    src: u8,
    sink: &mut EventSink,
) -> Option<Vec<u8>> {
    let fn_byte = *pdu_bytes.first()?;
    let start = match pdu_bytes.len() {
        0..=2 => 0,
        _ => u16::from_be_bytes([pdu_bytes[1], pdu_bytes[2]]),
    };

    let Some(function) = FunctionCode::from_byte(fn_byte) else {
        sink.report(
            ErrorKind::InvalidFunction,
            &format!("unsupported function {:#04X} from node {}", fn_byte, src),
        );
        let code = ProtocolErrorKind::InvalidFunction.to_exception_code();
        return Some(raw_exception(fn_byte, start, code));
    };

    let request = match pdu::parse_request(pdu_bytes) {
        Ok(request) => request,
        Err(kind) => {
            sink.report(
                ErrorKind::InvalidRequest,
                &format!("malformed {} request from node {}", function, src),
            );
            if function.is_read() {
                return ModbusPdu::exception(function, start, kind.to_exception_code()).encode();
            }
            return None;
        }
    };

    debug!(
        "executing {} start={} qty={} from node {}",
        function, request.start, request.quantity, src
    );

    match function {
        FunctionCode::ReadCoils => read_bits(map, arena, &request, src, sink, DataMap::get_coil),
        FunctionCode::ReadDiscreteInputs => {
            read_bits(map, arena, &request, src, sink, DataMap::get_ists)
        }
        FunctionCode::ReadHoldingRegisters => {
            read_regs(map, arena, &request, src, sink, DataMap::get_hreg)
        }
        FunctionCode::ReadInputRegisters => {
            read_regs(map, arena, &request, src, sink, DataMap::get_ireg)
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils => {
            write_coils(map, arena, &request, src, sink);
            None
        }
        FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
            write_regs(map, arena, &request, src, sink);
            None
        }
    }
}

fn raw_exception(fn_byte: u8, start: u16, code: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push(fn_byte | EXCEPTION_FLAG);
    out.extend_from_slice(&start.to_be_bytes());
    out.push(code);
    out
}

fn missing_address(
    request: &ModbusPdu,
    src: u8,
    address: u16,
    sink: &mut EventSink,
) -> Option<Vec<u8>> {
    sink.report(
        ErrorKind::InvalidAddress,
        &format!(
            "{} address {} not bound (node {})",
            request.function, address, src
        ),
    );
    let code = ProtocolErrorKind::InvalidDataAddress.to_exception_code();
    ModbusPdu::exception(request.function, request.start, code).encode()
}

fn read_bits(
    map: &mut DataMap,
    arena: &mut VarArena,
    request: &ModbusPdu,
    src: u8,
    sink: &mut EventSink,
    get: fn(&DataMap, &VarArena, u16) -> Option<bool>,
) -> Option<Vec<u8>> {
    let mut bits = Vec::with_capacity(request.quantity as usize);
    for offset in 0..request.quantity {
        let address = request.start.wrapping_add(offset);
        match get(map, arena, address) {
            Some(bit) => bits.push(bit),
            None => return missing_address(request, src, address, sink),
        }
    }
    ModbusPdu::response(
        request.function,
        request.start,
        request.quantity,
        pdu::pack_bits(&bits),
    )
    .encode()
}

fn read_regs(
    map: &mut DataMap,
    arena: &mut VarArena,
    request: &ModbusPdu,
    src: u8,
    sink: &mut EventSink,
    get: fn(&DataMap, &VarArena, u16) -> Option<i16>,
) -> Option<Vec<u8>> {
    let mut regs = Vec::with_capacity(request.quantity as usize);
    for offset in 0..request.quantity {
        let address = request.start.wrapping_add(offset);
        match get(map, arena, address) {
            Some(reg) => regs.push(reg),
            None => return missing_address(request, src, address, sink),
        }
    }
    ModbusPdu::response(
        request.function,
        request.start,
        request.quantity,
        pdu::pack_regs(&regs),
    )
    .encode()
}

fn write_coils(
    map: &mut DataMap,
    arena: &mut VarArena,
    request: &ModbusPdu,
    src: u8,
    sink: &mut EventSink,
) {
    // Validate the whole range up front so a bad request writes nothing
    for offset in 0..request.quantity {
        let address = request.start.wrapping_add(offset);
        if !map.has_coil(address) {
            sink.report(
                ErrorKind::InvalidAddress,
                &format!("coil write to unbound address {} (node {})", address, src),
            );
            return;
        }
    }

    let bits = pdu::unpack_bits(&request.payload, request.quantity);
    for (offset, bit) in bits.iter().enumerate() {
        let address = request.start.wrapping_add(offset as u16);
        if !map.set_coil(arena, address, *bit, src) {
            sink.report(
                ErrorKind::SlaveDeviceFailure,
                &format!("coil write failed at address {}", address),
            );
            return;
        }
    }
}

fn write_regs(
    map: &mut DataMap,
    arena: &mut VarArena,
    request: &ModbusPdu,
    src: u8,
    sink: &mut EventSink,
) {
    for offset in 0..request.quantity {
        let address = request.start.wrapping_add(offset);
        if !map.has_hreg(address) {
            sink.report(
                ErrorKind::InvalidAddress,
                &format!(
                    "register write to unbound address {} (node {})",
                    address, src
                ),
            );
            return;
        }
    }

    let regs = pdu::unpack_regs(&request.payload);
    for (offset, reg) in regs.iter().enumerate() {
        let address = request.start.wrapping_add(offset as u16);
        if !map.set_hreg(arena, address, *reg, src) {
            sink.report(
                ErrorKind::SlaveDeviceFailure,
                &format!("register write failed at address {}", address),
            );
            return;
        }
    }
}
