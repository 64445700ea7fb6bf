//! Embedded Modbus PDU codec.
//!
//! ModBee carries Modbus-style PDUs inside frame sections. Requests follow
//! the classical layout. Responses deviate on purpose: they echo the
//! two-byte start address before the byte count so a reply can be matched
//! back to its request anywhere in the ring, without a transaction id.
//!
//! ```text
//! read request   := fn | start(2 BE) | quantity(2 BE)
//! write single   := fn | start(2 BE) | value(2)
//! write multiple := fn | start(2 BE) | quantity(2 BE) | byte_count | data
//! response       := fn | start(2 BE) | byte_count | data
//! exception      := fn|0x80 | start(2 BE) | code
//! ```

use crate::errors::ProtocolErrorKind;

pub const EXCEPTION_FLAG: u8 = 0x80;

/// Read quantity caps, identical to classical Modbus.
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGS: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Decode a function byte, ignoring the exception flag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & !EXCEPTION_FLAG {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_write(&self) -> bool {
        !self.is_read()
    }

    /// Bit-granular functions pack their payload LSB-first, 8 per byte.
    pub fn is_bit_function(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }

    pub fn quantity_limit(&self) -> u16 {
        match self {
            Self::ReadCoils | Self::ReadDiscreteInputs => MAX_READ_BITS,
            Self::ReadHoldingRegisters | Self::ReadInputRegisters => MAX_READ_REGS,
            Self::WriteMultipleCoils => MAX_WRITE_BITS,
            Self::WriteMultipleRegisters => MAX_WRITE_REGS,
            Self::WriteSingleCoil | Self::WriteSingleRegister => 1,
        }
    }

    pub fn quantity_ok(&self, quantity: u16) -> bool {
        quantity >= 1 && quantity <= self.quantity_limit()
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadCoils => "READ_COILS",
            Self::ReadDiscreteInputs => "READ_DISCRETE_INPUTS",
            Self::ReadHoldingRegisters => "READ_HOLDING_REGISTERS",
            Self::ReadInputRegisters => "READ_INPUT_REGISTERS",
            Self::WriteSingleCoil => "WRITE_SINGLE_COIL",
            Self::WriteSingleRegister => "WRITE_SINGLE_REGISTER",
            Self::WriteMultipleCoils => "WRITE_MULTIPLE_COILS",
            Self::WriteMultipleRegisters => "WRITE_MULTIPLE_REGISTERS",
        };
        write!(f, "{}", name)
    }
}

/// One request or response PDU.
///
/// `quantity` is meaningful for requests; responses carry their size in
/// `payload` and an exception code instead of data when `exception` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusPdu {
    pub function: FunctionCode,
    pub start: u16,
    pub quantity: u16,
    pub payload: Vec<u8>,
    pub is_response: bool,
    pub exception: Option<u8>,
}

impl ModbusPdu {
    pub fn read_request(function: FunctionCode, start: u16, quantity: u16) -> Self {
        Self {
            function,
            start,
            quantity,
            payload: Vec::new(),
            is_response: false,
            exception: None,
        }
    }

    pub fn write_request(function: FunctionCode, start: u16, quantity: u16, payload: Vec<u8>) -> Self {
        Self {
            function,
            start,
            quantity,
            payload,
            is_response: false,
            exception: None,
        }
    }

    pub fn response(function: FunctionCode, start: u16, quantity: u16, payload: Vec<u8>) -> Self {
        Self {
            function,
            start,
            quantity,
            payload,
            is_response: true,
            exception: None,
        }
    }

    pub fn exception(function: FunctionCode, start: u16, code: u8) -> Self {
        Self {
            function,
            start,
            quantity: 0,
            payload: Vec::new(),
            is_response: true,
            exception: Some(code),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Serialize for the wire. Fails (None) on a quantity outside the
    /// function's limit, mirroring the execute-side checks.
    pub fn encode(&self) -> Option<Vec<u8>> {
        if self.is_response {
            return Some(self.encode_response());
        }
        if !self.function.quantity_ok(self.quantity) {
            return None;
        }

        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.push(self.function as u8);
        out.extend_from_slice(&self.start.to_be_bytes());
        match self.function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                out.extend_from_slice(&self.quantity.to_be_bytes());
            }
            FunctionCode::WriteSingleCoil => {
                let on = self.payload.first().map(|&b| b != 0).unwrap_or(false);
                out.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            FunctionCode::WriteSingleRegister => {
                if self.payload.len() != 2 {
                    return None;
                }
                out.extend_from_slice(&self.payload);
            }
            FunctionCode::WriteMultipleCoils => {
                let expected = bit_payload_len(self.quantity);
                if self.payload.len() != expected {
                    return None;
                }
                out.extend_from_slice(&self.quantity.to_be_bytes());
                out.push(expected as u8);
                out.extend_from_slice(&self.payload);
            }
            FunctionCode::WriteMultipleRegisters => {
                let expected = self.quantity as usize * 2;
                if self.payload.len() != expected {
                    return None;
                }
                out.extend_from_slice(&self.quantity.to_be_bytes());
                out.push(expected as u8);
                out.extend_from_slice(&self.payload);
            }
        }
        Some(out)
    }

    fn encode_response(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        match self.exception {
            Some(code) => {
                out.push(self.function as u8 | EXCEPTION_FLAG);
                out.extend_from_slice(&self.start.to_be_bytes());
                out.push(code);
            }
            None => {
                out.push(self.function as u8);
                out.extend_from_slice(&self.start.to_be_bytes());
                out.push(self.payload.len() as u8);
                out.extend_from_slice(&self.payload);
            }
        }
        out
    }

    /// Encoded length without serializing; used when bundling sections.
    pub fn encoded_len(&self) -> usize {
        if self.is_response {
            match self.exception {
                Some(_) => 4,
                None => 4 + self.payload.len(),
            }
        } else {
            match self.function {
                FunctionCode::WriteMultipleCoils => 6 + bit_payload_len(self.quantity),
                FunctionCode::WriteMultipleRegisters => 6 + self.quantity as usize * 2,
                _ => 5,
            }
        }
    }
}

/// Whether a section body has the shape of a response PDU.
///
/// A read request and a one-byte response are both five bytes long; the
/// dispatcher resolves that collision by trying the pending-operation
/// queue first.
pub fn looks_like_response(pdu: &[u8]) -> bool {
    if pdu.len() < 4 {
        return false;
    }
    if pdu[0] & EXCEPTION_FLAG != 0 {
        return pdu.len() == 4;
    }
    match FunctionCode::from_byte(pdu[0]) {
        Some(function) if function.is_read() => pdu.len() == 4 + pdu[3] as usize,
        _ => false,
    }
}

/// Parse a request PDU. Returns the PDU or the failure kind a responder
/// should echo as an exception code.
pub fn parse_request(pdu: &[u8]) -> Result<ModbusPdu, ProtocolErrorKind> {
    if pdu.len() < 3 {
        return Err(ProtocolErrorKind::InvalidDataValue);
    }
    let function = FunctionCode::from_byte(pdu[0]).ok_or(ProtocolErrorKind::InvalidFunction)?;
    if pdu[0] & EXCEPTION_FLAG != 0 {
        return Err(ProtocolErrorKind::InvalidFunction);
    }
    let start = u16::from_be_bytes([pdu[1], pdu[2]]);

    match function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            if pdu.len() != 5 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            if !function.quantity_ok(quantity) {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            Ok(ModbusPdu::read_request(function, start, quantity))
        }
        FunctionCode::WriteSingleCoil => {
            if pdu.len() != 5 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            if value != 0x0000 && value != 0xFF00 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            let bit = u8::from(value == 0xFF00);
            Ok(ModbusPdu::write_request(function, start, 1, vec![bit]))
        }
        FunctionCode::WriteSingleRegister => {
            if pdu.len() != 5 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            Ok(ModbusPdu::write_request(
                function,
                start,
                1,
                pdu[3..5].to_vec(),
            ))
        }
        FunctionCode::WriteMultipleCoils => {
            if pdu.len() < 6 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let count = pdu[5] as usize;
            if !function.quantity_ok(quantity)
                || count != bit_payload_len(quantity)
                || pdu.len() != 6 + count
            {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            Ok(ModbusPdu::write_request(
                function,
                start,
                quantity,
                pdu[6..].to_vec(),
            ))
        }
        FunctionCode::WriteMultipleRegisters => {
            if pdu.len() < 6 {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let count = pdu[5] as usize;
            if !function.quantity_ok(quantity)
                || count != quantity as usize * 2
                || pdu.len() != 6 + count
            {
                return Err(ProtocolErrorKind::InvalidDataValue);
            }
            Ok(ModbusPdu::write_request(
                function,
                start,
                quantity,
                pdu[6..].to_vec(),
            ))
        }
    }
}

/// Parse a response PDU (normal or exception).
pub fn parse_response(pdu: &[u8]) -> Option<ModbusPdu> {
    if pdu.len() < 4 {
        return None;
    }
    let function = FunctionCode::from_byte(pdu[0])?;
    let start = u16::from_be_bytes([pdu[1], pdu[2]]);

    if pdu[0] & EXCEPTION_FLAG != 0 {
        if pdu.len() != 4 {
            return None;
        }
        return Some(ModbusPdu::exception(function, start, pdu[3]));
    }

    let count = pdu[3] as usize;
    if pdu.len() != 4 + count {
        return None;
    }
    Some(ModbusPdu::response(function, start, 0, pdu[4..].to_vec()))
}

/// Bytes needed for `quantity` packed bits.
pub fn bit_payload_len(quantity: u16) -> usize {
    (quantity as usize + 7) / 8
}

/// Pack bits LSB-first, 8 per byte.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bit_payload_len(bits.len() as u16)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `quantity` bits, LSB-first.
pub fn unpack_bits(packed: &[u8], quantity: u16) -> Vec<bool> {
    (0..quantity as usize)
        .map(|i| {
            packed
                .get(i / 8)
                .map(|&byte| byte & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Pack registers big-endian.
pub fn pack_regs(regs: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(regs.len() * 2);
    for &reg in regs {
        out.extend_from_slice(&reg.to_be_bytes());
    }
    out
}

/// Reassemble big-endian registers; trailing odd bytes are dropped.
pub fn unpack_regs(packed: &[u8]) -> Vec<i16> {
    packed
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_round_trip() {
        let pdu = ModbusPdu::read_request(FunctionCode::ReadHoldingRegisters, 0x0010, 2);
        let bytes = pdu.encode().unwrap();
        assert_eq!(bytes, vec![0x03, 0x00, 0x10, 0x00, 0x02]);
        assert!(!looks_like_response(&bytes));

        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn response_echoes_address() {
        let pdu = ModbusPdu::response(
            FunctionCode::ReadHoldingRegisters,
            0x0010,
            0,
            pack_regs(&[42, -1]),
        );
        let bytes = pdu.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x03, 0x00, 0x10, 0x04, 0x00, 0x2A, 0xFF, 0xFF]
        );
        assert!(looks_like_response(&bytes));

        let parsed = parse_response(&bytes).unwrap();
        assert_eq!(parsed.start, 0x0010);
        assert_eq!(unpack_regs(&parsed.payload), vec![42, -1]);
    }

    #[test]
    fn exception_round_trip() {
        let code = ProtocolErrorKind::InvalidDataAddress.to_exception_code();
        let pdu = ModbusPdu::exception(FunctionCode::ReadCoils, 7, code);
        let bytes = pdu.encode().unwrap();
        assert_eq!(bytes, vec![0x81, 0x00, 0x07, 0x02]);
        assert!(looks_like_response(&bytes));

        let parsed = parse_response(&bytes).unwrap();
        assert!(parsed.is_exception());
        assert_eq!(parsed.exception, Some(code));
        assert_eq!(
            ProtocolErrorKind::from_exception_code(code),
            Some(ProtocolErrorKind::InvalidDataAddress)
        );
    }

    #[test]
    fn write_single_coil_values() {
        let on = ModbusPdu::write_request(FunctionCode::WriteSingleCoil, 3, 1, vec![1]);
        assert_eq!(on.encode().unwrap(), vec![0x05, 0x00, 0x03, 0xFF, 0x00]);

        let off = ModbusPdu::write_request(FunctionCode::WriteSingleCoil, 3, 1, vec![0]);
        assert_eq!(off.encode().unwrap(), vec![0x05, 0x00, 0x03, 0x00, 0x00]);

        // 0xFF00 and 0x0000 are the only legal wire values
        assert_eq!(
            parse_request(&[0x05, 0x00, 0x03, 0x12, 0x34]),
            Err(ProtocolErrorKind::InvalidDataValue)
        );
    }

    #[test]
    fn write_multiple_round_trip() {
        let bits = vec![true, false, true, true, false, false, false, false, true];
        let pdu = ModbusPdu::write_request(
            FunctionCode::WriteMultipleCoils,
            0x0100,
            bits.len() as u16,
            pack_bits(&bits),
        );
        let bytes = pdu.encode().unwrap();
        assert_eq!(bytes[5], 2); // byte count
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(unpack_bits(&parsed.payload, 9), bits);

        let regs = vec![1, -300, 0x1234];
        let pdu = ModbusPdu::write_request(
            FunctionCode::WriteMultipleRegisters,
            0,
            3,
            pack_regs(&regs),
        );
        let parsed = parse_request(&pdu.encode().unwrap()).unwrap();
        assert_eq!(unpack_regs(&parsed.payload), regs);
    }

    #[test]
    fn quantity_limits() {
        assert!(FunctionCode::ReadCoils.quantity_ok(2000));
        assert!(!FunctionCode::ReadCoils.quantity_ok(2001));
        assert!(FunctionCode::ReadHoldingRegisters.quantity_ok(125));
        assert!(!FunctionCode::ReadHoldingRegisters.quantity_ok(126));
        assert!(FunctionCode::WriteMultipleCoils.quantity_ok(1968));
        assert!(!FunctionCode::WriteMultipleCoils.quantity_ok(1969));
        assert!(FunctionCode::WriteMultipleRegisters.quantity_ok(123));
        assert!(!FunctionCode::WriteMultipleRegisters.quantity_ok(124));
        assert!(!FunctionCode::ReadCoils.quantity_ok(0));

        let over = ModbusPdu::read_request(FunctionCode::ReadHoldingRegisters, 0, 126);
        assert!(over.encode().is_none());
    }

    #[test]
    fn unknown_function_is_rejected() {
        assert_eq!(
            parse_request(&[0x2B, 0x00, 0x00, 0x00, 0x01]),
            Err(ProtocolErrorKind::InvalidFunction)
        );
        assert!(FunctionCode::from_byte(0x2B).is_none());
        // Exception flag is transparent for code lookup
        assert_eq!(
            FunctionCode::from_byte(0x83),
            Some(FunctionCode::ReadHoldingRegisters)
        );
    }

    #[test]
    fn bit_packing_lsb_first() {
        let bits = vec![true, false, false, false, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0x01, 0x01]);
        assert_eq!(unpack_bits(&packed, 9), bits);
    }

    #[test]
    fn encoded_len_matches_encode() {
        let cases = vec![
            ModbusPdu::read_request(FunctionCode::ReadCoils, 0, 10),
            ModbusPdu::write_request(FunctionCode::WriteSingleRegister, 1, 1, vec![0, 5]),
            ModbusPdu::write_request(
                FunctionCode::WriteMultipleRegisters,
                0,
                2,
                pack_regs(&[1, 2]),
            ),
            ModbusPdu::response(FunctionCode::ReadCoils, 0, 0, vec![0x03]),
            ModbusPdu::exception(
                FunctionCode::ReadCoils,
                0,
                ProtocolErrorKind::DeviceFailure.to_exception_code(),
            ),
        ];
        for pdu in cases {
            assert_eq!(pdu.encode().unwrap().len(), pdu.encoded_len());
        }
    }
}
