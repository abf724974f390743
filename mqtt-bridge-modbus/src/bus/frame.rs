//! Modbus-RTU framing: request encoding, response decoding and line timing.
//!
//! ```text
//! request  [slave][function][addr hi][addr lo][qty/value hi][qty/value lo][crc lo][crc hi]
//! response [slave][function][byte count][data ...][crc lo][crc hi]
//! fault    [slave][function | 0x80][exception][crc lo][crc hi]
//! ```

use std::time::Duration;

use crate::bus::ModbusStatus;
use crate::model::{FunctionCode, MAX_REGISTERS, MAX_SLAVE_ID, SerialFormat};

/// Coil count limit of one bit read.
pub const MAX_BITS: u16 = 2000;

/// Baud rate above which the inter-frame silence is fixed.
const FIXED_SILENCE_BAUD: u32 = 19200;
const FIXED_SILENCE: Duration = Duration::from_micros(1750);

/// One bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub slave_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    /// Registers or bits to read; 1 for writes.
    pub quantity: u16,
    /// Value of a write.
    pub value: u16,
}

impl Request {
    pub fn read(slave_id: u8, function: FunctionCode, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            value: 0,
        }
    }

    pub fn write(slave_id: u8, function: FunctionCode, address: u16, value: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity: 1,
            value,
        }
    }

    /// Reject requests that must not reach the line.
    pub fn validate(&self) -> Result<(), ModbusStatus> {
        if self.slave_id == 0 || self.slave_id > MAX_SLAVE_ID {
            return Err(ModbusStatus::InvalidSlaveId);
        }
        if self.function.is_read() {
            let limit = if self.function.reads_bits() {
                MAX_BITS
            } else {
                MAX_REGISTERS
            };
            if self.quantity == 0 || self.quantity > limit {
                return Err(ModbusStatus::IllegalDataValue);
            }
        }
        Ok(())
    }
}

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Encode a request into an RTU frame.
///
/// Function 16 always writes a single register.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut frame = Vec::with_capacity(11);
    frame.push(request.slave_id);
    frame.push(request.function.code());
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        FunctionCode::ReadCoil
        | FunctionCode::ReadDiscrete
        | FunctionCode::ReadHolding
        | FunctionCode::ReadInput => frame.extend_from_slice(&request.quantity.to_be_bytes()),
        FunctionCode::WriteCoil => {
            let value: u16 = if request.value != 0 { 0xFF00 } else { 0x0000 };
            frame.extend_from_slice(&value.to_be_bytes());
        }
        FunctionCode::WriteHolding => frame.extend_from_slice(&request.value.to_be_bytes()),
        FunctionCode::WriteMultipleHolding => {
            frame.extend_from_slice(&1u16.to_be_bytes());
            frame.push(2);
            frame.extend_from_slice(&request.value.to_be_bytes());
        }
    }

    append_crc(&mut frame);
    frame
}

/// Total length of the response being received, once the header allows
/// telling it.
pub fn expected_response_len(function: FunctionCode, received: &[u8]) -> Option<usize> {
    if received.len() < 2 {
        return None;
    }
    if received[1] & 0x80 != 0 {
        return Some(5);
    }
    if function.is_read() {
        received.get(2).map(|count| 5 + *count as usize)
    } else {
        Some(8)
    }
}

/// Longest well-formed response to a request.
pub fn max_response_len(request: &Request) -> usize {
    match request.function {
        FunctionCode::ReadCoil | FunctionCode::ReadDiscrete => {
            5 + (request.quantity as usize).div_ceil(8)
        }
        FunctionCode::ReadHolding | FunctionCode::ReadInput => 5 + 2 * request.quantity as usize,
        _ => 8,
    }
}

/// Validate a complete response frame and extract its words.
///
/// Checks run in order: slave id, exception, function, CRC. Register reads
/// yield big-endian words; bit reads pack the status bytes low byte first,
/// so bit 0 of word 0 is the first coil.
pub fn decode_response(request: &Request, frame: &[u8]) -> Result<Vec<u16>, ModbusStatus> {
    if frame.len() < 5 {
        return Err(ModbusStatus::ResponseTimedOut);
    }
    if frame[0] != request.slave_id {
        return Err(ModbusStatus::InvalidSlaveId);
    }
    if frame[1] & 0x80 != 0 {
        return Err(ModbusStatus::from_code(frame[2]));
    }
    if frame[1] != request.function.code() {
        return Err(ModbusStatus::InvalidFunction);
    }

    let (body, crc) = frame.split_at(frame.len() - 2);
    if crc16(body) != u16::from_le_bytes([crc[0], crc[1]]) {
        return Err(ModbusStatus::InvalidCrc);
    }

    if request.function.is_write() {
        return Ok(Vec::new());
    }

    let count = body[2] as usize;
    let data = body.get(3..3 + count).ok_or(ModbusStatus::ResponseTimedOut)?;

    let mut words: Vec<u16> = if request.function.reads_bits() {
        data.chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect()
    } else {
        data.chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    };

    if !request.function.reads_bits() {
        words.truncate(request.quantity as usize);
    }
    Ok(words)
}

/// Time one character occupies on the line.
pub fn char_time(baud: u32, format: SerialFormat) -> Duration {
    let baud = u64::from(baud.max(1));
    Duration::from_micros(u64::from(format.bits_per_char()) * 1_000_000 / baud)
}

/// Time `len` bytes occupy on the line.
pub fn frame_time(len: usize, baud: u32, format: SerialFormat) -> Duration {
    char_time(baud, format) * len as u32
}

/// Silence required between frames: 3.5 character times, fixed above
/// 19200 baud.
pub fn inter_frame_silence(baud: u32, format: SerialFormat) -> Duration {
    if baud > FIXED_SILENCE_BAUD {
        FIXED_SILENCE
    } else {
        char_time(baud, format) * 7 / 2
    }
}

/// Format bytes as space separated lower-case hex.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
