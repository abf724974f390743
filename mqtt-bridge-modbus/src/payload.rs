//! Conversion between register words and MQTT payloads.

use crate::error::WriteError;
use crate::model::{DataType, Datapoint, FunctionCode, RegisterSlice};

/// Fractional digits kept when rendering decimals.
const DECIMAL_DIGITS: usize = 6;

/// Render the response words of a read as a user payload.
///
/// A full-register `Int16` is read as two's complement; the other
/// single-word forms are unsigned.
///
/// Returns `None` when a numeric datapoint received no words.
pub fn decode_payload(dp: &Datapoint, words: &[u16]) -> Option<String> {
    if dp.data_type == DataType::Text {
        return Some(decode_text(words));
    }

    let first = *words.first()?;
    let scale = f64::from(dp.scale);

    let raw = match (dp.data_type, dp.register_slice) {
        (DataType::Int32 | DataType::UInt32 | DataType::Float32, _) if words.len() >= 2 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            match dp.data_type {
                DataType::Int32 => Raw::Signed(i64::from(bits as i32)),
                DataType::UInt32 => Raw::Unsigned(u64::from(bits)),
                _ => Raw::Float(f64::from(f32::from_bits(bits))),
            }
        }
        (DataType::Int64 | DataType::UInt64, _) if words.len() >= 4 => {
            let bits = words[..4]
                .iter()
                .fold(0u64, |acc, word| (acc << 16) | u64::from(*word));
            if dp.data_type == DataType::Int64 {
                Raw::Signed(bits as i64)
            } else {
                Raw::Unsigned(bits)
            }
        }
        (DataType::Int16, RegisterSlice::Full) => Raw::Signed(i64::from(first as i16)),
        (_, slice) => Raw::Unsigned(u64::from(slice.apply(first))),
    };

    Some(raw.render(scale))
}

enum Raw {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Raw {
    fn render(self, scale: f64) -> String {
        match self {
            // Unscaled integers keep their exact digits.
            Raw::Signed(v) if scale == 1.0 => v.to_string(),
            Raw::Unsigned(v) if scale == 1.0 => v.to_string(),
            Raw::Signed(v) => format_decimal(v as f64 * scale),
            Raw::Unsigned(v) => format_decimal(v as f64 * scale),
            Raw::Float(v) => format_decimal(v * scale),
        }
    }
}

/// High byte then low byte of every word, NUL bytes skipped.
fn decode_text(words: &[u16]) -> String {
    words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .filter(|byte| *byte != 0)
        .map(char::from)
        .collect()
}

/// Render a decimal with at most six fractional digits.
///
/// # Example
/// ```
/// use mqtt_bridge_modbus::payload::format_decimal;
///
/// assert_eq!(format_decimal(245.0 * 0.1), "24.5");
/// assert_eq!(format_decimal(-0.0000001), "0");
/// ```
pub fn format_decimal(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    let mut text = format!("{:.*}", DECIMAL_DIGITS, value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".to_string();
    }
    text
}

/// Parse an inbound write payload into the register or coil value.
pub fn parse_write_value(
    function: FunctionCode,
    scale: f32,
    payload: &str,
) -> Result<u16, WriteError> {
    let text = payload.trim();
    let invalid = || WriteError::InvalidPayload {
        payload: payload.to_string(),
    };

    match function {
        FunctionCode::WriteCoil => {
            if text.is_empty() {
                return Err(invalid());
            }
            if text.eq_ignore_ascii_case("true") {
                return Ok(1);
            }
            if text.eq_ignore_ascii_case("false") {
                return Ok(0);
            }
            Ok(u16::from(leading_integer(text) != 0))
        }
        FunctionCode::WriteHolding | FunctionCode::WriteMultipleHolding => {
            let value: f64 = text.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            let denom = if scale == 0.0 { 1.0 } else { f64::from(scale) };
            let word = (value / denom).round().clamp(0.0, f64::from(u16::MAX));
            Ok(word as u16)
        }
        other => Err(WriteError::UnsupportedFunction(other)),
    }
}

/// Integer prefix of `text`, 0 when it has none.
fn leading_integer(text: &str) -> i64 {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| {
            acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
        });
    if negative { -magnitude } else { magnitude }
}
