//! Conversion between engineering values and 16-bit register words.
//!
//! 32-bit types are sent high word first.

use crate::battery::{DataType, ModbusError, RegisterItem};

/// Scale and split `value` into register words for `item`.
///
/// The raw value is range checked against the declared type, so anything
/// returned here is safe to put on the wire.
pub fn encode(value: f64, item: &RegisterItem) -> Result<Vec<u16>, ModbusError> {
    let raw = to_raw(value, item);
    let (min, max) = item.data_type.range();
    if !raw.is_finite() || raw < min || raw > max {
        return Err(ModbusError::RegisterRange {
            value: raw,
            data_type: item.data_type,
        });
    }

    let raw = raw as i64;
    Ok(match item.data_type {
        DataType::Uint16 => vec![raw as u16],
        DataType::Int16 => vec![raw as i16 as u16],
        DataType::Uint32 => split(raw as u32),
        DataType::Int32 => split(raw as i32 as u32),
    })
}

/// Join the words for `item` and apply `(raw - offset) * factor`.
pub fn decode(words: &[u16], item: &RegisterItem) -> Result<f64, ModbusError> {
    let expected = item.data_type.word_count() as usize;
    if words.len() < expected {
        return Err(ModbusError::Decode {
            expected,
            got: words.len(),
        });
    }

    let raw = match item.data_type {
        DataType::Uint16 => words[0] as f64,
        DataType::Int16 => words[0] as i16 as f64,
        DataType::Uint32 => join(words[0], words[1]) as f64,
        DataType::Int32 => join(words[0], words[1]) as i32 as f64,
    };
    Ok((raw - item.offset) * item.factor)
}

/// Raw register value before range checking, rounded to the nearest count.
pub fn to_raw(value: f64, item: &RegisterItem) -> f64 {
    (value / item.factor + item.offset).round()
}

fn split(v: u32) -> Vec<u16> {
    vec![(v >> 16) as u16, v as u16]
}

fn join(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}
