//! Variable-width length fields and sample payload encoding.

use crate::chunks::{Format, Sample, Values};
use crate::errors::{RecorderError, Result};

/// Appends `NumLengthBytes` followed by the length itself, using the
/// smallest of the 1/4/8-byte forms (1 only for lengths below 256).
pub(crate) fn push_varlen(buf: &mut Vec<u8>, len: u64) {
    if len < 256 {
        buf.push(1);
        buf.push(len as u8);
    } else if len <= u64::from(u32::MAX) {
        buf.push(4);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
    } else {
        buf.push(8);
        buf.extend_from_slice(&len.to_le_bytes());
    }
}

/// Encodes a batch into the content of a Samples chunk, after the stream
/// id: sample count, then per sample an optional timestamp and the
/// channel values in the stream's format.
pub(crate) fn encode_samples(
    buf: &mut Vec<u8>,
    samples: &[Sample],
    format: Format,
    channel_count: u32,
    regular_rate: bool,
) -> Result<()> {
    push_varlen(buf, samples.len() as u64);
    for sample in samples {
        match sample.timestamp {
            Some(timestamp) => {
                buf.push(8);
                buf.extend_from_slice(&timestamp.to_le_bytes());
            }
            None if regular_rate => buf.push(0),
            None => {
                return Err(RecorderError::OrderViolation(
                    "omitted timestamp on an irregular-rate stream".into(),
                ))
            }
        }
        if sample.values.format() != format {
            return Err(RecorderError::OrderViolation(format!(
                "sample format {:?} does not match stream format {:?}",
                sample.values.format(),
                format
            )));
        }
        if sample.values.len() != channel_count as usize {
            return Err(RecorderError::OrderViolation(format!(
                "expected {} channel values but got {}",
                channel_count,
                sample.values.len()
            )));
        }
        push_values(buf, &sample.values);
    }
    Ok(())
}

fn push_values(buf: &mut Vec<u8>, values: &Values) {
    match values {
        Values::Int8(items) => buf.extend(items.iter().map(|value| *value as u8)),
        Values::Int16(items) => {
            for value in items {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        Values::Int32(items) => {
            for value in items {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        Values::Int64(items) => {
            for value in items {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        Values::Float32(items) => {
            for value in items {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        Values::Float64(items) => {
            for value in items {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        Values::String(items) => {
            for value in items {
                push_varlen(buf, value.len() as u64);
                buf.extend_from_slice(value.as_bytes());
            }
        }
    }
}
