//! Chunk-level parser for XDF files.
//!
//! Frame-first: the byte stream is split into raw length-delimited
//! frames, then each frame is interpreted in file order against a running
//! registry of stream schemas — sample payloads cannot be decoded without
//! the format and channel count from the owning stream's header. The test
//! suite leans on this module to check that everything the writer emits
//! survives a round trip.

mod content;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::chunks::{Chunk, Format, Tag};
use crate::errors::{RecorderError, Result};

pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<Chunk>> {
    parse_bytes(&fs::read(path)?)
}

pub fn parse_bytes(bytes: &[u8]) -> Result<Vec<Chunk>> {
    let body = bytes.strip_prefix(b"XDF:").ok_or_else(|| {
        RecorderError::Parse("file does not begin with the XDF: magic".into())
    })?;
    let (rest, frames) = content::frames(body)
        .map_err(|_| RecorderError::Parse("malformed chunk framing".into()))?;
    if !rest.is_empty() {
        return Err(RecorderError::Parse(format!(
            "{} trailing bytes after the last well-formed chunk",
            rest.len()
        )));
    }
    match frames.first() {
        Some(first) if first.tag == Tag::FileHeader => {}
        _ => return Err(RecorderError::Parse("first chunk is not a FileHeader".into())),
    }

    let mut registry: HashMap<u32, (Format, u32)> = HashMap::new();
    let mut chunks = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let chunk = match frame.tag {
            Tag::FileHeader => {
                if index != 0 {
                    return Err(RecorderError::Parse("more than one FileHeader".into()));
                }
                Chunk::FileHeader(content::file_header(frame.content)?)
            }
            Tag::StreamHeader => {
                let header = content::stream_header(frame.content)?;
                registry.insert(
                    header.stream_id,
                    (header.info.channel_format, header.info.channel_count),
                );
                Chunk::StreamHeader(header)
            }
            Tag::Samples => {
                let stream_id = content::peek_stream_id(frame.content)?;
                let (format, channels) = *registry.get(&stream_id).ok_or_else(|| {
                    RecorderError::Parse(format!(
                        "samples for stream id {stream_id} before its header"
                    ))
                })?;
                Chunk::Samples(content::samples(frame.content, format, channels)?)
            }
            Tag::ClockOffset => {
                let offset = content::clock_offset(frame.content)?;
                if !registry.contains_key(&offset.stream_id) {
                    return Err(RecorderError::Parse(format!(
                        "clock offset for stream id {} before its header",
                        offset.stream_id
                    )));
                }
                Chunk::ClockOffset(offset)
            }
            Tag::Boundary => Chunk::Boundary(content::boundary(frame.content)?),
            Tag::StreamFooter => {
                let footer = content::stream_footer(frame.content)?;
                if !registry.contains_key(&footer.stream_id) {
                    return Err(RecorderError::Parse(format!(
                        "footer for stream id {} before its header",
                        footer.stream_id
                    )));
                }
                Chunk::StreamFooter(footer)
            }
        };
        chunks.push(chunk);
    }
    Ok(chunks)
}
