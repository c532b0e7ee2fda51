//! Append-only XDF serializer.
//!
//! One [`XdfWriter`] owns the output destination; clones of the handle
//! share it through a mutex, so acquisition workers on different threads
//! can append concurrently. Each chunk is framed into a single buffer and
//! written with one `write_all`, which is what makes chunks atomic at the
//! granularity readers care about.

mod encode;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;
use xmltree::{Element, XMLNode};

use crate::chunks::{Format, Sample, Tag, BOUNDARY_UUID};
use crate::errors::{RecorderError, Result};
use crate::source::StreamDescriptor;

use encode::{encode_samples, push_varlen};

/// Boundary cadence: a Boundary chunk goes out once this much file growth
/// or this much wall time has passed, whichever comes first. Readers use
/// them as resynchronization points and do not rely on the exact figures.
const BOUNDARY_BYTES: u64 = 10 * 1024 * 1024;
const BOUNDARY_INTERVAL: Duration = Duration::from_secs(10);

struct StreamEntry {
    format: Format,
    channel_count: u32,
    regular_rate: bool,
    footer_written: bool,
    // tallies kept so close() can footer streams nobody finalized
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
    sample_count: u64,
    clock_offsets: u64,
}

struct WriterState<W: Write> {
    dest: W,
    failed: bool,
    closed: bool,
    streams: HashMap<u32, StreamEntry>,
    bytes_since_boundary: u64,
    last_boundary: Instant,
}

/// Shared handle to the single writer of one XDF file.
pub struct XdfWriter<W: Write> {
    state: Arc<Mutex<WriterState<W>>>,
}

impl<W: Write> Clone for XdfWriter<W> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl XdfWriter<BufWriter<File>> {
    /// Creates (or overwrites) `path` and writes the magic preamble plus
    /// the FileHeader chunk.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> XdfWriter<W> {
    /// Wraps an arbitrary destination; used directly by the tests.
    pub fn new(mut dest: W) -> Result<Self> {
        dest.write_all(b"XDF:")?;
        let mut state = WriterState {
            dest,
            failed: false,
            closed: false,
            streams: HashMap::new(),
            bytes_since_boundary: 0,
            last_boundary: Instant::now(),
        };
        let mut xml = Vec::new();
        file_header_xml()
            .write(&mut xml)
            .map_err(xml_write_error)?;
        state.append_chunk(Tag::FileHeader, &xml)?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Must precede any data for `stream_id`.
    pub fn write_stream_header(&self, stream_id: u32, descriptor: &StreamDescriptor) -> Result<()> {
        let mut state = self.state.lock()?;
        state.guard()?;
        if state.streams.contains_key(&stream_id) {
            return Err(RecorderError::OrderViolation(format!(
                "duplicate stream header for stream id {stream_id}"
            )));
        }
        let mut content = stream_id.to_le_bytes().to_vec();
        descriptor
            .header_xml()
            .write(&mut content)
            .map_err(xml_write_error)?;
        state.append_data(Tag::StreamHeader, &content)?;
        state.streams.insert(
            stream_id,
            StreamEntry {
                format: descriptor.channel_format,
                channel_count: descriptor.channel_count,
                regular_rate: descriptor.nominal_srate.is_some(),
                footer_written: false,
                first_timestamp: None,
                last_timestamp: None,
                sample_count: 0,
                clock_offsets: 0,
            },
        );
        Ok(())
    }

    /// Appends one Samples chunk holding the whole batch. Empty batches
    /// are a no-op.
    pub fn write_samples(&self, stream_id: u32, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock()?;
        state.guard()?;
        let (format, channel_count, regular_rate) = {
            let entry = state.open_entry(stream_id)?;
            (entry.format, entry.channel_count, entry.regular_rate)
        };
        let mut content = stream_id.to_le_bytes().to_vec();
        encode_samples(&mut content, samples, format, channel_count, regular_rate)?;
        state.append_data(Tag::Samples, &content)?;
        if let Some(entry) = state.streams.get_mut(&stream_id) {
            for sample in samples {
                if let Some(timestamp) = sample.timestamp {
                    if entry.first_timestamp.is_none() {
                        entry.first_timestamp = Some(timestamp);
                    }
                    entry.last_timestamp = Some(timestamp);
                }
            }
            entry.sample_count += samples.len() as u64;
        }
        Ok(())
    }

    pub fn write_clock_offset(
        &self,
        stream_id: u32,
        collection_time: f64,
        offset: f64,
    ) -> Result<()> {
        let mut state = self.state.lock()?;
        state.guard()?;
        state.open_entry(stream_id)?;
        let mut content = [0u8; 20];
        content[0..4].copy_from_slice(&stream_id.to_le_bytes());
        content[4..12].copy_from_slice(&collection_time.to_le_bytes());
        content[12..20].copy_from_slice(&offset.to_le_bytes());
        state.append_data(Tag::ClockOffset, &content)?;
        if let Some(entry) = state.streams.get_mut(&stream_id) {
            entry.clock_offsets += 1;
        }
        Ok(())
    }

    /// After this, no further data for `stream_id` is accepted.
    pub fn write_stream_footer(
        &self,
        stream_id: u32,
        first_timestamp: Option<f64>,
        last_timestamp: Option<f64>,
        sample_count: u64,
        clock_offsets: u64,
    ) -> Result<()> {
        let mut state = self.state.lock()?;
        state.guard()?;
        state.open_entry(stream_id)?;
        let mut content = stream_id.to_le_bytes().to_vec();
        footer_xml(first_timestamp, last_timestamp, sample_count, clock_offsets)
            .write(&mut content)
            .map_err(xml_write_error)?;
        state.append_data(Tag::StreamFooter, &content)?;
        if let Some(entry) = state.streams.get_mut(&stream_id) {
            entry.footer_written = true;
        }
        Ok(())
    }

    /// Appends a Boundary chunk unconditionally and resets the cadence.
    pub fn write_boundary(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.guard()?;
        state.append_boundary()
    }

    /// Flushes and closes. Streams whose footer was never written get one
    /// from the writer's own tallies, so the file stays well-formed even
    /// when workers died without finalizing. Idempotent; best-effort once
    /// the writer has failed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if state.failed {
            let _ = state.dest.flush();
            return Err(failed_error());
        }

        let mut pending: Vec<(u32, Option<f64>, Option<f64>, u64, u64)> = state
            .streams
            .iter()
            .filter(|(_, entry)| !entry.footer_written)
            .map(|(id, entry)| {
                (
                    *id,
                    entry.first_timestamp,
                    entry.last_timestamp,
                    entry.sample_count,
                    entry.clock_offsets,
                )
            })
            .collect();
        pending.sort_by_key(|(id, ..)| *id);

        let mut first_error = None;
        for (stream_id, first, last, samples, offsets) in pending {
            debug!(stream_id, "writing missing stream footer on close");
            let mut content = stream_id.to_le_bytes().to_vec();
            let result = footer_xml(first, last, samples, offsets)
                .write(&mut content)
                .map_err(xml_write_error)
                .and_then(|()| state.append_chunk(Tag::StreamFooter, &content));
            if let Err(err) = result {
                first_error.get_or_insert(err);
                break;
            }
            if let Some(entry) = state.streams.get_mut(&stream_id) {
                entry.footer_written = true;
            }
        }

        if let Err(err) = state.dest.flush() {
            state.failed = true;
            first_error.get_or_insert(RecorderError::Io(err));
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// True once an I/O failure has latched; later writes fail fast.
    pub fn is_failed(&self) -> bool {
        self.state.lock().map(|state| state.failed).unwrap_or(true)
    }
}

impl<W: Write> WriterState<W> {
    fn guard(&self) -> Result<()> {
        if self.failed {
            Err(failed_error())
        } else if self.closed {
            Err(RecorderError::OrderViolation("writer already closed".into()))
        } else {
            Ok(())
        }
    }

    fn open_entry(&self, stream_id: u32) -> Result<&StreamEntry> {
        let entry = self.streams.get(&stream_id).ok_or_else(|| {
            RecorderError::OrderViolation(format!(
                "no stream header written for stream id {stream_id}"
            ))
        })?;
        if entry.footer_written {
            return Err(RecorderError::OrderViolation(format!(
                "stream id {stream_id} already has its footer"
            )));
        }
        Ok(entry)
    }

    /// Frames and appends one chunk. An I/O failure latches the failed
    /// state so later calls return without touching the destination.
    fn append_chunk(&mut self, tag: Tag, content: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(content.len() + 11);
        push_varlen(&mut frame, content.len() as u64 + 2);
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(content);
        if let Err(err) = self.dest.write_all(&frame) {
            self.failed = true;
            return Err(err.into());
        }
        self.bytes_since_boundary += frame.len() as u64;
        Ok(())
    }

    /// Data-path append; may be preceded by a Boundary chunk per cadence.
    fn append_data(&mut self, tag: Tag, content: &[u8]) -> Result<()> {
        if self.bytes_since_boundary >= BOUNDARY_BYTES
            || self.last_boundary.elapsed() >= BOUNDARY_INTERVAL
        {
            self.append_boundary()?;
        }
        self.append_chunk(tag, content)
    }

    fn append_boundary(&mut self) -> Result<()> {
        self.append_chunk(Tag::Boundary, &BOUNDARY_UUID)?;
        self.bytes_since_boundary = 0;
        self.last_boundary = Instant::now();
        Ok(())
    }
}

fn file_header_xml() -> Element {
    let mut info = Element::new("info");
    let mut version = Element::new("version");
    version.children.push(XMLNode::Text("1.0".to_string()));
    info.children.push(XMLNode::Element(version));
    info
}

fn footer_xml(
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
    sample_count: u64,
    clock_offsets: u64,
) -> Element {
    let mut info = Element::new("info");
    let mut push = |name: &str, text: String| {
        let mut child = Element::new(name);
        child.children.push(XMLNode::Text(text));
        info.children.push(XMLNode::Element(child));
    };
    if let Some(first) = first_timestamp {
        push("first_timestamp", first.to_string());
    }
    if let Some(last) = last_timestamp {
        push("last_timestamp", last.to_string());
    }
    push("sample_count", sample_count.to_string());
    push("clock_offsets", clock_offsets.to_string());
    info
}

fn failed_error() -> RecorderError {
    RecorderError::Io(io::Error::new(
        io::ErrorKind::Other,
        "writer is in failed state after an earlier I/O error",
    ))
}

// Element::write only fails on the underlying sink, and ours is a Vec, so
// this path is effectively unreachable; it still must map somewhere.
fn xml_write_error(err: xmltree::Error) -> RecorderError {
    RecorderError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
}
