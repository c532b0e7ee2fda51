//! Writer-level invariants: framing round-trips, length encoding,
//! ordering contract, failure latching, and chunk atomicity under
//! concurrent appenders.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use strict_num::NonZeroPositiveF64;
use tempfile::tempdir;
use xdfrec::chunks::{Chunk, Format, Sample, Values};
use xdfrec::errors::RecorderError;
use xdfrec::reader;
use xdfrec::source::StreamDescriptor;
use xdfrec::writer::XdfWriter;

fn descriptor(uid: &str, format: Format, channels: u32, rate_hz: Option<f64>) -> StreamDescriptor {
    StreamDescriptor {
        uid: uid.to_string(),
        name: format!("{uid}-name"),
        stream_type: "Test".to_string(),
        hostname: "testhost".to_string(),
        source_id: uid.to_string(),
        channel_count: channels,
        channel_format: format,
        nominal_srate: rate_hz.and_then(NonZeroPositiveF64::new),
        metadata: None,
    }
}

fn float_sample(timestamp: f64, values: Vec<f32>) -> Sample {
    Sample {
        timestamp: Some(timestamp),
        values: Values::Float32(values),
    }
}

#[test]
fn framing_round_trip_preserves_every_chunk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("round_trip.xdf");

    let eeg = vec![
        float_sample(10.0, vec![1.0, 2.0]),
        float_sample(10.01, vec![3.0, 4.0]),
        float_sample(10.02, vec![5.0, 6.0]),
    ];
    let markers = vec![Sample {
        timestamp: Some(10.5),
        values: Values::String(vec!["go".to_string()]),
    }];

    let writer = XdfWriter::create(&path).unwrap();
    writer
        .write_stream_header(1, &descriptor("eeg", Format::Float32, 2, Some(100.0)))
        .unwrap();
    writer
        .write_stream_header(2, &descriptor("mrk", Format::String, 1, None))
        .unwrap();
    writer.write_samples(1, &eeg).unwrap();
    writer.write_clock_offset(1, 11.0, -0.002).unwrap();
    writer.write_samples(2, &markers).unwrap();
    writer
        .write_stream_footer(2, Some(10.5), Some(10.5), 1, 0)
        .unwrap();
    writer
        .write_stream_footer(1, Some(10.0), Some(10.02), 3, 1)
        .unwrap();
    writer.close().unwrap();

    let chunks = reader::parse_file(&path).unwrap();
    assert_eq!(chunks.len(), 8);
    assert!(matches!(&chunks[0], Chunk::FileHeader(header) if header.version == 1.0));
    match &chunks[1] {
        Chunk::StreamHeader(header) => {
            assert_eq!(header.stream_id, 1);
            assert_eq!(header.info.channel_count, 2);
            assert_eq!(header.info.channel_format, Format::Float32);
            assert_eq!(header.info.nominal_srate, Some(100.0));
            assert_eq!(header.info.name.as_deref(), Some("eeg-name"));
        }
        other => panic!("expected stream header, got {other:?}"),
    }
    match &chunks[3] {
        Chunk::Samples(samples) => {
            assert_eq!(samples.stream_id, 1);
            assert_eq!(samples.samples, eeg);
        }
        other => panic!("expected samples, got {other:?}"),
    }
    match &chunks[4] {
        Chunk::ClockOffset(offset) => {
            assert_eq!(offset.stream_id, 1);
            assert_eq!(offset.collection_time, 11.0);
            assert_eq!(offset.offset_value, -0.002);
        }
        other => panic!("expected clock offset, got {other:?}"),
    }
    match &chunks[5] {
        Chunk::Samples(samples) => {
            assert_eq!(samples.stream_id, 2);
            assert_eq!(samples.samples, markers);
        }
        other => panic!("expected samples, got {other:?}"),
    }
    match &chunks[7] {
        Chunk::StreamFooter(footer) => {
            assert_eq!(footer.stream_id, 1);
            assert_eq!(footer.info.first_timestamp, Some(10.0));
            assert_eq!(footer.info.last_timestamp, Some(10.02));
            assert_eq!(footer.info.sample_count, 3);
            assert_eq!(footer.info.clock_offsets, 1);
        }
        other => panic!("expected stream footer, got {other:?}"),
    }
}

/// Walks the raw frames and returns (length-field width, length) pairs.
fn frame_widths(bytes: &[u8]) -> Vec<(u8, u64)> {
    assert_eq!(&bytes[..4], b"XDF:");
    let mut widths = Vec::new();
    let mut pos = 4;
    while pos < bytes.len() {
        let width = bytes[pos];
        pos += 1;
        let len = match width {
            1 => u64::from(bytes[pos]),
            4 => u64::from(u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())),
            8 => u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()),
            other => panic!("invalid length width {other} at offset {pos}"),
        };
        pos += width as usize + len as usize;
        widths.push((width, len));
    }
    assert_eq!(pos, bytes.len());
    widths
}

#[test]
fn chunk_lengths_use_the_smallest_form() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lengths.xdf");

    let writer = XdfWriter::create(&path).unwrap();
    writer
        .write_stream_header(1, &descriptor("wide", Format::Float64, 4, Some(500.0)))
        .unwrap();
    // one tiny chunk (< 256 bytes) and one that overflows the 1-byte form
    let small = vec![Sample {
        timestamp: Some(0.5),
        values: Values::Float64(vec![0.0; 4]),
    }];
    writer.write_samples(1, &small).unwrap();
    let large: Vec<Sample> = (0..100)
        .map(|index| Sample {
            timestamp: Some(index as f64),
            values: Values::Float64(vec![index as f64; 4]),
        })
        .collect();
    writer.write_samples(1, &large).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let widths = frame_widths(&bytes);
    for (width, len) in &widths {
        if *len < 256 {
            assert_eq!(*width, 1, "length {len} must use the 1-byte form");
        } else {
            assert_eq!(*width, 4, "length {len} must use the 4-byte form");
        }
    }
    assert!(widths.iter().any(|(width, _)| *width == 1));
    assert!(widths.iter().any(|(width, _)| *width == 4));

    // the reader applies the same rule and agrees
    assert!(reader::parse_bytes(&bytes).is_ok());
}

#[test]
fn writer_enforces_the_ordering_contract() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ordering.xdf");
    let writer = XdfWriter::create(&path).unwrap();
    let batch = vec![float_sample(1.0, vec![0.0])];

    // data before header
    let err = writer.write_samples(7, &batch).unwrap_err();
    assert!(matches!(err, RecorderError::OrderViolation(_)));
    let err = writer.write_clock_offset(7, 1.0, 0.0).unwrap_err();
    assert!(matches!(err, RecorderError::OrderViolation(_)));

    writer
        .write_stream_header(7, &descriptor("s", Format::Float32, 1, Some(10.0)))
        .unwrap();
    let err = writer
        .write_stream_header(7, &descriptor("s", Format::Float32, 1, Some(10.0)))
        .unwrap_err();
    assert!(matches!(err, RecorderError::OrderViolation(_)));

    writer.write_samples(7, &batch).unwrap();
    writer
        .write_stream_footer(7, Some(1.0), Some(1.0), 1, 0)
        .unwrap();

    // nothing after the footer
    let err = writer.write_samples(7, &batch).unwrap_err();
    assert!(matches!(err, RecorderError::OrderViolation(_)));
    let err = writer
        .write_stream_footer(7, Some(1.0), Some(1.0), 1, 0)
        .unwrap_err();
    assert!(matches!(err, RecorderError::OrderViolation(_)));

    writer.close().unwrap();
    assert!(reader::parse_file(&path).is_ok());
}

#[test]
fn empty_batches_are_a_no_op() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.xdf");
    let writer = XdfWriter::create(&path).unwrap();
    writer
        .write_stream_header(1, &descriptor("s", Format::Float32, 1, Some(10.0)))
        .unwrap();
    writer.write_samples(1, &[]).unwrap();
    writer.close().unwrap();

    let chunks = reader::parse_file(&path).unwrap();
    assert!(!chunks.iter().any(|chunk| matches!(chunk, Chunk::Samples(_))));
}

#[test]
fn close_writes_footers_for_still_open_streams() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("close.xdf");
    let writer = XdfWriter::create(&path).unwrap();
    writer
        .write_stream_header(1, &descriptor("a", Format::Float32, 1, Some(10.0)))
        .unwrap();
    writer
        .write_stream_header(2, &descriptor("b", Format::Float32, 1, Some(10.0)))
        .unwrap();
    writer
        .write_samples(1, &[float_sample(3.0, vec![1.0]), float_sample(3.1, vec![2.0])])
        .unwrap();
    writer.close().unwrap();
    // close is idempotent
    writer.close().unwrap();

    let chunks = reader::parse_file(&path).unwrap();
    let footers: Vec<_> = chunks
        .iter()
        .filter_map(|chunk| match chunk {
            Chunk::StreamFooter(footer) => Some(footer),
            _ => None,
        })
        .collect();
    assert_eq!(footers.len(), 2);
    let first = footers.iter().find(|f| f.stream_id == 1).unwrap();
    assert_eq!(first.info.sample_count, 2);
    assert_eq!(first.info.first_timestamp, Some(3.0));
    assert_eq!(first.info.last_timestamp, Some(3.1));
    let second = footers.iter().find(|f| f.stream_id == 2).unwrap();
    assert_eq!(second.info.sample_count, 0);
}

/// Destination that errors once a byte budget is exhausted.
struct FailingDest {
    written: usize,
    budget: usize,
}

impl Write for FailingDest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() > self.budget {
            return Err(io::Error::new(io::ErrorKind::Other, "synthetic disk failure"));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn io_failure_latches_and_later_writes_fail_fast() {
    // enough budget for the magic and FileHeader, not for a stream header
    let writer = XdfWriter::new(FailingDest {
        written: 0,
        budget: 150,
    })
    .unwrap();
    let err = writer
        .write_stream_header(1, &descriptor("s", Format::Float32, 4, Some(100.0)))
        .unwrap_err();
    assert!(matches!(err, RecorderError::Io(_)));
    assert!(writer.is_failed());

    // no disk access happens here; the failed state answers immediately
    let err = writer
        .write_samples(1, &[float_sample(0.0, vec![0.0; 4])])
        .unwrap_err();
    assert!(matches!(err, RecorderError::Io(_)));
    assert!(writer.close().is_err());
}

#[test]
fn concurrent_writers_never_tear_chunks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("concurrent.xdf");
    let writer = XdfWriter::create(&path).unwrap();

    const WRITERS: u32 = 4;
    const BATCHES: u64 = 2_500;
    for stream_id in 1..=WRITERS {
        writer
            .write_stream_header(
                stream_id,
                &descriptor(&format!("s{stream_id}"), Format::Float32, 2, Some(100.0)),
            )
            .unwrap();
    }

    let shared = Arc::new(writer);
    let mut handles = Vec::new();
    for stream_id in 1..=WRITERS {
        let writer = Arc::clone(&shared);
        handles.push(thread::spawn(move || {
            for index in 0..BATCHES {
                let batch = vec![float_sample(
                    index as f64,
                    vec![stream_id as f32, index as f32],
                )];
                writer.write_samples(stream_id, &batch).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for stream_id in 1..=WRITERS {
        shared
            .write_stream_footer(stream_id, Some(0.0), Some((BATCHES - 1) as f64), BATCHES, 0)
            .unwrap();
    }
    shared.close().unwrap();

    let chunks = reader::parse_file(&path).unwrap();
    for stream_id in 1..=WRITERS {
        let written: u64 = chunks
            .iter()
            .filter_map(|chunk| match chunk {
                Chunk::Samples(samples) if samples.stream_id == stream_id => {
                    Some(samples.samples.len() as u64)
                }
                _ => None,
            })
            .sum();
        assert_eq!(written, BATCHES, "stream {stream_id} lost or tore samples");
    }
}

#[test]
fn boundary_chunks_appear_in_large_recordings() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("large.xdf");
    let writer = XdfWriter::create(&path).unwrap();
    writer
        .write_stream_header(1, &descriptor("big", Format::Float64, 8, Some(1000.0)))
        .unwrap();

    // ~36 KiB per chunk; 300 chunks comfortably exceed the 10 MiB cadence
    let mut timestamp = 0.0;
    for _ in 0..300 {
        let batch: Vec<Sample> = (0..500)
            .map(|_| {
                timestamp += 0.001;
                Sample {
                    timestamp: Some(timestamp),
                    values: Values::Float64(vec![0.25; 8]),
                }
            })
            .collect();
        writer.write_samples(1, &batch).unwrap();
    }
    writer.close().unwrap();

    let chunks = reader::parse_file(&path).unwrap();
    assert!(
        chunks.iter().any(|chunk| matches!(chunk, Chunk::Boundary(_))),
        "a >10 MiB recording must carry at least one boundary chunk"
    );
}
