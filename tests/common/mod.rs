//! Scripted in-process stream source for the integration tests.
//!
//! Two kinds of streams: a rate-driven generator that produces samples
//! against the wall clock (standing in for an EEG amp), and a preloaded
//! queue that serves its samples immediately (standing in for a marker
//! stream). Each stream has a kill switch so tests can sever a source
//! mid-session.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use strict_num::NonZeroPositiveF64;
use xdfrec::chunks::{Format, Sample, Values};
use xdfrec::clock;
use xdfrec::source::{Inlet, SourceError, StreamDescriptor, StreamSource};

/// Clones share the same stream table, so a test can keep a handle and
/// mutate the scripted world after the recorder takes ownership.
#[derive(Clone)]
pub struct ScriptedSource {
    streams: Arc<Mutex<Vec<ScriptedStream>>>,
}

#[derive(Clone)]
struct ScriptedStream {
    descriptor: StreamDescriptor,
    alive: Arc<AtomicBool>,
    kind: StreamKind,
}

#[derive(Clone)]
enum StreamKind {
    Regular { rate_hz: f64 },
    Queue { queue: Arc<Mutex<VecDeque<Sample>>> },
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adds a float32 stream that generates samples at `rate_hz` relative
    /// to the wall clock. Returns its kill switch.
    pub fn add_regular(
        &self,
        uid: &str,
        name: &str,
        channels: u32,
        rate_hz: f64,
    ) -> Arc<AtomicBool> {
        let descriptor = StreamDescriptor {
            uid: uid.to_string(),
            name: name.to_string(),
            stream_type: "EEG".to_string(),
            hostname: "testhost".to_string(),
            source_id: uid.to_string(),
            channel_count: channels,
            channel_format: Format::Float32,
            nominal_srate: NonZeroPositiveF64::new(rate_hz),
            metadata: None,
        };
        let alive = Arc::new(AtomicBool::new(true));
        self.streams.lock().unwrap().push(ScriptedStream {
            descriptor,
            alive: Arc::clone(&alive),
            kind: StreamKind::Regular { rate_hz },
        });
        alive
    }

    /// Adds an irregular-rate string stream that serves `samples` as soon
    /// as they are pulled, then stays silent.
    pub fn add_markers(&self, uid: &str, name: &str, samples: Vec<Sample>) -> Arc<AtomicBool> {
        let descriptor = StreamDescriptor {
            uid: uid.to_string(),
            name: name.to_string(),
            stream_type: "Markers".to_string(),
            hostname: "testhost".to_string(),
            source_id: uid.to_string(),
            channel_count: 1,
            channel_format: Format::String,
            nominal_srate: None,
            metadata: None,
        };
        let alive = Arc::new(AtomicBool::new(true));
        self.streams.lock().unwrap().push(ScriptedStream {
            descriptor,
            alive: Arc::clone(&alive),
            kind: StreamKind::Queue {
                queue: Arc::new(Mutex::new(samples.into())),
            },
        });
        alive
    }

    /// Removes a stream entirely so the next discovery no longer sees it.
    pub fn remove(&self, uid: &str) {
        self.streams
            .lock()
            .unwrap()
            .retain(|stream| stream.descriptor.uid != uid);
    }
}

impl StreamSource for ScriptedSource {
    type Inlet = ScriptedInlet;

    fn discover(&self, _timeout_s: f64) -> Vec<StreamDescriptor> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|stream| stream.alive.load(Ordering::Acquire))
            .map(|stream| stream.descriptor.clone())
            .collect()
    }

    fn open(
        &self,
        descriptor: &StreamDescriptor,
        _buffer_seconds: u32,
        _max_chunk_len: usize,
    ) -> Result<Self::Inlet, SourceError> {
        let streams = self.streams.lock().unwrap();
        let stream = streams
            .iter()
            .find(|stream| stream.descriptor.uid == descriptor.uid)
            .ok_or_else(|| SourceError::Unavailable(format!("no stream {}", descriptor.uid)))?;
        if !stream.alive.load(Ordering::Acquire) {
            return Err(SourceError::Unavailable(format!(
                "stream {} has gone away",
                descriptor.uid
            )));
        }
        Ok(ScriptedInlet {
            alive: Arc::clone(&stream.alive),
            channels: stream.descriptor.channel_count,
            kind: stream.kind.clone(),
            opened_at: clock::now_streaming(),
            produced: 0,
        })
    }
}

pub struct ScriptedInlet {
    alive: Arc<AtomicBool>,
    channels: u32,
    kind: StreamKind,
    opened_at: f64,
    produced: u64,
}

impl Inlet for ScriptedInlet {
    fn pull_batch(&mut self, max_samples: usize, timeout_s: f64) -> Result<Vec<Sample>, SourceError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SourceError::Lost);
        }
        match &self.kind {
            StreamKind::Regular { rate_hz } => {
                let now = clock::now_streaming();
                let due = ((now - self.opened_at) * rate_hz).floor() as u64;
                let count = due.saturating_sub(self.produced).min(max_samples as u64);
                if count == 0 {
                    thread::sleep(Duration::from_secs_f64(timeout_s));
                    return Ok(Vec::new());
                }
                let mut batch = Vec::with_capacity(count as usize);
                for index in 0..count {
                    let ordinal = self.produced + index + 1;
                    let timestamp = self.opened_at + ordinal as f64 / rate_hz;
                    let values = (0..self.channels)
                        .map(|channel| ordinal as f32 + channel as f32 * 0.25)
                        .collect();
                    batch.push(Sample {
                        timestamp: Some(timestamp),
                        values: Values::Float32(values),
                    });
                }
                self.produced += count;
                Ok(batch)
            }
            StreamKind::Queue { queue } => {
                let mut queue = queue.lock().unwrap();
                if queue.is_empty() {
                    drop(queue);
                    thread::sleep(Duration::from_secs_f64(timeout_s));
                    return Ok(Vec::new());
                }
                let count = queue.len().min(max_samples);
                Ok(queue.drain(..count).collect())
            }
        }
    }

    fn time_correction(&mut self, _timeout_s: f64) -> Result<f64, SourceError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SourceError::Transient("source has gone away".into()));
        }
        Ok(0.000125)
    }

    fn close(&mut self) {}
}

/// A string-format marker sample.
pub fn marker(timestamp: f64, text: &str) -> Sample {
    Sample {
        timestamp: Some(timestamp),
        values: Values::String(vec![text.to_string()]),
    }
}
