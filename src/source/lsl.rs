//! LSL transport adapter, compiled with the `lsl` cargo feature.
//!
//! Wraps the resolver and inlet API of the `lsl` crate behind the
//! [`StreamSource`] boundary. Discovery caches the resolved
//! `StreamInfo` handles by uid so `open` can build an inlet for a
//! descriptor chosen earlier in the same cycle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use lsl::{ChannelFormat, StreamInfo, StreamInlet};
use tracing::{debug, warn};
use xmltree::Element;

use crate::chunks::{Format, Sample, Values};
use crate::source::{Inlet, SourceError, StreamDescriptor, StreamSource};
use strict_num::NonZeroPositiveF64;

#[derive(Default)]
pub struct LslSource {
    resolved: Mutex<HashMap<String, StreamInfo>>,
}

impl LslSource {
    fn descriptor_from(info: &StreamInfo) -> Option<StreamDescriptor> {
        let channel_format = match info.channel_format() {
            ChannelFormat::Float32 => Format::Float32,
            ChannelFormat::Double64 => Format::Float64,
            ChannelFormat::Int8 => Format::Int8,
            ChannelFormat::Int16 => Format::Int16,
            ChannelFormat::Int32 => Format::Int32,
            ChannelFormat::Int64 => Format::Int64,
            ChannelFormat::String => Format::String,
            other => {
                warn!(?other, stream = %info.name(), "skipping stream with unsupported format");
                return None;
            }
        };
        let metadata = info
            .as_xml()
            .ok()
            .and_then(|xml| Element::parse(xml.as_bytes()).ok())
            .and_then(|root| root.get_child("desc").cloned());
        Some(StreamDescriptor {
            uid: info.uid().to_string(),
            name: info.name().to_string(),
            stream_type: info.stream_type().to_string(),
            hostname: info.hostname().to_string(),
            source_id: info.source_id().to_string(),
            channel_count: info.channel_count() as u32,
            channel_format,
            nominal_srate: NonZeroPositiveF64::new(info.sampling_rate()),
            metadata,
        })
    }
}

impl StreamSource for LslSource {
    type Inlet = LslInlet;

    fn discover(&self, timeout_s: f64) -> Vec<StreamDescriptor> {
        let found = lsl::resolve_streams(timeout_s);
        debug!(count = found.len(), "LSL resolver returned");
        let mut cache = match self.resolved.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.clear();
        let mut descriptors = Vec::with_capacity(found.len());
        for info in found {
            if let Some(descriptor) = Self::descriptor_from(&info) {
                cache.insert(descriptor.uid.clone(), info);
                descriptors.push(descriptor);
            }
        }
        descriptors
    }

    fn open(
        &self,
        descriptor: &StreamDescriptor,
        buffer_seconds: u32,
        max_chunk_len: usize,
    ) -> Result<Self::Inlet, SourceError> {
        let cache = match self.resolved.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        let info = cache.get(&descriptor.uid).ok_or_else(|| {
            SourceError::Unavailable(format!("stream {} not in the last discovery", descriptor.uid))
        })?;
        let inlet = StreamInlet::new(info, buffer_seconds as i32, max_chunk_len as i32, true)
            .map_err(|err| SourceError::Unavailable(format!("{err:?}")))?;
        Ok(LslInlet {
            inlet: Some(inlet),
            format: descriptor.channel_format,
            channel_count: descriptor.channel_count as usize,
        })
    }

    fn local_clock(&self) -> f64 {
        lsl::local_clock()
    }
}

pub struct LslInlet {
    inlet: Option<StreamInlet>,
    format: Format,
    channel_count: usize,
}

impl LslInlet {
    fn pull_numeric<T, P>(
        &self,
        inlet: &StreamInlet,
        max_samples: usize,
        pull: P,
        wrap: fn(Vec<T>) -> Values,
    ) -> Result<Vec<Sample>, SourceError>
    where
        T: Default + Clone,
        P: Fn(&StreamInlet, &mut [T], &mut [f64]) -> Result<usize, SourceError>,
    {
        let mut values = vec![T::default(); max_samples * self.channel_count];
        let mut timestamps = vec![0.0_f64; max_samples];
        let pulled = pull(inlet, &mut values, &mut timestamps)?;
        let mut samples = Vec::with_capacity(pulled);
        for index in 0..pulled {
            let start = index * self.channel_count;
            let channels = values[start..start + self.channel_count].to_vec();
            samples.push(Sample {
                timestamp: Some(timestamps[index]),
                values: wrap(channels),
            });
        }
        Ok(samples)
    }
}

fn severed(err: impl std::fmt::Debug) -> SourceError {
    // liblsl reports a broken inlet as a lost-error on the pull path
    debug!(?err, "inlet pull failed");
    SourceError::Lost
}

impl Inlet for LslInlet {
    fn pull_batch(&mut self, max_samples: usize, timeout_s: f64) -> Result<Vec<Sample>, SourceError> {
        let Some(inlet) = self.inlet.as_ref() else {
            return Err(SourceError::Lost);
        };
        let samples = match self.format {
            Format::Float32 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_f32(values, Some(stamps)).map_err(severed)
            }, Values::Float32)?,
            Format::Float64 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_f64(values, Some(stamps)).map_err(severed)
            }, Values::Float64)?,
            Format::Int8 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_i8(values, Some(stamps)).map_err(severed)
            }, Values::Int8)?,
            Format::Int16 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_i16(values, Some(stamps)).map_err(severed)
            }, Values::Int16)?,
            Format::Int32 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_i32(values, Some(stamps)).map_err(severed)
            }, Values::Int32)?,
            Format::Int64 => self.pull_numeric(inlet, max_samples, |inlet, values, stamps| {
                inlet.pull_chunk_i64(values, Some(stamps)).map_err(severed)
            }, Values::Int64)?,
            Format::String => {
                let mut values = vec![String::new(); max_samples * self.channel_count];
                let mut timestamps = vec![0.0_f64; max_samples];
                let pulled = inlet
                    .pull_chunk_str(&mut values, Some(&mut timestamps))
                    .map_err(severed)?;
                let mut samples = Vec::with_capacity(pulled);
                for index in 0..pulled {
                    let start = index * self.channel_count;
                    samples.push(Sample {
                        timestamp: Some(timestamps[index]),
                        values: Values::String(
                            values[start..start + self.channel_count].to_vec(),
                        ),
                    });
                }
                samples
            }
        };
        if samples.is_empty() {
            // the pull itself does not block; honor the caller's window
            thread::sleep(Duration::from_secs_f64(timeout_s));
        }
        Ok(samples)
    }

    fn time_correction(&mut self, timeout_s: f64) -> Result<f64, SourceError> {
        let Some(inlet) = self.inlet.as_ref() else {
            return Err(SourceError::Lost);
        };
        inlet
            .time_correction(timeout_s)
            .map_err(|err| SourceError::Transient(format!("{err:?}")))
    }

    fn close(&mut self) {
        self.inlet = None;
    }
}
