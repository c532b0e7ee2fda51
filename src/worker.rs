//! Per-stream acquisition workers.
//!
//! One OS thread per selected stream, so a slow or silent stream can
//! never starve the pull timeouts of another. The loop opens its inlet
//! with exponential backoff, pulls timed batches, forwards them to the
//! shared writer, and emits a clock offset once per sync interval. On a
//! severed inlet it reconnects for as long as the session records. On
//! cancellation it just exits: footers are the controller's job, so a
//! hung worker cannot leave the file malformed.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::source::{Inlet, SourceError, StreamDescriptor, StreamSource};
use crate::writer::XdfWriter;

const BACKOFF_INITIAL_S: f64 = 0.5;
const BACKOFF_CAP_S: f64 = 10.0;
/// Bound on a single time-correction query.
const TIME_CORRECTION_TIMEOUT_S: f64 = 1.0;

/// Counters a worker shares with the session controller. Timestamps are
/// NaN until the first sample arrives.
#[derive(Debug, Clone, Copy)]
pub struct StreamProgress {
    pub sample_count: u64,
    pub first_timestamp: f64,
    pub last_timestamp: f64,
    pub clock_offsets_written: u64,
}

impl Default for StreamProgress {
    fn default() -> Self {
        Self {
            sample_count: 0,
            first_timestamp: f64::NAN,
            last_timestamp: f64::NAN,
            clock_offsets_written: 0,
        }
    }
}

pub(crate) struct WorkerShared {
    pub cancel: AtomicBool,
    pub finished: AtomicBool,
    pub progress: Mutex<StreamProgress>,
}

impl WorkerShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            progress: Mutex::new(StreamProgress::default()),
        })
    }
}

pub(crate) struct WorkerHandle {
    pub shared: Arc<WorkerShared>,
    pub join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn progress(&self) -> StreamProgress {
        self.shared
            .progress
            .lock()
            .map(|progress| *progress)
            .unwrap_or_default()
    }
}

pub(crate) fn spawn<S, W>(
    source: Arc<S>,
    descriptor: StreamDescriptor,
    stream_id: u32,
    writer: XdfWriter<W>,
    config: RecorderConfig,
) -> std::io::Result<WorkerHandle>
where
    S: StreamSource,
    W: Write + Send + 'static,
{
    let shared = WorkerShared::new();
    let thread_shared = Arc::clone(&shared);
    let join = thread::Builder::new()
        .name(format!("acq-{stream_id}"))
        .spawn(move || run(source, descriptor, stream_id, writer, config, thread_shared))?;
    Ok(WorkerHandle {
        shared,
        join: Some(join),
    })
}

fn run<S, W>(
    source: Arc<S>,
    descriptor: StreamDescriptor,
    stream_id: u32,
    writer: XdfWriter<W>,
    config: RecorderConfig,
    shared: Arc<WorkerShared>,
) where
    S: StreamSource,
    W: Write + Send + 'static,
{
    let name = descriptor.name.clone();
    let mut inlet: Option<S::Inlet> = None;
    let mut backoff_s = BACKOFF_INITIAL_S;
    // negative infinity forces the first offset out on the first cycle
    let mut last_offset_at = f64::NEG_INFINITY;

    info!(stream = %name, stream_id, "acquisition started");

    while !shared.cancel.load(Ordering::Acquire) {
        let Some(active) = inlet.as_mut() else {
            match source.open(&descriptor, config.buffer_seconds, config.max_samples_per_pull) {
                Ok(opened) => {
                    debug!(stream = %name, "inlet open");
                    inlet = Some(opened);
                    backoff_s = BACKOFF_INITIAL_S;
                }
                Err(err) => {
                    warn!(stream = %name, %err, backoff_s, "inlet open failed, will retry");
                    sleep_unless_cancelled(&shared, backoff_s);
                    backoff_s = (backoff_s * 2.0).min(BACKOFF_CAP_S);
                }
            }
            continue;
        };

        match active.pull_batch(config.max_samples_per_pull, config.pull_timeout_s) {
            Ok(batch) if !batch.is_empty() => {
                if let Ok(mut progress) = shared.progress.lock() {
                    for sample in &batch {
                        if let Some(timestamp) = sample.timestamp {
                            if progress.first_timestamp.is_nan() {
                                progress.first_timestamp = timestamp;
                            }
                            progress.last_timestamp = timestamp;
                        }
                    }
                    progress.sample_count += batch.len() as u64;
                }
                if let Err(err) = writer.write_samples(stream_id, &batch) {
                    warn!(stream = %name, %err, "sample write failed, stopping acquisition");
                    break;
                }
            }
            Ok(_) => {}
            Err(SourceError::Lost) => {
                warn!(stream = %name, "inlet lost, reconnecting");
                active.close();
                inlet = None;
                continue;
            }
            Err(err) => {
                debug!(stream = %name, %err, "pull failed");
            }
        }

        // re-check after the pull returns; a stop may have arrived meanwhile
        if shared.cancel.load(Ordering::Acquire) {
            break;
        }

        let now = source.local_clock();
        if now - last_offset_at >= config.clock_sync_interval_s {
            // the cadence advances whether or not the query succeeds, so a
            // persistently failing source is probed once per interval
            last_offset_at = now;
            if let Some(active) = inlet.as_mut() {
                match active.time_correction(TIME_CORRECTION_TIMEOUT_S) {
                    Ok(offset) => {
                        if let Err(err) = writer.write_clock_offset(stream_id, now, offset) {
                            warn!(stream = %name, %err, "clock offset write failed, stopping acquisition");
                            break;
                        }
                        if let Ok(mut progress) = shared.progress.lock() {
                            progress.clock_offsets_written += 1;
                        }
                    }
                    Err(err) => debug!(stream = %name, %err, "time correction skipped"),
                }
            }
        }
    }

    if let Some(mut active) = inlet.take() {
        active.close();
    }
    shared.finished.store(true, Ordering::Release);
    info!(stream = %name, stream_id, "acquisition finished");
}

/// Backoff sleep in small slices so cancellation stays responsive.
fn sleep_unless_cancelled(shared: &WorkerShared, seconds: f64) {
    let deadline = std::time::Instant::now() + Duration::from_secs_f64(seconds);
    while std::time::Instant::now() < deadline {
        if shared.cancel.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
