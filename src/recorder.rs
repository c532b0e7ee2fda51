//! The session controller.
//!
//! Owns the session state machine, the discovery snapshot, the selection,
//! the active writer, and the worker lifecycle. All state mutations happen
//! under one mutex; discovery, file I/O, and worker joins run with the
//! mutex released so a long operation never blocks `status`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RecorderConfig;
use crate::errors::{RecorderError, Result};
use crate::filename;
use crate::source::{StreamDescriptor, StreamSource};
use crate::worker::{self, WorkerHandle};
use crate::writer::XdfWriter;

/// Session lifecycle. `Discovering`, `Stopping`, and `Closed` are
/// transitional; a finished session returns to `Idle` so the recorder can
/// run another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Discovering,
    Ready,
    Recording,
    Stopping,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Discovering => "Discovering",
            SessionState::Ready => "Ready",
            SessionState::Recording => "Recording",
            SessionState::Stopping => "Stopping",
            SessionState::Closed => "Closed",
        }
    }
}

/// Argument of the `select` operation.
#[derive(Debug, Clone)]
pub enum Selection {
    All,
    None,
    Uids(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamListEntry {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub channels: u32,
    pub rate: f64,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub uid: String,
    pub name: String,
    pub sample_count: u64,
    pub last_timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: &'static str,
    pub filename: Option<String>,
    pub selected_count: usize,
    pub available_count: usize,
    pub per_stream: Vec<StreamStatus>,
}

type FileXdfWriter = XdfWriter<BufWriter<File>>;

struct ActiveStream {
    uid: String,
    name: String,
    stream_id: u32,
    worker: WorkerHandle,
}

struct Inner {
    state: SessionState,
    filename: Option<PathBuf>,
    available: Vec<StreamDescriptor>,
    selected: Vec<String>,
    active: Vec<ActiveStream>,
    writer: Option<FileXdfWriter>,
}

pub struct Recorder<S: StreamSource> {
    source: Arc<S>,
    config: RecorderConfig,
    inner: Mutex<Inner>,
}

impl<S: StreamSource> Recorder<S> {
    pub fn new(source: S, config: RecorderConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                filename: None,
                available: Vec::new(),
                selected: Vec::new(),
                active: Vec::new(),
                writer: None,
            }),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Runs discovery and replaces the available-streams snapshot. If a
    /// previously selected uid vanished, the whole selection is reset.
    pub fn update_streams(&self) -> Result<Vec<StreamListEntry>> {
        {
            let mut inner = self.inner.lock()?;
            match inner.state {
                SessionState::Idle | SessionState::Ready => {
                    inner.state = SessionState::Discovering;
                }
                state => return Err(invalid(state)),
            }
        }

        let found = self.source.discover(self.config.discovery_timeout_s);
        info!(count = found.len(), "stream discovery finished");

        let mut inner = self.inner.lock()?;
        let vanished = inner
            .selected
            .iter()
            .any(|uid| !found.iter().any(|descriptor| &descriptor.uid == uid));
        if vanished {
            warn!("selection cleared: a selected stream disappeared");
            inner.selected.clear();
        }
        inner.available = found;
        inner.state = SessionState::Ready;
        Ok(list_entries(&inner))
    }

    /// The last discovery snapshot, without re-discovering.
    pub fn stream_list(&self) -> Result<Vec<StreamListEntry>> {
        let inner = self.inner.lock()?;
        Ok(list_entries(&inner))
    }

    /// Updates the selection against the last discovery snapshot. Unknown
    /// uids are skipped with a warning; duplicates collapse to the first
    /// occurrence.
    pub fn select(&self, selection: Selection) -> Result<Vec<String>> {
        let mut inner = self.inner.lock()?;
        match inner.state {
            SessionState::Idle | SessionState::Ready => {}
            state => return Err(invalid(state)),
        }
        let chosen: Vec<String> = match selection {
            Selection::All => inner
                .available
                .iter()
                .map(|descriptor| descriptor.uid.clone())
                .collect(),
            Selection::None => Vec::new(),
            Selection::Uids(uids) => {
                let mut chosen = Vec::new();
                for uid in uids {
                    if !inner
                        .available
                        .iter()
                        .any(|descriptor| descriptor.uid == uid)
                    {
                        warn!(%uid, "ignoring unknown stream uid");
                        continue;
                    }
                    if !chosen.contains(&uid) {
                        chosen.push(uid);
                    }
                }
                chosen
            }
        };
        inner.selected = chosen.clone();
        Ok(chosen)
    }

    /// Parses and stores the output path. Valid in any state except
    /// Recording; a template error leaves everything untouched.
    pub fn set_filename(&self, spec: &str) -> Result<PathBuf> {
        let resolved = filename::resolve(spec)?;
        let mut inner = self.inner.lock()?;
        if inner.state == SessionState::Recording {
            return Err(invalid(inner.state));
        }
        inner.filename = Some(resolved.clone());
        Ok(resolved)
    }

    pub fn filename(&self) -> Result<Option<PathBuf>> {
        Ok(self.inner.lock()?.filename.clone())
    }

    /// Opens the writer, writes FileHeader plus one StreamHeader per
    /// selection (stream ids 1..K in selection order), launches the
    /// workers, and enters Recording.
    pub fn start(&self) -> Result<()> {
        let (path, selections) = {
            let mut inner = self.inner.lock()?;
            if inner.state != SessionState::Ready {
                return Err(invalid(inner.state));
            }
            if inner.selected.is_empty() {
                return Err(RecorderError::NoSelection);
            }
            // a session with no output path is not ready to start
            let path = inner.filename.clone().ok_or_else(|| invalid(inner.state))?;
            let mut selections = Vec::with_capacity(inner.selected.len());
            for uid in &inner.selected {
                // selection is maintained as a subset of the discovery
                // snapshot; a uid that slipped out anyway leaves nothing
                // usable to record
                let descriptor = inner
                    .available
                    .iter()
                    .find(|descriptor| &descriptor.uid == uid)
                    .cloned()
                    .ok_or(RecorderError::NoSelection)?;
                selections.push(descriptor);
            }
            // flip optimistically so concurrent commands are rejected while
            // the writer and workers come up; reverted on failure below
            inner.state = SessionState::Recording;
            (path, selections)
        };

        match self.launch(&path, &selections) {
            Ok((active, writer)) => {
                let mut inner = self.inner.lock()?;
                if inner.state != SessionState::Recording {
                    // a concurrent stop raced us between the state flip and
                    // here; tear the fresh session down instead of leaking it
                    let state = inner.state;
                    drop(inner);
                    for stream in &active {
                        stream.worker.shared.cancel.store(true, Ordering::Release);
                    }
                    for mut stream in active {
                        if let Some(join) = stream.worker.join.take() {
                            let _ = join.join();
                        }
                    }
                    let _ = writer.close();
                    return Err(invalid(state));
                }
                inner.active = active;
                inner.writer = Some(writer);
                info!(path = %path.display(), streams = selections.len(), "recording started");
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock()?;
                inner.state = SessionState::Ready;
                Err(err)
            }
        }
    }

    fn launch(
        &self,
        path: &Path,
        selections: &[StreamDescriptor],
    ) -> Result<(Vec<ActiveStream>, FileXdfWriter)> {
        let writer = XdfWriter::create(path)?;
        for (index, descriptor) in selections.iter().enumerate() {
            writer.write_stream_header(index as u32 + 1, descriptor)?;
        }

        let mut active: Vec<ActiveStream> = Vec::with_capacity(selections.len());
        for (index, descriptor) in selections.iter().enumerate() {
            let stream_id = index as u32 + 1;
            let spawned = worker::spawn(
                Arc::clone(&self.source),
                descriptor.clone(),
                stream_id,
                writer.clone(),
                self.config.clone(),
            );
            match spawned {
                Ok(handle) => active.push(ActiveStream {
                    uid: descriptor.uid.clone(),
                    name: descriptor.name.clone(),
                    stream_id,
                    worker: handle,
                }),
                Err(err) => {
                    // unwind the workers already running, then give up
                    for stream in &active {
                        stream.worker.shared.cancel.store(true, Ordering::Release);
                    }
                    for mut stream in active {
                        if let Some(join) = stream.worker.join.take() {
                            let _ = join.join();
                        }
                    }
                    let _ = writer.close();
                    return Err(err.into());
                }
            }
        }
        Ok((active, writer))
    }

    /// Cancels the workers, joins them with a bounded wait, writes one
    /// footer per selection from the controller's own bookkeeping, and
    /// closes the file. A worker that outlives the join bound is
    /// abandoned; its footer is written from the last known counters, so
    /// the file is well-formed regardless.
    pub fn stop(&self) -> Result<()> {
        let (active, writer) = {
            let mut inner = self.inner.lock()?;
            if inner.state != SessionState::Recording {
                return Err(invalid(inner.state));
            }
            inner.state = SessionState::Stopping;
            (std::mem::take(&mut inner.active), inner.writer.take())
        };

        info!("stopping recording");
        for stream in &active {
            stream.worker.shared.cancel.store(true, Ordering::Release);
        }

        let deadline = Instant::now() + Duration::from_secs_f64(self.config.stop_timeout_s);
        let mut first_error: Option<RecorderError> = None;
        for mut stream in active {
            if wait_until_finished(&stream.worker, deadline) {
                if let Some(join) = stream.worker.join.take() {
                    let _ = join.join();
                }
            } else {
                warn!(stream = %stream.name, "worker did not stop in time, abandoning");
            }
            let progress = stream.worker.progress();
            if let Some(writer) = &writer {
                let result = writer.write_stream_footer(
                    stream.stream_id,
                    nan_to_none(progress.first_timestamp),
                    nan_to_none(progress.last_timestamp),
                    progress.sample_count,
                    progress.clock_offsets_written,
                );
                if let Err(err) = result {
                    warn!(stream = %stream.name, %err, "footer write failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(writer) = writer {
            if let Err(err) = writer.close() {
                first_error.get_or_insert(err);
            }
        }

        {
            let mut inner = self.inner.lock()?;
            // Closed is only ever momentary: the session is immediately
            // reusable, so the observable state is Idle
            inner.state = SessionState::Idle;
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("recording stopped");
                Ok(())
            }
        }
    }

    pub fn is_recording(&self) -> Result<bool> {
        Ok(self.inner.lock()?.state == SessionState::Recording)
    }

    /// Pure snapshot; never mutates state.
    pub fn status(&self) -> Result<StatusReport> {
        let inner = self.inner.lock()?;
        let per_stream = if inner.active.is_empty() {
            inner
                .selected
                .iter()
                .filter_map(|uid| {
                    inner
                        .available
                        .iter()
                        .find(|descriptor| &descriptor.uid == uid)
                })
                .map(|descriptor| StreamStatus {
                    uid: descriptor.uid.clone(),
                    name: descriptor.name.clone(),
                    sample_count: 0,
                    last_timestamp: None,
                })
                .collect()
        } else {
            inner
                .active
                .iter()
                .map(|stream| {
                    let progress = stream.worker.progress();
                    StreamStatus {
                        uid: stream.uid.clone(),
                        name: stream.name.clone(),
                        sample_count: progress.sample_count,
                        last_timestamp: nan_to_none(progress.last_timestamp),
                    }
                })
                .collect()
        };
        Ok(StatusReport {
            state: inner.state.name(),
            filename: inner
                .filename
                .as_ref()
                .map(|path| path.display().to_string()),
            selected_count: inner.selected.len(),
            available_count: inner.available.len(),
            per_stream,
        })
    }

    /// Stops an in-flight session, if any. Used on shutdown paths.
    pub fn shutdown(&self) {
        if self.is_recording().unwrap_or(false) {
            if let Err(err) = self.stop() {
                warn!(%err, "stop during shutdown failed");
            }
        }
    }
}

fn list_entries(inner: &Inner) -> Vec<StreamListEntry> {
    inner
        .available
        .iter()
        .map(|descriptor| StreamListEntry {
            uid: descriptor.uid.clone(),
            name: descriptor.name.clone(),
            stream_type: descriptor.stream_type.clone(),
            channels: descriptor.channel_count,
            rate: descriptor.srate_hz(),
            selected: inner.selected.contains(&descriptor.uid),
        })
        .collect()
}

fn invalid(state: SessionState) -> RecorderError {
    RecorderError::InvalidState {
        state: state.name(),
    }
}

fn nan_to_none(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

fn wait_until_finished(handle: &WorkerHandle, deadline: Instant) -> bool {
    loop {
        if handle.shared.finished.load(Ordering::Acquire) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
