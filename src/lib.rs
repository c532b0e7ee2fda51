#![forbid(unsafe_code)]
#![deny(nonstandard_style)]

//! Records live Lab Streaming Layer streams into a single XDF file.
//!
//! The pieces, from the bottom up: [`source`] abstracts the streaming
//! transport (discovery, inlets, time correction), [`writer`] serializes
//! chunks into the XDF container, [`worker`] runs one acquisition thread
//! per selected stream, [`recorder`] owns the session state machine, and
//! [`control`] exposes it all over a small line-oriented TCP protocol so
//! experiment software can drive a session remotely. [`reader`] parses
//! produced files back at chunk granularity.
//!
//! A session in library form:
//!
//! ```no_run
//! use std::sync::Arc;
//! use xdfrec::config::RecorderConfig;
//! use xdfrec::control::ControlServer;
//! use xdfrec::recorder::{Recorder, Selection};
//! # fn demo<S: xdfrec::source::StreamSource>(source: S) -> xdfrec::errors::Result<()> {
//! let recorder = Arc::new(Recorder::new(source, RecorderConfig::default()));
//! let _server = ControlServer::start(Arc::clone(&recorder), "127.0.0.1", 22345)?;
//! recorder.update_streams()?;
//! recorder.select(Selection::All)?;
//! recorder.set_filename("{root:/data} {template:run-{n}.xdf} {n:1}")?;
//! recorder.start()?;
//! // ... record ...
//! recorder.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod chunks;
pub mod clock;
pub mod config;
pub mod control;
pub mod errors;
pub mod filename;
pub mod reader;
pub mod recorder;
pub mod source;
mod worker;
pub mod writer;

pub use chunks::{Chunk, Format, Sample, Values};
pub use config::RecorderConfig;
pub use control::ControlServer;
pub use errors::{RecorderError, Result};
pub use recorder::{Recorder, Selection, SessionState};
pub use source::{Inlet, SourceError, StreamDescriptor, StreamSource};
pub use worker::StreamProgress;
pub use writer::XdfWriter;
