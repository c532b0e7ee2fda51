//! The boundary to the streaming transport.
//!
//! Everything above this module sees streams only through
//! [`StreamSource`], [`Inlet`], and [`StreamDescriptor`]; the transport
//! library itself never leaks past here. The real LSL adapter lives in
//! [`lsl`] behind the cargo feature of the same name, and the test suite
//! plugs in a scripted source.

use strict_num::NonZeroPositiveF64;
use thiserror::Error;
use xmltree::{Element, XMLNode};

use crate::chunks::{Format, Sample};
use crate::errors::RecorderError;

#[cfg(feature = "lsl")]
pub mod lsl;

/// Failures surfaced by a stream source. All of these are recoverable
/// from the acquisition loop's point of view: `Unavailable` and `Lost`
/// trigger a reconnect with backoff, `Transient` skips one cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("inlet permanently severed")]
    Lost,

    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<SourceError> for RecorderError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) => RecorderError::SourceUnavailable(msg),
            SourceError::Lost => RecorderError::SourceLost,
            SourceError::Transient(msg) => RecorderError::Transient(msg),
        }
    }
}

/// Identity and schema of a discoverable stream.
///
/// The `uid` is only stable within one discovery cycle; a fresh discovery
/// may hand out new uids for the same physical stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub uid: String,
    pub name: String,
    pub stream_type: String,
    pub hostname: String,
    pub source_id: String,
    pub channel_count: u32,
    pub channel_format: Format,
    /// `None` encodes a nominal rate of 0, i.e. irregular sampling.
    pub nominal_srate: Option<NonZeroPositiveF64>,
    /// Opaque metadata subtree, serialized verbatim under `<desc>`. The
    /// recorder never interprets it.
    pub metadata: Option<Element>,
}

impl StreamDescriptor {
    pub fn srate_hz(&self) -> f64 {
        self.nominal_srate.map_or(0.0, |rate| rate.get())
    }

    /// The `<info>` element written into this stream's header chunk.
    pub fn header_xml(&self) -> Element {
        let mut info = Element::new("info");
        push_text_child(&mut info, "name", &self.name);
        push_text_child(&mut info, "type", &self.stream_type);
        push_text_child(&mut info, "channel_count", &self.channel_count.to_string());
        push_text_child(&mut info, "nominal_srate", &self.srate_hz().to_string());
        push_text_child(&mut info, "channel_format", self.channel_format.as_str());
        push_text_child(&mut info, "source_id", &self.source_id);
        push_text_child(&mut info, "hostname", &self.hostname);
        push_text_child(&mut info, "uid", &self.uid);
        let desc = self
            .metadata
            .clone()
            .unwrap_or_else(|| Element::new("desc"));
        info.children.push(XMLNode::Element(desc));
        info
    }
}

fn push_text_child(parent: &mut Element, name: &str, text: &str) {
    let mut child = Element::new(name);
    child.children.push(XMLNode::Text(text.to_string()));
    parent.children.push(XMLNode::Element(child));
}

/// An open subscription to one remote stream.
pub trait Inlet: Send {
    /// Pulls up to `max_samples` samples, blocking at most `timeout_s`.
    /// An empty batch means no data arrived within the window; `Lost`
    /// means the subscription is severed for good and must be reopened.
    fn pull_batch(&mut self, max_samples: usize, timeout_s: f64) -> Result<Vec<Sample>, SourceError>;

    /// Current offset between the local clock and the remote clock, in
    /// seconds. May fail `Transient`; callers tolerate and retry later.
    fn time_correction(&mut self, timeout_s: f64) -> Result<f64, SourceError>;

    /// Idempotent.
    fn close(&mut self);
}

/// Discovery and inlet construction. The sole boundary to the transport.
pub trait StreamSource: Send + Sync + 'static {
    type Inlet: Inlet + 'static;

    /// Blocks up to `timeout_s`. An empty result is not an error.
    fn discover(&self, timeout_s: f64) -> Vec<StreamDescriptor>;

    /// Fails `Unavailable` if the stream vanished between discovery and
    /// open.
    fn open(
        &self,
        descriptor: &StreamDescriptor,
        buffer_seconds: u32,
        max_chunk_len: usize,
    ) -> Result<Self::Inlet, SourceError>;

    /// Clock of the transport's time base, seconds.
    fn local_clock(&self) -> f64 {
        crate::clock::now_streaming()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            uid: "uid-1".into(),
            name: "BioSemi".into(),
            stream_type: "EEG".into(),
            hostname: "labpc".into(),
            source_id: "biosemi-1".into(),
            channel_count: 8,
            channel_format: Format::Float32,
            nominal_srate: NonZeroPositiveF64::new(512.0),
            metadata: None,
        }
    }

    #[test]
    fn header_xml_carries_the_schema_fields() {
        let xml = descriptor().header_xml();
        let text = |tag: &str| {
            xml.get_child(tag)
                .and_then(|child| child.get_text())
                .map(|value| value.to_string())
        };
        assert_eq!(text("name").as_deref(), Some("BioSemi"));
        assert_eq!(text("channel_count").as_deref(), Some("8"));
        assert_eq!(text("nominal_srate").as_deref(), Some("512"));
        assert_eq!(text("channel_format").as_deref(), Some("float32"));
        assert!(xml.get_child("desc").is_some());
    }

    #[test]
    fn irregular_rate_serializes_as_zero() {
        let mut desc = descriptor();
        desc.nominal_srate = None;
        let xml = desc.header_xml();
        let srate = xml
            .get_child("nominal_srate")
            .and_then(|child| child.get_text())
            .map(|value| value.to_string());
        assert_eq!(srate.as_deref(), Some("0"));
    }
}
