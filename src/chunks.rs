//! On-disk chunk model shared by the writer and the reader.

use xmltree::Element;

/// Chunk tags as they appear on disk (little-endian `u16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    FileHeader = 1,
    StreamHeader = 2,
    Samples = 3,
    ClockOffset = 4,
    Boundary = 5,
    StreamFooter = 6,
}

impl Tag {
    pub(crate) fn to_le_bytes(self) -> [u8; 2] {
        (self as u16).to_le_bytes()
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Tag::FileHeader),
            2 => Some(Tag::StreamHeader),
            3 => Some(Tag::Samples),
            4 => Some(Tag::ClockOffset),
            5 => Some(Tag::Boundary),
            6 => Some(Tag::StreamFooter),
            _ => None,
        }
    }
}

/// The fixed 16-byte UUID carried by every Boundary chunk.
pub const BOUNDARY_UUID: [u8; 16] = [
    0x43, 0xA5, 0x46, 0xDC, 0xCB, 0xF5, 0x41, 0x0F, 0xB3, 0x0E, 0xD5, 0x46, 0x73, 0x83, 0xCB, 0xE4,
];

/// Channel value format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

impl Format {
    /// Name written into stream header XML. The on-disk name for `Float64`
    /// is `double64`, inherited from LSL.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Int8 => "int8",
            Format::Int16 => "int16",
            Format::Int32 => "int32",
            Format::Int64 => "int64",
            Format::Float32 => "float32",
            Format::Float64 => "double64",
            Format::String => "string",
        }
    }

    /// Accepts both the on-disk spelling and the `float64` alias.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int8" => Some(Format::Int8),
            "int16" => Some(Format::Int16),
            "int32" => Some(Format::Int32),
            "int64" => Some(Format::Int64),
            "float32" => Some(Format::Float32),
            "double64" | "float64" => Some(Format::Float64),
            "string" => Some(Format::String),
            _ => None,
        }
    }

    /// Byte width of a single value, `None` for strings.
    pub fn value_size(self) -> Option<usize> {
        match self {
            Format::Int8 => Some(1),
            Format::Int16 => Some(2),
            Format::Int32 => Some(4),
            Format::Int64 => Some(8),
            Format::Float32 => Some(4),
            Format::Float64 => Some(8),
            Format::String => None,
        }
    }
}

/// Channel values of a single sample, tagged by format.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

impl Values {
    pub fn format(&self) -> Format {
        match self {
            Values::Int8(_) => Format::Int8,
            Values::Int16(_) => Format::Int16,
            Values::Int32(_) => Format::Int32,
            Values::Int64(_) => Format::Int64,
            Values::Float32(_) => Format::Float32,
            Values::Float64(_) => Format::Float64,
            Values::String(_) => Format::String,
        }
    }

    /// Number of channel values held.
    pub fn len(&self) -> usize {
        match self {
            Values::Int8(v) => v.len(),
            Values::Int16(v) => v.len(),
            Values::Int32(v) => v.len(),
            Values::Int64(v) => v.len(),
            Values::Float32(v) => v.len(),
            Values::Float64(v) => v.len(),
            Values::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single sample of one stream.
///
/// A `None` timestamp means the reader should deduce it from the previous
/// sample plus `1 / nominal_srate`; only regular-rate streams may omit
/// timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: Option<f64>,
    pub values: Values,
}

#[derive(Debug)]
pub struct FileHeaderChunk {
    pub version: f32,
    pub xml: Element,
}

#[derive(Debug, Clone)]
pub struct StreamHeaderInfo {
    pub channel_count: u32,
    /// `None` encodes a nominal rate of 0, i.e. irregular sampling.
    pub nominal_srate: Option<f64>,
    pub channel_format: Format,
    pub name: Option<String>,
    pub stream_type: Option<String>,
}

#[derive(Debug)]
pub struct StreamHeaderChunk {
    pub stream_id: u32,
    pub info: StreamHeaderInfo,
    pub xml: Element,
}

#[derive(Debug)]
pub struct SamplesChunk {
    pub stream_id: u32,
    pub samples: Vec<Sample>,
}

#[derive(Debug)]
pub struct ClockOffsetChunk {
    pub stream_id: u32,
    pub collection_time: f64,
    pub offset_value: f64,
}

#[derive(Debug)]
pub struct BoundaryChunk;

#[derive(Debug, Clone)]
pub struct StreamFooterInfo {
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
    pub sample_count: u64,
    pub clock_offsets: u64,
}

#[derive(Debug)]
pub struct StreamFooterChunk {
    pub stream_id: u32,
    pub info: StreamFooterInfo,
    pub xml: Element,
}

/// One parsed chunk of an XDF file.
#[derive(Debug)]
pub enum Chunk {
    FileHeader(FileHeaderChunk),
    StreamHeader(StreamHeaderChunk),
    Samples(SamplesChunk),
    ClockOffset(ClockOffsetChunk),
    Boundary(BoundaryChunk),
    StreamFooter(StreamFooterChunk),
}

impl Chunk {
    /// Stream id carried by the chunk, if any. FileHeader and Boundary
    /// chunks are file-global.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Chunk::StreamHeader(c) => Some(c.stream_id),
            Chunk::Samples(c) => Some(c.stream_id),
            Chunk::ClockOffset(c) => Some(c.stream_id),
            Chunk::StreamFooter(c) => Some(c.stream_id),
            Chunk::FileHeader(_) | Chunk::Boundary(_) => None,
        }
    }
}
