//! Frame splitting and per-chunk content parsers.

// chunk structure
// [NumLengthBytes] [Length] [Tag] [Content]
// [1, 4, or 8] [as coded] [u16 le] [arbitrary]

use byteorder::{ByteOrder, LittleEndian};
use nom::branch::alt;
use nom::bytes::complete::{tag, take};
use nom::combinator::{complete, map_opt, value};
use nom::multi::{count, many0};
use nom::number::complete::{
    le_f32, le_f64, le_i16, le_i32, le_i64, le_i8, le_u16, le_u32, le_u64, le_u8,
};
use nom::IResult;
use xmltree::Element;

use crate::chunks::{
    BoundaryChunk, ClockOffsetChunk, FileHeaderChunk, Format, Sample, SamplesChunk,
    StreamFooterChunk, StreamFooterInfo, StreamHeaderChunk, StreamHeaderInfo, Tag as ChunkTag,
    Values, BOUNDARY_UUID,
};
use crate::errors::{RecorderError, Result};

pub(super) struct RawFrame<'a> {
    pub tag: ChunkTag,
    pub content: &'a [u8],
}

fn num_length_bytes(input: &[u8]) -> IResult<&[u8], u8> {
    alt((
        value(1, tag([1_u8])),
        value(4, tag([4_u8])),
        value(8, tag([8_u8])),
    ))(input)
}

pub(super) fn length(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, width) = num_length_bytes(input)?;
    match width {
        1 => {
            let (input, len) = le_u8(input)?;
            Ok((input, u64::from(len)))
        }
        4 => {
            let (input, len) = le_u32(input)?;
            Ok((input, u64::from(len)))
        }
        8 => le_u64(input),
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        ))),
    }
}

fn chunk_tag(input: &[u8]) -> IResult<&[u8], ChunkTag> {
    map_opt(le_u16, ChunkTag::from_u16)(input)
}

fn frame(input: &[u8]) -> IResult<&[u8], RawFrame<'_>> {
    let (input, len) = length(input)?;
    if len < 2 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (input, body) = take(len as usize)(input)?;
    let (content, tag) = chunk_tag(body)?;
    Ok((input, RawFrame { tag, content }))
}

pub(super) fn frames(input: &[u8]) -> IResult<&[u8], Vec<RawFrame<'_>>> {
    many0(complete(frame))(input)
}

pub(super) fn peek_stream_id(content: &[u8]) -> Result<u32> {
    Ok(split_stream_id(content)?.0)
}

fn split_stream_id(content: &[u8]) -> Result<(u32, &[u8])> {
    if content.len() < 4 {
        return Err(RecorderError::Parse("chunk too short for a stream id".into()));
    }
    Ok((LittleEndian::read_u32(&content[..4]), &content[4..]))
}

pub(super) fn file_header(content: &[u8]) -> Result<FileHeaderChunk> {
    let xml = parse_xml(content)?;
    let version_text = child_text(&xml, "version")
        .ok_or_else(|| RecorderError::Parse("file header has no version element".into()))?;
    let version: f32 = version_text
        .parse()
        .map_err(|_| RecorderError::Parse(format!("bad file version {version_text:?}")))?;
    if version != 1.0 {
        return Err(RecorderError::Parse(format!(
            "unsupported XDF version {version}"
        )));
    }
    Ok(FileHeaderChunk { version, xml })
}

pub(super) fn stream_header(content: &[u8]) -> Result<StreamHeaderChunk> {
    let (stream_id, rest) = split_stream_id(content)?;
    let xml = parse_xml(rest)?;
    let channel_count = child_text(&xml, "channel_count")
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| {
            RecorderError::Parse(format!("stream {stream_id}: bad or missing channel_count"))
        })?;
    let channel_format = child_text(&xml, "channel_format")
        .and_then(|text| Format::from_name(&text))
        .ok_or_else(|| {
            RecorderError::Parse(format!("stream {stream_id}: bad or missing channel_format"))
        })?;
    let nominal_srate = child_text(&xml, "nominal_srate")
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|rate| *rate > 0.0);
    let info = StreamHeaderInfo {
        channel_count,
        nominal_srate,
        channel_format,
        name: child_text(&xml, "name"),
        stream_type: child_text(&xml, "type"),
    };
    Ok(StreamHeaderChunk {
        stream_id,
        info,
        xml,
    })
}

pub(super) fn samples(content: &[u8], format: Format, channel_count: u32) -> Result<SamplesChunk> {
    let (stream_id, rest) = split_stream_id(content)?;
    let malformed =
        || RecorderError::Parse(format!("stream {stream_id}: malformed samples payload"));
    let (rest, samples) =
        samples_body(rest, format, channel_count as usize).map_err(|_| malformed())?;
    if !rest.is_empty() {
        return Err(malformed());
    }
    Ok(SamplesChunk { stream_id, samples })
}

fn samples_body(input: &[u8], format: Format, channels: usize) -> IResult<&[u8], Vec<Sample>> {
    let (input, num_samples) = length(input)?;
    count(|i| sample(i, format, channels), num_samples as usize)(input)
}

// structure of a sample:
// [TimestampBytes] [OptionalTimestamp] [Value 1] ... [Value N]
// [0 or 8] [f64 le, seconds] [as coded by the stream format] ...

fn sample(input: &[u8], format: Format, channels: usize) -> IResult<&[u8], Sample> {
    let (input, timestamp) = optional_timestamp(input)?;
    let (input, values) = values(input, format, channels)?;
    Ok((input, Sample { timestamp, values }))
}

fn optional_timestamp(input: &[u8]) -> IResult<&[u8], Option<f64>> {
    let (input, width) = le_u8(input)?;
    match width {
        0 => Ok((input, None)),
        8 => {
            let (input, timestamp) = le_f64(input)?;
            Ok((input, Some(timestamp)))
        }
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        ))),
    }
}

// string values carry their own 1/4/8-byte length prefix
fn string_value(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = length(input)?;
    let (input, bytes) = take(len as usize)(input)?;
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => Ok((input, text)),
        Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        ))),
    }
}

fn values(input: &[u8], format: Format, channels: usize) -> IResult<&[u8], Values> {
    match format {
        Format::Int8 => {
            let (input, items) = count(le_i8, channels)(input)?;
            Ok((input, Values::Int8(items)))
        }
        Format::Int16 => {
            let (input, items) = count(le_i16, channels)(input)?;
            Ok((input, Values::Int16(items)))
        }
        Format::Int32 => {
            let (input, items) = count(le_i32, channels)(input)?;
            Ok((input, Values::Int32(items)))
        }
        Format::Int64 => {
            let (input, items) = count(le_i64, channels)(input)?;
            Ok((input, Values::Int64(items)))
        }
        Format::Float32 => {
            let (input, items) = count(le_f32, channels)(input)?;
            Ok((input, Values::Float32(items)))
        }
        Format::Float64 => {
            let (input, items) = count(le_f64, channels)(input)?;
            Ok((input, Values::Float64(items)))
        }
        Format::String => {
            let (input, items) = count(string_value, channels)(input)?;
            Ok((input, Values::String(items)))
        }
    }
}

// clock offset content:
// [StreamID] [CollectionTime] [OffsetValue]
// [u32 le] [f64 le, seconds] [f64 le, seconds]

pub(super) fn clock_offset(content: &[u8]) -> Result<ClockOffsetChunk> {
    if content.len() != 20 {
        return Err(RecorderError::Parse(format!(
            "clock offset chunk must be 20 bytes, got {}",
            content.len()
        )));
    }
    Ok(ClockOffsetChunk {
        stream_id: LittleEndian::read_u32(&content[..4]),
        collection_time: LittleEndian::read_f64(&content[4..12]),
        offset_value: LittleEndian::read_f64(&content[12..20]),
    })
}

pub(super) fn boundary(content: &[u8]) -> Result<BoundaryChunk> {
    if content != BOUNDARY_UUID {
        return Err(RecorderError::Parse(
            "boundary chunk carries the wrong UUID".into(),
        ));
    }
    Ok(BoundaryChunk)
}

pub(super) fn stream_footer(content: &[u8]) -> Result<StreamFooterChunk> {
    let (stream_id, rest) = split_stream_id(content)?;
    let xml = parse_xml(rest)?;
    let number = |name: &str| child_text(&xml, name).and_then(|text| text.parse::<f64>().ok());
    let info = StreamFooterInfo {
        first_timestamp: number("first_timestamp"),
        last_timestamp: number("last_timestamp"),
        sample_count: child_text(&xml, "sample_count")
            .and_then(|text| text.parse().ok())
            .unwrap_or(0),
        clock_offsets: child_text(&xml, "clock_offsets")
            .and_then(|text| text.parse().ok())
            .unwrap_or(0),
    };
    Ok(StreamFooterChunk {
        stream_id,
        info,
        xml,
    })
}

fn parse_xml(bytes: &[u8]) -> Result<Element> {
    Element::parse(bytes).map_err(|err| RecorderError::Parse(format!("bad XML payload: {err}")))
}

fn child_text(root: &Element, name: &str) -> Option<String> {
    root.get_child(name)
        .and_then(|child| child.get_text())
        .map(|text| text.to_string())
}
