//! Typed reply frames
//!
//! A [`Reply`] is the result of one command: a return code, a signature
//! describing the field types of one logical row, and the flat list of
//! fields. The signature cycles over the payload, so `[String, Int]`
//! describes alternating key/count pairs.

use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use super::varint::{put_slot, put_varint, read_slot, read_varint, SLOT_SIZE};
use super::ProtocolError;

/// Largest signature a decoder accepts.
const MAX_SIGNATURE_LEN: i64 = 64;

/// Field type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    String,
}

impl FieldType {
    pub fn code(self) -> i64 {
        match self {
            FieldType::Bool => 0,
            FieldType::Int => 1,
            FieldType::String => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(FieldType::Bool),
            1 => Ok(FieldType::Int),
            2 => Ok(FieldType::String),
            other => Err(ProtocolError::UnknownFieldType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Bool => "BOOL",
            FieldType::Int => "INT",
            FieldType::String => "STRING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    Fail,
}

impl ReturnCode {
    pub fn code(self) -> i64 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::Fail => 1,
        }
    }

    /// Anything other than 0 is a failure.
    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            ReturnCode::Ok
        } else {
            ReturnCode::Fail
        }
    }
}

/// One payload row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Bool(bool),
    Int(i64),
    Str(Vec<u8>),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Bool(_) => FieldType::Bool,
            Field::Int(_) => FieldType::Int,
            Field::Str(_) => FieldType::String,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Field::Str(value.into().into_bytes())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Bool(true) => write!(f, "TRUE"),
            Field::Bool(false) => write!(f, "FALSE"),
            Field::Int(i) => write!(f, "{}", i),
            Field::Str(s) => write!(f, "{}", String::from_utf8_lossy(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub return_code: ReturnCode,
    pub signature: Vec<FieldType>,
    pub payload: Vec<Field>,
}

impl Reply {
    pub fn new(return_code: ReturnCode, signature: Vec<FieldType>, payload: Vec<Field>) -> Self {
        Self { return_code, signature, payload }
    }

    /// Successful reply without rows.
    pub fn empty() -> Self {
        Self::new(ReturnCode::Ok, Vec::new(), Vec::new())
    }

    /// Successful reply with exactly one field.
    pub fn single(field: Field) -> Self {
        Self::new(ReturnCode::Ok, vec![field.field_type()], vec![field])
    }

    pub fn rows(signature: Vec<FieldType>, payload: Vec<Field>) -> Self {
        Self::new(ReturnCode::Ok, signature, payload)
    }

    /// Failure reply carrying a human readable message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(ReturnCode::Fail, vec![FieldType::String], vec![Field::text(message)])
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == ReturnCode::Ok
    }

    /// First payload field, if any.
    pub fn first(&self) -> Option<&Field> {
        self.payload.first()
    }

    /// Payload grouped into logical rows of `signature.len()` fields.
    pub fn logical_rows(&self) -> impl Iterator<Item = &[Field]> {
        self.payload.chunks(self.signature.len().max(1))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(3 + self.signature.len() + self.payload.len() * SLOT_SIZE);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        put_varint(buf, self.return_code.code());
        put_varint(buf, self.signature.len() as i64);
        for field_type in &self.signature {
            put_varint(buf, field_type.code());
        }

        if self.signature.is_empty() {
            for _ in &self.payload {
                put_slot(buf, 0)?;
            }
            return Ok(());
        }

        for (index, field) in self.payload.iter().enumerate() {
            let expected = self.signature[index % self.signature.len()];
            if field.field_type() != expected {
                return Err(ProtocolError::SignatureMismatch {
                    index,
                    expected,
                    found: field.field_type(),
                });
            }
            encode_field(field, buf)?;
        }
        Ok(())
    }

    /// Decode one frame.
    ///
    /// The row list ends where the input ends; a truncated trailing row is
    /// dropped rather than reported.
    pub fn decode(input: &[u8]) -> Result<Reply, ProtocolError> {
        let (mut reply, mut pos) = decode_header(input)?;

        if reply.signature.is_empty() {
            return Ok(reply);
        }

        let mut index = 0;
        while pos < input.len() {
            let field_type = reply.signature[index % reply.signature.len()];
            match decode_field(&input[pos..], field_type) {
                Ok((field, used)) => {
                    reply.payload.push(field);
                    pos += used;
                    index += 1;
                }
                Err(e) => {
                    debug!(row = index, error = %e, "reply rows end at truncated input");
                    break;
                }
            }
        }
        Ok(reply)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_ok() {
            let message = self.payload.first().map(|m| m.to_string()).unwrap_or_default();
            return writeln!(f, "{} (Return code {})", message, self.return_code.code());
        }
        match self.payload.len() {
            0 => writeln!(f, "OK"),
            1 => writeln!(f, "{}", self.payload[0]),
            _ => {
                for (n, row) in self.logical_rows().enumerate() {
                    let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
                    writeln!(f, "{}) {}", n + 1, cells.join(" "))?;
                }
                Ok(())
            }
        }
    }
}

fn decode_header(input: &[u8]) -> Result<(Reply, usize), ProtocolError> {
    let (code, mut pos) = read_varint(input)?;
    let (count, used) = read_varint(&input[pos..])?;
    pos += used;
    if !(0..=MAX_SIGNATURE_LEN).contains(&count) {
        return Err(ProtocolError::MalformedMessage(format!("invalid field count {}", count)));
    }

    let mut signature = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (type_code, used) = read_varint(&input[pos..])?;
        pos += used;
        signature.push(FieldType::from_code(type_code)?);
    }

    Ok((Reply::new(ReturnCode::from_code(code), signature, Vec::new()), pos))
}

fn encode_field(field: &Field, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match field {
        Field::Bool(b) => put_slot(buf, *b as i64),
        Field::Int(i) => put_slot(buf, *i),
        Field::Str(s) => {
            put_slot(buf, s.len() as i64)?;
            buf.extend_from_slice(s);
            Ok(())
        }
    }
}

fn decode_field(input: &[u8], field_type: FieldType) -> Result<(Field, usize), ProtocolError> {
    let value = read_slot(input)?;
    match field_type {
        FieldType::Bool => Ok((Field::Bool(value != 0), SLOT_SIZE)),
        FieldType::Int => Ok((Field::Int(value), SLOT_SIZE)),
        FieldType::String => {
            let len = usize::try_from(value)
                .map_err(|_| ProtocolError::MalformedMessage(format!("negative length {}", value)))?;
            let end = SLOT_SIZE + len;
            if input.len() < end {
                return Err(ProtocolError::Truncated);
            }
            Ok((Field::Str(input[SLOT_SIZE..end].to_vec()), end))
        }
    }
}

/// Encode the replies of one message as newline separated frames.
pub fn encode_batch(replies: &[Reply]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    for (n, reply) in replies.iter().enumerate() {
        if n > 0 {
            buf.push(b'\n');
        }
        reply.encode_into(&mut buf)?;
    }
    Ok(buf)
}

/// Split a reply body into `expected` frames.
///
/// The separator byte can also occur inside row slots, so the split is the
/// segmentation into exactly `expected` well-formed frames that consumes the
/// whole body.
pub fn decode_batch(input: &[u8], expected: usize) -> Result<Vec<Reply>, ProtocolError> {
    match expected {
        0 if input.is_empty() => Ok(Vec::new()),
        0 => Err(ProtocolError::BatchMismatch(0)),
        1 => Ok(vec![Reply::decode(input)?]),
        _ => {
            let mut dead_ends = HashSet::new();
            split_frames(input, 0, expected, &mut dead_ends)
                .ok_or(ProtocolError::BatchMismatch(expected))
        }
    }
}

/// One frame scanned from the front of a batch body.
struct ScannedFrame {
    reply: Reply,
    /// `(offset, fields)` pairs: the frame may end at `offset` (end of input
    /// or a `\n` byte) holding the first `fields` payload fields.
    ends: Vec<(usize, usize)>,
}

impl ScannedFrame {
    fn take(&self, fields: usize) -> Reply {
        let mut reply = Reply::new(self.reply.return_code, self.reply.signature.clone(), Vec::new());
        reply.payload.extend_from_slice(&self.reply.payload[..fields]);
        reply
    }
}

/// Walk one frame row by row and record every offset where it could end:
/// after a whole number of logical rows, written with canonical varints.
fn scan_frame(input: &[u8]) -> Option<ScannedFrame> {
    let (mut reply, mut pos) = decode_header(input).ok()?;
    let mut header = Vec::with_capacity(pos);
    reply.encode_into(&mut header).ok()?;
    if header.as_slice() != &input[..pos] {
        return None;
    }

    let at_boundary = |pos: usize| pos == input.len() || input[pos] == b'\n';
    let mut ends = Vec::new();

    if reply.signature.is_empty() {
        loop {
            if at_boundary(pos) {
                ends.push((pos, 0));
            }
            if input.get(pos..pos + SLOT_SIZE) != Some(&[0u8; SLOT_SIZE][..]) {
                break;
            }
            pos += SLOT_SIZE;
        }
        return Some(ScannedFrame { reply, ends });
    }

    let width = reply.signature.len();
    let mut canonical = Vec::new();
    loop {
        if reply.payload.len() % width == 0 && at_boundary(pos) {
            ends.push((pos, reply.payload.len()));
        }
        if pos >= input.len() {
            break;
        }
        let field_type = reply.signature[reply.payload.len() % width];
        let Ok((field, used)) = decode_field(&input[pos..], field_type) else {
            break;
        };
        canonical.clear();
        if encode_field(&field, &mut canonical).is_err() || canonical.as_slice() != &input[pos..pos + used] {
            break;
        }
        reply.payload.push(field);
        pos += used;
    }
    Some(ScannedFrame { reply, ends })
}

fn split_frames(
    input: &[u8],
    start: usize,
    remaining: usize,
    dead_ends: &mut HashSet<(usize, usize)>,
) -> Option<Vec<Reply>> {
    if dead_ends.contains(&(start, remaining)) {
        return None;
    }

    if let Some(frame) = scan_frame(&input[start..]) {
        for &(end, fields) in &frame.ends {
            let at = start + end;
            if remaining == 1 {
                if at == input.len() {
                    return Some(vec![frame.take(fields)]);
                }
                continue;
            }
            if at == input.len() {
                continue;
            }
            if let Some(mut tail) = split_frames(input, at + 1, remaining - 1, dead_ends) {
                tail.insert(0, frame.take(fields));
                return Some(tail);
            }
        }
    }

    dead_ends.insert((start, remaining));
    None
}
