//! Binary framing for [`Message`].
//!
//! Every frame starts with a one-byte tag. Control frames put the control
//! kind immediately after the tag, which is why the first two bytes of every
//! asterisque stream are `*Q` (0x2A 0x51): the leading `Control(SyncSession)`
//! of the handshake. A u16 little-endian length of the remaining body follows
//! the tag (and kind), so decoding is restartable: a short buffer yields
//! `Ok(None)` and consumes nothing.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};

use crate::{Block, Close, CodecError, Control, Message, Open, SyncSession, Value, type_id};

/// Message tag for `Open`.
pub const TAG_OPEN: u8 = b'Q';
/// Message tag for `Close`.
pub const TAG_CLOSE: u8 = b'-';
/// Message tag for `Block`.
pub const TAG_BLOCK: u8 = b'#';
/// Message tag for `Control`; the kind byte follows immediately.
pub const TAG_CONTROL: u8 = b'*';

/// Control kind: session handshake.
pub const CTRL_SYNC_SESSION: u8 = b'Q';
/// Control kind: graceful session shutdown.
pub const CTRL_CLOSE: u8 = 1;

/// The first two bytes of every asterisque stream: the tag and kind of the
/// leading `Control(SyncSession)`.
pub const STREAM_MAGIC: [u8; 2] = [TAG_CONTROL, CTRL_SYNC_SESSION];

/// Maximum body size representable by the u16 length field.
pub const MAX_BODY_LEN: usize = 0xFFFF;

/// Maximum nesting of lists and maps accepted by the value decoder.
const MAX_VALUE_DEPTH: usize = 64;

/// Encode a message into a self-contained frame.
///
/// Fails with [`CodecError::MessageTooLarge`] (without side effects) if the
/// body exceeds the 16-bit length budget.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    match msg {
        Message::Open(open) => {
            let mut body = Vec::with_capacity(8);
            put_u16(&mut body, open.pipe_id);
            put_u16(&mut body, open.function_id);
            body.push(open.priority as u8);
            encode_value(&mut body, &open.params)?;
            frame(TAG_OPEN, None, body)
        }
        Message::Block(block) => {
            if block.payload.len() > Block::MAX_PAYLOAD {
                return Err(CodecError::MessageTooLarge(block.payload.len()));
            }
            if block.eof && !block.payload.is_empty() {
                return Err(CodecError::Malformed("eof block with non-empty payload"));
            }
            if block.loss > Block::MAX_LOSS {
                return Err(CodecError::Malformed("loss exceeds 7 bits"));
            }
            let mut body = Vec::with_capacity(block.payload.len() + 5);
            put_u16(&mut body, block.pipe_id);
            body.push(((block.eof as u8) << 7) | block.loss);
            put_u16(&mut body, block.payload.len() as u16);
            body.extend_from_slice(&block.payload);
            frame(TAG_BLOCK, None, body)
        }
        Message::Close(close) => {
            let mut body = Vec::with_capacity(8);
            put_u16(&mut body, close.pipe_id);
            body.push(close.code);
            encode_value(&mut body, &close.body)?;
            frame(TAG_CLOSE, None, body)
        }
        Message::Control(Control::SyncSession(sync)) => {
            let mut body = Vec::with_capacity(64);
            put_u16(&mut body, sync.version);
            put_u64(&mut body, sync.session_id);
            put_u64(&mut body, sync.utc_ms);
            put_len_bytes(&mut body, &sync.sealed_certificate)?;
            put_len_bytes(&mut body, sync.service_id.as_bytes())?;
            if sync.config.len() > u16::MAX as usize {
                return Err(CodecError::MessageTooLarge(sync.config.len()));
            }
            put_u16(&mut body, sync.config.len() as u16);
            for (key, val) in &sync.config {
                put_len_bytes(&mut body, key.as_bytes())?;
                put_len_bytes(&mut body, val.as_bytes())?;
            }
            frame(TAG_CONTROL, Some(CTRL_SYNC_SESSION), body)
        }
        Message::Control(Control::Close) => frame(TAG_CONTROL, Some(CTRL_CLOSE), Vec::new()),
    }
}

/// Decode one message from the front of `buf`.
///
/// Returns `Ok(None)` ("unsatisfied") when the buffer holds fewer bytes than
/// the message requires; the caller retries with more input. On success the
/// returned usize is the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf[0];
    let header = match tag {
        TAG_CONTROL => 4,
        TAG_OPEN | TAG_CLOSE | TAG_BLOCK => 3,
        other => return Err(CodecError::UnknownTag(other)),
    };
    if buf.len() < header {
        return Ok(None);
    }
    let len = u16::from_le_bytes([buf[header - 2], buf[header - 1]]) as usize;
    let total = header + len;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[header..total];
    let msg = match tag {
        TAG_OPEN => decode_open(body)?,
        TAG_CLOSE => decode_close(body)?,
        TAG_BLOCK => decode_block(body)?,
        TAG_CONTROL => decode_control(buf[1], body)?,
        _ => unreachable!(),
    };
    Ok(Some((msg, total)))
}

fn frame(tag: u8, kind: Option<u8>, body: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::MessageTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(tag);
    if let Some(kind) = kind {
        out.push(kind);
    }
    put_u16(&mut out, body.len() as u16);
    out.extend_from_slice(&body);
    Ok(out)
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_len_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::ValueTooLong(bytes.len()));
    }
    put_u16(buf, bytes.len() as u16);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), CodecError> {
    buf.push(value.type_id());
    match value {
        Value::Null => {}
        Value::Bool(b) => buf.push(*b as u8),
        Value::Int8(v) => buf.push(*v as u8),
        Value::Int16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Float32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Float64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Char(c) => {
            let cp = *c as u32;
            if cp > u16::MAX as u32 {
                return Err(CodecError::CharOutOfRange(cp));
            }
            put_u16(buf, cp as u16);
        }
        Value::String(s) => put_len_bytes(buf, s.as_bytes())?,
        Value::Binary(b) => put_len_bytes(buf, b)?,
        Value::List(items) => {
            if items.len() > u16::MAX as usize {
                return Err(CodecError::ValueTooLong(items.len()));
            }
            put_u16(buf, items.len() as u16);
            for item in items {
                encode_value(buf, item)?;
            }
        }
        Value::Map(pairs) => {
            if pairs.len() > u16::MAX as usize {
                return Err(CodecError::ValueTooLong(pairs.len()));
            }
            put_u16(buf, pairs.len() as u16);
            for (key, val) in pairs {
                encode_value(buf, key)?;
                encode_value(buf, val)?;
            }
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Malformed("truncated body"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    fn len_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn len_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.len_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::Malformed("trailing bytes after body"));
        }
        Ok(())
    }
}

fn decode_open(body: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(body);
    let pipe_id = r.u16()?;
    let function_id = r.u16()?;
    let priority = r.u8()? as i8;
    let params = decode_value(&mut r, 0)?;
    r.finish()?;
    Ok(Message::Open(Open { pipe_id, priority, function_id, params }))
}

fn decode_block(body: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(body);
    let pipe_id = r.u16()?;
    let packed = r.u8()?;
    let eof = packed & 0x80 != 0;
    let loss = packed & Block::MAX_LOSS;
    let payload = r.len_bytes()?.to_vec();
    r.finish()?;
    if eof && !payload.is_empty() {
        return Err(CodecError::Malformed("eof block with non-empty payload"));
    }
    Ok(Message::Block(Block { pipe_id, loss, payload, eof }))
}

fn decode_close(body: &[u8]) -> Result<Message, CodecError> {
    let mut r = Reader::new(body);
    let pipe_id = r.u16()?;
    let code = r.u8()?;
    let value = decode_value(&mut r, 0)?;
    r.finish()?;
    Ok(Message::Close(Close { pipe_id, code, body: value }))
}

fn decode_control(kind: u8, body: &[u8]) -> Result<Message, CodecError> {
    match kind {
        CTRL_SYNC_SESSION => {
            let mut r = Reader::new(body);
            let version = r.u16()?;
            let session_id = r.u64()?;
            let utc_ms = r.u64()?;
            let sealed_certificate = r.len_bytes()?.to_vec();
            let service_id = r.len_string()?;
            let pairs = r.u16()?;
            let mut config = BTreeMap::new();
            for _ in 0..pairs {
                let key = r.len_string()?;
                let val = r.len_string()?;
                config.insert(key, val);
            }
            r.finish()?;
            Ok(Message::Control(Control::SyncSession(SyncSession {
                version,
                session_id,
                utc_ms,
                sealed_certificate,
                service_id,
                config,
            })))
        }
        CTRL_CLOSE => {
            if !body.is_empty() {
                return Err(CodecError::Malformed("control close with body"));
            }
            Ok(Message::Control(Control::Close))
        }
        other => Err(CodecError::UnknownControlKind(other)),
    }
}

fn decode_value(r: &mut Reader<'_>, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::Malformed("value nesting too deep"));
    }
    let tid = r.u8()?;
    let value = match tid {
        type_id::NULL => Value::Null,
        type_id::BOOL => Value::Bool(r.u8()? != 0),
        type_id::INT8 => Value::Int8(r.u8()? as i8),
        type_id::INT16 => Value::Int16(r.u16()? as i16),
        type_id::INT32 => {
            let b = r.take(4)?;
            Value::Int32(i32::from_le_bytes(b.try_into().expect("4-byte slice")))
        }
        type_id::INT64 => Value::Int64(r.u64()? as i64),
        type_id::FLOAT32 => {
            let b = r.take(4)?;
            Value::Float32(f32::from_le_bytes(b.try_into().expect("4-byte slice")))
        }
        type_id::FLOAT64 => Value::Float64(f64::from_bits(r.u64()?)),
        type_id::CHAR => {
            let cp = r.u16()? as u32;
            let c = char::from_u32(cp).ok_or(CodecError::CharOutOfRange(cp))?;
            Value::Char(c)
        }
        type_id::STRING => Value::String(r.len_string()?),
        type_id::BINARY => Value::Binary(r.len_bytes()?.to_vec()),
        type_id::LIST => {
            let count = r.u16()? as usize;
            let mut items = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                items.push(decode_value(r, depth + 1)?);
            }
            Value::List(items)
        }
        type_id::MAP => {
            let count = r.u16()? as usize;
            let mut pairs = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let key = decode_value(r, depth + 1)?;
                let val = decode_value(r, depth + 1)?;
                pairs.push((key, val));
            }
            Value::Map(pairs)
        }
        other => return Err(CodecError::UnknownValueType(other)),
    };
    Ok(value)
}

/// Incremental decoder used by the transport drivers.
///
/// Bytes are appended with [`feed`](FrameDecoder::feed) as they arrive from
/// the transport; [`next`](FrameDecoder::next) pops complete messages and
/// leaves partial frames buffered.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder { buf: BytesMut::with_capacity(8 * 1024) }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn next(&mut self) -> Result<Option<Message>, CodecError> {
        match decode(&self.buf)? {
            Some((msg, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
