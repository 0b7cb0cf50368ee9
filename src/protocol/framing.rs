//! Self-delimited tagged records over a byte stream.
//!
//! A record is `<Tag>body</Tag>`. Text bodies are escaped so they never
//! contain delimiter text; composite bodies are a concatenation of nested
//! records. The decoder keeps its scan position between calls, so partial
//! reads never re-scan bytes already inspected, and it counts nested
//! occurrences of the same tag so `<A><A>x</A></A>` yields one record.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{ConnectionError, FramingError, HerdError, ProtocolError};

/// A tagged payload exchanged over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub tag: String,
    /// Raw body as it appears on the wire (escaped text or nested records).
    pub body: String,
}

impl FramedMessage {
    /// A record whose body is already wire-ready.
    pub fn raw(tag: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            body: body.into(),
        }
    }

    /// A record carrying `text`, escaped.
    pub fn text(tag: impl Into<String>, text: &str) -> Self {
        Self::raw(tag, escape(text))
    }

    /// A record whose body is the concatenation of `children`.
    pub fn composite(tag: impl Into<String>, children: &[FramedMessage]) -> Self {
        let mut body = String::new();
        for child in children {
            child.write_to(&mut body);
        }
        Self::raw(tag, body)
    }

    pub fn empty(tag: impl Into<String>) -> Self {
        Self::raw(tag, String::new())
    }

    /// The body interpreted as escaped text.
    pub fn as_text(&self) -> Result<String, ProtocolError> {
        unescape(&self.body)
    }

    /// The body interpreted as a sequence of nested records.
    pub fn children(&self) -> Result<Vec<FramedMessage>, ProtocolError> {
        let mut codec = RecordCodec::new();
        let mut buf = BytesMut::from(self.body.as_bytes());
        let mut out = Vec::new();
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => break,
                Err(FramingError::Protocol(e)) => return Err(e),
                Err(FramingError::Io(e)) => return Err(ProtocolError::Malformed(e.to_string())),
            }
        }
        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            return Err(ProtocolError::Malformed(format!(
                "truncated record inside <{}>",
                self.tag
            )));
        }
        Ok(out)
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        out.push('>');
        out.push_str(&self.body);
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }

    /// Wire representation of the record.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 2 * self.tag.len() + 5);
        self.write_to(&mut out);
        out
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['&', '<']) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if rest.starts_with('<') {
            return Err(ProtocolError::Malformed(
                "unescaped delimiter in text body".to_string(),
            ));
        }
        let (entity, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else {
            return Err(ProtocolError::Malformed(format!(
                "unknown entity near {:?}",
                &rest[..rest.len().min(8)]
            )));
        };
        out.push(entity);
        rest = &rest[len..];
    }
    out.push_str(rest);
    Ok(out)
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

#[derive(Debug, Default)]
enum DecodeState {
    /// Looking for the next opening delimiter.
    #[default]
    Seeking,
    /// Inside a record; `scan` is the next byte to inspect.
    InRecord {
        tag: String,
        body_start: usize,
        scan: usize,
        depth: usize,
    },
}

/// `tokio_util` codec for [`FramedMessage`] records.
#[derive(Debug, Default)]
pub struct RecordCodec {
    state: DecodeState,
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the opening delimiter at the start of `buf`.
    /// Returns the tag and the header length, or `None` if more bytes are needed.
    fn parse_open(buf: &BytesMut) -> Result<Option<(String, usize)>, ProtocolError> {
        debug_assert_eq!(buf.first(), Some(&b'<'));
        for (i, &b) in buf.iter().enumerate().skip(1) {
            if b == b'>' {
                if i == 1 {
                    return Err(ProtocolError::Malformed("empty tag".to_string()));
                }
                let tag = String::from_utf8_lossy(&buf[1..i]).into_owned();
                return Ok(Some((tag, i + 1)));
            }
            if !is_tag_byte(b) {
                return Err(ProtocolError::Malformed(format!(
                    "invalid byte {:#04x} in tag",
                    b
                )));
            }
        }
        Ok(None)
    }
}

impl Decoder for RecordCodec {
    type Item = FramedMessage;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &mut self.state {
                DecodeState::Seeking => {
                    let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                    buf.advance(skip);
                    let Some(&first) = buf.first() else {
                        return Ok(None);
                    };
                    if first != b'<' {
                        return Err(ProtocolError::Malformed(format!(
                            "unexpected byte {:#04x} between records",
                            first
                        ))
                        .into());
                    }
                    let Some((tag, header_len)) = Self::parse_open(buf)? else {
                        return Ok(None);
                    };
                    self.state = DecodeState::InRecord {
                        tag,
                        body_start: header_len,
                        scan: header_len,
                        depth: 1,
                    };
                }
                DecodeState::InRecord {
                    tag,
                    body_start,
                    scan,
                    depth,
                } => {
                    let open = format!("<{}>", tag);
                    let close = format!("</{}>", tag);
                    while *scan < buf.len() {
                        let Some(offset) = buf[*scan..].iter().position(|&b| b == b'<') else {
                            *scan = buf.len();
                            break;
                        };
                        let at = *scan + offset;
                        let rest = &buf[at..];
                        if rest.starts_with(close.as_bytes()) {
                            *depth -= 1;
                            if *depth == 0 {
                                let body_start = *body_start;
                                let tag = std::mem::take(tag);
                                self.state = DecodeState::Seeking;
                                let record = buf.split_to(at + close.len());
                                let body = std::str::from_utf8(&record[body_start..at])
                                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?
                                    .to_string();
                                return Ok(Some(FramedMessage { tag, body }));
                            }
                            *scan = at + close.len();
                        } else if rest.starts_with(open.as_bytes()) {
                            *depth += 1;
                            *scan = at + open.len();
                        } else if close.as_bytes().starts_with(rest) || open.as_bytes().starts_with(rest) {
                            // Delimiter split across reads.
                            *scan = at;
                            return Ok(None);
                        } else {
                            *scan = at + 1;
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(msg) = self.decode(buf)? {
            return Ok(Some(msg));
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            buf.clear();
            return Ok(None);
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed in the middle of a record",
        )
        .into())
    }
}

impl Encoder<FramedMessage> for RecordCodec {
    type Error = FramingError;

    fn encode(&mut self, item: FramedMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.tag.is_empty() || !item.tag.bytes().all(is_tag_byte) {
            return Err(ProtocolError::Malformed(format!("invalid tag {:?}", item.tag)).into());
        }
        dst.reserve(item.body.len() + 2 * item.tag.len() + 5);
        dst.put_u8(b'<');
        dst.put_slice(item.tag.as_bytes());
        dst.put_u8(b'>');
        dst.put_slice(item.body.as_bytes());
        dst.put_slice(b"</");
        dst.put_slice(item.tag.as_bytes());
        dst.put_u8(b'>');
        Ok(())
    }
}

/// A connection carrying [`FramedMessage`] records in both directions.
pub struct MessageStream<T> {
    inner: Framed<T, RecordCodec>,
}

impl<T> MessageStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            inner: Framed::new(io, RecordCodec::new()),
        }
    }

    /// Append one record to the stream and flush it.
    pub async fn write_message(&mut self, message: FramedMessage) -> Result<(), FramingError> {
        self.inner.send(message).await
    }

    /// Next record, or `None` on orderly close.
    pub async fn read_next(&mut self) -> Result<Option<FramedMessage>, FramingError> {
        self.inner.next().await.transpose()
    }

    /// Like [`read_next`](Self::read_next) but fails when the peer stays silent for `idle`.
    pub async fn read_next_timeout(
        &mut self,
        idle: Duration,
    ) -> Result<Option<FramedMessage>, HerdError> {
        match tokio::time::timeout(idle, self.read_next()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::IdleTimeout(idle).into()),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
