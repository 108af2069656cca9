//! Length-prefixed binary frames.
//!
//! Layout (all integers little-endian `u32`):
//! ```text
//! [size][id: 16][kind][kind-specific fixed fields ...][raw-data region]
//! ```
//! `size` counts every byte after itself. Variable-length fields (names,
//! content) live in the raw-data region and are referenced from the fixed
//! header by `(len, offset)` pairs, offsets being relative to the start of
//! the raw-data region. A path is four fields: `abs_len, abs_off, rel_len,
//! rel_off`. A non-empty content block starts with a one-byte flag telling
//! whether the payload is DEFLATE-compressed.

use std::io::{self, ErrorKind, Read, Write};

use crate::compress;
use crate::message::{
    Body, FileData, Kind, Message, MessageId, OpenFlags, Request, ResourcePath, Response, Status,
};

/// Size of the length prefix
pub const SIZE_PREFIX: usize = 4;

const CONTENT_PLAIN: u8 = 0;
const CONTENT_DEFLATE: u8 = 1;

/// Fixed bytes per attached file in a response: path (4) + content (2) fields
const FILE_FIELDS_SIZE: usize = 6 * 4;

/// Body bytes of a files response before any file: id, kind, status, count
pub const FILES_RESPONSE_HEADER_SIZE: usize = 16 + 3 * 4;

/// Body bytes one attached file adds to an uncompressed files response.
pub fn attached_file_size(path: &ResourcePath, content_len: usize) -> usize {
    let block = if content_len == 0 { 0 } else { 1 + content_len };
    FILE_FIELDS_SIZE + path.absolute().len() + path.relative().len() + block
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Whether content blocks should be compressed when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Disabled,
    Enabled,
}

impl From<bool> for Compression {
    fn from(enabled: bool) -> Self {
        if enabled {
            Compression::Enabled
        } else {
            Compression::Disabled
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct FrameBuilder {
    header: Vec<u8>,
    raw: Vec<u8>,
    compression: Compression,
}

impl FrameBuilder {
    fn new(compression: Compression) -> Self {
        Self {
            header: Vec::with_capacity(64),
            raw: Vec::new(),
            compression,
        }
    }

    fn put_u32(&mut self, value: u32) {
        self.header.extend_from_slice(&value.to_le_bytes());
    }

    fn put_len(&mut self, value: usize) -> Result<()> {
        let value = u32::try_from(value).map_err(|_| WireError::Malformed("field too long"))?;
        self.put_u32(value);
        Ok(())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let offset = self.raw.len();
        self.raw.extend_from_slice(bytes);
        self.put_len(bytes.len())?;
        self.put_len(offset)
    }

    fn put_path(&mut self, path: &ResourcePath) -> Result<()> {
        self.put_bytes(path.absolute().as_bytes())?;
        self.put_bytes(path.relative().as_bytes())
    }

    fn put_content(&mut self, content: &[u8]) -> Result<()> {
        let offset = self.raw.len();
        if !content.is_empty() {
            let packed = match self.compression {
                Compression::Enabled => Some(compress::compress(content)?),
                Compression::Disabled => None,
            };
            match packed {
                Some(packed) if packed.len() < content.len() => {
                    self.raw.push(CONTENT_DEFLATE);
                    self.raw.extend_from_slice(&packed);
                }
                _ => {
                    self.raw.push(CONTENT_PLAIN);
                    self.raw.extend_from_slice(content);
                }
            }
        }
        self.put_len(self.raw.len() - offset)?;
        self.put_len(offset)
    }

    fn put_file_request(
        &mut self,
        flags: u32,
        path: &ResourcePath,
        content: &[u8],
    ) -> Result<()> {
        self.put_u32(flags);
        self.put_path(path)?;
        self.put_content(content)
    }

    fn finish(self) -> Result<Vec<u8>> {
        let size = self.header.len() + self.raw.len();
        let size32 = u32::try_from(size).map_err(|_| WireError::Malformed("frame too long"))?;
        let mut frame = Vec::with_capacity(SIZE_PREFIX + size);
        frame.extend_from_slice(&size32.to_le_bytes());
        frame.extend_from_slice(&self.header);
        frame.extend_from_slice(&self.raw);
        Ok(frame)
    }
}

/// Encode a message into a complete frame, length prefix included.
pub fn encode(message: &Message, compression: Compression) -> Result<Vec<u8>> {
    let mut b = FrameBuilder::new(compression);
    b.header.extend_from_slice(message.id.as_bytes());
    b.put_u32(message.kind().code());

    match &message.body {
        Body::Request(request) => match request {
            Request::OpenSession | Request::CloseSession => {}
            Request::ReadNFiles { n } => b.put_u32(*n),
            Request::OpenFile { path, flags } => b.put_file_request(flags.bits(), path, &[])?,
            Request::WriteFile { path, content } | Request::AppendFile { path, content } => {
                b.put_file_request(0, path, content)?
            }
            Request::CloseFile { path }
            | Request::ReadFile { path }
            | Request::LockFile { path }
            | Request::UnlockFile { path }
            | Request::RemoveFile { path } => b.put_file_request(0, path, &[])?,
        },
        Body::Response(Response::Simple { status }) => b.put_u32(status.code()),
        Body::Response(Response::WithFiles { status, files }) => {
            b.put_u32(status.code());
            b.put_len(files.len())?;
            for file in files {
                b.put_path(&file.path)?;
                b.put_content(&file.content)?;
            }
        }
    }

    b.finish()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Walks the fixed header; every (len, offset) pair is resolved against the
/// raw-data region once the header end is known.
struct HeaderReader<'a> {
    frame: &'a [u8],
    pos: usize,
}

#[derive(Clone, Copy)]
struct Span {
    len: u32,
    offset: u32,
}

struct PathSpan {
    absolute: Span,
    relative: Span,
}

impl<'a> HeaderReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self { frame, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.frame.len())
            .ok_or(WireError::Malformed("fixed header truncated"))?;
        let bytes = &self.frame[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn span(&mut self) -> Result<Span> {
        Ok(Span {
            len: self.u32()?,
            offset: self.u32()?,
        })
    }

    fn path(&mut self) -> Result<PathSpan> {
        Ok(PathSpan {
            absolute: self.span()?,
            relative: self.span()?,
        })
    }

    fn remaining(&self) -> usize {
        self.frame.len() - self.pos
    }

    fn raw(&self) -> &'a [u8] {
        &self.frame[self.pos..]
    }
}

fn resolve<'a>(raw: &'a [u8], span: Span) -> Result<&'a [u8]> {
    let start = span.offset as usize;
    let end = start
        .checked_add(span.len as usize)
        .filter(|end| *end <= raw.len())
        .ok_or(WireError::Malformed("field out of frame bounds"))?;
    Ok(&raw[start..end])
}

fn resolve_str(raw: &[u8], span: Span) -> Result<String> {
    let bytes = resolve(raw, span)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Malformed("name is not UTF-8"))
}

fn resolve_path(raw: &[u8], span: &PathSpan) -> Result<ResourcePath> {
    Ok(ResourcePath::new(
        resolve_str(raw, span.absolute)?,
        resolve_str(raw, span.relative)?,
    ))
}

fn resolve_content(raw: &[u8], span: Span) -> Result<Vec<u8>> {
    let block = resolve(raw, span)?;
    match block.split_first() {
        None => Ok(Vec::new()),
        Some((&CONTENT_PLAIN, payload)) => Ok(payload.to_vec()),
        Some((&CONTENT_DEFLATE, payload)) => compress::decompress(payload)
            .map_err(|_| WireError::Malformed("corrupt compressed content")),
        Some(_) => Err(WireError::Malformed("unknown content flag")),
    }
}

/// Decode a frame body (everything after the length prefix).
pub fn decode(frame: &[u8]) -> Result<Message> {
    let mut h = HeaderReader::new(frame);
    let id_bytes = h.take(16)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(id_bytes);
    let id = MessageId::from_bytes(id);

    let code = h.u32()?;
    let kind = Kind::from_code(code).ok_or(WireError::UnknownKind(code))?;

    let body = match kind {
        Kind::OpenSession => Body::Request(Request::OpenSession),
        Kind::CloseSession => Body::Request(Request::CloseSession),
        Kind::ReadNFiles => Body::Request(Request::ReadNFiles { n: h.u32()? }),
        Kind::OpenFile
        | Kind::CloseFile
        | Kind::ReadFile
        | Kind::LockFile
        | Kind::UnlockFile
        | Kind::RemoveFile
        | Kind::WriteFile
        | Kind::AppendFile => {
            let flags = h.u32()?;
            let path_span = h.path()?;
            let content_span = h.span()?;
            let raw = h.raw();
            let path = resolve_path(raw, &path_span)?;
            Body::Request(match kind {
                Kind::OpenFile => Request::OpenFile {
                    path,
                    flags: OpenFlags::from_bits(flags)
                        .ok_or(WireError::Malformed("unknown open flags"))?,
                },
                Kind::CloseFile => Request::CloseFile { path },
                Kind::ReadFile => Request::ReadFile { path },
                Kind::LockFile => Request::LockFile { path },
                Kind::UnlockFile => Request::UnlockFile { path },
                Kind::RemoveFile => Request::RemoveFile { path },
                Kind::WriteFile => Request::WriteFile {
                    path,
                    content: resolve_content(raw, content_span)?,
                },
                _ => Request::AppendFile {
                    path,
                    content: resolve_content(raw, content_span)?,
                },
            })
        }
        Kind::SimpleResponse => Body::Response(Response::Simple {
            status: read_status(&mut h)?,
        }),
        Kind::ResponseWithFiles => {
            let status = read_status(&mut h)?;
            let count = h.u32()? as usize;
            if count > h.remaining() / FILE_FIELDS_SIZE {
                return Err(WireError::Malformed("file count exceeds frame size"));
            }
            let mut spans = Vec::with_capacity(count);
            for _ in 0..count {
                spans.push((h.path()?, h.span()?));
            }
            let raw = h.raw();
            let files = spans
                .iter()
                .map(|(path, content)| {
                    Ok(FileData::new(
                        resolve_path(raw, path)?,
                        resolve_content(raw, *content)?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            Body::Response(Response::WithFiles { status, files })
        }
    };

    Ok(Message { id, body })
}

fn read_status(h: &mut HeaderReader<'_>) -> Result<Status> {
    let code = h.u32()?;
    Status::from_code(code).ok_or(WireError::Malformed("unknown status code"))
}

// ---------------------------------------------------------------------------
// Socket I/O
// ---------------------------------------------------------------------------

/// Read the length prefix. `None` means the peer closed cleanly before
/// sending anything.
fn read_size<R: Read>(reader: &mut R) -> Result<Option<usize>> {
    let mut buf = [0u8; SIZE_PREFIX];
    let mut filled = 0;
    while filled < SIZE_PREFIX {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(WireError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u32::from_le_bytes(buf) as usize))
}

/// Read exactly one frame into `scratch` and decode it.
///
/// Returns `Ok(None)` on a clean disconnect. Frames declaring more than
/// `max_frame` bytes are rejected before any of the body is read.
pub fn read_frame<R: Read>(
    reader: &mut R,
    scratch: &mut Vec<u8>,
    max_frame: usize,
) -> Result<Option<Message>> {
    let Some(size) = read_size(reader)? else {
        return Ok(None);
    };
    if size > max_frame {
        return Err(WireError::FrameTooLarge {
            size,
            max: max_frame,
        });
    }

    scratch.clear();
    scratch.resize(size, 0);
    reader.read_exact(scratch).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => WireError::Truncated,
        _ => WireError::Io(e),
    })?;

    decode(scratch).map(Some)
}

/// Encode and send one frame. Returns the number of bytes written.
pub fn write_frame<W: Write>(
    writer: &mut W,
    message: &Message,
    compression: Compression,
) -> Result<usize> {
    let frame = encode(message, compression)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(frame.len())
}
