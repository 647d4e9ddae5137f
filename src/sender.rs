//! Delivery of a regular file's bytes to a client.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::RequestError;

/// Files smaller than this go out in a single write.
pub const CHUNK_THRESHOLD: u64 = 1 << 20;

/// Size of each write when a file is streamed.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// An opened file waiting to be sent. The handle is closed when this is dropped, whichever way
/// sending ends.
#[derive(Debug)]
pub struct FileReply {
    file: File,
    len: u64,
    mimetype: String,
}

impl FileReply {
    pub fn open(path: &Path, mimetype: &str) -> Result<Self, RequestError> {
        let file = File::open(path).map_err(RequestError::from_open)?;
        let metadata = file.metadata().map_err(RequestError::FileIo)?;
        if !metadata.is_file() {
            return Err(RequestError::Forbidden);
        }
        Ok(Self {
            file,
            len: metadata.len(),
            mimetype: mimetype.to_string(),
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Send the file body to `out`, returning the number of bytes written.
    ///
    /// At most `len()` bytes are sent even if the file grew since it was opened. A file that
    /// shrank ends the body early, which the caller treats as a failed connection.
    pub fn send<W: Write>(self, out: &mut W) -> io::Result<u64> {
        if self.len < CHUNK_THRESHOLD {
            self.send_whole(out)
        } else {
            self.send_chunked(out)
        }
    }

    fn send_whole<W: Write>(self, out: &mut W) -> io::Result<u64> {
        let mut body = Vec::with_capacity(self.len as usize);
        self.file.take(self.len).read_to_end(&mut body)?;
        out.write_all(&body)?;
        out.flush()?;
        short_body_check(body.len() as u64, self.len)
    }

    fn send_chunked<W: Write>(self, out: &mut W) -> io::Result<u64> {
        let len = self.len;
        let mut chunks = Chunks::new(self.file.take(len));
        let mut sent = 0;
        while let Some(chunk) = chunks.next_chunk()? {
            out.write_all(chunk)?;
            sent += chunk.len() as u64;
        }
        out.flush()?;
        short_body_check(sent, len)
    }
}

fn short_body_check(sent: u64, len: u64) -> io::Result<u64> {
    if sent < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file shrank to {} of {} bytes while sending", sent, len),
        ));
    }
    Ok(sent)
}

/// Successive fixed-size reads from a file. A zero-length read ends the sequence.
struct Chunks<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: Read> Chunks<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0; CHUNK_SIZE],
        }
    }

    fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(if filled == 0 {
            None
        } else {
            Some(&self.buf[..filled])
        })
    }
}
