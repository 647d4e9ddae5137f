//! Incremental `multipart/form-data` decoding for `POST /upload`.
//!
//! Body bytes are fed in as they arrive from the socket. File parts are streamed into temporary
//! files next to their destination and only renamed into place once the whole declared body
//! has been received, so an interrupted upload leaves nothing behind.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::RequestError;
use crate::http::find_bytes;

/// Part header blocks larger than this are rejected.
const MAX_PART_HEADER_LENGTH: usize = 16 * 1024;

const TEMP_PREFIX: &str = ".upload-";

/// The `Content-Disposition` parameters of one part.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub name: Option<String>,
    pub filename: Option<String>,
}

impl Disposition {
    /// Extract `name` and `filename` from a part's header block. The filename is everything
    /// between the first `filename="` and the next quote.
    pub fn parse(headers: &[u8]) -> Self {
        let headers = String::from_utf8_lossy(headers);
        let line = match headers
            .split("\r\n")
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
        {
            Some(line) => line,
            None => return Self::default(),
        };
        Self {
            name: quoted_param(line, "; name=\"").or_else(|| quoted_param(line, ";name=\"")),
            filename: quoted_param(line, "filename=\""),
        }
    }
}

fn quoted_param(line: &str, marker: &str) -> Option<String> {
    let start = line.find(marker)? + marker.len();
    let len = line[start..].find('"')?;
    Some(line[start..start + len].to_string())
}

/// Receives the pieces of a multipart body as the parser finds them.
pub trait PartSink {
    fn part_start(&mut self, disposition: Disposition) -> Result<(), RequestError>;
    fn part_data(&mut self, data: &[u8]) -> Result<(), RequestError>;
    fn part_end(&mut self) -> Result<(), RequestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Before the first boundary line.
    Preamble,
    /// Inside a part's header block.
    PartHeaders,
    /// Inside a part's content.
    PartBody,
    /// After the closing boundary; everything is ignored.
    Epilogue,
}

/// Streaming splitter for a multipart body with a known boundary.
#[derive(Debug)]
pub struct MultipartParser {
    /// `--boundary`, as it appears at the very start of the body.
    dash_boundary: Vec<u8>,
    /// `CRLF--boundary`, which ends every part.
    delimiter: Vec<u8>,
    state: ParseState,
    buf: Vec<u8>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let dash_boundary = format!("--{}", boundary).into_bytes();
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&dash_boundary);
        Self {
            dash_boundary,
            delimiter,
            state: ParseState::Preamble,
            buf: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Epilogue
    }

    pub fn feed<S: PartSink>(&mut self, data: &[u8], sink: &mut S) -> Result<(), RequestError> {
        if self.state == ParseState::Epilogue {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        while self.step(sink)? {}
        Ok(())
    }

    /// Make one transition. Returns false when more input is needed.
    fn step<S: PartSink>(&mut self, sink: &mut S) -> Result<bool, RequestError> {
        match self.state {
            ParseState::Preamble => {
                let at = match find_bytes(&self.dash_boundary, &self.buf) {
                    Some(at) => at,
                    None => {
                        let keep = self.dash_boundary.len().min(self.buf.len());
                        self.buf.drain(..self.buf.len() - keep);
                        return Ok(false);
                    }
                };
                let after = at + self.dash_boundary.len();
                match self.buf.get(after..after + 2) {
                    None => {
                        self.buf.drain(..at);
                        Ok(false)
                    }
                    Some(b"\r\n") => {
                        self.buf.drain(..after + 2);
                        self.state = ParseState::PartHeaders;
                        Ok(true)
                    }
                    Some(b"--") => {
                        self.close();
                        Ok(false)
                    }
                    Some(_) => {
                        // boundary text inside the preamble, keep looking
                        self.buf.drain(..at + 1);
                        Ok(true)
                    }
                }
            }
            ParseState::PartHeaders => {
                let (headers_len, skip) = if self.buf.starts_with(b"\r\n") {
                    (0, 2)
                } else {
                    match find_bytes(b"\r\n\r\n", &self.buf) {
                        Some(end) => (end, end + 4),
                        None if self.buf.len() > MAX_PART_HEADER_LENGTH => {
                            return Err(RequestError::MalformedUpload("part header too long"));
                        }
                        None => return Ok(false),
                    }
                };
                let disposition = Disposition::parse(&self.buf[..headers_len]);
                self.buf.drain(..skip);
                self.state = ParseState::PartBody;
                sink.part_start(disposition)?;
                Ok(true)
            }
            ParseState::PartBody => {
                let at = match find_bytes(&self.delimiter, &self.buf) {
                    Some(at) => at,
                    None => {
                        // the tail might be the start of a delimiter split across reads
                        let safe = self.buf.len().saturating_sub(self.delimiter.len() - 1);
                        if safe > 0 {
                            sink.part_data(&self.buf[..safe])?;
                            self.buf.drain(..safe);
                        }
                        return Ok(false);
                    }
                };
                if at > 0 {
                    sink.part_data(&self.buf[..at])?;
                    self.buf.drain(..at);
                }
                let after = self.delimiter.len();
                match self.buf.get(after..after + 2) {
                    None => Ok(false),
                    Some(b"\r\n") => {
                        sink.part_end()?;
                        self.buf.drain(..after + 2);
                        self.state = ParseState::PartHeaders;
                        Ok(true)
                    }
                    Some(b"--") => {
                        sink.part_end()?;
                        self.close();
                        Ok(false)
                    }
                    Some(_) => {
                        // not a real delimiter, it is content
                        sink.part_data(&self.buf[..1])?;
                        self.buf.drain(..1);
                        Ok(true)
                    }
                }
            }
            ParseState::Epilogue => Ok(false),
        }
    }

    fn close(&mut self) {
        self.state = ParseState::Epilogue;
        self.buf = Vec::new();
    }

    /// End of input. A part still open is closed at the end of the data, minus a trailing CRLF.
    pub fn finish<S: PartSink>(&mut self, sink: &mut S) -> Result<(), RequestError> {
        if self.state == ParseState::PartBody {
            let mut end = self.buf.len();
            if self.buf.ends_with(b"\r\n") {
                end -= 2;
            }
            if end > 0 {
                sink.part_data(&self.buf[..end])?;
            }
            sink.part_end()?;
        }
        self.close();
        Ok(())
    }
}

/// Whether `name` is the temporary file of an upload still in progress.
pub fn is_partial_upload(name: &OsStr) -> bool {
    name.as_bytes().starts_with(TEMP_PREFIX.as_bytes())
}

/// Reduce a client-supplied filename to a bare file name.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let name = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    match name.trim() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// Pick a destination in `dir` for `filename` that doesn't clobber an existing file, trying
/// `name-1.ext`, `name-2.ext`, … in turn.
pub fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, extension) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], &filename[dot..]),
        _ => (filename, ""),
    };
    (1..)
        .map(|counter| dir.join(format!("{}-{}{}", stem, counter, extension)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(candidate)
}

/// Move `temp` into `dir` under `filename` or the first free `name-N.ext` variant. Another
/// upload may claim a name between picking it and the rename, so a taken name is retried.
fn persist_unique(mut temp: NamedTempFile, dir: &Path, filename: &str) -> io::Result<PathBuf> {
    loop {
        let destination = unique_destination(dir, filename);
        match temp.persist_noclobber(&destination) {
            Ok(_) => return Ok(destination),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => temp = e.file,
            Err(e) => return Err(e.error),
        }
    }
}

/// A file part that has been fully received but not yet moved into place.
#[derive(Debug)]
struct ReceivedFile {
    filename: String,
    temp: NamedTempFile,
}

/// Collects file parts into temporary files in the destination directory.
#[derive(Debug)]
struct TempFileSink {
    target_dir: PathBuf,
    current: Option<ReceivedFile>,
    received: Vec<ReceivedFile>,
}

impl PartSink for TempFileSink {
    fn part_start(&mut self, disposition: Disposition) -> Result<(), RequestError> {
        let filename = match disposition.filename {
            Some(filename) if !filename.is_empty() => filename,
            Some(_) => {
                log::debug!("skipping file field with no file chosen");
                return Ok(());
            }
            None => {
                log::info!(
                    "ignoring form field {:?}",
                    disposition.name.as_deref().unwrap_or("")
                );
                return Ok(());
            }
        };
        let filename = sanitize_filename(&filename)
            .ok_or(RequestError::MalformedUpload("invalid filename"))?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.target_dir)
            .map_err(RequestError::FileIo)?;
        self.current = Some(ReceivedFile { filename, temp });
        Ok(())
    }

    fn part_data(&mut self, data: &[u8]) -> Result<(), RequestError> {
        if let Some(current) = &mut self.current {
            current.temp.write_all(data).map_err(RequestError::FileIo)?;
        }
        Ok(())
    }

    fn part_end(&mut self) -> Result<(), RequestError> {
        if let Some(mut current) = self.current.take() {
            current.temp.flush().map_err(RequestError::FileIo)?;
            self.received.push(current);
        }
        Ok(())
    }
}

/// One in-flight upload, owned by the connection that is receiving it.
#[derive(Debug)]
pub struct PendingUpload {
    content_length: u64,
    received: u64,
    overwrite: bool,
    parser: MultipartParser,
    sink: TempFileSink,
}

impl PendingUpload {
    pub fn new(target_dir: PathBuf, content_length: u64, boundary: &str, overwrite: bool) -> Self {
        Self {
            content_length,
            received: 0,
            overwrite,
            parser: MultipartParser::new(boundary),
            sink: TempFileSink {
                target_dir,
                current: None,
                received: Vec::new(),
            },
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.sink.target_dir
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.content_length - self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.content_length
    }

    /// Feed body bytes. Anything past the declared length is ignored; returns how many bytes
    /// were consumed.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, RequestError> {
        let take = data.len().min(self.remaining() as usize);
        self.parser.feed(&data[..take], &mut self.sink)?;
        self.received += take as u64;
        Ok(take)
    }

    /// Move every received file into place and return the names they were saved under.
    pub fn finish(mut self) -> Result<Vec<String>, RequestError> {
        self.parser.finish(&mut self.sink)?;
        if self.sink.received.is_empty() {
            return Err(RequestError::MalformedUpload("no file in upload"));
        }
        let mut saved = Vec::new();
        for file in self.sink.received.drain(..) {
            let destination = if self.overwrite {
                let destination = self.sink.target_dir.join(&file.filename);
                file.temp
                    .persist(&destination)
                    .map_err(|e| RequestError::FileIo(e.error))?;
                destination
            } else {
                persist_unique(file.temp, &self.sink.target_dir, &file.filename)
                    .map_err(RequestError::FileIo)?
            };
            log::info!("saved upload {}", destination.display());
            saved.push(
                destination
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(file.filename),
            );
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::{read, read_dir, write};

    use tempfile::tempdir;
    use test_case::test_case;

    /// Records parser events as text.
    #[derive(Default)]
    struct Events {
        log: Vec<String>,
        data: Vec<Vec<u8>>,
    }

    impl PartSink for Events {
        fn part_start(&mut self, disposition: Disposition) -> Result<(), RequestError> {
            self.log.push(format!(
                "start {:?} {:?}",
                disposition.name, disposition.filename
            ));
            self.data.push(Vec::new());
            Ok(())
        }
        fn part_data(&mut self, data: &[u8]) -> Result<(), RequestError> {
            self.data
                .last_mut()
                .expect("data before part start")
                .extend_from_slice(data);
            Ok(())
        }
        fn part_end(&mut self) -> Result<(), RequestError> {
            self.log.push("end".to_string());
            Ok(())
        }
    }

    const BODY: &[u8] = b"preamble\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"note\"\r\n\
        \r\n\
        just a field\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"c.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        world\r\n--XyZ-not-a-delimiter\r\n\
        --XyZ--\r\n\
        epilogue";

    #[test_case(BODY.len() ; "one read")]
    #[test_case(1 ; "byte by byte")]
    #[test_case(3 ; "three bytes")]
    #[test_case(7 ; "seven bytes")]
    #[test_case(64 ; "sixty four bytes")]
    fn splits_parts_across_reads(read_size: usize) {
        let mut parser = MultipartParser::new("XyZ");
        let mut events = Events::default();
        for chunk in BODY.chunks(read_size) {
            parser.feed(chunk, &mut events).unwrap();
        }
        assert!(parser.is_finished());
        parser.finish(&mut events).unwrap();
        assert_eq!(
            events.log,
            [
                "start Some(\"note\") None",
                "end",
                "start Some(\"file\") Some(\"c.txt\")",
                "end",
            ]
        );
        assert_eq!(events.data[0], b"just a field");
        assert_eq!(events.data[1], b"world\r\n--XyZ-not-a-delimiter");
    }

    #[test]
    fn unterminated_part_runs_to_end_of_body() {
        let mut parser = MultipartParser::new("b");
        let mut events = Events::default();
        parser
            .feed(
                b"--b\r\nContent-Disposition: form-data; name=\"file\"; filename=\"x\"\r\n\r\npayload\r\n",
                &mut events,
            )
            .unwrap();
        assert!(!parser.is_finished());
        parser.finish(&mut events).unwrap();
        assert_eq!(events.data[0], b"payload");
        assert_eq!(events.log.last().map(String::as_str), Some("end"));
    }

    #[test]
    fn no_boundary_means_no_parts() {
        let mut parser = MultipartParser::new("b");
        let mut events = Events::default();
        parser.feed(b"this is not multipart at all", &mut events).unwrap();
        parser.finish(&mut events).unwrap();
        assert!(events.log.is_empty());
    }

    #[test]
    fn oversized_part_header_is_malformed() {
        let mut parser = MultipartParser::new("b");
        let mut events = Events::default();
        parser.feed(b"--b\r\n", &mut events).unwrap();
        let junk = vec![b'x'; MAX_PART_HEADER_LENGTH + 1];
        assert!(matches!(
            parser.feed(&junk, &mut events),
            Err(RequestError::MalformedUpload(_))
        ));
    }

    #[test_case(b"Content-Disposition: form-data; name=\"file\"; filename=\"a b.txt\"", Some("file"), Some("a b.txt") ; "file")]
    #[test_case(b"content-disposition: form-data; name=\"field\"", Some("field"), None ; "field")]
    #[test_case(b"Content-Type: text/plain\r\nContent-Disposition: form-data;name=\"f\";filename=\"\"", Some("f"), Some("") ; "empty filename")]
    #[test_case(b"Content-Type: text/plain", None, None ; "no disposition")]
    fn disposition(headers: &[u8], name: Option<&str>, filename: Option<&str>) {
        let disposition = Disposition::parse(headers);
        assert_eq!(disposition.name.as_deref(), name);
        assert_eq!(disposition.filename.as_deref(), filename);
    }

    #[test_case("c.txt", Some("c.txt") ; "plain")]
    #[test_case("C:\\Users\\me\\photo.jpg", Some("photo.jpg") ; "windows path")]
    #[test_case("../../etc/passwd", Some("passwd") ; "traversal")]
    #[test_case("..", None ; "dot dot")]
    #[test_case("dir/", None ; "trailing slash")]
    #[test_case("", None ; "empty")]
    fn sanitized(filename: &str, expected: Option<&str>) {
        assert_eq!(sanitize_filename(filename).as_deref(), expected);
    }

    #[test]
    fn unique_destinations() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_destination(dir.path(), "c.txt"), dir.path().join("c.txt"));
        write(dir.path().join("c.txt"), "").unwrap();
        assert_eq!(unique_destination(dir.path(), "c.txt"), dir.path().join("c-1.txt"));
        write(dir.path().join("c-1.txt"), "").unwrap();
        assert_eq!(unique_destination(dir.path(), "c.txt"), dir.path().join("c-2.txt"));
        write(dir.path().join("README"), "").unwrap();
        assert_eq!(unique_destination(dir.path(), "README"), dir.path().join("README-1"));
        write(dir.path().join(".hidden"), "").unwrap();
        assert_eq!(unique_destination(dir.path(), ".hidden"), dir.path().join(".hidden-1"));
    }

    #[test]
    fn simultaneous_uploads_of_one_name_all_land() {
        use std::sync::{Arc, Barrier};

        let dir = tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut temp = NamedTempFile::new_in(&dir).unwrap();
                    write!(temp, "upload {}", i).unwrap();
                    barrier.wait();
                    persist_unique(temp, &dir, "c.txt").unwrap()
                })
            })
            .collect();
        let mut saved: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        saved.sort();
        saved.dedup();
        assert_eq!(saved.len(), 8);
        assert_eq!(read_dir(dir.path()).unwrap().count(), 8);
        assert!(saved.contains(&dir.path().join("c.txt")));
        assert!(saved.contains(&dir.path().join("c-7.txt")));
    }

    fn body_for(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (filename, content) in files {
            body.extend_from_slice(b"--BOUNDARY\r\n");
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\r\n",
                    filename
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"--BOUNDARY--\r\n");
        body
    }

    #[test]
    fn upload_writes_file_only_when_complete() {
        let dir = tempdir().unwrap();
        let body = body_for(&[("c.txt", b"world")]);
        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", false);

        let (first, second) = body.split_at(20);
        assert_eq!(upload.feed(first).unwrap(), 20);
        assert!(!upload.is_complete());
        assert!(!dir.path().join("c.txt").exists());

        // extra bytes past the declared length are not consumed
        let mut rest = second.to_vec();
        rest.extend_from_slice(b"trailing garbage");
        assert_eq!(upload.feed(&rest).unwrap(), second.len());
        assert!(upload.is_complete());
        assert_eq!(upload.received(), body.len() as u64);

        assert_eq!(upload.finish().unwrap(), ["c.txt"]);
        assert_eq!(read(dir.path().join("c.txt")).unwrap(), b"world");
        assert_eq!(read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn collisions_are_renamed_unless_overwriting() {
        let dir = tempdir().unwrap();
        write(dir.path().join("c.txt"), "old").unwrap();
        let body = body_for(&[("c.txt", b"new")]);

        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", false);
        upload.feed(&body).unwrap();
        assert_eq!(upload.finish().unwrap(), ["c-1.txt"]);
        assert_eq!(read(dir.path().join("c.txt")).unwrap(), b"old");
        assert_eq!(read(dir.path().join("c-1.txt")).unwrap(), b"new");

        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", true);
        upload.feed(&body).unwrap();
        assert_eq!(upload.finish().unwrap(), ["c.txt"]);
        assert_eq!(read(dir.path().join("c.txt")).unwrap(), b"new");
    }

    #[test]
    fn several_files_in_one_body() {
        let dir = tempdir().unwrap();
        let body = body_for(&[("one.bin", &[0, 1, 2, 13, 10]), ("two.txt", b"2")]);
        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", false);
        upload.feed(&body).unwrap();
        assert_eq!(upload.finish().unwrap(), ["one.bin", "two.txt"]);
        assert_eq!(read(dir.path().join("one.bin")).unwrap(), [0, 1, 2, 13, 10]);
    }

    #[test]
    fn body_without_file_is_malformed() {
        let dir = tempdir().unwrap();
        let body = b"--BOUNDARY\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n1\r\n--BOUNDARY--\r\n";
        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", false);
        upload.feed(body).unwrap();
        assert!(matches!(
            upload.finish(),
            Err(RequestError::MalformedUpload(_))
        ));
        assert_eq!(read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn abandoned_upload_leaves_nothing() {
        let dir = tempdir().unwrap();
        let body = body_for(&[("big.bin", &[7; 4096])]);
        let mut upload =
            PendingUpload::new(dir.path().to_path_buf(), body.len() as u64, "BOUNDARY", false);
        upload.feed(&body[..2000]).unwrap();
        assert_eq!(read_dir(dir.path()).unwrap().count(), 1);
        drop(upload);
        assert_eq!(read_dir(dir.path()).unwrap().count(), 0);
    }
}
