#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use sharehttpd::access_log::LogSink;
use sharehttpd::Config;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(vec![$(($k, $v),)*].into_iter())
    };
}

pub const BOUNDARY: &str = "----sharehttpdTestBoundary";

/// A server running in-process on a random port, sharing a fresh temporary folder.
pub struct Server {
    server: sharehttpd::Server,
    addr: SocketAddr,
    root: TempDir,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config<F: FnOnce(&mut Config)>(configure: F) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let mut config = Config {
            root: Some(root.path().to_path_buf()),
            bindaddr: Some("127.0.0.1".to_string()),
            bindport: 0,
            log_sink: LogSink::Disabled,
            ..Default::default()
        };
        configure(&mut config);
        let mut server = sharehttpd::Server::new(config);
        server.start().expect("failed to start server");
        let addr = server.local_addr().expect("server has no address");
        Self { server, addr, root }
    }

    pub fn inner(&mut self) -> &mut sharehttpd::Server {
        &mut self.server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str) -> File {
        File::create(self.root().join(name)).expect("failed to create file")
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) {
        self.create_file(name)
            .write_all(contents)
            .expect("failed to write file");
    }

    pub fn read_file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.root().join(name)).expect("failed to read file")
    }

    pub fn stream(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut stream = self.stream();
        write!(stream, "GET {} HTTP/1.1\r\n", path).unwrap();
        for (header_name, header_value) in headers {
            write!(stream, "{}: {}\r\n", header_name, header_value).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    /// Send `request` as is and read one response.
    pub fn raw(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    /// Upload `files` (name, contents) into the folder `path`.
    pub fn upload(&self, path: Option<&str>, files: &[(&str, &[u8])]) -> Response {
        let body = multipart_body(files);
        let mut stream = self.stream();
        stream.write_all(&upload_header(path, body.len())).unwrap();
        stream.write_all(&body).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
}

pub fn upload_header(path: Option<&str>, content_length: usize) -> Vec<u8> {
    format!(
        "POST /upload{} HTTP/1.1\r\n\
        Host: localhost\r\n\
        Content-Type: multipart/form-data; boundary={}\r\n\
        Content-Length: {}\r\n\
        \r\n",
        path.map(|path| format!("?path={}", path))
            .unwrap_or_default(),
        BOUNDARY,
        content_length
    )
    .into_bytes()
}

/// A multipart body with one file part per entry, the way a browser sends the upload form.
pub fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (filename, contents) in files {
        write!(
            body,
            "--{}\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n",
            BOUNDARY, filename
        )
        .unwrap();
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n");
    }
    write!(body, "--{}--\r\n", BOUNDARY).unwrap();
    body
}

/// HTTP Response from the server.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Number of interim 1xx responses that preceded this one.
    pub interim: usize,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        Self::read(reader, true)
    }

    /// Read a response to a HEAD request, which has no body.
    pub fn head_from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        Self::read(reader, false)
    }

    fn read<R: Read>(reader: &mut R, with_body: bool) -> io::Result<Self> {
        let mut interim = 0;
        let (response_line, headers) = loop {
            let response_line = Self::read_header(reader)?;
            let headers = Self::read_headers(reader)?;
            if response_line.splitn(2, ' ').nth(1).map_or(false, |status| status.starts_with('1')) {
                interim += 1;
                continue;
            }
            break (response_line, headers);
        };
        let body = headers
            .get("Content-Length")
            .filter(|_| with_body)
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
            interim,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn code(&self) -> u16 {
        self.status()[..3].parse().expect("invalid status code")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
