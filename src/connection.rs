//! The life of one accepted connection: read a request, route it, reply, log it.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};

use crate::access_log::{AccessLog, AccessRecord};
use crate::error::RequestError;
use crate::listing;
use crate::mime::MimeMap;
use crate::registry::Registration;
use crate::request::{find_header_end, Method, RequestHead, MAX_HEADER_LENGTH};
use crate::response::{Reply, Responder, CONTINUE};
use crate::router::{root_relative, route, route_upload, RouteDecision};
use crate::sender::FileReply;
use crate::stats::ServerStats;
use crate::upload::PendingUpload;

/// Bytes requested from the socket per read.
const READ_SIZE: usize = 64 * 1024;

/// How long to keep draining an unread request body after replying, so the client sees the
/// reply instead of a reset.
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Most bytes drained after replying before giving up on the client.
const LINGER_LIMIT: usize = 1 << 20;

/// Everything a connection needs from the server that accepted it. Fixed while the server runs.
#[derive(Debug)]
pub struct Shared {
    /// Canonical shared folder.
    pub root: Option<PathBuf>,
    pub mime_map: MimeMap,
    pub responder: Responder,
    pub access_log: Arc<AccessLog>,
    pub stats: Arc<ServerStats>,
    pub max_upload: Option<u64>,
    pub overwrite_uploads: bool,
}

/// A socket that counts the bytes going through it.
#[derive(Debug)]
struct Metered {
    stream: TcpStream,
    read: u64,
    written: u64,
}

impl Read for Metered {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

impl Write for Metered {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[derive(Debug)]
enum ConnectionState {
    ReceiveRequest,
    ReceiveBody(PendingUpload),
    SendReply(Reply),
    Done,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            Self::ReceiveRequest => "receiving request",
            Self::ReceiveBody(_) => "receiving upload",
            Self::SendReply(_) => "sending reply",
            Self::Done => "done",
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    // Dropped first, so the registry forgets the descriptor before the socket closes it.
    registration: Registration,
    socket: Metered,
    client: IpAddr,
    shared: Arc<Shared>,
    state: ConnectionState,
    request: Vec<u8>,
    method: Option<String>,
    url: Option<String>,
    referer: Option<String>,
    user_agent: Option<String>,
    include_body: bool,
    continue_sent: bool,
    /// The client may still be sending a body nobody is going to read.
    unread_body: bool,
    http_code: u16,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        client: IpAddr,
        registration: Registration,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            registration,
            socket: Metered {
                stream,
                read: 0,
                written: 0,
            },
            client,
            shared,
            state: ConnectionState::ReceiveRequest,
            request: Vec::new(),
            method: None,
            url: None,
            referer: None,
            user_agent: None,
            include_body: true,
            continue_sent: false,
            unread_body: false,
            http_code: 0,
        }
    }

    /// Drive the connection until it is done, failed or cancelled.
    pub fn run(mut self) {
        let id = self.registration.id();
        loop {
            let state = std::mem::replace(&mut self.state, ConnectionState::Done);
            let name = state.name();
            let next = match state {
                ConnectionState::ReceiveRequest => self.receive_request(),
                ConnectionState::ReceiveBody(upload) => self.receive_body(upload),
                ConnectionState::SendReply(reply) => self.send_reply(reply),
                ConnectionState::Done => break,
            };
            self.state = next.unwrap_or_else(|e| {
                log::debug!(
                    "connection {} from {} failed while {}: {:#}",
                    id,
                    self.client,
                    name,
                    e
                );
                ConnectionState::Done
            });
        }
        if self.unread_body {
            self.linger();
        }
        self.log_connection(SystemTime::now());
        self.shared.stats.add_in(self.socket.read);
        self.shared.stats.add_out(self.socket.written);
    }

    fn receive_request(&mut self) -> Result<ConnectionState> {
        let mut buf = vec![0; READ_SIZE];
        let recvd = match self.socket.read(&mut buf) {
            Ok(0) => return Ok(self.request_ended()),
            Ok(recvd) => recvd,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(ConnectionState::ReceiveRequest)
            }
            Err(e) if self.request.is_empty() => {
                return Err(e).context("failed to read request");
            }
            Err(e) => {
                // a timed out or broken request is answered with the root listing
                log::debug!("read error after partial request: {}", e);
                self.request = Vec::new();
                return Ok(self.process_request(RequestHead::fallback(), &[]));
            }
        };
        self.request.extend_from_slice(&buf[..recvd]);

        if let Some(end) = find_header_end(&self.request) {
            let body = self.request.split_off(end);
            let head = RequestHead::parse(&self.request).unwrap_or_else(RequestHead::fallback);
            self.request = Vec::new();
            return Ok(self.process_request(head, &body));
        }
        if self.request.len() > MAX_HEADER_LENGTH {
            self.shared.stats.add_request();
            self.unread_body = true;
            return Ok(self.error_state(&RequestError::HeaderTooLarge));
        }
        Ok(ConnectionState::ReceiveRequest)
    }

    /// The stream ended before a complete header block arrived.
    fn request_ended(&mut self) -> ConnectionState {
        if self.request.is_empty() {
            // closed without saying anything
            return ConnectionState::Done;
        }
        let head = RequestHead::parse(&self.request)
            .filter(|head| head.method == Method::Get)
            .unwrap_or_else(RequestHead::fallback);
        self.request = Vec::new();
        self.process_request(head, &[])
    }

    fn process_request(&mut self, head: RequestHead, body: &[u8]) -> ConnectionState {
        self.shared.stats.add_request();
        self.method = Some(head.method.as_str().to_string());
        self.url = Some(head.target.clone());
        self.referer = head.header("Referer").map(str::to_string);
        self.user_agent = head.header("User-Agent").map(str::to_string);

        let shared = Arc::clone(&self.shared);
        let root = match &shared.root {
            Some(root) => root,
            None => {
                self.unread_body = head.method == Method::Post;
                return self.error_state(&RequestError::NoRootConfigured);
            }
        };
        match head.method {
            Method::Get => self.serve_get(&head.target, root),
            Method::Head => {
                self.include_body = false;
                self.serve_get(&head.target, root)
            }
            Method::Post => self.begin_upload(&head, root, body),
            Method::Other(_) => {
                self.unread_body = head.content_length().unwrap_or(0) > 0;
                self.error_state(&RequestError::NotImplemented)
            }
        }
    }

    fn serve_get(&mut self, target: &str, root: &Path) -> ConnectionState {
        let now = SystemTime::now();
        let responder = &self.shared.responder;
        let reply = match route(target, root) {
            RouteDecision::ServeDirectory(directory) => {
                match listing::render(&directory, root, &responder.footer(now)) {
                    Ok(html) => responder.page(html, now),
                    Err(e) => {
                        log::warn!("failed to list {}: {}", directory.display(), e);
                        responder.request_error(&RequestError::DirectoryRead(e), now)
                    }
                }
            }
            RouteDecision::ServeFile(path) => {
                let mimetype = self.shared.mime_map.content_type(&path);
                match FileReply::open(&path, mimetype) {
                    Ok(file) => responder.file(file, now),
                    Err(e) => responder.request_error(&e, now),
                }
            }
            RouteDecision::BadRequest(reason) => {
                responder.request_error(&RequestError::BadRequest(reason), now)
            }
            RouteDecision::NotFound | RouteDecision::Upload { .. } => {
                responder.request_error(&RequestError::NotFound, now)
            }
        };
        ConnectionState::SendReply(reply)
    }

    /// Start receiving an upload with whatever body bytes arrived along with the header.
    fn begin_upload(&mut self, head: &RequestHead, root: &Path, body: &[u8]) -> ConnectionState {
        self.unread_body = true;
        let (target_dir, content_length, boundary) = match route_upload(head, root) {
            RouteDecision::Upload {
                target_dir,
                content_length,
                boundary,
            } => (target_dir, content_length, boundary),
            RouteDecision::BadRequest(reason) => {
                return self.error_state(&RequestError::MalformedUpload(reason))
            }
            _ => return self.error_state(&RequestError::NotFound),
        };
        if let Some(limit) = self.shared.max_upload {
            if content_length > limit {
                return self.error_state(&RequestError::PayloadTooLarge {
                    size: content_length,
                    limit,
                });
            }
        }
        log::debug!(
            "receiving {} byte upload into {}",
            content_length,
            target_dir.display()
        );

        let mut upload = PendingUpload::new(
            target_dir,
            content_length,
            &boundary,
            self.shared.overwrite_uploads,
        );
        if let Err(e) = upload.feed(body) {
            return self.error_state(&e);
        }
        if upload.is_complete() {
            self.finish_upload(upload)
        } else {
            ConnectionState::ReceiveBody(upload)
        }
    }

    fn receive_body(&mut self, mut upload: PendingUpload) -> Result<ConnectionState> {
        if !self.continue_sent {
            self.socket
                .write_all(CONTINUE)
                .context("failed to send 100 Continue")?;
            self.continue_sent = true;
        }

        let mut buf = vec![0; READ_SIZE];
        let want = buf.len().min(upload.remaining() as usize);
        let recvd = match self.socket.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(anyhow!(
                    "client went away after {} of {} body bytes",
                    upload.received(),
                    upload.received() + upload.remaining()
                ))
            }
            Ok(recvd) => recvd,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(ConnectionState::ReceiveBody(upload))
            }
            Err(e) => return Err(e).context("failed to read upload body"),
        };
        if let Err(e) = upload.feed(&buf[..recvd]) {
            return Ok(self.error_state(&e));
        }
        Ok(if upload.is_complete() {
            self.finish_upload(upload)
        } else {
            ConnectionState::ReceiveBody(upload)
        })
    }

    fn finish_upload(&mut self, upload: PendingUpload) -> ConnectionState {
        self.unread_body = false;
        let now = SystemTime::now();
        let target_dir = upload.target_dir().to_path_buf();
        let redirect_to = root_relative(
            &target_dir,
            self.shared.root.as_deref().unwrap_or(&target_dir),
        );
        match upload.finish() {
            Ok(saved) => ConnectionState::SendReply(self.shared.responder.upload_saved(
                &saved,
                &redirect_to,
                now,
            )),
            Err(e) => {
                log::warn!("upload into {} failed: {}", target_dir.display(), e);
                self.error_state(&e)
            }
        }
    }

    fn error_state(&self, error: &RequestError) -> ConnectionState {
        ConnectionState::SendReply(
            self.shared
                .responder
                .request_error(error, SystemTime::now()),
        )
    }

    fn send_reply(&mut self, reply: Reply) -> Result<ConnectionState> {
        self.http_code = reply.code;
        reply
            .send(&mut self.socket, self.include_body)
            .context("failed to send reply")?;
        Ok(ConnectionState::Done)
    }

    /// Stop sending and discard what the client is still sending, until it closes, goes quiet,
    /// runs past `LINGER_TIMEOUT` in total or exceeds `LINGER_LIMIT` bytes.
    fn linger(&mut self) {
        if self.socket.stream.shutdown(Shutdown::Write).is_err() {
            return;
        }
        let deadline = Instant::now() + LINGER_TIMEOUT;
        let mut buf = vec![0; READ_SIZE];
        let mut drained = 0;
        while drained < LINGER_LIMIT {
            let left = deadline.saturating_duration_since(Instant::now());
            if left == Duration::ZERO || self.socket.stream.set_read_timeout(Some(left)).is_err() {
                break;
            }
            match self.socket.read(&mut buf) {
                Ok(n) if n > 0 => drained += n,
                _ => break,
            }
        }
        if drained >= LINGER_LIMIT {
            log::debug!("gave up draining after {} bytes", drained);
        }
    }

    /// Add the connection's details to the access log.
    fn log_connection(&self, now: SystemTime) {
        let (method, url) = match (&self.method, &self.url) {
            (Some(method), Some(url)) => (method, url),
            // didn't parse, maybe too long
            _ => return,
        };
        self.shared.access_log.record(
            self.client,
            &AccessRecord {
                method,
                url,
                http_code: self.http_code,
                total_sent: self.socket.written,
                referer: self.referer.as_deref(),
                user_agent: self.user_agent.as_deref(),
            },
            now,
        );
    }
}
