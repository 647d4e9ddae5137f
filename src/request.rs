//! Classification of a raw request header block.

use crate::http::find_bytes;

/// To prevent a malformed request from eating up too much memory, give up once the header block
/// exceeds this many bytes without a terminator.
pub const MAX_HEADER_LENGTH: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Other(String),
}

impl Method {
    fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            _ => Self::Other(method.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Other(method) => method,
        }
    }
}

/// Return the length of the header block including its terminator, if the buffer holds one.
///
/// The terminator is CRLFCRLF; a bare LFLF is accepted too.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = find_bytes(b"\r\n\r\n", buf).map(|i| i + 4);
    let lf = find_bytes(b"\n\n", buf).map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// The request line and headers of one request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a header block. Only the first two tokens of the request line are used; the
    /// protocol version and anything after it are ignored.
    ///
    /// Returns None if there is no usable request line.
    pub fn parse(block: &[u8]) -> Option<Self> {
        let block = String::from_utf8_lossy(block);
        let mut lines = block.split('\n').map(|line| line.trim_end_matches('\r'));

        let mut request_line = lines.next()?.split(' ').filter(|token| !token.is_empty());
        let method = Method::parse(request_line.next()?);
        let target = request_line.next()?.to_string();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| {
                let mut field = line.splitn(2, ':');
                let name = field.next()?.trim();
                let value = field.next()?.trim();
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Some(Self {
            method,
            target,
            headers,
        })
    }

    /// The fallback used when a request can't be understood: list the root directory.
    pub fn fallback() -> Self {
        Self {
            method: Method::Get,
            target: "/".to_string(),
            headers: Vec::new(),
        }
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.parse().ok()
    }

    /// The multipart boundary token from `Content-Type`, without surrounding quotes.
    pub fn boundary(&self) -> Option<&str> {
        let content_type = self.header("Content-Type")?;
        let start = content_type.to_ascii_lowercase().find("boundary=")? + "boundary=".len();
        let boundary = content_type[start..]
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .trim_matches('"');
        if boundary.is_empty() {
            None
        } else {
            Some(boundary)
        }
    }

    /// The target without its query string.
    pub fn path(&self) -> &str {
        self.target.splitn(2, '?').next().unwrap_or("")
    }

    /// Value of a query string parameter, still percent-encoded.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.target.splitn(2, '?').nth(1)?;
        query.split('&').find_map(|pair| {
            let mut pair = pair.splitn(2, '=');
            if pair.next()? == name {
                Some(pair.next().unwrap_or(""))
            } else {
                None
            }
        })
    }
}
