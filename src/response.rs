//! Status lines, headers and generated HTML bodies.

use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::SystemTime;

use crate::error::RequestError;
use crate::http::{HtmlEscaped, HttpDate, UrlEncoded};
use crate::sender::FileReply;

/// Interim reply sent while an upload body is still arriving.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug)]
pub enum Body {
    Generated(String),
    File(FileReply),
}

/// A complete reply: status, header block and body.
#[derive(Debug)]
pub struct Reply {
    pub code: u16,
    header: String,
    body: Body,
}

impl Reply {
    #[cfg(test)]
    fn body_len(&self) -> u64 {
        match &self.body {
            Body::Generated(body) => body.len() as u64,
            Body::File(file) => file.len(),
        }
    }

    /// Write the reply to `out`, omitting the body for HEAD requests. Returns the number of
    /// body bytes written.
    pub fn send<W: Write>(self, out: &mut W, include_body: bool) -> io::Result<u64> {
        match self.body {
            Body::Generated(body) => {
                // header and body go out as one write
                let mut message = self.header.into_bytes();
                if include_body {
                    message.extend_from_slice(body.as_bytes());
                }
                out.write_all(&message)?;
                out.flush()?;
                Ok(if include_body { body.len() as u64 } else { 0 })
            }
            Body::File(file) => {
                out.write_all(self.header.as_bytes())?;
                if include_body {
                    file.send(out)
                } else {
                    out.flush()?;
                    Ok(0)
                }
            }
        }
    }
}

/// "Generated by" string.
struct GeneratedOn<'a>(&'a Responder, SystemTime);

impl<'a> std::fmt::Display for GeneratedOn<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.0.want_no_server_id {
            writeln!(
                f,
                "Generated by {}/{} on {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                HttpDate(self.1)
            )?;
        }
        Ok(())
    }
}

/// Builds replies with the server's identity settings.
#[derive(Debug, Clone)]
pub struct Responder {
    want_no_server_id: bool,
    server_hdr: String,
}

impl Responder {
    pub fn new(want_no_server_id: bool) -> Self {
        let server_hdr = if want_no_server_id {
            String::new()
        } else {
            format!(
                "Server: {}/{}\r\n",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )
        };
        Self {
            want_no_server_id,
            server_hdr,
        }
    }

    /// Footer appended to every generated page.
    pub fn footer(&self, now: SystemTime) -> String {
        GeneratedOn(self, now).to_string()
    }

    fn header(
        &self,
        code: u16,
        now: SystemTime,
        content_type: &str,
        content_length: u64,
        extra: &str,
    ) -> String {
        format!(
            "HTTP/1.0 {} {}\r\n\
            Date: {}\r\n\
            {}\
            Content-Type: {}\r\n\
            Content-Length: {}\r\n\
            {}\
            Connection: close\r\n\
            \r\n",
            code,
            if code == 200 { "OK" } else { "Error" },
            HttpDate(now),
            self.server_hdr,
            content_type,
            content_length,
            extra,
        )
    }

    fn html(&self, code: u16, now: SystemTime, body: String) -> Reply {
        Reply {
            code,
            header: self.header(
                code,
                now,
                "text/html; charset=utf-8",
                body.len() as u64,
                "",
            ),
            body: Body::Generated(body),
        }
    }

    /// A minimal HTML error page.
    pub fn error(&self, code: u16, message: &str, now: SystemTime) -> Reply {
        let body = format!(
            "<html><head><title>Error {}</title></head><body>\n\
            <h1>Error {}</h1>\n\
            <p>{}</p>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            code,
            code,
            HtmlEscaped(message),
            GeneratedOn(self, now),
        );
        self.html(code, now, body)
    }

    pub fn request_error(&self, error: &RequestError, now: SystemTime) -> Reply {
        self.error(error.status_code(), &error.to_string(), now)
    }

    /// A 200 reply carrying an already rendered page.
    pub fn page(&self, html: String, now: SystemTime) -> Reply {
        self.html(200, now, html)
    }

    pub fn file(&self, file: FileReply, now: SystemTime) -> Reply {
        Reply {
            code: 200,
            header: self.header(
                200,
                now,
                file.mimetype(),
                file.len(),
                "Accept-Ranges: bytes\r\n",
            ),
            body: Body::File(file),
        }
    }

    /// Confirmation page for a finished upload that sends the browser back to `directory`, a
    /// root-relative URL path.
    pub fn upload_saved(&self, saved: &[String], directory: &Path, now: SystemTime) -> Reply {
        let location = UrlEncoded::path(directory.as_os_str().as_bytes()).to_string();
        let mut names = String::new();
        for name in saved {
            names.push_str(&format!("<li>{}</li>\n", HtmlEscaped(name)));
        }
        let body = format!(
            "<html><head>\n\
            <meta http-equiv=\"refresh\" content=\"1;url={}\">\n\
            <title>Upload complete</title></head><body>\n\
            <h1>Upload complete</h1>\n\
            <ul>\n{}</ul>\n\
            <p><a href=\"{}\">Back to {}</a></p>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            location,
            names,
            location,
            HtmlEscaped(&directory.to_string_lossy()),
            GeneratedOn(self, now),
        );
        self.html(200, now, body)
    }
}
