//! Small formatting and parsing helpers shared by the request and response paths.

use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Percent-encode raw bytes as an RFC3986 URL part. Slashes are kept when the
/// value is a path so that links stay hierarchical.
pub struct UrlEncoded<'a> {
    bytes: &'a [u8],
    keep_slash: bool,
}

impl<'a> UrlEncoded<'a> {
    /// Encode a single path segment or query value.
    pub fn part(value: &'a str) -> Self {
        Self::bytes(value.as_bytes(), false)
    }

    /// Encode a `/`-separated path, leaving the separators alone.
    pub fn path(value: &'a [u8]) -> Self {
        Self::bytes(value, true)
    }

    pub fn bytes(bytes: &'a [u8], keep_slash: bool) -> Self {
        Self { bytes, keep_slash }
    }
}

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.bytes {
            if b.is_ascii_alphanumeric()
                || matches!(b, b'-' | b'.' | b'_' | b'~')
                || (self.keep_slash && b == b'/')
            {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the byte it represents.
///
/// Malformed escapes are passed through untouched.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    match hex {
        b'A'..=b'F' => hex - b'A' + 10,
        b'a'..=b'f' => hex - b'a' + 10,
        _ => hex - b'0',
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Resolve //, /./, and /../ in a decoded URL path.
///
/// Returns None if the path doesn't start with a slash or climbs above the root.
pub fn make_safe_url(url: &[u8]) -> Option<Vec<u8>> {
    if !url.starts_with(b"/") {
        return None;
    }

    let mut out = Vec::with_capacity(url.len());
    let mut src = 0;
    while src < url.len() {
        let rest = &url[src..];
        if rest.starts_with(b"//") {
            src += 1;
        } else if rest.starts_with(b"/.") && matches!(rest.get(2), Some(&b'/') | None) {
            src += 2;
        } else if rest.starts_with(b"/..") && matches!(rest.get(3), Some(&b'/') | None) {
            src += 3;
            // drop the previous component
            loop {
                match out.pop() {
                    None => return None,
                    Some(b'/') => break,
                    Some(_) => {}
                }
            }
        } else {
            out.push(url[src]);
            src += 1;
        }
    }

    // Always preserve leading slash
    if out.is_empty() {
        out.push(b'/');
    }
    Some(out)
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find_bytes(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    #[test]
    fn url_encoded_works() {
        assert_eq!(
            UrlEncoded::part("escape(this)name\tcrab\u{1F980}").to_string(),
            "escape%28this%29name%09crab%F0%9F%A6%80"
        );
        assert_eq!(
            UrlEncoded::path(b"docs/my file.txt").to_string(),
            "docs/my%20file.txt"
        );
        assert_eq!(UrlEncoded::part("a/b").to_string(), "a%2Fb");
    }

    #[test]
    fn url_decoded_works() {
        assert_eq!(url_decode("escape%28this%29name%09"), b"escape(this)name\t");
        assert_eq!(url_decode("edge%"), b"edge%");
        assert_eq!(url_decode("edge%2"), b"edge%2");
        assert_eq!(url_decode("edge%20"), b"edge ");
        assert_eq!(url_decode("%zz"), b"%zz");
        assert_eq!(url_decode("invalid%C3%28"), b"invalid\xc3\x28");
    }

    #[test]
    fn html_escaped_works() {
        assert_eq!(
            HtmlEscaped("foo<>&'\"").to_string(),
            "foo&lt;&gt;&amp;&apos;&quot;"
        );
    }

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("some\"log\tcrab\u{1F980}").to_string(),
            "some%22log%09crab%F0%9F%A6%80"
        );
    }

    #[test]
    fn clf_date_works() {
        // contains system's local timezone
        assert!(
            ClfDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1620965123))
                .to_string()
                .contains("May/2021")
        );
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1622040683)).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn find_bytes_works() {
        assert_eq!(find_bytes(b"\r\n\r\n", b"GET / HTTP/1.0\r\n\r\nbody"), Some(14));
        assert_eq!(find_bytes(b"xyz", b"abc"), None);
        assert_eq!(find_bytes(b"abcd", b"abc"), None);
    }

    #[test]
    fn make_safe_url_works() {
        let test_cases: &[(&str, Option<&str>)] = &[
            ("", None),
            ("/", Some("/")),
            ("/.", Some("/")),
            ("/./", Some("/")),
            ("/.d", Some("/.d")),
            ("//.d", Some("/.d")),
            ("/../", None),
            ("/abc", Some("/abc")),
            ("/abc/", Some("/abc/")),
            ("/abc/.", Some("/abc")),
            ("/abc/..", Some("/")),
            ("/abc/../def/", Some("/def/")),
            ("/abc/../def/../../", None),
            ("/a/b/c/../../d/", Some("/a/d/")),
            ("/a/b/../../../c", None),
            ("/../../etc/passwd", None),
            ("//a///b////c/////", Some("/a/b/c/")),
        ];
        for (url, expected) in test_cases {
            assert_eq!(
                make_safe_url(url.as_bytes()),
                expected.map(|s| s.as_bytes().to_vec()),
                "{}",
                url
            );
        }
    }
}
