use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "text/html                       html htm",
    "text/css                        css",
    "text/javascript                 js",
    "image/jpeg                      jpg jpeg",
    "image/png                       png",
    "image/gif                       gif",
    "image/svg+xml                   svg",
    "application/pdf                 pdf",
    "audio/mpeg                      mp3",
    "video/mp4                       mp4",
    "application/json                json",
    "application/xml                 xml",
    "text/plain                      txt",
    "application/java-archive        jar",
    "application/vnd.symbian.install sis sisx",
    "application/zip                 zip",
    "application/x-rar-compressed    rar",
    "application/octet-stream        exe",
];

/// Maps lowercase file extensions to MIME types.
#[derive(Debug, Clone)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: String,
}

impl MimeMap {
    /// Add extension map from a file in mime.types format.
    pub fn parse_extension_map_file(&mut self, filename: &OsStr) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.to_string_lossy()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", filename.to_string_lossy()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map: a MIME type followed by its extensions.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line.split_whitespace();
        let mimetype = match fields.next() {
            Some(mimetype) if !mimetype.starts_with('#') => mimetype,
            _ => return, // empty line or comment
        };
        for extension in fields {
            self.mimetypes
                .insert(extension.to_ascii_lowercase(), mimetype.to_string());
        }
    }

    /// Get content type for a file path, by its extension.
    pub fn content_type(&self, path: &Path) -> &str {
        path.extension()
            .map(|extension| extension.to_string_lossy().to_ascii_lowercase())
            .and_then(|extension| self.mimetypes.get(&extension))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}
