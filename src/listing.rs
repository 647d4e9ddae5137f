//! HTML index pages for shared directories.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::http::{HtmlEscaped, UrlEncoded};
use crate::router::{root_relative, UPLOAD_PATH};
use crate::upload::is_partial_upload;

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: OsString,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Read the immediate children of `directory`, directories first, then by name.
///
/// Any enumeration error fails the whole listing rather than producing a partial one.
pub fn read_entries(directory: &Path) -> io::Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if is_partial_upload(&entry.file_name()) {
            continue;
        }
        let path = entry.path();
        // follow symlinks; a dangling one lists as a file
        let is_dir = std::fs::metadata(&path)
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        entries.push(DirectoryEntry {
            name: entry.file_name(),
            path,
            is_dir,
        });
    }
    sort_entries(&mut entries);
    Ok(entries)
}

fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

/// Directory listing body.
struct Listing<'a> {
    entries: &'a [DirectoryEntry],
    root: &'a Path,
    parent: Option<PathBuf>,
}

impl<'a> std::fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "<ul>")?;
        if let Some(parent) = &self.parent {
            writeln!(
                f,
                "<li><a href=\"{}\">../</a></li>",
                UrlEncoded::path(parent.as_os_str().as_bytes())
            )?;
        }
        for entry in self.entries {
            let href = root_relative(&entry.path, self.root);
            writeln!(
                f,
                "<li><a href=\"{}\">{}{}</a></li>",
                UrlEncoded::path(href.as_os_str().as_bytes()),
                HtmlEscaped(&entry.name.to_string_lossy()),
                if entry.is_dir { "/" } else { "" }
            )?;
        }
        writeln!(f, "</ul>")
    }
}

/// Render the index page of `directory`, which must lie under `root`. `footer` is appended
/// verbatim before the closing tags.
pub fn render(directory: &Path, root: &Path, footer: &str) -> io::Result<String> {
    let entries = read_entries(directory)?;
    let here = root_relative(directory, root);
    let parent = if directory == root {
        None
    } else {
        here.parent().map(Path::to_path_buf)
    };
    let here_lossy = here.to_string_lossy();
    let upload_dir = here_lossy.trim_start_matches('/');

    Ok(format!(
        "<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Directory: {}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>Directory: {}</h1>\n\
        <form enctype=\"multipart/form-data\" method=\"post\" action=\"{}?path={}\">\n\
        <input type=\"file\" name=\"file\">\n\
        <input type=\"submit\" value=\"Upload\">\n\
        </form>\n\
        {}\
        <hr>\n\
        {}\
        </body>\n</html>\n",
        HtmlEscaped(&here_lossy),
        HtmlEscaped(&here_lossy),
        UPLOAD_PATH,
        UrlEncoded::part(upload_dir),
        Listing {
            entries: &entries,
            root,
            parent,
        },
        footer,
    ))
}
