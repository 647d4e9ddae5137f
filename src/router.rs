//! Maps a request target onto the shared folder.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::http::{make_safe_url, url_decode};
use crate::request::RequestHead;
use crate::upload::is_partial_upload;

pub const UPLOAD_PATH: &str = "/upload";

#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision {
    ServeDirectory(PathBuf),
    ServeFile(PathBuf),
    Upload {
        target_dir: PathBuf,
        content_length: u64,
        boundary: String,
    },
    NotFound,
    BadRequest(&'static str),
}

/// Route a GET target. `root` must already be canonical.
pub fn route(target: &str, root: &Path) -> RouteDecision {
    let path = target.splitn(2, '?').next().unwrap_or("");
    let relative = path.strip_prefix('/').unwrap_or(path);
    if relative.is_empty() {
        return RouteDecision::ServeDirectory(root.to_path_buf());
    }

    let resolved = match resolve(relative, root) {
        Ok(resolved) => resolved,
        Err(decision) => return decision,
    };
    if resolved.file_name().map_or(false, is_partial_upload) {
        return RouteDecision::NotFound;
    }
    match resolved.metadata() {
        Ok(metadata) if metadata.is_dir() => RouteDecision::ServeDirectory(resolved),
        Ok(metadata) if metadata.is_file() => RouteDecision::ServeFile(resolved),
        _ => RouteDecision::NotFound,
    }
}

/// Route a `POST /upload[?path=dir]` request.
pub fn route_upload(head: &RequestHead, root: &Path) -> RouteDecision {
    if head.path() != UPLOAD_PATH {
        return RouteDecision::NotFound;
    }
    let target_dir = match head.query_param("path").filter(|dir| !dir.is_empty()) {
        None => root.to_path_buf(),
        Some(dir) => match resolve(dir.trim_start_matches('/'), root) {
            Ok(dir) if dir.is_dir() => dir,
            Ok(_) => return RouteDecision::NotFound,
            Err(decision) => return decision,
        },
    };
    let content_length = match head.content_length() {
        Some(content_length) => content_length,
        None => return RouteDecision::BadRequest("missing Content-Length"),
    };
    let boundary = match head.boundary() {
        Some(boundary) => boundary.to_string(),
        None => return RouteDecision::BadRequest("missing multipart boundary"),
    };
    RouteDecision::Upload {
        target_dir,
        content_length,
        boundary,
    }
}

/// Percent-decode `relative`, join it onto `root` and make sure the result stays inside.
///
/// Paths that climb above the root are a bad request; paths that leave it through a symlink
/// are reported as missing.
fn resolve(relative: &str, root: &Path) -> Result<PathBuf, RouteDecision> {
    let mut decoded = b"/".to_vec();
    decoded.extend(url_decode(relative));
    if decoded.contains(&0) {
        return Err(RouteDecision::BadRequest("You requested an invalid URL."));
    }
    let safe = match make_safe_url(&decoded) {
        Some(safe) => safe,
        None => return Err(RouteDecision::BadRequest("You requested an invalid URL.")),
    };

    let joined = root.join(OsStr::from_bytes(&safe[1..]));
    match joined.canonicalize() {
        Ok(canonical) if canonical.starts_with(root) => Ok(joined),
        _ => Err(RouteDecision::NotFound),
    }
}

/// Express `path` relative to `root` as a URL path with a leading slash.
pub fn root_relative(path: &Path, root: &Path) -> PathBuf {
    let relative = path.strip_prefix(root).unwrap_or(path);
    Path::new("/").join(relative)
}
