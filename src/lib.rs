//! An embeddable HTTP/1.x file-sharing server.
//!
//! A [`Server`] shares one folder: `GET` returns directory listings and file contents, and
//! `POST /upload` stores files sent as `multipart/form-data`. Requests are parsed by hand and
//! every connection runs on its own thread.

pub mod access_log;
pub mod config;
mod connection;
pub mod error;
pub mod http;
pub mod listing;
pub mod mime;
pub mod registry;
pub mod request;
pub mod response;
pub mod router;
pub mod sender;
pub mod server;
pub mod stats;
pub mod upload;

pub use config::Config;
pub use error::{Error, RequestError};
pub use server::{Lifecycle, Server, ServerEvent};
