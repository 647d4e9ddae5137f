use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::getuid;

use crate::access_log::LogSink;
use crate::error::Error;
use crate::mime::{MimeMap, DEFAULT_MIME_TYPE};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Config {
    /// Folder to share. Requests get a 500 until one is set.
    pub root: Option<PathBuf>,
    pub bindaddr: Option<String>,
    pub bindport: u16,
    pub inet6: bool,
    /// Idle time after which a connection is closed, if any.
    pub timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    pub log_sink: LogSink,
    pub want_no_server_id: bool,
    pub mime_map: MimeMap,
    /// Largest accepted upload body, if limited.
    pub max_upload: Option<u64>,
    pub overwrite_uploads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: None,
            bindaddr: None,
            bindport: DEFAULT_PORT,
            inet6: false,
            timeout: Some(DEFAULT_TIMEOUT),
            max_connections: None,
            log_sink: LogSink::default(),
            want_no_server_id: false,
            mime_map: MimeMap::default(),
            max_upload: None,
            overwrite_uploads: false,
        }
    }
}

impl Config {
    /// Parse command line arguments, not including the program name. Returns None if help was
    /// requested.
    pub fn from_args<I>(args: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self {
            bindport: if getuid().is_root() { 80 } else { DEFAULT_PORT },
            ..Default::default()
        };
        let mut args = args.into_iter().peekable();
        if let Some(root) = args.next_if(|arg| !arg.starts_with("--")) {
            config.root = Some(PathBuf::from(root));
        }
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" => return Ok(None),
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    config.bindport = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--addr" => {
                    config.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--ipv6" => config.inet6 = true,
                "--maxconn" => {
                    let number = args.next().context("missing number after --maxconn")?;
                    config.max_connections = Some(
                        number
                            .parse()
                            .with_context(|| format!("maxconn number {} is invalid", number))?,
                    );
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    config.log_sink = LogSink::file(filename.as_ref())?;
                }
                "--syslog" => config.log_sink = LogSink::Syslog,
                "--no-log" => config.log_sink = LogSink::Disabled,
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    config
                        .mime_map
                        .parse_extension_map_file(&OsString::from(filename))?;
                }
                "--default-mimetype" => {
                    config.mime_map.default_mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                }
                "--no-server-id" => config.want_no_server_id = true,
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let timeout_secs = number
                        .parse::<u64>()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    config.timeout = match timeout_secs {
                        0 => None,
                        timeout_secs => Some(Duration::from_secs(timeout_secs)),
                    };
                }
                "--max-upload" => {
                    let number = args.next().context("missing number after --max-upload")?;
                    config.max_upload = Some(
                        number
                            .parse()
                            .with_context(|| format!("max-upload size {} is invalid", number))?,
                    );
                }
                "--overwrite-uploads" => config.overwrite_uploads = true,
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }
        Ok(Some(config))
    }

    pub fn usage(&self, argv0: &str) {
        print!(
            "usage:\t{} [/path/to/shared/folder] [flags]\n\n\
            \tWithout a folder every request is answered with an error.\n\n\
            flags:\t--port number (default: {}, or 80 if running as root)\n\
            \t\tSpecifies which port to listen on for connections.\n\
            \t\tPass 0 to let the system choose any free port for you.\n\n\
            \t--addr ip (default: all)\n\
            \t\tIf multiple interfaces are present, specifies\n\
            \t\twhich one to bind the listening port to.\n\n\
            \t--ipv6\n\
            \t\tListen on IPv6 address.\n\n\
            \t--maxconn number (default: no limit)\n\
            \t\tSpecifies how many concurrent connections to accept.\n\n\
            \t--log filename (default: stdout)\n\
            \t\tSpecifies which file to append the request log to.\n\n\
            \t--syslog\n\
            \t\tUse syslog for request log.\n\n\
            \t--no-log\n\
            \t\tDon't keep a request log.\n\n\
            \t--mimetypes filename (optional)\n\
            \t\tParses specified file for extension-MIME associations.\n\n\
            \t--default-mimetype string (optional, default: {})\n\
            \t\tFiles with unknown extensions are served as this mimetype.\n\n\
            \t--no-server-id\n\
            \t\tDon't identify the server type in headers\n\
            \t\tor generated pages.\n\n\
            \t--timeout secs (default: {})\n\
            \t\tIf a connection is idle for more than this many seconds,\n\
            \t\tit will be closed. Set to zero to disable timeouts.\n\n\
            \t--max-upload bytes (default: no limit)\n\
            \t\tRefuse uploads whose body is larger than this.\n\n\
            \t--overwrite-uploads\n\
            \t\tReplace existing files with uploads of the same name\n\
            \t\tinstead of saving them as name-1.ext, name-2.ext, ...\n\n\
            \tSet RUST_LOG to control diagnostic output (default: info).\n\n",
            argv0,
            DEFAULT_PORT,
            DEFAULT_MIME_TYPE,
            DEFAULT_TIMEOUT.as_secs(),
        );
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let malformed = |_| Error::BindAddress(self.bindaddr.clone().unwrap_or_default());
        let ip = if self.inet6 {
            IpAddr::V6(
                Ipv6Addr::from_str(self.bindaddr.as_deref().unwrap_or("::")).map_err(malformed)?,
            )
        } else {
            IpAddr::V4(
                Ipv4Addr::from_str(self.bindaddr.as_deref().unwrap_or("0.0.0.0"))
                    .map_err(malformed)?,
            )
        };
        Ok(SocketAddr::new(ip, self.bindport))
    }
}
