//! Common Log Format request log.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::http::{ClfDate, LogEncoded};

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
    Disabled,
}

impl LogSink {
    /// Open `filename` for appending.
    pub fn file(filename: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(filename)
            .with_context(|| format!("failed to open log file {}", filename.display()))?;
        Ok(Self::File(BufWriter::new(file)))
    }

    fn log(&mut self, message: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                unsafe { libc::syslog(libc::LOG_INFO, message.as_c_str().as_ptr()) };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
            Self::Disabled => {}
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// One finished request, as it appears in the log.
#[derive(Debug, Clone, Default)]
pub struct AccessRecord<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub http_code: u16,
    pub total_sent: u64,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

impl<'a> AccessRecord<'a> {
    fn format(&self, client: IpAddr, now: SystemTime) -> String {
        format!(
            "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"\n",
            client,
            ClfDate(now),
            LogEncoded(self.method),
            LogEncoded(self.url),
            self.http_code,
            self.total_sent,
            LogEncoded(self.referer.unwrap_or("")),
            LogEncoded(self.user_agent.unwrap_or(""))
        )
    }
}

/// The access log shared by all connection threads.
#[derive(Debug, Default)]
pub struct AccessLog {
    sink: Mutex<LogSink>,
}

impl AccessLog {
    pub fn new(sink: LogSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn is_stdout(&self) -> bool {
        matches!(*self.lock(), LogSink::Stdout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogSink> {
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a request's details to the log. Requests that never produced a status are skipped.
    pub fn record(&self, client: IpAddr, record: &AccessRecord<'_>, now: SystemTime) {
        if record.http_code == 0 {
            return;
        }
        let message = record.format(client, now);
        if let Err(e) = self.lock().log(&message) {
            log::warn!("failed to write access log: {}", e);
        }
    }
}
