use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use sharehttpd::{Config, Server, ServerEvent};

/// How often the main thread checks whether a signal asked it to stop.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args();
    let name = args
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
    let config = match Config::from_args(args)? {
        Some(config) => config,
        None => {
            Config::default().usage(&name);
            return Ok(());
        }
    };
    if config.root.is_none() {
        log::warn!("no shared folder given, every request will be answered with an error");
    }

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = Server::new(config);
    let events = server.subscribe();
    server.start()?;

    let mut result = Ok(());
    while is_running() {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(ServerEvent::Ready(addr)) => println!("listening on: http://{}/", addr),
            Ok(ServerEvent::Waiting(reason)) => log::info!("waiting: {}", reason),
            Ok(ServerEvent::Failed(reason)) => {
                result = Err(anyhow!("server failed: {}", reason));
                break;
            }
            Ok(ServerEvent::Stopped) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    server.stop();

    // Usage stats go to stdout, so skip them when stdout carries the access log.
    if !server.logs_to_stdout() {
        server.stats().print()?;
    }
    result
}
