//! serve-a-page: an epoll-based multi-threaded static web server
//!
//! Features:
//! - One-shot epoll readiness dispatch onto a fixed worker pool
//! - Keep-alive HTTP/1.1 with mmap-backed file responses
//! - Idle-connection eviction driven by an indexed timer heap
//! - Form login and registration against an in-process user directory
//! - Configuration via CLI arguments or TOML file

mod auth;
mod config;
mod http;
mod logging;
mod runtime;

use config::Config;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; the guard keeps the file sink alive until exit
    let _log_guard = logging::init(&config)?;

    info!(
        port = config.port,
        workers = config.workers,
        credential_slots = config.credential_slots,
        trig_mode = config.trig_mode,
        timeout_ms = config.timeout_ms,
        doc_root = %config.root.display(),
        "Starting serve-a-page"
    );

    runtime::run(config)?;
    Ok(())
}
