//! Centralized configuration for the QuiverCGI server.
//!
//! Sources, lowest to highest priority:
//! - ServerConfig::default()
//! - ENV (ServerConfig::from_env(), QCGI_* variables; FCGI_WEB_SERVER_ADDRS for the ACL)
//! - config file (ConfigTable, see config/table.rs) via merge_table()
//! - CLI flags (cli.rs), applied through the with_* setters
//!
//! The config is built once at startup and is read-only afterwards (shared via ServerContext).

pub mod table;

pub use table::ConfigTable;

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::PathBuf;

use crate::consts::{
    DEFAULT_LISTEN, DEFAULT_PORT, DEFAULT_SESSION_DIR, DEFAULT_SESSION_SWEEP_SECS,
    DEFAULT_SESSION_TTL_SECS, DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_STREAM_BUFFER,
    DEFAULT_SUPERVISE_MS, DEFAULT_WORKERS, FCGI_MAX_CONTENT_LEN,
};
use crate::util::parse_flag;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address: IP/host, or a filesystem path (or "unix:/path") for a Unix socket.
    /// Env: QCGI_LISTEN (default 127.0.0.1)
    pub listen: String,

    /// TCP port (ignored for Unix sockets).
    /// Env: QCGI_PORT (default 9000)
    pub port: u16,

    /// Number of long-lived workers sharing the listener.
    /// Env: QCGI_WORKERS (default 4)
    pub workers: usize,

    /// Detach from the terminal (unix only).
    /// Env: QCGI_DAEMONIZE (default false)
    pub daemonize: bool,

    /// Per-stream buffer (bytes of record content), 1..=65535.
    /// Env: QCGI_STREAM_BUFFER (default 8192)
    pub stream_buffer: usize,

    /// Session files directory.
    /// Env: QCGI_SESSION_DIR (default <tmp>/quivercgi-sessions)
    pub session_dir: PathBuf,

    /// Session TTL in seconds (sliding window).
    /// Env: QCGI_SESSION_TTL (default 10800)
    pub session_ttl_secs: u64,

    /// Expired session sweep period in seconds (0 disables).
    /// Env: QCGI_SESSION_SWEEP (default 600)
    pub session_sweep_secs: u64,

    /// Optional log file; None => env_logger on stderr.
    /// Env: QCGI_LOG_FILE
    pub log_file: Option<PathBuf>,

    /// Allowed peer addresses (empty => everyone).
    /// Env: QCGI_ALLOW or FCGI_WEB_SERVER_ADDRS (comma separated)
    pub allow: Vec<String>,

    /// Directory scanned for executable handlers.
    /// Env: QCGI_HANDLERS_DIR
    pub handlers_dir: Option<PathBuf>,

    /// Optional status endpoint (metrics) address, e.g. 127.0.0.1:9898.
    /// Env: QCGI_STATUS_ADDR
    pub status_addr: Option<String>,

    /// Worker liveness check period, ms.
    /// Env: QCGI_SUPERVISE_MS (default 500)
    pub supervise_ms: u64,

    /// How long the quiesce phase waits for busy workers, ms.
    /// Env: QCGI_SHUTDOWN_GRACE_MS (default 3000)
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            daemonize: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            session_dir: std::env::temp_dir().join(DEFAULT_SESSION_DIR),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            session_sweep_secs: DEFAULT_SESSION_SWEEP_SECS,
            log_file: None,
            allow: Vec::new(),
            handlers_dir: None,
            status_addr: None,
            supervise_ms: DEFAULT_SUPERVISE_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_string())
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl ServerConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = std::env::var("QCGI_LISTEN").ok().and_then(|v| non_empty(&v)) {
            cfg.listen = v;
        }
        if let Ok(v) = std::env::var("QCGI_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                cfg.port = n;
            }
        }
        if let Ok(v) = std::env::var("QCGI_WORKERS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.workers = n;
            }
        }
        if let Ok(v) = std::env::var("QCGI_DAEMONIZE") {
            cfg.daemonize = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("QCGI_STREAM_BUFFER") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.stream_buffer = n;
            }
        }
        if let Some(v) = std::env::var("QCGI_SESSION_DIR").ok().and_then(|v| non_empty(&v)) {
            cfg.session_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QCGI_SESSION_TTL") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.session_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("QCGI_SESSION_SWEEP") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.session_sweep_secs = n;
            }
        }
        if let Some(v) = std::env::var("QCGI_LOG_FILE").ok().and_then(|v| non_empty(&v)) {
            cfg.log_file = Some(PathBuf::from(v));
        }
        // QCGI_ALLOW имеет приоритет над стандартной FCGI_WEB_SERVER_ADDRS
        if let Ok(v) = std::env::var("QCGI_ALLOW").or_else(|_| std::env::var("FCGI_WEB_SERVER_ADDRS")) {
            cfg.allow = split_list(&v);
        }
        if let Some(v) = std::env::var("QCGI_HANDLERS_DIR").ok().and_then(|v| non_empty(&v)) {
            cfg.handlers_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = std::env::var("QCGI_STATUS_ADDR").ok().and_then(|v| non_empty(&v)) {
            cfg.status_addr = Some(v);
        }
        if let Ok(v) = std::env::var("QCGI_SUPERVISE_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.supervise_ms = n;
            }
        }
        if let Ok(v) = std::env::var("QCGI_SHUTDOWN_GRACE_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.shutdown_grace_ms = n;
            }
        }

        cfg
    }

    /// Override fields present in a loaded config file.
    pub fn merge_table(mut self, t: &ConfigTable) -> Result<Self> {
        if let Some(v) = t.get("listen").and_then(non_empty) {
            self.listen = v;
        }
        if let Some(n) = t.get_parsed::<u16>("port")? {
            self.port = n;
        }
        if let Some(n) = t.get_parsed::<usize>("workers")? {
            self.workers = n;
        }
        if let Some(v) = t.get("daemonize") {
            self.daemonize = parse_flag(v);
        }
        if let Some(n) = t.get_parsed::<usize>("stream_buffer")? {
            self.stream_buffer = n;
        }
        if let Some(v) = t.get("session_dir").and_then(non_empty) {
            self.session_dir = PathBuf::from(v);
        }
        if let Some(n) = t.get_parsed::<u64>("session_ttl")? {
            self.session_ttl_secs = n;
        }
        if let Some(n) = t.get_parsed::<u64>("session_sweep")? {
            self.session_sweep_secs = n;
        }
        if let Some(v) = t.get("log_file").and_then(non_empty) {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = t.get("allow") {
            self.allow = split_list(v);
        }
        if let Some(v) = t.get("handlers_dir").and_then(non_empty) {
            self.handlers_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = t.get("status_addr").and_then(non_empty) {
            self.status_addr = Some(v);
        }
        if let Some(n) = t.get_parsed::<u64>("supervise_ms")? {
            self.supervise_ms = n;
        }
        if let Some(n) = t.get_parsed::<u64>("shutdown_grace_ms")? {
            self.shutdown_grace_ms = n;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be >= 1"));
        }
        if self.stream_buffer == 0 || self.stream_buffer > FCGI_MAX_CONTENT_LEN {
            return Err(anyhow!(
                "stream_buffer must be in 1..={} (got {})",
                FCGI_MAX_CONTENT_LEN,
                self.stream_buffer
            ));
        }
        if self.session_ttl_secs == 0 {
            return Err(anyhow!("session_ttl must be > 0"));
        }
        if self.supervise_ms == 0 {
            return Err(anyhow!("supervise_ms must be > 0"));
        }
        Ok(())
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_listen<S: Into<String>>(mut self, listen: S) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_daemonize(mut self, on: bool) -> Self {
        self.daemonize = on;
        self
    }

    pub fn with_stream_buffer(mut self, n: usize) -> Self {
        self.stream_buffer = n;
        self
    }

    pub fn with_session_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.session_dir = dir.into();
        self
    }

    pub fn with_session_ttl_secs(mut self, secs: u64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    pub fn with_log_file<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.log_file = path.map(Into::into);
        self
    }

    pub fn with_allow<S: AsRef<str>>(mut self, addrs: &[S]) -> Self {
        self.allow = addrs.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_handlers_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.handlers_dir = dir.map(Into::into);
        self
    }

    pub fn with_status_addr<S: Into<String>>(mut self, addr: Option<S>) -> Self {
        self.status_addr = addr.map(Into::into);
        self
    }

    pub fn with_supervise_ms(mut self, ms: u64) -> Self {
        self.supervise_ms = ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerConfig {{ \
             listen: {}, \
             port: {}, \
             workers: {}, \
             daemonize: {}, \
             stream_buffer: {}, \
             session_dir: {}, \
             session_ttl_secs: {}, \
             log_file: {}, \
             allow: [{}], \
             handlers_dir: {}, \
             status_addr: {} \
             }}",
            self.listen,
            self.port,
            self.workers,
            self.daemonize,
            self.stream_buffer,
            self.session_dir.display(),
            self.session_ttl_secs,
            self.log_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "stderr".to_string()),
            self.allow.join(","),
            self.handlers_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            self.status_addr.as_deref().unwrap_or("off"),
        )
    }
}
