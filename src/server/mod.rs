//! Connection & worker supervisor.
//!
//! - listener   - TCP / Unix socket, общий для воркеров;
//! - connection - конечный автомат одного соединения и вызов обработчика;
//! - worker     - Worker::accept_loop и Supervisor (перезапуск, quiesce);
//! - dispatch   - таблица маршрутов;
//! - status     - опциональный HTTP endpoint со счётчиками.
//!
//! ServerContext собирается один раз при старте и дальше только читается.

pub mod connection;
pub mod dispatch;
pub mod listener;
pub mod status;
pub mod worker;

pub use connection::{ConnState, Connection};
pub use dispatch::{route_name, DispatchTable};
pub use listener::{listen, Listener, Stream};
pub use worker::{Supervisor, Worker};

use anyhow::{anyhow, Context, Result};
use log::info;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::acl::AccessList;
use crate::config::ServerConfig;
use crate::session::SessionStore;

pub struct ServerContext {
    pub config: ServerConfig,
    pub dispatch: DispatchTable,
    pub acl: AccessList,
    pub sessions: SessionStore,
}

impl ServerContext {
    /// ACL из config.allow, хранилище сессий в config.session_dir.
    pub fn new(config: ServerConfig, dispatch: DispatchTable) -> Result<Self> {
        config.validate()?;
        let acl = AccessList::parse(&config.allow.join(","))?;
        let sessions = SessionStore::open(&config.session_dir, config.session_ttl_secs)?;
        Ok(Self {
            config,
            dispatch,
            acl,
            sessions,
        })
    }

    /// Как new, плюс обработчики из config.handlers_dir.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let mut dispatch = DispatchTable::new();
        if let Some(dir) = &config.handlers_dir {
            dispatch.scan_dir(dir)?;
        }
        Self::new(config, dispatch)
    }
}

#[cfg(unix)]
fn daemonize_process() -> Result<()> {
    // cwd сохраняем (относительные пути конфига), stdio -> /dev/null
    nix::unistd::daemon(true, false).map_err(|e| anyhow!("daemonize: {}", e))
}

#[cfg(not(unix))]
fn daemonize_process() -> Result<()> {
    Err(anyhow!("daemonize is only supported on unix"))
}

/// listen -> (daemonize) -> сигналы -> воркеры -> надзор до SIGINT/SIGTERM.
pub fn run(ctx: ServerContext, workers: usize, daemonize: bool) -> Result<()> {
    let listener = listen(&ctx.config.listen, ctx.config.port)?;
    info!("listening on {}", listener.local_addr_string());

    // до появления потоков: fork в многопоточном процессе небезопасен
    if daemonize {
        daemonize_process()?;
        info!("daemonized, pid={}", std::process::id());
    }

    let ctx = Arc::new(ctx);
    let mut sup = Supervisor::new(ctx.clone(), listener, workers);

    let flag = sup.shutdown_flag();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install SIGINT/SIGTERM handler")?;

    let status = match &ctx.config.status_addr {
        Some(addr) => Some(status::spawn_status_server(
            addr,
            ctx.clone(),
            sup.shutdown_flag(),
        )?),
        None => None,
    };

    sup.run_until_shutdown()?;

    if let Some(h) = status {
        let _ = h.join();
    }
    Ok(())
}
