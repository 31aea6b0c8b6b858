//! Воркеры и супервизор.
//!
//! Design:
//! - N долгоживущих потоков делят один слушающий сокет (Listener::try_clone);
//! - каждый воркер: accept -> обслужить соединение целиком -> снова accept,
//!   двое воркеров никогда не работают с одним соединением;
//! - listener неблокирующий, воркер опрашивает его и флаг shutdown с шагом ACCEPT_POLL_MS;
//! - супервизор раз в supervise_ms проверяет потоки (JoinHandle::is_finished) и
//!   перезапускает упавшие (паника обработчика убивает только свой поток);
//! - shutdown: воркеры перестают принимать, дообслуживают текущее соединение,
//!   супервизор ждёт их не дольше shutdown_grace_ms.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::consts::ACCEPT_POLL_MS;
use crate::metrics;

use super::connection::{record_failure, Connection};
use super::listener::{Listener, Stream};
use super::ServerContext;

pub struct Worker {
    id: usize,
    listener: Listener,
    ctx: Arc<ServerContext>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(id: usize, listener: Listener, ctx: Arc<ServerContext>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            id,
            listener,
            ctx,
            shutdown,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// accept -> serve -> repeat, пока не поднят флаг shutdown.
    pub fn accept_loop(&self) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        debug!("worker {} accepting", self.id);

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE и т.п.: не крутимся вхолостую
                    warn!("worker {}: accept failed: {}", self.id, e);
                    thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                }
            }
        }
        debug!("worker {} stopped", self.id);
        Ok(())
    }

    fn serve(&self, stream: Stream, peer: Option<IpAddr>) {
        if !self.ctx.acl.permits(peer) {
            metrics::record_connection_denied();
            warn!(
                "worker {}: connection from {:?} denied by access list",
                self.id, peer
            );
            return;
        }
        metrics::record_connection_accepted();

        let mut conn = Connection::new(stream, self.ctx.config.stream_buffer);
        if let Err(e) = conn.serve(&self.ctx) {
            record_failure(&e);
        }
        let st = conn.stats();
        debug!(
            "worker {}: connection done (peer={:?} requests={} in={}B out={}B mgmt={} rejected={} skipped={})",
            self.id,
            peer,
            conn.served(),
            st.bytes_in,
            st.bytes_out,
            st.management,
            st.rejected,
            st.skipped
        );
    }
}

struct Slot {
    id: usize,
    handle: Option<JoinHandle<()>>,
    restarts: u64,
}

pub struct Supervisor {
    ctx: Arc<ServerContext>,
    listener: Listener,
    shutdown: Arc<AtomicBool>,
    slots: Vec<Slot>,
    size: usize,
    last_sweep: Instant,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Supervisor {
    pub fn new(ctx: Arc<ServerContext>, listener: Listener, size: usize) -> Self {
        Self {
            ctx,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
            slots: Vec::new(),
            size: size.max(1),
            last_sweep: Instant::now(),
        }
    }

    /// Флаг остановки (для обработчика сигналов и тестов).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Живые (не завершившиеся) воркеры.
    pub fn alive(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.handle.as_ref().map_or(false, |h| !h.is_finished()))
            .count()
    }

    /// Суммарное число перезапусков.
    pub fn restarts(&self) -> u64 {
        self.slots.iter().map(|s| s.restarts).sum()
    }

    fn spawn(&self, id: usize) -> Result<JoinHandle<()>> {
        let listener = self
            .listener
            .try_clone()
            .context("clone listener for worker")?;
        let worker = Worker::new(id, listener, self.ctx.clone(), self.shutdown.clone());
        let h = thread::Builder::new()
            .name(format!("quivercgi-worker-{}", id))
            .spawn(move || {
                if let Err(e) = worker.accept_loop() {
                    error!("worker {} exited: {:#}", worker.id(), e);
                }
            })
            .with_context(|| format!("spawn worker {}", id))?;
        metrics::record_worker_spawned();
        Ok(h)
    }

    /// Запустить N воркеров.
    pub fn start(&mut self) -> Result<()> {
        for id in 0..self.size {
            let h = self.spawn(id)?;
            self.slots.push(Slot {
                id,
                handle: Some(h),
                restarts: 0,
            });
        }
        info!(
            "{} worker(s) started on {}",
            self.size,
            self.listener.local_addr_string()
        );
        Ok(())
    }

    /// Один проход проверки: завершившиеся воркеры перезапускаются. Возвращает число перезапусков.
    pub fn supervise_once(&mut self) -> Result<usize> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut respawned = 0usize;
        for i in 0..self.slots.len() {
            let finished = self.slots[i]
                .handle
                .as_ref()
                .map_or(true, |h| h.is_finished());
            if !finished {
                continue;
            }
            let id = self.slots[i].id;
            if let Some(h) = self.slots[i].handle.take() {
                match h.join() {
                    Ok(()) => warn!("worker {} exited, respawning", id),
                    Err(p) => error!("worker {} died: {}, respawning", id, panic_message(&*p)),
                }
            }
            let h = self.spawn(id)?;
            self.slots[i].handle = Some(h);
            self.slots[i].restarts += 1;
            metrics::record_worker_respawned();
            respawned += 1;
        }
        Ok(respawned)
    }

    fn maybe_sweep_sessions(&mut self) {
        let every = self.ctx.config.session_sweep_secs;
        if every == 0 || self.last_sweep.elapsed() < Duration::from_secs(every) {
            return;
        }
        self.last_sweep = Instant::now();
        if let Err(e) = self.ctx.sessions.sweep() {
            warn!("session sweep failed: {:#}", e);
        }
    }

    /// Ждать период supervise_ms, просыпаясь для проверки флага. true - пора останавливаться.
    fn wait_tick(&self) -> bool {
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.supervise_ms);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(ACCEPT_POLL_MS)));
        }
    }

    /// Основной цикл: старт, надзор до сигнала, затем quiesce.
    pub fn run_until_shutdown(&mut self) -> Result<()> {
        if self.slots.is_empty() {
            self.start()?;
        }
        while !self.wait_tick() {
            self.supervise_once()?;
            self.maybe_sweep_sessions();
        }
        let left = self.quiesce();
        if left > 0 {
            warn!("{} worker(s) still busy after shutdown grace period", left);
        }
        Ok(())
    }

    /// Остановка: поднять флаг, дождаться воркеров (не дольше shutdown_grace_ms),
    /// убрать файл Unix-сокета. Возвращает число не успевших завершиться воркеров.
    pub fn quiesce(&mut self) -> usize {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("shutting down: waiting for workers");
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.shutdown_grace_ms);

        loop {
            for slot in self.slots.iter_mut() {
                let done = slot.handle.as_ref().map_or(false, |h| h.is_finished());
                if done {
                    if let Some(h) = slot.handle.take() {
                        if let Err(p) = h.join() {
                            error!("worker {} died during shutdown: {}", slot.id, panic_message(&*p));
                        }
                    }
                }
            }
            let left = self.slots.iter().filter(|s| s.handle.is_some()).count();
            if left == 0 || Instant::now() >= deadline {
                self.listener.cleanup();
                info!("shutdown complete ({} worker(s) abandoned)", left);
                return left;
            }
            thread::sleep(Duration::from_millis(ACCEPT_POLL_MS / 2));
        }
    }
}
