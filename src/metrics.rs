//! Lightweight global metrics for QuiverCGI.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Accept / ACL
//! - Requests (begin / complete / handler errors)
//! - Protocol (management records, CANT_MPX_CONN, UNKNOWN_ROLE)
//! - Transport (bytes in/out, I/O errors)
//! - Workers (spawn / respawn)
//! - Sessions (create / expire / sweep)
//!
//! Снимок (MetricsSnapshot) сериализуется в JSON для /status и
//! рендерится в Prometheus text format для /metrics (server/status.rs).

use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Accept -----
static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_DENIED: AtomicU64 = AtomicU64::new(0);

// ----- Requests -----
static REQUESTS_STARTED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_ABORTED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_NOT_FOUND: AtomicU64 = AtomicU64::new(0);
static HANDLER_ERRORS: AtomicU64 = AtomicU64::new(0);

// ----- Protocol -----
static MANAGEMENT_RECORDS: AtomicU64 = AtomicU64::new(0);
static MULTIPLEX_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static UNKNOWN_ROLES: AtomicU64 = AtomicU64::new(0);
static PROTOCOL_ERRORS: AtomicU64 = AtomicU64::new(0);

// ----- Transport -----
static TRANSPORT_ERRORS: AtomicU64 = AtomicU64::new(0);
static BYTES_IN: AtomicU64 = AtomicU64::new(0);
static BYTES_OUT: AtomicU64 = AtomicU64::new(0);

// ----- Workers -----
static WORKERS_SPAWNED: AtomicU64 = AtomicU64::new(0);
static WORKERS_RESPAWNED: AtomicU64 = AtomicU64::new(0);

// ----- Sessions -----
static SESSIONS_CREATED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_EXPIRED: AtomicU64 = AtomicU64::new(0);
static SESSION_SWEEP_RUNS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Accept
    pub connections_accepted: u64,
    pub connections_denied: u64,

    // Requests
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_aborted: u64,
    pub requests_not_found: u64,
    pub handler_errors: u64,

    // Protocol
    pub management_records: u64,
    pub multiplex_rejections: u64,
    pub unknown_roles: u64,
    pub protocol_errors: u64,

    // Transport
    pub transport_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,

    // Workers
    pub workers_spawned: u64,
    pub workers_respawned: u64,

    // Sessions
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub session_sweep_runs: u64,
}

impl MetricsSnapshot {
    /// Запросы, начатые, но ещё не завершённые (грубая оценка на момент снимка).
    pub fn requests_in_flight(&self) -> u64 {
        self.requests_started
            .saturating_sub(self.requests_completed)
            .saturating_sub(self.requests_aborted)
    }

    /// Prometheus text exposition (version 0.0.4).
    pub fn render_prometheus(&self) -> String {
        let rows: [(&str, &str, u64); 20] = [
            ("connections_accepted_total", "counter", self.connections_accepted),
            ("connections_denied_total", "counter", self.connections_denied),
            ("requests_started_total", "counter", self.requests_started),
            ("requests_completed_total", "counter", self.requests_completed),
            ("requests_aborted_total", "counter", self.requests_aborted),
            ("requests_not_found_total", "counter", self.requests_not_found),
            ("handler_errors_total", "counter", self.handler_errors),
            ("management_records_total", "counter", self.management_records),
            ("multiplex_rejections_total", "counter", self.multiplex_rejections),
            ("unknown_roles_total", "counter", self.unknown_roles),
            ("protocol_errors_total", "counter", self.protocol_errors),
            ("transport_errors_total", "counter", self.transport_errors),
            ("bytes_in_total", "counter", self.bytes_in),
            ("bytes_out_total", "counter", self.bytes_out),
            ("workers_spawned_total", "counter", self.workers_spawned),
            ("workers_respawned_total", "counter", self.workers_respawned),
            ("sessions_created_total", "counter", self.sessions_created),
            ("sessions_expired_total", "counter", self.sessions_expired),
            ("session_sweep_runs_total", "counter", self.session_sweep_runs),
            ("requests_in_flight", "gauge", self.requests_in_flight()),
        ];
        let mut out = String::new();
        for (name, kind, v) in rows.iter() {
            let _ = writeln!(out, "# TYPE quivercgi_{} {}", name, kind);
            let _ = writeln!(out, "quivercgi_{} {}", name, v);
        }
        out
    }
}

// ----- Accept -----
pub fn record_connection_accepted() {
    CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_connection_denied() {
    CONNECTIONS_DENIED.fetch_add(1, Ordering::Relaxed);
}

// ----- Requests -----
pub fn record_request_started() {
    REQUESTS_STARTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_request_completed() {
    REQUESTS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_request_aborted() {
    REQUESTS_ABORTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_request_not_found() {
    REQUESTS_NOT_FOUND.fetch_add(1, Ordering::Relaxed);
}
pub fn record_handler_error() {
    HANDLER_ERRORS.fetch_add(1, Ordering::Relaxed);
}

// ----- Protocol -----
pub fn record_management_record() {
    MANAGEMENT_RECORDS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_multiplex_rejection() {
    MULTIPLEX_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_unknown_role() {
    UNKNOWN_ROLES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_protocol_error() {
    PROTOCOL_ERRORS.fetch_add(1, Ordering::Relaxed);
}

// ----- Transport -----
pub fn record_transport_error() {
    TRANSPORT_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_bytes_in(n: usize) {
    BYTES_IN.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_bytes_out(n: usize) {
    BYTES_OUT.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Workers -----
pub fn record_worker_spawned() {
    WORKERS_SPAWNED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_worker_respawned() {
    WORKERS_RESPAWNED.fetch_add(1, Ordering::Relaxed);
}

// ----- Sessions -----
pub fn record_session_created() {
    SESSIONS_CREATED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_sessions_expired(n: usize) {
    SESSIONS_EXPIRED.fetch_add(n as u64, Ordering::Relaxed);
}
pub fn record_session_sweep_run() {
    SESSION_SWEEP_RUNS.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
        connections_denied: CONNECTIONS_DENIED.load(Ordering::Relaxed),

        requests_started: REQUESTS_STARTED.load(Ordering::Relaxed),
        requests_completed: REQUESTS_COMPLETED.load(Ordering::Relaxed),
        requests_aborted: REQUESTS_ABORTED.load(Ordering::Relaxed),
        requests_not_found: REQUESTS_NOT_FOUND.load(Ordering::Relaxed),
        handler_errors: HANDLER_ERRORS.load(Ordering::Relaxed),

        management_records: MANAGEMENT_RECORDS.load(Ordering::Relaxed),
        multiplex_rejections: MULTIPLEX_REJECTIONS.load(Ordering::Relaxed),
        unknown_roles: UNKNOWN_ROLES.load(Ordering::Relaxed),
        protocol_errors: PROTOCOL_ERRORS.load(Ordering::Relaxed),

        transport_errors: TRANSPORT_ERRORS.load(Ordering::Relaxed),
        bytes_in: BYTES_IN.load(Ordering::Relaxed),
        bytes_out: BYTES_OUT.load(Ordering::Relaxed),

        workers_spawned: WORKERS_SPAWNED.load(Ordering::Relaxed),
        workers_respawned: WORKERS_RESPAWNED.load(Ordering::Relaxed),

        sessions_created: SESSIONS_CREATED.load(Ordering::Relaxed),
        sessions_expired: SESSIONS_EXPIRED.load(Ordering::Relaxed),
        session_sweep_runs: SESSION_SWEEP_RUNS.load(Ordering::Relaxed),
    }
}
