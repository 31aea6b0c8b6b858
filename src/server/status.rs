//! Status endpoint (tiny_http): счётчики сервера.
//!
//! GET /metrics  -> Prometheus text (version 0.0.4)
//! GET /status   -> JSON (MetricsSnapshot + конфигурация воркеров)
//! GET /health, /ready, / -> "OK"

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Header, Response, Server};

use crate::metrics::{self, MetricsSnapshot};

use super::ServerContext;

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    listen: &'a str,
    port: u16,
    workers: usize,
    routes: Vec<String>,
    metrics: MetricsSnapshot,
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn status_json(ctx: &ServerContext) -> Result<String> {
    let report = StatusReport {
        listen: &ctx.config.listen,
        port: ctx.config.port,
        workers: ctx.config.workers,
        routes: ctx.dispatch.names(),
        metrics: metrics::snapshot(),
    };
    serde_json::to_string_pretty(&report).context("serialize status")
}

/// Запускает endpoint в отдельном потоке; поток завершается по флагу shutdown.
pub fn spawn_status_server(
    addr: &str,
    ctx: Arc<ServerContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let server = Server::http(addr).map_err(|e| anyhow!("bind status http at {}: {}", addr, e))?;
    info!("status endpoint listening on {}", addr);

    let h = thread::Builder::new()
        .name("quivercgi-status".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                let rq = match server.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(rq)) => rq,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("status http recv error: {}", e);
                        continue;
                    }
                };

                let url = rq.url().to_string();
                let method = rq.method().as_str().to_string();

                if method != "GET" {
                    let _ = rq.respond(Response::from_string("method not allowed\n").with_status_code(405));
                    continue;
                }

                let resp = match url.as_str() {
                    "/" | "/health" | "/ready" => Response::from_string("OK\n"),
                    "/metrics" => {
                        let mut r = Response::from_string(metrics::snapshot().render_prometheus());
                        if let Some(ct) = header("Content-Type", "text/plain; version=0.0.4") {
                            r.add_header(ct);
                        }
                        r
                    }
                    "/status" => match status_json(&ctx) {
                        Ok(body) => {
                            let mut r = Response::from_string(body);
                            if let Some(ct) = header("Content-Type", "application/json") {
                                r.add_header(ct);
                            }
                            r
                        }
                        Err(e) => Response::from_string(format!("status error: {:#}\n", e))
                            .with_status_code(500),
                    },
                    _ => Response::from_string("not found\n").with_status_code(404),
                };
                let _ = rq.respond(resp);
            }
        })
        .context("spawn status thread")?;
    Ok(h)
}
