//! Обслуживание одного соединения.
//!
//! Состояния: AwaitBegin -> ReadingParams -> ReadingBody -> Dispatched -> Finishing ->
//! (keep-alive: снова AwaitBegin) | Closed.
//!
//! - неизвестная роль: END_REQUEST(UNKNOWN_ROLE), затем соединение закрывается с ошибкой;
//! - ABORT_REQUEST во время PARAMS: обработчик не вызывается, запрос завершается со статусом 0;
//! - маршрут не найден: CGI-ответ "Status: 404 Not Found", app_status 0;
//! - ошибка обработчика: текст в STDERR, app_status 1;
//! - ошибка транспорта/протокола внутри обработчика фатальна для соединения.

use log::{debug, warn};
use std::io::{self, Read, Write};

use crate::error::{FcgiError, FcgiResult};
use crate::handler::RequestHandle;
use crate::metrics;
use crate::protocol::{BeginRequestBody, Conn, ConnStats, ProtocolStatus, RecordType, Request, Role};
use crate::session::SessionStore;

use super::ServerContext;

const NOT_FOUND_RESPONSE: &[u8] =
    b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnot found\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitBegin,
    ReadingParams,
    ReadingBody,
    Dispatched,
    Finishing,
    Closed,
}

pub struct Connection<T: Read + Write> {
    conn: Conn<T>,
    state: ConnState,
    served: u64,
}

impl<T: Read + Write> Connection<T> {
    pub fn new(io: T, buffer: usize) -> Self {
        Self {
            conn: Conn::new(io, buffer),
            state: ConnState::AwaitBegin,
            served: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Число завершённых запросов на соединении.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn stats(&self) -> ConnStats {
        self.conn.stats()
    }

    pub fn into_inner(self) -> T {
        self.conn.into_inner()
    }

    /// Обслуживать запросы до закрытия соединения.
    pub fn serve(&mut self, ctx: &ServerContext) -> FcgiResult<()> {
        let res = self.serve_inner(ctx);
        self.state = ConnState::Closed;
        res
    }

    fn serve_inner(&mut self, ctx: &ServerContext) -> FcgiResult<()> {
        loop {
            self.state = ConnState::AwaitBegin;
            let Some(rec) = self.conn.next_record()? else {
                return Ok(());
            };
            if rec.rtype() != RecordType::BeginRequest {
                return Err(FcgiError::protocol(format!(
                    "expected BEGIN_REQUEST, got {:?}",
                    rec.rtype()
                )));
            }
            let id = rec.request_id();
            let body = BeginRequestBody::decode(&rec.content)?;
            let Some(role) = Role::from_u16(body.role) else {
                metrics::record_unknown_role();
                self.conn.end_request(id, 0, ProtocolStatus::UnknownRole)?;
                return Err(FcgiError::protocol(format!(
                    "request id={}: unknown role {}",
                    id, body.role
                )));
            };

            let keep = body.keep_conn();
            self.serve_request(ctx, id, role, keep)?;
            self.served += 1;
            if !keep {
                return Ok(());
            }
        }
    }

    fn serve_request(&mut self, ctx: &ServerContext, id: u16, role: Role, keep: bool) -> FcgiResult<()> {
        let mut req = Request::new(&mut self.conn, id, role, keep, ctx.config.stream_buffer);

        self.state = ConnState::ReadingParams;
        req.read_params()?;
        if req.is_aborted() {
            debug!("request id={} aborted before dispatch", id);
            self.state = ConnState::Finishing;
            return req.finish(0);
        }

        self.state = ConnState::ReadingBody;
        let (route, handler) = ctx.dispatch.resolve(req.env());

        self.state = ConnState::Dispatched;
        let status = match handler {
            None => {
                debug!("request id={}: no handler for '{}'", id, route);
                metrics::record_request_not_found();
                req.stdout().write_exact(NOT_FOUND_RESPONSE)?;
                0
            }
            Some(h) => {
                let outcome = {
                    let mut ex = Exchange {
                        req: &mut req,
                        sessions: &ctx.sessions,
                    };
                    h.handle(&mut ex)
                };
                if let Some(fatal) = req.take_failure() {
                    return Err(fatal);
                }
                match outcome {
                    Ok(status) => status,
                    Err(e) => {
                        metrics::record_handler_error();
                        warn!("request id={} route '{}': handler failed: {:#}", id, route, e);
                        let msg = format!("handler '{}' failed: {:#}\n", route, e);
                        req.stderr().write_exact(msg.as_bytes())?;
                        1
                    }
                }
            }
        };

        self.state = ConnState::Finishing;
        if keep {
            // следующий запрос может прийти с тем же id
            let skipped = req.drain_input()?;
            if skipped > 0 {
                debug!("request id={}: {} unread body bytes drained", id, skipped);
            }
        }
        req.finish(status)
    }
}

/// RequestHandle, который сервер отдаёт обработчику: запрос + хранилище сессий.
struct Exchange<'x, 'c, T: Read + Write> {
    req: &'x mut Request<'c, T>,
    sessions: &'x SessionStore,
}

impl<'x, 'c, T: Read + Write> RequestHandle for Exchange<'x, 'c, T> {
    fn role(&self) -> Role {
        self.req.role()
    }

    fn request_id(&self) -> u16 {
        self.req.id()
    }

    fn get_param(&self, name: &str) -> Option<&str> {
        self.req.param(name)
    }

    fn params(&self) -> Vec<(String, String)> {
        RequestHandle::params(&*self.req)
    }

    fn read_body(&mut self) -> anyhow::Result<Vec<u8>> {
        RequestHandle::read_body(&mut *self.req)
    }

    fn read_data(&mut self) -> anyhow::Result<Vec<u8>> {
        RequestHandle::read_data(&mut *self.req)
    }

    fn write_response(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        RequestHandle::write_response(&mut *self.req, bytes)
    }

    fn write_error(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        RequestHandle::write_error(&mut *self.req, bytes)
    }

    fn is_aborted(&self) -> bool {
        self.req.is_aborted()
    }

    fn sessions(&self) -> Option<&SessionStore> {
        Some(self.sessions)
    }
}

/// Классификация ошибки соединения для лога и метрик (воркер).
pub fn record_failure(err: &FcgiError) {
    match err {
        FcgiError::Transport(e) if is_disconnect(e) => {
            debug!("connection closed by peer: {}", e);
        }
        FcgiError::Transport(e) => {
            metrics::record_transport_error();
            warn!("connection transport error: {}", e);
        }
        FcgiError::Protocol(_) => {
            metrics::record_protocol_error();
            warn!("connection dropped: {}", err);
        }
        other => warn!("connection dropped: {}", other),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
    )
}
