//! Один логический запрос на соединении.
//!
//! Создаётся по BEGIN_REQUEST (Conn становится занятым этим id), живёт до END_REQUEST.
//! Drop освобождает соединение (active = None) даже на пути ошибки.
//!
//! Порядок на выходе: записи содержимого -> пустая терминальная запись канала ->
//! END_REQUEST после закрытия последнего писателя (счётчик open_writers стартует с 2).

use log::debug;
use std::io::{Read, Write};

use crate::error::{FcgiError, FcgiResult};
use crate::metrics;

use super::conn::Conn;
use super::params::{decode_pairs, Environment};
use super::record::{ProtocolStatus, Record, RecordType, Role};
use super::stream::{Channel, InState, OutState, Reader, Writer};

pub struct Request<'c, T: Read + Write> {
    conn: &'c mut Conn<T>,
    id: u16,
    role: Role,
    keep_conn: bool,
    env: Environment,
    stdin: InState,
    data: InState,
    stdout: OutState,
    stderr: OutState,
    open_writers: u8,
    app_status: u32,
    aborted: bool,
    params_done: bool,
    finished: bool,
    failure: Option<FcgiError>,
}

impl<'c, T: Read + Write> Request<'c, T> {
    /// buffer - вместимость записи STDOUT/STDERR (1..=65535).
    pub fn new(conn: &'c mut Conn<T>, id: u16, role: Role, keep_conn: bool, buffer: usize) -> Self {
        conn.set_active(Some(id));
        metrics::record_request_started();
        let cap = buffer.clamp(1, crate::consts::FCGI_MAX_CONTENT_LEN);
        let mut data = InState::default();
        // DATA существует только у FILTER
        if role != Role::Filter {
            data.ended = true;
        }
        Self {
            conn,
            id,
            role,
            keep_conn,
            env: Environment::new(),
            stdin: InState::default(),
            data,
            stdout: OutState::new(RecordType::Stdout, cap),
            stderr: OutState::new(RecordType::Stderr, cap),
            open_writers: 2,
            app_status: 0,
            aborted: false,
            params_done: false,
            finished: false,
            failure: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.env.get_str(name)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn params_done(&self) -> bool {
        self.params_done
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn open_writers(&self) -> u8 {
        self.open_writers
    }

    /// Ошибка потока, случившаяся внутри обработчика (обработчик мог её проглотить
    /// или завернуть в anyhow). После неё соединение непригодно.
    pub fn take_failure(&mut self) -> Option<FcgiError> {
        self.failure.take()
    }

    /// Читает PARAMS до пустой записи. Пары могут пересекать границы записей,
    /// поэтому разбор - после склейки.
    pub fn read_params(&mut self) -> FcgiResult<()> {
        let mut raw = Vec::new();
        while !self.params_done && !self.aborted {
            let rec = self.fetch("PARAMS")?;
            if rec.rtype() == RecordType::Params {
                if rec.content.is_empty() {
                    self.params_done = true;
                } else {
                    raw.extend_from_slice(&rec.content);
                }
            } else {
                self.route(rec);
            }
        }
        if self.aborted && !self.params_done {
            // буфер может обрываться посреди пары; обработчик всё равно не вызывается
            debug!(
                "fcgi: request id={} aborted during PARAMS ({} bytes dropped)",
                self.id,
                raw.len()
            );
            return Ok(());
        }
        for (name, value) in decode_pairs(&raw)? {
            self.env.push(&name, &value)?;
        }
        debug!("fcgi: request id={} params={}", self.id, self.env.len());
        Ok(())
    }

    pub fn stdin(&mut self) -> Reader<'_, 'c, T> {
        Reader {
            req: self,
            channel: Channel::Stdin,
        }
    }

    pub fn data(&mut self) -> Reader<'_, 'c, T> {
        Reader {
            req: self,
            channel: Channel::Data,
        }
    }

    pub fn stdout(&mut self) -> Writer<'_, 'c, T> {
        Writer {
            req: self,
            channel: Channel::Stdout,
        }
    }

    pub fn stderr(&mut self) -> Writer<'_, 'c, T> {
        Writer {
            req: self,
            channel: Channel::Stderr,
        }
    }

    /// Дочитать и выбросить остаток входа (перед keep-alive переиспользованием).
    pub fn drain_input(&mut self) -> FcgiResult<u64> {
        let mut sink = [0u8; 4096];
        let mut total = 0u64;
        for ch in [Channel::Stdin, Channel::Data] {
            loop {
                let n = self.read_channel(ch, &mut sink)?;
                if n == 0 {
                    break;
                }
                total += n as u64;
            }
        }
        Ok(total)
    }

    pub(crate) fn read_channel(&mut self, ch: Channel, buf: &mut [u8]) -> FcgiResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let state = match ch {
                Channel::Stdin => &mut self.stdin,
                Channel::Data => &mut self.data,
                _ => return Err(FcgiError::protocol(format!("{:?} is not readable", ch))),
            };
            let n = state.take(buf);
            if n > 0 {
                return Ok(n);
            }
            if state.ended {
                return Ok(0);
            }
            let rec = self.fetch("request body")?;
            self.route(rec);
        }
    }

    pub(crate) fn write_channel(&mut self, ch: Channel, bytes: &[u8]) -> FcgiResult<()> {
        let out = match ch {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
            _ => return Err(FcgiError::protocol(format!("{:?} is not writable", ch))),
        };
        let res = out.write(self.conn, self.id, bytes);
        res.map_err(|e| self.fail(e))
    }

    pub(crate) fn flush_channel(&mut self, ch: Channel) -> FcgiResult<()> {
        let out = match ch {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
            _ => return Ok(()),
        };
        let res = out.flush(self.conn, self.id);
        res.map_err(|e| self.fail(e))
    }

    /// Закрыть писатель. Последний закрытый писатель шлёт END_REQUEST.
    pub fn close_stream(&mut self, ch: Channel) -> FcgiResult<()> {
        let (out, always) = match ch {
            Channel::Stdout => (&mut self.stdout, true),
            Channel::Stderr => (&mut self.stderr, false),
            _ => return Ok(()),
        };
        if out.closed {
            return Ok(());
        }
        out.close(self.conn, self.id, always)?;
        self.open_writers -= 1;
        if self.open_writers == 0 {
            self.conn
                .end_request(self.id, self.app_status, ProtocolStatus::RequestComplete)?;
            self.finished = true;
            if self.aborted {
                metrics::record_request_aborted();
            } else {
                metrics::record_request_completed();
            }
        }
        Ok(())
    }

    /// Завершить запрос со статусом приложения: STDOUT, затем STDERR, затем END_REQUEST.
    pub fn finish(mut self, app_status: u32) -> FcgiResult<()> {
        self.app_status = app_status;
        self.close_stream(Channel::Stdout)?;
        self.close_stream(Channel::Stderr)?;
        Ok(())
    }

    fn fetch(&mut self, what: &str) -> FcgiResult<Record> {
        match self.conn.next_record() {
            Ok(Some(rec)) => Ok(rec),
            Ok(None) => Err(self.fail(FcgiError::unexpected_eof(what))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: FcgiError) -> FcgiError {
        if self.failure.is_none() {
            self.failure = Some(e.replicate());
        }
        e
    }

    fn route(&mut self, rec: Record) {
        match rec.rtype() {
            RecordType::Stdin => self.stdin.push(rec.content),
            RecordType::Data => self.data.push(rec.content),
            RecordType::AbortRequest => {
                debug!("fcgi: request id={} aborted by peer", self.id);
                self.aborted = true;
                self.stdin.ended = true;
                self.data.ended = true;
            }
            other => {
                debug!(
                    "fcgi: request id={} ignores {:?} ({} bytes)",
                    self.id,
                    other,
                    rec.content.len()
                );
            }
        }
    }
}

impl<'c, T: Read + Write> Drop for Request<'c, T> {
    fn drop(&mut self) {
        self.conn.set_active(None);
    }
}
