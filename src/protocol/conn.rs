//! Connection codec: framing поверх блокирующего Read + Write.
//!
//! Conn отдаёт наверх только записи активного запроса и BEGIN_REQUEST на свободном
//! соединении. Всё остальное обрабатывается здесь же, синхронно:
//! - request_id == 0 (management): GET_VALUES -> GET_VALUES_RESULT с фиксированными
//!   возможностями, любой другой тип -> UNKNOWN_TYPE;
//! - BEGIN_REQUEST при активном запросе -> END_REQUEST(CANT_MPX_CONN) для чужого id,
//!   запись отбрасывается, активный запрос продолжается;
//! - запись с чужим request_id -> пропускается (content + padding уже дочитаны).
//!
//! Ошибки версии/длины фатальны (FcgiError::Protocol), ошибки сокета - Transport.

use log::{debug, trace};
use std::io::{BufReader, ErrorKind, Read, Write};

use crate::consts::*;
use crate::error::{FcgiError, FcgiResult};
use crate::metrics;

use super::params::{decode_pairs, encode_pair};
use super::record::{
    encode_record, read_record, unknown_type_body, BeginRequestBody, EndRequestBody,
    ProtocolStatus, Record, RecordType,
};

/// Счётчики одного соединения (в лог при закрытии).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub records_in: u64,
    pub records_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub management: u64,
    pub rejected: u64,
    pub skipped: u64,
}

pub struct Conn<T: Read + Write> {
    io: BufReader<T>,
    active: Option<u16>,
    stats: ConnStats,
}

impl<T: Read + Write> Conn<T> {
    /// buffer - размер буфера чтения сокета (stream_buffer из конфига).
    pub fn new(io: T, buffer: usize) -> Self {
        Self {
            io: BufReader::with_capacity(buffer.max(FCGI_HEADER_LEN), io),
            active: None,
            stats: ConnStats::default(),
        }
    }

    pub fn active(&self) -> Option<u16> {
        self.active
    }

    pub fn set_active(&mut self, id: Option<u16>) {
        self.active = id;
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn get_ref(&self) -> &T {
        self.io.get_ref()
    }

    /// Отдаёт транспорт. Непрочитанные буферизованные байты теряются.
    pub fn into_inner(self) -> T {
        self.io.into_inner()
    }

    /// Следующая запись для вызывающего (см. модульный комментарий).
    /// Ok(None) - пир закрыл соединение на границе записи.
    pub fn next_record(&mut self) -> FcgiResult<Option<Record>> {
        loop {
            let rec = match read_record(&mut self.io)? {
                Some(r) => r,
                None => return Ok(None),
            };
            let wire = FCGI_HEADER_LEN + rec.content.len() + rec.header.padding_len as usize;
            self.stats.records_in += 1;
            self.stats.bytes_in += wire as u64;
            metrics::record_bytes_in(wire);
            trace!(
                "fcgi <- {:?} id={} len={}",
                rec.rtype(),
                rec.request_id(),
                rec.content.len()
            );

            if rec.header.is_management() {
                self.answer_management(&rec)?;
                continue;
            }

            if rec.rtype() == RecordType::BeginRequest {
                match self.active {
                    None => return Ok(Some(rec)),
                    Some(active) => {
                        // битое тело - всё равно ошибка протокола
                        BeginRequestBody::decode(&rec.content)?;
                        debug!(
                            "fcgi: BEGIN_REQUEST id={} while id={} is active, CANT_MPX_CONN",
                            rec.request_id(),
                            active
                        );
                        self.stats.rejected += 1;
                        metrics::record_multiplex_rejection();
                        self.end_request(rec.request_id(), 0, ProtocolStatus::CantMpxConn)?;
                        continue;
                    }
                }
            }

            if self.active == Some(rec.request_id()) {
                return Ok(Some(rec));
            }

            self.stats.skipped += 1;
            debug!(
                "fcgi: skip {:?} for id={} (active={:?})",
                rec.rtype(),
                rec.request_id(),
                self.active
            );
        }
    }

    fn answer_management(&mut self, rec: &Record) -> FcgiResult<()> {
        self.stats.management += 1;
        metrics::record_management_record();

        match rec.rtype() {
            RecordType::GetValues => {
                let asked = decode_pairs(&rec.content)?;
                let mut body = Vec::new();
                for (name, _) in asked {
                    let value = match name.as_slice() {
                        n if n == FCGI_MAX_CONNS.as_bytes() => CAP_MAX_CONNS,
                        n if n == FCGI_MAX_REQS.as_bytes() => CAP_MAX_REQS,
                        n if n == FCGI_MPXS_CONNS.as_bytes() => CAP_MPXS_CONNS,
                        _ => continue,
                    };
                    encode_pair(&mut body, &name, value.as_bytes());
                }
                debug!("fcgi: GET_VALUES answered ({} bytes)", body.len());
                self.write_record(RecordType::GetValuesResult, FCGI_NULL_REQUEST_ID, &body)
            }
            other => {
                debug!("fcgi: unknown management record type {}", other.as_u8());
                let body = unknown_type_body(other.as_u8());
                self.write_record(RecordType::UnknownType, FCGI_NULL_REQUEST_ID, &body)
            }
        }
    }

    pub fn write_record(&mut self, rtype: RecordType, id: u16, content: &[u8]) -> FcgiResult<()> {
        let frame = encode_record(rtype, id, content)?;
        self.write_frame(&frame)
    }

    /// Пишет готовый кадр целиком: повтор при коротких записях и EINTR.
    pub fn write_frame(&mut self, frame: &[u8]) -> FcgiResult<()> {
        let w = self.io.get_mut();
        let mut off = 0usize;
        while off < frame.len() {
            match w.write(&frame[off..]) {
                Ok(0) => {
                    return Err(FcgiError::Transport(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "peer stopped accepting record bytes",
                    )))
                }
                Ok(n) => off += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FcgiError::Transport(e)),
            }
        }
        loop {
            match w.flush() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FcgiError::Transport(e)),
            }
        }
        self.stats.records_out += 1;
        self.stats.bytes_out += frame.len() as u64;
        metrics::record_bytes_out(frame.len());
        Ok(())
    }

    pub fn end_request(&mut self, id: u16, app_status: u32, status: ProtocolStatus) -> FcgiResult<()> {
        let body = EndRequestBody::new(app_status, status).encode();
        self.write_record(RecordType::EndRequest, id, &body)
    }
}
