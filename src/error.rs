//! Таксономия ошибок ядра.
//!
//! - Protocol: битый заголовок, несовпадение версии, неверная длина тела - фатально для соединения.
//! - Transport: ошибка чтения/записи сокета - фатально для соединения.
//! - Capacity: второй BEGIN_REQUEST на занятом соединении; отвечаем in-protocol (CANT_MPX_CONN),
//!   наверх как ошибка воркера не поднимается.
//! - Resource: отказ аллокатора пула; фатально только для текущего запроса.
//!
//! Всё остальное (конфиг, сессии, CLI) ходит через anyhow::Result, как и раньше.
//! Воркер классифицирует ошибки через downcast_ref::<FcgiError>().

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FcgiError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("request {0} rejected: connection already serves a request (CANT_MPX_CONN)")]
    Capacity(u16),

    #[error("resource error: {0}")]
    Resource(String),
}

pub type FcgiResult<T> = std::result::Result<T, FcgiError>;

impl FcgiError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        FcgiError::Protocol(msg.into())
    }

    pub fn resource<S: Into<String>>(msg: S) -> Self {
        FcgiError::Resource(msg.into())
    }

    /// Соединение закрыто пиром посреди записи/запроса.
    pub fn unexpected_eof(what: &str) -> Self {
        FcgiError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed while reading {}", what),
        ))
    }

    /// Копия ошибки (io::Error не Clone: сохраняются kind и текст).
    pub fn replicate(&self) -> Self {
        match self {
            FcgiError::Protocol(m) => FcgiError::Protocol(m.clone()),
            FcgiError::Transport(e) => FcgiError::Transport(io::Error::new(e.kind(), e.to_string())),
            FcgiError::Capacity(id) => FcgiError::Capacity(*id),
            FcgiError::Resource(m) => FcgiError::Resource(m.clone()),
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, FcgiError::Protocol(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, FcgiError::Transport(_))
    }
}

impl From<FcgiError> for io::Error {
    fn from(e: FcgiError) -> Self {
        match e {
            FcgiError::Transport(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
