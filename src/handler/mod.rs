//! Граница вызова обработчиков.
//!
//! Сервер вызывает Handler::handle с непрозрачным RequestHandle: обработчик читает тело
//! (read_body), метаданные (get_param) и пишет ответ (write_response). Возвращённый u32 -
//! app_status в END_REQUEST. Ошибка обработчика завершает запрос со статусом 1 и текстом
//! ошибки в STDERR (см. server/connection.rs).
//!
//! Реализации: замыкания Fn(&mut dyn RequestHandle) -> Result<u32>, ExecHandler
//! (внешняя программа в стиле CGI).

pub mod exec;

pub use exec::ExecHandler;

use anyhow::Result;
use std::io::{Read, Write};

use crate::protocol::{Request, Role};
use crate::session::SessionStore;

pub trait RequestHandle {
    fn role(&self) -> Role;

    fn request_id(&self) -> u16;

    fn get_param(&self, name: &str) -> Option<&str>;

    /// Все PARAMS в порядке прихода (lossy UTF-8).
    fn params(&self) -> Vec<(String, String)>;

    /// Остаток STDIN целиком.
    fn read_body(&mut self) -> Result<Vec<u8>>;

    /// Остаток DATA (FILTER); у остальных ролей пусто.
    fn read_data(&mut self) -> Result<Vec<u8>>;

    fn write_response(&mut self, bytes: &[u8]) -> Result<()>;

    fn write_error(&mut self, bytes: &[u8]) -> Result<()>;

    fn is_aborted(&self) -> bool;

    /// Хранилище сессий сервера, если обработчик запущен сервером.
    fn sessions(&self) -> Option<&SessionStore> {
        None
    }

    /// Значение cookie из HTTP_COOKIE ("a=1; b=2").
    fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.get_param("HTTP_COOKIE")?;
        raw.split(';').find_map(|kv| {
            let (k, v) = kv.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }

    /// Значение из QUERY_STRING (без percent-decoding).
    fn query_param(&self, name: &str) -> Option<String> {
        let raw = self.get_param("QUERY_STRING")?;
        raw.split('&').find_map(|kv| {
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            (k == name).then(|| v.to_string())
        })
    }
}

pub trait Handler: Send + Sync {
    fn handle(&self, req: &mut dyn RequestHandle) -> Result<u32>;
}

impl<F> Handler for F
where
    F: Fn(&mut dyn RequestHandle) -> Result<u32> + Send + Sync,
{
    fn handle(&self, req: &mut dyn RequestHandle) -> Result<u32> {
        self(req)
    }
}

impl<'c, T: Read + Write> RequestHandle for Request<'c, T> {
    fn role(&self) -> Role {
        Request::role(self)
    }

    fn request_id(&self) -> u16 {
        self.id()
    }

    fn get_param(&self, name: &str) -> Option<&str> {
        self.param(name)
    }

    fn params(&self) -> Vec<(String, String)> {
        self.env()
            .pairs()
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                )
            })
            .collect()
    }

    fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stdin().read_to_end(&mut out)?;
        Ok(out)
    }

    fn read_data(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.data().read_to_end(&mut out)?;
        Ok(out)
    }

    fn write_response(&mut self, bytes: &[u8]) -> Result<()> {
        self.stdout().write_exact(bytes)?;
        Ok(())
    }

    fn write_error(&mut self, bytes: &[u8]) -> Result<()> {
        self.stderr().write_exact(bytes)?;
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        Request::is_aborted(self)
    }
}
