//! ACL допустимых адресов веб-сервера (соглашение FCGI_WEB_SERVER_ADDRS).
//!
//! Хранится в том же упорядоченном индексе, что и конфиг/маршруты: ключ - канонический
//! текст IP-адреса. Пустой список пропускает всех; Unix-сокеты (peer = None) пропускаются всегда.
//! IPv4-mapped IPv6 адреса приводятся к IPv4 перед поиском.

use anyhow::{anyhow, Result};
use std::net::IpAddr;

use crate::index::{Key, OrderedIndex};

#[derive(Default)]
pub struct AccessList {
    index: OrderedIndex<()>,
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Разобрать список адресов, разделённых запятыми и/или пробелами.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut acl = Self::new();
        for item in spec.split(|c: char| c == ',' || c.is_whitespace()) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let ip: IpAddr = item
                .parse()
                .map_err(|e| anyhow!("acl: invalid address '{}': {}", item, e))?;
            acl.allow(ip);
        }
        Ok(acl)
    }

    /// Добавить адрес. false - уже был в списке.
    pub fn allow(&mut self, ip: IpAddr) -> bool {
        let key = Key::Str(canonical(ip).to_string().into_bytes());
        self.index.insert(key, ()).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn permits(&self, peer: Option<IpAddr>) -> bool {
        if self.index.is_empty() {
            return true;
        }
        match peer {
            None => true,
            Some(ip) => self
                .index
                .find_str(canonical(ip).to_string().as_bytes())
                .is_some(),
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.index.iter().map(|(k, _)| k.to_string()).collect()
    }
}
