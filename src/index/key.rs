//! index/key - ключ упорядоченного индекса и единый компаратор.
//!
//! Ключ - тегированный вариант: строка байт, целое или идентичность (непрозрачный usize).
//! Между тегами порядок фиксирован: Str < Int < Ident.
//!
//! Строки сравниваются memcmp по длине более короткого ключа; при равенстве префиксов
//! более КОРОТКИЙ ключ считается БОЛЬШИМ (равенство - только при равных длинах).
//! Это полный порядок: конец строки ведёт себя как символ больше любого байта.

use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Debug)]
pub enum Key {
    Str(Vec<u8>),
    Int(i64),
    Ident(usize),
}

impl Key {
    pub fn str<B: AsRef<[u8]>>(b: B) -> Self {
        Key::Str(b.as_ref().to_vec())
    }

    fn tag(&self) -> u8 {
        match self {
            Key::Str(_) => 0,
            Key::Int(_) => 1,
            Key::Ident(_) => 2,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Key::Str(b) => Some(b),
            _ => None,
        }
    }
}

/// Компаратор строковых ключей (см. описание модуля).
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    let n = a.len().min(b.len());
    match a[..n].cmp(&b[..n]) {
        Ordering::Equal => b.len().cmp(&a.len()),
        ord => ord,
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Str(a), Key::Str(b)) => compare_bytes(a, b),
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Ident(a), Key::Ident(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.as_bytes().to_vec())
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Key::Int(v) => write!(f, "{}", v),
            Key::Ident(p) => write!(f, "#{:x}", p),
        }
    }
}
