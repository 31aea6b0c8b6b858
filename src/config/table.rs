//! config/table - загрузчик плоского конфиг-файла в упорядоченный индекс.
//!
//! Формат (построчно):
//!   # комментарий            (также ';' в начале строки)
//!   [section]
//!   key = "value"            (двойные кавычки)
//!   key = 'value'            (одинарные кавычки)
//!   key = value ; хвост      (без кавычек - до ';' или '#', пробелы по краям срезаются)
//!
//! Поиск - только по ключу; секция хранится, но в ключ поиска не входит.
//! Дубликаты ключа (в том числе из разных секций): побеждает ПЕРВОЕ вхождение,
//! последующие игнорируются (debug-лог). Это прямо следует из insert() индекса.
//!
//! Байты ключей/значений лежат в managed-пуле таблицы и освобождаются вместе с ней.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::path::Path;
use std::str::FromStr;

use crate::index::{Key, OrderedIndex};
use crate::pool::{BlockId, Pool};

struct Entry {
    section: usize,
    value: BlockId,
    line: usize,
}

pub struct ConfigTable {
    pool: Pool,
    sections: Vec<String>,
    index: OrderedIndex<Entry>,
}

impl Default for ConfigTable {
    fn default() -> Self {
        Self {
            pool: Pool::managed(),
            sections: vec![String::new()],
            index: OrderedIndex::new(),
        }
    }
}

impl ConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse_str(text: &str) -> Result<Self> {
        let mut table = Self::new();
        let mut section = 0usize;

        for (i, raw) in text.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let (name, tail) = rest
                    .split_once(']')
                    .ok_or_else(|| anyhow!("line {}: unterminated section header", lineno))?;
                let tail = tail.trim_start();
                if !(tail.is_empty() || tail.starts_with('#') || tail.starts_with(';')) {
                    return Err(anyhow!("line {}: junk after section header", lineno));
                }
                let name = name.trim();
                table.sections.push(name.to_string());
                section = table.sections.len() - 1;
                continue;
            }

            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected 'key = value'", lineno))?;
            let key = k.trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty key", lineno));
            }
            let value = parse_value(v.trim()).map_err(|e| anyhow!("line {}: {}", lineno, e))?;

            table.insert(section, key, value, lineno)?;
        }
        Ok(table)
    }

    fn insert(&mut self, section: usize, key: &str, value: &str, line: usize) -> Result<()> {
        if let Some(prev) = self.index.get_str(key.as_bytes()) {
            debug!(
                "config: duplicate key '{}' at line {} ignored (first seen at line {})",
                key, line, prev.line
            );
            return Ok(());
        }
        let value = self.pool.dup(value.as_bytes())?;
        self.index
            .insert(Key::str(key), Entry { section, value, line });
        Ok(())
    }

    /// Программная вставка (тесты, CLI). false - ключ уже был.
    pub fn set(&mut self, section: &str, key: &str, value: &str) -> Result<bool> {
        if self.index.find_str(key.as_bytes()).is_some() {
            return Ok(false);
        }
        let sec = match self.sections.iter().position(|s| s == section) {
            Some(i) => i,
            None => {
                self.sections.push(section.to_string());
                self.sections.len() - 1
            }
        };
        self.insert(sec, key, value, 0)?;
        Ok(true)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        let e = self.index.get_str(key.as_bytes())?;
        self.pool.bytes(e.value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_bytes(key).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Разобрать значение в T. Ok(None) - ключа нет.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(s) => s
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("config key '{}' = '{}': {}", key, s, e)),
        }
    }

    pub fn section_of(&self, key: &str) -> Option<&str> {
        let e = self.index.get_str(key.as_bytes())?;
        self.sections.get(e.section).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// (ключ, секция, значение) в порядке индекса.
    pub fn entries(&self) -> Vec<(String, String, String)> {
        self.index
            .iter()
            .map(|(k, e)| {
                let v = self.pool.bytes(e.value).unwrap_or_default();
                (
                    k.to_string(),
                    self.sections.get(e.section).cloned().unwrap_or_default(),
                    String::from_utf8_lossy(v).into_owned(),
                )
            })
            .collect()
    }

    pub fn pool_bytes(&self) -> usize {
        self.pool.total()
    }
}

fn parse_value(s: &str) -> Result<&str> {
    for q in ['"', '\''] {
        if let Some(rest) = s.strip_prefix(q) {
            let end = rest
                .find(q)
                .ok_or_else(|| anyhow!("unterminated {} quote", q))?;
            return Ok(&rest[..end]);
        }
    }
    let end = s.find(|c| c == ';' || c == '#').unwrap_or(s.len());
    Ok(s[..end].trim_end())
}
