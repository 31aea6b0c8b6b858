//! Файловое хранилище сессий.
//!
//! Формат файла <dir>/sess_<uuid>:
//! [10 байт: десятичный Unix timestamp, дополненный нулями][payload ...]
//!
//! Design:
//! - id - случайный UUID v4; всё, что не разбирается как UUID, сразу Absent
//!   (имя файла никогда не строится из произвольной строки);
//! - TTL скользящий: успешный find переписывает timestamp на "сейчас";
//! - сессия истекла, если now - ts > ttl; истёкший файл удаляется при обнаружении;
//! - find / update / destroy держат эксклюзивную advisory-блокировку (fs2) на файле
//!   сессии; sweep пропускает занятые файлы.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::consts::{SESSION_FILE_PREFIX, SESSION_TS_LEN};
use crate::metrics;
use crate::util::now_secs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Live(Vec<u8>),
    Expired,
    Absent,
}

impl Lookup {
    pub fn into_payload(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Live(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    ttl: u64,
}

/// Снимает блокировку при выходе из области видимости.
struct Locked(File);

impl Drop for Locked {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

fn encode_ts(ts: u64) -> String {
    format!("{:0width$}", ts, width = SESSION_TS_LEN)
}

fn parse_ts(raw: &[u8]) -> Option<u64> {
    if raw.len() < SESSION_TS_LEN {
        return None;
    }
    std::str::from_utf8(&raw[..SESSION_TS_LEN])
        .ok()?
        .trim()
        .parse()
        .ok()
}

impl SessionStore {
    /// Открывает (и создаёт при необходимости) каталог сессий.
    pub fn open(dir: &Path, ttl_secs: u64) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create session dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            ttl: ttl_secs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Путь файла сессии; None для id, не являющегося UUID.
    pub fn path_for(&self, id: &str) -> Option<PathBuf> {
        let id = Uuid::parse_str(id).ok()?;
        Some(
            self.dir
                .join(format!("{}{}", SESSION_FILE_PREFIX, id.hyphenated())),
        )
    }

    fn is_expired(&self, ts: u64, now: u64) -> bool {
        now.saturating_sub(ts) > self.ttl
    }

    pub fn create(&self, payload: &[u8]) -> Result<String> {
        self.create_at(payload, now_secs())
    }

    pub fn create_at(&self, payload: &[u8], now: u64) -> Result<String> {
        let id = Uuid::new_v4().hyphenated().to_string();
        let path = self
            .dir
            .join(format!("{}{}", SESSION_FILE_PREFIX, id));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create session file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock session file {}", path.display()))?;
        let mut f = Locked(file);

        f.0.write_all(encode_ts(now).as_bytes())?;
        f.0.write_all(payload)?;
        metrics::record_session_created();
        debug!("session {} created ({} bytes)", id, payload.len());
        Ok(id)
    }

    fn open_locked(&self, path: &Path) -> Result<Option<Locked>> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("open session file {}", path.display()))
            }
        };
        file.lock_exclusive()
            .with_context(|| format!("lock session file {}", path.display()))?;
        Ok(Some(Locked(file)))
    }

    pub fn find(&self, id: &str) -> Result<Lookup> {
        self.find_at(id, now_secs())
    }

    /// Live(payload) с обновлением timestamp, Expired (файл удалён) или Absent.
    pub fn find_at(&self, id: &str, now: u64) -> Result<Lookup> {
        let Some(path) = self.path_for(id) else {
            return Ok(Lookup::Absent);
        };
        let Some(mut f) = self.open_locked(&path)? else {
            return Ok(Lookup::Absent);
        };

        let mut raw = Vec::new();
        f.0.read_to_end(&mut raw)
            .with_context(|| format!("read session file {}", path.display()))?;

        let Some(ts) = parse_ts(&raw) else {
            warn!("session {}: corrupt timestamp, removing", id);
            let _ = fs::remove_file(&path);
            return Ok(Lookup::Absent);
        };

        if self.is_expired(ts, now) {
            fs::remove_file(&path)
                .with_context(|| format!("remove expired session {}", path.display()))?;
            metrics::record_sessions_expired(1);
            debug!("session {} expired (ts={}, now={})", id, ts, now);
            return Ok(Lookup::Expired);
        }

        f.0.seek(SeekFrom::Start(0))?;
        f.0.write_all(encode_ts(now).as_bytes())
            .with_context(|| format!("refresh session file {}", path.display()))?;

        Ok(Lookup::Live(raw.split_off(SESSION_TS_LEN)))
    }

    pub fn update(&self, id: &str, payload: &[u8]) -> Result<bool> {
        self.update_at(id, payload, now_secs())
    }

    /// Перезаписывает payload живой сессии. false - сессии нет (или она истекла).
    pub fn update_at(&self, id: &str, payload: &[u8], now: u64) -> Result<bool> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        let Some(mut f) = self.open_locked(&path)? else {
            return Ok(false);
        };

        let mut head = [0u8; SESSION_TS_LEN];
        let live = match f.0.read_exact(&mut head) {
            Ok(()) => parse_ts(&head).map_or(false, |ts| !self.is_expired(ts, now)),
            Err(_) => false,
        };
        if !live {
            let _ = fs::remove_file(&path);
            return Ok(false);
        }

        f.0.set_len(0)?;
        f.0.seek(SeekFrom::Start(0))?;
        f.0.write_all(encode_ts(now).as_bytes())?;
        f.0.write_all(payload)
            .with_context(|| format!("write session file {}", path.display()))?;
        Ok(true)
    }

    /// Удаляет сессию. false - её не было.
    pub fn destroy(&self, id: &str) -> Result<bool> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };
        let Some(_guard) = self.open_locked(&path)? else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove session {}", path.display())),
        }
    }

    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(now_secs())
    }

    /// Удаляет все истёкшие файлы сессий. Возвращает число удалённых.
    pub fn sweep_at(&self, now: u64) -> Result<usize> {
        let mut removed = 0usize;
        let rd = fs::read_dir(&self.dir)
            .with_context(|| format!("read session dir {}", self.dir.display()))?;
        for entry in rd {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(SESSION_FILE_PREFIX) {
                continue;
            }
            let path = entry.path();
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            // занятые сессии живы по определению
            if file.try_lock_exclusive().is_err() {
                continue;
            }
            let mut f = Locked(file);
            let mut head = [0u8; SESSION_TS_LEN];
            let expired = match f.0.read_exact(&mut head) {
                Ok(()) => parse_ts(&head).map_or(true, |ts| self.is_expired(ts, now)),
                Err(_) => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        metrics::record_session_sweep_run();
        if removed > 0 {
            metrics::record_sessions_expired(removed);
            debug!("session sweep removed {} file(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_root(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("qcgi-{prefix}-{pid}-{t}"))
    }

    #[test]
    fn file_layout_and_bad_ids() -> Result<()> {
        let root = unique_root("sess-unit");
        let store = SessionStore::open(&root, 60)?;
        let id = store.create_at(b"payload", 42)?;

        let raw = fs::read(root.join(format!("sess_{}", id)))?;
        assert_eq!(&raw[..10], b"0000000042");
        assert_eq!(&raw[10..], b"payload");

        assert_eq!(store.find_at("../etc/passwd", 42)?, Lookup::Absent);
        assert_eq!(store.find_at("", 42)?, Lookup::Absent);
        assert!(!store.destroy("not-a-uuid")?);

        assert!(store.destroy(&id)?);
        assert_eq!(store.find_at(&id, 42)?, Lookup::Absent);

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }
}
