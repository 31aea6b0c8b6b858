//! Logging setup.
//!
//! - log_file не задан: env_logger (RUST_LOG, по умолчанию info, метки времени в мс).
//! - log_file задан: FileLog - единственный общий sink для всех воркеров.
//!   Строка собирается в буфере из пула и пишется одним write_all под мьютексом,
//!   поэтому строки разных потоков не перемешиваются.

use anyhow::{anyhow, Context, Result};
use env_logger::{Builder, Env};
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ServerConfig;
use crate::pool::{BlockId, Pool};

struct FileLogInner {
    file: File,
    pool: Pool,
    line: Option<BlockId>,
}

pub struct FileLog {
    level: LevelFilter,
    inner: Mutex<FileLogInner>,
}

impl FileLog {
    pub fn open(path: &Path, level: LevelFilter) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            level,
            inner: Mutex::new(FileLogInner {
                file,
                pool: Pool::managed(),
                line: None,
            }),
        })
    }

    fn format_line(record: &Record) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!(
            "[{}.{:03} {:<5} {}] {}\n",
            now.as_secs(),
            now.subsec_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl FileLogInner {
    /// Копирует строку в буфер пула (растёт через realloc) и пишет одним вызовом.
    fn append(&mut self, text: &[u8]) -> std::io::Result<()> {
        let id = match self.line {
            Some(id) => self.pool.realloc(id, text.len())?,
            None => self.pool.alloc(text.len())?,
        };
        self.line = Some(id);
        let buf = self
            .pool
            .bytes_mut(id)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "log buffer lost"))?;
        buf[..text.len()].copy_from_slice(text);
        let buf = &buf[..text.len()];
        self.file.write_all(buf)
    }
}

impl Log for FileLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format_line(record);
        // Отравленный мьютекс (паника воркера во время записи) не должен глушить лог.
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = inner.append(line.as_bytes());
    }

    fn flush(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.file.flush();
        }
    }
}

fn level_from_env() -> LevelFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Устанавливает глобальный логгер. Повторный вызов - ошибка (как у log::set_boxed_logger).
pub fn init_logger(cfg: &ServerConfig) -> Result<()> {
    match &cfg.log_file {
        Some(path) => {
            let level = level_from_env();
            let sink = FileLog::open(path, level)?;
            log::set_boxed_logger(Box::new(sink))
                .map_err(|e| anyhow!("install file logger: {}", e))?;
            log::set_max_level(level);
            Ok(())
        }
        None => {
            // Уровень берём из RUST_LOG, иначе дефолт - info.
            Builder::from_env(Env::default().default_filter_or("info"))
                .format_timestamp_millis()
                .try_init()
                .map_err(|e| anyhow!("install env_logger: {}", e))
        }
    }
}
