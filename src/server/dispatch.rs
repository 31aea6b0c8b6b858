//! Dispatch table: имя маршрута -> обработчик (OrderedIndex).
//!
//! Имя маршрута выводится из пути запроса (DOCUMENT_URI, иначе SCRIPT_NAME):
//! query отрезается, ведущие '/' убираются, расширение последнего сегмента
//! отбрасывается, пустое имя и путь на '/' дают "index".
//!   "/hello"          -> "hello"
//!   "/api/users.cgi"  -> "api/users"
//!   "/"               -> "index"
//!   "/blog/"          -> "blog/index"
//!
//! Таблица строится при старте и дальше только читается (общая через Arc<ServerContext>).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::consts::{ROUTE_INDEX, ROUTE_PARAMS};
use crate::handler::{ExecHandler, Handler, RequestHandle};
use crate::index::{Key, OrderedIndex};
use crate::protocol::Environment;

pub fn route_name(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or("");
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return ROUTE_INDEX.to_string();
    }
    if trimmed.ends_with('/') {
        return format!("{}{}", trimmed, ROUTE_INDEX);
    }
    let (dir, last) = match trimmed.rfind('/') {
        Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
        None => ("", trimmed),
    };
    let stem = match last.rfind('.') {
        Some(0) | None => last,
        Some(i) => &last[..i],
    };
    format!("{}{}", dir, stem)
}

#[derive(Default)]
pub struct DispatchTable {
    index: OrderedIndex<Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Привязать обработчик. false - имя уже занято (первая привязка остаётся).
    pub fn bind(&mut self, name: &str, handler: Arc<dyn Handler>) -> bool {
        let ok = self.index.insert(Key::str(name), handler).is_some();
        if !ok {
            warn!("dispatch: route '{}' already bound, keeping the first", name);
        }
        ok
    }

    pub fn bind_fn<F>(&mut self, name: &str, f: F) -> bool
    where
        F: Fn(&mut dyn RequestHandle) -> Result<u32> + Send + Sync + 'static,
    {
        self.bind(name, Arc::new(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.index.get_str(name.as_bytes()).cloned()
    }

    /// Маршрут запроса по окружению: (имя, обработчик если найден).
    pub fn resolve(&self, env: &Environment) -> (String, Option<Arc<dyn Handler>>) {
        let uri = ROUTE_PARAMS
            .iter()
            .find_map(|p| env.get_str(p))
            .unwrap_or("/");
        let name = route_name(uri);
        let handler = self.get(&name);
        (name, handler)
    }

    /// Рекурсивно обходит каталог и привязывает исполняемые файлы как ExecHandler.
    /// Скрытые файлы/каталоги пропускаются. Возвращает число новых маршрутов.
    pub fn scan_dir(&mut self, dir: &Path) -> Result<usize> {
        let root = dir
            .canonicalize()
            .with_context(|| format!("resolve handlers dir {}", dir.display()))?;
        let mut bound = 0usize;
        let mut stack = vec![root.clone()];
        while let Some(cur) = stack.pop() {
            let rd = std::fs::read_dir(&cur)
                .with_context(|| format!("read handlers dir {}", cur.display()))?;
            for entry in rd {
                let entry = entry?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let ft = entry.file_type()?;
                if ft.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !is_executable(&path) {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&root) else { continue };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let route = route_name(&rel);
                debug!("dispatch: {} -> {}", route, path.display());
                if self.bind(&route, Arc::new(ExecHandler::new(path))) {
                    bound += 1;
                }
            }
        }
        info!("dispatch: {} handler(s) bound from {}", bound, root.display());
        Ok(bound)
    }

    pub fn names(&self) -> Vec<String> {
        self.index.iter().map(|(k, _)| k.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("exe") || e.eq_ignore_ascii_case("bat"))
            .unwrap_or(false)
}
