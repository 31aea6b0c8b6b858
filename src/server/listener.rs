//! Слушающий сокет: TCP или Unix domain.
//!
//! listen(address, port):
//! - address начинается с "unix:" или содержит '/' -> Unix socket по этому пути
//!   (старый файл сокета удаляется перед bind);
//! - иначе TCP host:port.
//!
//! Один Listener делится между воркерами через try_clone (общий дескриптор).

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

fn unix_path(address: &str) -> Option<PathBuf> {
    if let Some(p) = address.strip_prefix("unix:") {
        return Some(PathBuf::from(p));
    }
    if address.contains('/') {
        return Some(PathBuf::from(address));
    }
    None
}

pub fn listen(address: &str, port: u16) -> Result<Listener> {
    if let Some(path) = unix_path(address) {
        #[cfg(unix)]
        {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("remove stale socket {}", path.display()))?;
            }
            let l = UnixListener::bind(&path)
                .with_context(|| format!("bind unix socket {}", path.display()))?;
            return Ok(Listener::Unix(l, path));
        }
        #[cfg(not(unix))]
        {
            return Err(anyhow!(
                "unix sockets are not supported on this platform ({})",
                path.display()
            ));
        }
    }

    let addr = if address.contains(':') && !address.starts_with('[') {
        // голый IPv6
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    };
    let l = TcpListener::bind(&addr).map_err(|e| anyhow!("bind listener at {}: {}", addr, e))?;
    Ok(Listener::Tcp(l))
}

impl Listener {
    pub fn try_clone(&self) -> io::Result<Listener> {
        match self {
            Listener::Tcp(l) => Ok(Listener::Tcp(l.try_clone()?)),
            #[cfg(unix)]
            Listener::Unix(l, p) => Ok(Listener::Unix(l.try_clone()?, p.clone())),
        }
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(on),
            #[cfg(unix)]
            Listener::Unix(l, _) => l.set_nonblocking(on),
        }
    }

    /// Принять соединение. Для TCP отдаёт IP пира (для ACL), для Unix - None.
    pub fn accept(&self) -> io::Result<(Stream, Option<IpAddr>)> {
        match self {
            Listener::Tcp(l) => {
                let (s, peer) = l.accept()?;
                s.set_nonblocking(false)?;
                s.set_nodelay(true).ok(); // best-effort
                Ok((Stream::Tcp(s), Some(peer.ip())))
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let (s, _) = l.accept()?;
                s.set_nonblocking(false)?;
                Ok((Stream::Unix(s), None))
            }
        }
    }

    /// "127.0.0.1:9000" или "unix:/path".
    pub fn local_addr_string(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            #[cfg(unix)]
            Listener::Unix(_, p) => format!("unix:{}", p.display()),
        }
    }

    /// TCP-порт (полезно при bind на порт 0).
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    /// Удалить файл Unix-сокета (после остановки всех воркеров).
    pub fn cleanup(&self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix(_, p) => {
                let _ = std::fs::remove_file(p);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}
