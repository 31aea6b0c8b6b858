use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigTable, ServerConfig};
use crate::consts::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS, FCGI_RESPONDER};
use crate::logging::init_logger;
use crate::protocol::{
    decode_pairs, encode_pair, encode_record, read_record, BeginRequestBody, EndRequestBody,
    RecordType,
};
use crate::server::{self, DispatchTable, ServerContext};
use crate::session::SessionStore;
use crate::util::display_text;

#[derive(Parser, Debug)]
#[command(
    name = "quivercgi",
    version,
    about = "FastCGI application server with supervised workers",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Config file ([section] key = value). CLI flags override config values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address: IP/host, or a socket path ("unix:/run/app.sock")
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    workers: Option<usize>,

    /// Detach from the terminal (unix)
    #[arg(long)]
    daemonize: bool,

    /// Record buffer per output stream, 1..=65535
    #[arg(long)]
    stream_buffer: Option<usize>,

    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Session TTL in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Allowed web server addresses (comma separated)
    #[arg(long)]
    allow: Option<String>,

    /// Directory with executable handlers
    #[arg(long)]
    handlers_dir: Option<PathBuf>,

    /// Status endpoint address (e.g. 127.0.0.1:9898)
    #[arg(long)]
    status_addr: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Run the server until SIGINT/SIGTERM
    Serve(ServeArgs),

    /// Print the effective configuration and the raw config table
    Config(ServeArgs),

    /// List routes bound from a handlers directory
    Routes {
        #[arg(long)]
        handlers_dir: PathBuf,
    },

    /// Remove expired session files
    SessionSweep {
        #[arg(long)]
        session_dir: PathBuf,
        #[arg(long, default_value_t = crate::consts::DEFAULT_SESSION_TTL_SECS)]
        ttl: u64,
    },

    /// Query a running FastCGI server: capabilities, and optionally one RESPONDER request
    Probe {
        /// host:port
        #[arg(long, default_value = "127.0.0.1:9000")]
        addr: String,
        /// DOCUMENT_URI of a request to send (only GET_VALUES if omitted)
        #[arg(long)]
        uri: Option<String>,
        /// Request body (STDIN)
        #[arg(long)]
        body: Option<String>,
    },
}

/// CLI > config file > ENV/defaults (через ServerConfig::from_env).
fn effective_config(args: &ServeArgs) -> Result<(ServerConfig, Option<ConfigTable>)> {
    let table = match &args.config {
        Some(p) => Some(ConfigTable::load(p)?),
        None => None,
    };
    let mut cfg = ServerConfig::from_env();
    if let Some(t) = &table {
        cfg = cfg.merge_table(t)?;
    }

    if let Some(v) = &args.listen {
        cfg = cfg.with_listen(v.clone());
    }
    if let Some(v) = args.port {
        cfg = cfg.with_port(v);
    }
    if let Some(v) = args.workers {
        cfg = cfg.with_workers(v);
    }
    if args.daemonize {
        cfg = cfg.with_daemonize(true);
    }
    if let Some(v) = args.stream_buffer {
        cfg = cfg.with_stream_buffer(v);
    }
    if let Some(v) = &args.session_dir {
        cfg = cfg.with_session_dir(v.clone());
    }
    if let Some(v) = args.session_ttl {
        cfg = cfg.with_session_ttl_secs(v);
    }
    if args.log_file.is_some() {
        cfg = cfg.with_log_file(args.log_file.clone());
    }
    if let Some(v) = &args.allow {
        let list: Vec<&str> = v.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        cfg = cfg.with_allow(&list);
    }
    if args.handlers_dir.is_some() {
        cfg = cfg.with_handlers_dir(args.handlers_dir.clone());
    }
    if args.status_addr.is_some() {
        cfg = cfg.with_status_addr(args.status_addr.clone());
    }
    cfg.validate()?;
    Ok((cfg, table))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Serve(args) => {
            let (cfg, _) = effective_config(&args)?;
            init_logger(&cfg)?;
            info!("{}", cfg);
            let workers = cfg.workers;
            let daemonize = cfg.daemonize;
            let ctx = ServerContext::from_config(cfg)?;
            if ctx.dispatch.is_empty() {
                log::warn!("no handlers bound: every request will get 404");
            }
            server::run(ctx, workers, daemonize)?;
        }
        Cmd::Config(args) => {
            let (cfg, table) = effective_config(&args)?;
            println!("{}", cfg);
            if let Some(t) = table {
                println!("config table: {} key(s), {} pool bytes", t.len(), t.pool_bytes());
                for (key, section, value) in t.entries() {
                    println!("  [{}] {} = {}", section, key, value);
                }
            }
        }
        Cmd::Routes { handlers_dir } => {
            init_logger(&ServerConfig::default())?;
            let mut table = DispatchTable::new();
            let n = table.scan_dir(&handlers_dir)?;
            println!("{} route(s) in {}", n, handlers_dir.display());
            for name in table.names() {
                println!("  /{}", name);
            }
        }
        Cmd::SessionSweep { session_dir, ttl } => {
            init_logger(&ServerConfig::default())?;
            let store = SessionStore::open(&session_dir, ttl)?;
            let removed = store.sweep()?;
            println!("removed {} expired session(s) from {}", removed, session_dir.display());
        }
        Cmd::Probe { addr, uri, body } => {
            probe(&addr, uri.as_deref(), body.as_deref().unwrap_or(""))?;
        }
    }
    Ok(())
}

fn probe(addr: &str, uri: Option<&str>, body: &str) -> Result<()> {
    let mut s = TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?;
    s.set_read_timeout(Some(Duration::from_secs(10))).ok();

    let mut q = Vec::new();
    for name in [FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS] {
        encode_pair(&mut q, name.as_bytes(), b"");
    }
    let mut out = encode_record(RecordType::GetValues, 0, &q)?;

    if let Some(uri) = uri {
        let begin = BeginRequestBody {
            role: FCGI_RESPONDER,
            flags: 0,
        };
        out.extend(encode_record(RecordType::BeginRequest, 1, &begin.encode())?);
        let mut params = Vec::new();
        encode_pair(&mut params, b"DOCUMENT_URI", uri.as_bytes());
        let method: &[u8] = if body.is_empty() { b"GET" } else { b"POST" };
        encode_pair(&mut params, b"REQUEST_METHOD", method);
        encode_pair(&mut params, b"CONTENT_LENGTH", body.len().to_string().as_bytes());
        out.extend(encode_record(RecordType::Params, 1, &params)?);
        out.extend(encode_record(RecordType::Params, 1, &[])?);
        for chunk in body.as_bytes().chunks(crate::consts::FCGI_MAX_CONTENT_LEN) {
            out.extend(encode_record(RecordType::Stdin, 1, chunk)?);
        }
        out.extend(encode_record(RecordType::Stdin, 1, &[])?);
    }
    s.write_all(&out)?;
    s.flush()?;

    let mut caps_seen = false;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let Some(rec) = read_record(&mut s)? else {
            return Err(anyhow!("server closed the connection"));
        };
        match rec.rtype() {
            RecordType::GetValuesResult => {
                println!("capabilities:");
                for (k, v) in decode_pairs(&rec.content)? {
                    println!("  {} = {}", display_text(&k), display_text(&v));
                }
                caps_seen = true;
                if uri.is_none() {
                    break;
                }
            }
            RecordType::Stdout => stdout.extend_from_slice(&rec.content),
            RecordType::Stderr => stderr.extend_from_slice(&rec.content),
            RecordType::EndRequest => {
                let end = EndRequestBody::decode(&rec.content)?;
                if !stdout.is_empty() {
                    std::io::stdout().write_all(&stdout)?;
                }
                if !stderr.is_empty() {
                    eprintln!("--- stderr ---\n{}", display_text(&stderr));
                }
                println!(
                    "--- end: app_status={} protocol_status={} ---",
                    end.app_status, end.protocol_status
                );
                break;
            }
            other => println!("unexpected record {:?}", other),
        }
    }
    if !caps_seen {
        println!("(no GET_VALUES_RESULT)");
    }
    if uri.is_some() {
        // сервер закрывает соединение после запроса без KEEP_CONN
        let mut rest = Vec::new();
        let _ = s.read_to_end(&mut rest);
    }
    Ok(())
}
