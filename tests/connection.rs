use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;

use QuiverCGI::config::ServerConfig;
use QuiverCGI::handler::RequestHandle;
use QuiverCGI::protocol::{
    encode_pair, encode_record, read_record, BeginRequestBody, EndRequestBody, Record, RecordType,
};
use QuiverCGI::server::{ConnState, Connection, DispatchTable, ServerContext};

struct Duplex {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("qcgi-{}-{}-{}", prefix, pid, t))
}

fn rec(rtype: RecordType, id: u16, content: &[u8]) -> Vec<u8> {
    encode_record(rtype, id, content).expect("encode")
}

/// BEGIN + PARAMS + STDIN одного запроса.
fn request(id: u16, role: u16, keep: bool, uri: &str, body: &[u8]) -> Vec<u8> {
    let begin = BeginRequestBody {
        role,
        flags: if keep { 1 } else { 0 },
    };
    let mut out = rec(RecordType::BeginRequest, id, &begin.encode());
    let mut pairs = Vec::new();
    encode_pair(&mut pairs, b"DOCUMENT_URI", uri.as_bytes());
    encode_pair(&mut pairs, b"REQUEST_METHOD", b"POST");
    encode_pair(&mut pairs, b"HTTP_COOKIE", b"theme=dark; sid=abc");
    encode_pair(&mut pairs, b"QUERY_STRING", b"x=1&flag");
    out.extend(rec(RecordType::Params, id, &pairs));
    out.extend(rec(RecordType::Params, id, &[]));
    if !body.is_empty() {
        out.extend(rec(RecordType::Stdin, id, body));
    }
    out.extend(rec(RecordType::Stdin, id, &[]));
    out
}

fn context(prefix: &str) -> Result<(ServerContext, PathBuf)> {
    let root = unique_root(prefix);
    let cfg = ServerConfig::default()
        .with_session_dir(root.join("sessions"))
        .with_stream_buffer(8192);

    let mut dispatch = DispatchTable::new();
    dispatch.bind_fn("hello", |req: &mut dyn RequestHandle| {
        req.read_body()?;
        req.write_response(b"ok")?;
        Ok(0)
    });
    dispatch.bind_fn("echo", |req: &mut dyn RequestHandle| {
        let body = req.read_body()?;
        req.write_response(&body)?;
        Ok(7)
    });
    dispatch.bind_fn("fail", |_req: &mut dyn RequestHandle| Err(anyhow!("boom")));
    dispatch.bind_fn("meta", |req: &mut dyn RequestHandle| {
        let theme = req.cookie("theme").unwrap_or_default();
        let x = req.query_param("x").unwrap_or_default();
        let flag = req.query_param("flag").is_some();
        let line = format!("{} {} {} {}", theme, x, flag, req.params().len());
        req.write_response(line.as_bytes())?;
        Ok(0)
    });
    dispatch.bind_fn("session", |req: &mut dyn RequestHandle| {
        let store = req.sessions().ok_or_else(|| anyhow!("no session store"))?;
        let id = store.create(b"cart=3")?;
        let payload = store
            .find(&id)?
            .into_payload()
            .ok_or_else(|| anyhow!("session vanished"))?;
        req.write_response(&payload)?;
        Ok(0)
    });

    let ctx = ServerContext::new(cfg, dispatch)?;
    Ok((ctx, root))
}

fn serve(ctx: &ServerContext, input: Vec<u8>) -> (Result<()>, Vec<Record>, u64) {
    let io = Duplex {
        input: Cursor::new(input),
        output: Vec::new(),
    };
    let mut conn = Connection::new(io, ctx.config.stream_buffer);
    let res = conn.serve(ctx).map_err(anyhow::Error::from);
    assert_eq!(conn.state(), ConnState::Closed);
    let served = conn.served();
    let raw = conn.into_inner().output;
    let mut cur = raw.as_slice();
    let mut out = Vec::new();
    while let Some(r) = read_record(&mut cur).expect("server output is well-formed") {
        out.push(r);
    }
    (res, out, served)
}

fn stream_of(out: &[Record], id: u16, rtype: RecordType) -> Vec<u8> {
    out.iter()
        .filter(|r| r.request_id() == id && r.rtype() == rtype)
        .flat_map(|r| r.content.clone())
        .collect()
}

fn end_of(out: &[Record], id: u16) -> Option<EndRequestBody> {
    out.iter()
        .find(|r| r.request_id() == id && r.rtype() == RecordType::EndRequest)
        .and_then(|r| EndRequestBody::decode(&r.content).ok())
}

#[test]
fn responder_hello_end_to_end() -> Result<()> {
    let (ctx, root) = context("conn-hello")?;
    let (res, out, served) = serve(&ctx, request(1, 1, false, "/hello", b""));
    res?;
    assert_eq!(served, 1);

    let seq: Vec<(RecordType, Vec<u8>)> = out.iter().map(|r| (r.rtype(), r.content.clone())).collect();
    assert_eq!(seq.len(), 3);
    assert_eq!(seq[0], (RecordType::Stdout, b"ok".to_vec()));
    assert_eq!(seq[1], (RecordType::Stdout, Vec::new()));
    assert_eq!(seq[2].0, RecordType::EndRequest);
    let end = end_of(&out, 1).expect("END_REQUEST");
    assert_eq!((end.app_status, end.protocol_status), (0, 0));

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn keep_alive_reuses_request_id() -> Result<()> {
    let (ctx, root) = context("conn-keep")?;
    let mut input = request(1, 1, true, "/echo", b"first");
    input.extend(request(1, 1, false, "/echo.php?x=2", b"second"));

    let (res, out, served) = serve(&ctx, input);
    res?;
    assert_eq!(served, 2);

    let ends: Vec<usize> = out
        .iter()
        .enumerate()
        .filter(|(_, r)| r.rtype() == RecordType::EndRequest)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(ends.len(), 2);
    let (first, second) = out.split_at(ends[0] + 1);
    assert_eq!(stream_of(first, 1, RecordType::Stdout), b"first");
    assert_eq!(stream_of(second, 1, RecordType::Stdout), b"second");
    assert_eq!(end_of(second, 1).map(|e| e.app_status), Some(7));

    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn unread_body_is_drained_before_next_request() -> Result<()> {
    let (ctx, root) = context("conn-drain")?;
    // "hello" читает тело, "meta" - нет: остаток должен быть выброшен
    let mut input = request(3, 1, true, "/meta", b"ignored body");
    input.extend(request(3, 1, false, "/hello", b""));

    let (res, out, served) = serve(&ctx, input);
    res?;
    assert_eq!(served, 2);
    let stdout = stream_of(&out, 3, RecordType::Stdout);
    assert_eq!(stdout, b"dark 1 true 4ok");
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn unknown_role_closes_connection() -> Result<()> {
    let (ctx, root) = context("conn-role")?;
    let mut input = request(4, 9, true, "/hello", b"");
    input.extend(request(5, 1, false, "/hello", b""));

    let (res, out, served) = serve(&ctx, input);
    assert!(res.is_err());
    assert_eq!(served, 0);
    assert_eq!(out.len(), 1);
    let end = end_of(&out, 4).expect("END_REQUEST");
    assert_eq!(end.protocol_status, 3, "UNKNOWN_ROLE");
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn missing_route_answers_404() -> Result<()> {
    let (ctx, root) = context("conn-404")?;
    let (res, out, _) = serve(&ctx, request(2, 1, false, "/nope/", b""));
    res?;
    let stdout = String::from_utf8(stream_of(&out, 2, RecordType::Stdout))?;
    assert!(stdout.starts_with("Status: 404 Not Found\r\n"));
    assert_eq!(end_of(&out, 2).map(|e| e.app_status), Some(0));
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn handler_error_goes_to_stderr() -> Result<()> {
    let (ctx, root) = context("conn-fail")?;
    let (res, out, _) = serve(&ctx, request(6, 1, false, "/fail", b"x"));
    res?;
    let stderr = String::from_utf8(stream_of(&out, 6, RecordType::Stderr))?;
    assert!(stderr.contains("boom"), "stderr: {stderr}");
    assert_eq!(end_of(&out, 6).map(|e| e.app_status), Some(1));

    // STDOUT терминальная запись всё равно есть, END_REQUEST последняя
    let kinds: Vec<RecordType> = out.iter().map(|r| r.rtype()).collect();
    assert_eq!(kinds.first(), Some(&RecordType::Stdout));
    assert_eq!(kinds.last(), Some(&RecordType::EndRequest));
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn abort_during_params_skips_handler() -> Result<()> {
    let (ctx, root) = context("conn-abort")?;
    let begin = BeginRequestBody { role: 1, flags: 0 };
    let mut input = rec(RecordType::BeginRequest, 8, &begin.encode());
    let mut pairs = Vec::new();
    encode_pair(&mut pairs, b"DOCUMENT_URI", b"/fail");
    input.extend(rec(RecordType::Params, 8, &pairs));
    input.extend(rec(RecordType::AbortRequest, 8, &[]));

    let (res, out, _) = serve(&ctx, input);
    res?;
    assert!(stream_of(&out, 8, RecordType::Stderr).is_empty());
    assert_eq!(end_of(&out, 8).map(|e| e.app_status), Some(0));
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn abort_inside_split_pair_still_ends_request() -> Result<()> {
    let (ctx, root) = context("conn-abort-split")?;
    let begin = BeginRequestBody { role: 1, flags: 0 };
    let mut input = rec(RecordType::BeginRequest, 8, &begin.encode());
    let mut pairs = Vec::new();
    encode_pair(&mut pairs, b"DOCUMENT_URI", b"/hello");
    // пара обрывается: две записи PARAMS, затем ABORT
    input.extend(rec(RecordType::Params, 8, &pairs[..5]));
    input.extend(rec(RecordType::Params, 8, &pairs[5..9]));
    input.extend(rec(RecordType::AbortRequest, 8, &[]));

    let (res, out, _) = serve(&ctx, input);
    res?;
    assert!(stream_of(&out, 8, RecordType::Stdout).is_empty());
    let end = end_of(&out, 8).expect("END_REQUEST");
    assert_eq!(end.app_status, 0);
    assert_eq!(end.protocol_status, 0);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn handlers_see_the_session_store() -> Result<()> {
    let (ctx, root) = context("conn-session")?;
    let (res, out, _) = serve(&ctx, request(1, 1, false, "/session", b""));
    res?;
    assert_eq!(stream_of(&out, 1, RecordType::Stdout), b"cart=3");

    // файл сессии остался в каталоге хранилища
    let files = std::fs::read_dir(ctx.sessions.dir())?.count();
    assert_eq!(files, 1);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn stray_record_before_begin_is_skipped() -> Result<()> {
    let (ctx, root) = context("conn-stray")?;
    let mut input = rec(RecordType::Stdin, 1, b"x");
    input.extend(request(1, 1, false, "/hello", b""));
    let (res, _out, served) = serve(&ctx, input);
    // без активного запроса запись с id=1 пропускается, затем обычный запрос
    res?;
    assert_eq!(served, 1);
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
