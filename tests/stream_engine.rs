use anyhow::Result;
use std::io::{Cursor, Read, Write};

use QuiverCGI::protocol::{
    decode_pairs, encode_pair, encode_record, read_record, BeginRequestBody, Conn,
    EndRequestBody, Record, RecordType, Request, Role,
};

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

fn conn_over(input: Vec<u8>) -> Conn<Duplex> {
    Conn::new(
        Duplex {
            input: Cursor::new(input),
            output: Vec::new(),
        },
        8192,
    )
}

fn output_records(conn: Conn<Duplex>) -> Result<Vec<Record>> {
    let raw = conn.into_inner().output;
    let mut cur = raw.as_slice();
    let mut out = Vec::new();
    while let Some(r) = read_record(&mut cur)? {
        out.push(r);
    }
    Ok(out)
}

fn rec(rtype: RecordType, id: u16, content: &[u8]) -> Vec<u8> {
    encode_record(rtype, id, content).expect("encode")
}

fn begin(id: u16, role: u16, keep: bool) -> Vec<u8> {
    let body = BeginRequestBody {
        role,
        flags: if keep { 1 } else { 0 },
    };
    rec(RecordType::BeginRequest, id, &body.encode())
}

fn params(id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (k, v) in pairs {
        encode_pair(&mut body, k.as_bytes(), v.as_bytes());
    }
    let mut out = rec(RecordType::Params, id, &body);
    out.extend(rec(RecordType::Params, id, &[]));
    out
}

fn end_body(r: &Record) -> EndRequestBody {
    EndRequestBody::decode(&r.content).expect("END_REQUEST body")
}

/// BEGIN -> Request -> PARAMS (как делает сервер).
fn open_request<'c>(conn: &'c mut Conn<Duplex>, buffer: usize) -> Result<Request<'c, Duplex>> {
    let first = conn.next_record()?.expect("BEGIN_REQUEST");
    assert_eq!(first.rtype(), RecordType::BeginRequest);
    let body = BeginRequestBody::decode(&first.content)?;
    let role = Role::from_u16(body.role).expect("known role");
    let mut req = Request::new(conn, first.request_id(), role, body.keep_conn(), buffer);
    req.read_params()?;
    Ok(req)
}

#[test]
fn get_values_answered_inline() -> Result<()> {
    let mut q = Vec::new();
    encode_pair(&mut q, b"FCGI_MAX_CONNS", b"");
    encode_pair(&mut q, b"FCGI_MPXS_CONNS", b"");
    encode_pair(&mut q, b"FCGI_SOMETHING_ELSE", b"");
    encode_pair(&mut q, b"FCGI_MAX_REQS", b"");

    let mut input = rec(RecordType::GetValues, 0, &q);
    // management-запись неизвестного типа
    input.extend(rec(RecordType::Stdin, 0, b"zzz"));

    let mut conn = conn_over(input);
    assert!(conn.next_record()?.is_none(), "management records are not surfaced");
    assert_eq!(conn.stats().management, 2);

    let out = output_records(conn)?;
    assert_eq!(out.len(), 2);

    assert_eq!(out[0].rtype(), RecordType::GetValuesResult);
    assert_eq!(out[0].request_id(), 0);
    let pairs = decode_pairs(&out[0].content)?;
    assert_eq!(
        pairs,
        vec![
            (b"FCGI_MAX_CONNS".to_vec(), b"1".to_vec()),
            (b"FCGI_MPXS_CONNS".to_vec(), b"0".to_vec()),
            (b"FCGI_MAX_REQS".to_vec(), b"1".to_vec()),
        ]
    );

    assert_eq!(out[1].rtype(), RecordType::UnknownType);
    assert_eq!(out[1].request_id(), 0);
    assert_eq!(out[1].content[0], 5);
    assert_eq!(out[1].content.len(), 8);
    Ok(())
}

#[test]
fn second_begin_is_rejected_and_active_request_continues() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(params(1, &[("DOCUMENT_URI", "/hello")]));
    input.extend(begin(2, 1, false));
    input.extend(rec(RecordType::Stdin, 1, b"abc"));
    input.extend(rec(RecordType::Stdin, 1, b""));

    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        assert_eq!(req.param("DOCUMENT_URI"), Some("/hello"));
        let mut body = Vec::new();
        req.stdin().read_to_end(&mut body)?;
        assert_eq!(body, b"abc");
        req.stdout().write_exact(&body)?;
        req.finish(0)?;
    }
    assert_eq!(conn.stats().rejected, 1);
    assert_eq!(conn.active(), None);

    let out = output_records(conn)?;
    let kinds: Vec<(RecordType, u16)> = out.iter().map(|r| (r.rtype(), r.request_id())).collect();
    assert_eq!(
        kinds,
        vec![
            (RecordType::EndRequest, 2),
            (RecordType::Stdout, 1),
            (RecordType::Stdout, 1),
            (RecordType::EndRequest, 1),
        ]
    );
    let rejected = end_body(&out[0]);
    assert_eq!(rejected.protocol_status, 1, "CANT_MPX_CONN");
    assert_eq!(out[1].content, b"abc");
    assert!(out[2].content.is_empty());
    let done = end_body(&out[3]);
    assert_eq!((done.app_status, done.protocol_status), (0, 0));
    Ok(())
}

#[test]
fn foreign_request_ids_are_skipped() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(rec(RecordType::Params, 7, b"\x01\x01AB"));
    input.extend(params(1, &[("A", "1")]));
    input.extend(rec(RecordType::Stdin, 7, b"noise"));
    input.extend(rec(RecordType::Stdin, 1, b"data"));
    input.extend(rec(RecordType::Stdin, 1, b""));

    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        assert_eq!(req.env().len(), 1);
        let body = req.stdin().read_exact_vec(4)?;
        assert_eq!(body, b"data");
        assert_eq!(req.stdin().read_byte()?, None);
        req.finish(0)?;
    }
    assert_eq!(conn.stats().skipped, 2);
    Ok(())
}

#[test]
fn terminal_records_precede_end_request() -> Result<()> {
    let mut input = begin(5, 1, false);
    input.extend(params(5, &[]));
    input.extend(rec(RecordType::Stdin, 5, b""));

    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        req.stdout().write_exact(b"out")?;
        req.stderr().write_exact(b"err")?;
        req.finish(3)?;
    }
    let out = output_records(conn)?;
    let seq: Vec<(RecordType, usize)> = out.iter().map(|r| (r.rtype(), r.content.len())).collect();
    assert_eq!(
        seq,
        vec![
            (RecordType::Stdout, 3),
            (RecordType::Stdout, 0),
            (RecordType::Stderr, 3),
            (RecordType::Stderr, 0),
            (RecordType::EndRequest, 8),
        ]
    );
    assert_eq!(end_body(&out[4]).app_status, 3);
    Ok(())
}

#[test]
fn end_request_only_after_both_writers_close() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(params(1, &[]));

    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        assert_eq!(req.open_writers(), 2);
        req.stdout().write_exact(b"x")?;
        req.stdout().close()?;
        assert_eq!(req.open_writers(), 1);
        assert!(!req.is_finished());
        // закрытие STDERR без записей: терминальная запись не нужна
        req.stderr().close()?;
        assert!(req.is_finished());
        // повторное закрытие - no-op
        req.stdout().close()?;
    }
    let out = output_records(conn)?;
    let seq: Vec<RecordType> = out.iter().map(|r| r.rtype()).collect();
    assert_eq!(
        seq,
        vec![RecordType::Stdout, RecordType::Stdout, RecordType::EndRequest]
    );
    Ok(())
}

#[test]
fn large_output_is_split_at_buffer_size() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(params(1, &[]));

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        let mut w = req.stdout();
        // несколько write разного размера
        w.write_all(&payload[..100])?;
        w.write_all(&payload[100..12_000])?;
        w.write_all(&payload[12_000..])?;
        drop(w);
        req.finish(0)?;
    }
    let out = output_records(conn)?;
    let sizes: Vec<usize> = out
        .iter()
        .filter(|r| r.rtype() == RecordType::Stdout)
        .map(|r| r.content.len())
        .collect();
    assert_eq!(sizes, vec![8192, 8192, 3616, 0]);
    let joined: Vec<u8> = out
        .iter()
        .filter(|r| r.rtype() == RecordType::Stdout)
        .flat_map(|r| r.content.clone())
        .collect();
    assert_eq!(joined, payload);
    Ok(())
}

#[test]
fn params_may_span_records() -> Result<()> {
    let mut pairs = Vec::new();
    encode_pair(&mut pairs, b"QUERY_STRING", &vec![b'q'; 300]);
    encode_pair(&mut pairs, b"DOCUMENT_URI", b"/x");

    let mut input = begin(1, 1, false);
    // рвём буфер пар посреди длины
    input.extend(rec(RecordType::Params, 1, &pairs[..3]));
    input.extend(rec(RecordType::Params, 1, &pairs[3..]));
    input.extend(rec(RecordType::Params, 1, &[]));

    let mut conn = conn_over(input);
    let req = open_request(&mut conn, 8192)?;
    assert!(req.params_done());
    assert_eq!(req.param("QUERY_STRING").map(str::len), Some(300));
    assert_eq!(req.param("DOCUMENT_URI"), Some("/x"));
    Ok(())
}

#[test]
fn abort_ends_input_streams() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(params(1, &[]));
    input.extend(rec(RecordType::Stdin, 1, b"part"));
    input.extend(rec(RecordType::AbortRequest, 1, b""));

    let mut conn = conn_over(input);
    {
        let mut req = open_request(&mut conn, 8192)?;
        let mut body = Vec::new();
        req.stdin().read_to_end(&mut body)?;
        // уже полученное отдаётся, дальше - конец потока
        assert_eq!(body, b"part");
        assert!(req.is_aborted());
        req.finish(0)?;
    }
    let out = output_records(conn)?;
    assert_eq!(out.last().map(|r| r.rtype()), Some(RecordType::EndRequest));
    Ok(())
}

#[test]
fn filter_reads_data_stream() -> Result<()> {
    let mut input = begin(1, 3, false);
    input.extend(params(1, &[]));
    // DATA вперемешку со STDIN
    input.extend(rec(RecordType::Data, 1, b"file-"));
    input.extend(rec(RecordType::Stdin, 1, b"in"));
    input.extend(rec(RecordType::Data, 1, b"bytes"));
    input.extend(rec(RecordType::Stdin, 1, b""));
    input.extend(rec(RecordType::Data, 1, b""));

    let mut conn = conn_over(input);
    let mut req = open_request(&mut conn, 8192)?;
    assert_eq!(req.role(), Role::Filter);
    let mut stdin = Vec::new();
    req.stdin().read_to_end(&mut stdin)?;
    let mut data = Vec::new();
    req.data().read_to_end(&mut data)?;
    assert_eq!(stdin, b"in");
    assert_eq!(data, b"file-bytes");
    Ok(())
}

#[test]
fn version_mismatch_is_fatal() -> Result<()> {
    let mut input = begin(1, 1, false);
    input[0] = 2;
    let mut conn = conn_over(input);
    let err = conn.next_record().unwrap_err();
    assert!(err.is_protocol());
    Ok(())
}

#[test]
fn eof_inside_body_marks_request_broken() -> Result<()> {
    let mut input = begin(1, 1, false);
    input.extend(params(1, &[]));
    input.extend(rec(RecordType::Stdin, 1, b"par"));
    // обрыв: нет терминальной STDIN, соединение закрыто

    let mut conn = conn_over(input);
    let mut req = open_request(&mut conn, 8192)?;
    let mut body = Vec::new();
    let err = req.stdin().read_to_end(&mut body).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    let failure = req.take_failure().expect("failure recorded");
    assert!(failure.is_transport());
    Ok(())
}
