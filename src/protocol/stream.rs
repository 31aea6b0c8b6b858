//! Потоки запроса поверх записей.
//!
//! Reader (STDIN / DATA): буфер исчерпан -> следующая запись через Conn. Записи другого
//! канала, пришедшие вперемешку, складываются в очередь своего канала.
//! Writer (STDOUT / STDERR): содержимое копится в буфере [header | content | padding];
//! при заполнении или flush заголовок дописывается задним числом, padding заполняется
//! нулями, кадр уходит одним write_frame.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::consts::FCGI_HEADER_LEN;
use crate::error::{FcgiError, FcgiResult};

use super::conn::Conn;
use super::record::{padding_for, RecordHeader, RecordType};
use super::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin,
    Data,
    Stdout,
    Stderr,
}

impl Channel {
    pub fn record_type(self) -> RecordType {
        match self {
            Channel::Stdin => RecordType::Stdin,
            Channel::Data => RecordType::Data,
            Channel::Stdout => RecordType::Stdout,
            Channel::Stderr => RecordType::Stderr,
        }
    }
}

/// Входной канал: очередь содержимого записей + курсор в текущей.
#[derive(Debug, Default)]
pub(crate) struct InState {
    chunks: VecDeque<Vec<u8>>,
    cur: Vec<u8>,
    pos: usize,
    pub(crate) ended: bool,
}

impl InState {
    pub(crate) fn push(&mut self, content: Vec<u8>) {
        if self.ended {
            return;
        }
        if content.is_empty() {
            self.ended = true;
        } else {
            self.chunks.push_back(content);
        }
    }

    /// Копирует доступные байты; 0 - буфер пуст (не обязательно конец потока).
    pub(crate) fn take(&mut self, out: &mut [u8]) -> usize {
        while self.pos >= self.cur.len() {
            match self.chunks.pop_front() {
                Some(next) => {
                    self.cur = next;
                    self.pos = 0;
                }
                None => return 0,
            }
        }
        let n = out.len().min(self.cur.len() - self.pos);
        out[..n].copy_from_slice(&self.cur[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Выходной канал: один кадр записи, переиспользуемый между flush.
#[derive(Debug)]
pub(crate) struct OutState {
    rtype: RecordType,
    frame: Vec<u8>,
    cap: usize,
    len: usize,
    pub(crate) wrote_any: bool,
    pub(crate) closed: bool,
}

impl OutState {
    pub(crate) fn new(rtype: RecordType, cap: usize) -> Self {
        Self {
            rtype,
            // header + content + максимум 7 байт padding
            frame: vec![0u8; FCGI_HEADER_LEN + cap + 7],
            cap,
            len: 0,
            wrote_any: false,
            closed: false,
        }
    }

    pub(crate) fn write<T: Read + Write>(
        &mut self,
        conn: &mut Conn<T>,
        id: u16,
        mut data: &[u8],
    ) -> FcgiResult<()> {
        if self.closed {
            return Err(FcgiError::protocol(format!(
                "{:?} stream written after close",
                self.rtype
            )));
        }
        while !data.is_empty() {
            let room = self.cap - self.len;
            let n = room.min(data.len());
            let off = FCGI_HEADER_LEN + self.len;
            self.frame[off..off + n].copy_from_slice(&data[..n]);
            self.len += n;
            self.wrote_any = true;
            data = &data[n..];
            if self.len == self.cap {
                self.flush(conn, id)?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush<T: Read + Write>(&mut self, conn: &mut Conn<T>, id: u16) -> FcgiResult<()> {
        if self.len == 0 {
            return Ok(());
        }
        let hdr = RecordHeader::new(self.rtype, id, self.len as u16);
        hdr.encode(&mut self.frame[..FCGI_HEADER_LEN]);
        let content_end = FCGI_HEADER_LEN + self.len;
        let end = content_end + padding_for(self.len) as usize;
        self.frame[content_end..end].fill(0);
        conn.write_frame(&self.frame[..end])?;
        self.len = 0;
        Ok(())
    }

    /// flush + пустая терминальная запись канала (если нужна).
    pub(crate) fn close<T: Read + Write>(
        &mut self,
        conn: &mut Conn<T>,
        id: u16,
        always_terminate: bool,
    ) -> FcgiResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush(conn, id)?;
        if always_terminate || self.wrote_any {
            conn.write_record(self.rtype, id, &[])?;
        }
        self.closed = true;
        Ok(())
    }
}

/// Read-поток входного канала запроса.
pub struct Reader<'r, 'c, T: Read + Write> {
    pub(crate) req: &'r mut Request<'c, T>,
    pub(crate) channel: Channel,
}

impl<'r, 'c, T: Read + Write> Reader<'r, 'c, T> {
    /// Один байт; None - конец потока.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Ровно n байт; конец потока раньше - UnexpectedEof.
    pub fn read_exact_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_exact(&mut out)?;
        Ok(out)
    }
}

impl<'r, 'c, T: Read + Write> Read for Reader<'r, 'c, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.req.read_channel(self.channel, buf)?)
    }
}

/// Write-поток выходного канала запроса.
pub struct Writer<'r, 'c, T: Read + Write> {
    pub(crate) req: &'r mut Request<'c, T>,
    pub(crate) channel: Channel,
}

impl<'r, 'c, T: Read + Write> Writer<'r, 'c, T> {
    pub fn write_exact(&mut self, bytes: &[u8]) -> FcgiResult<()> {
        self.req.write_channel(self.channel, bytes)
    }

    /// Закрыть канал (терминальная запись; END_REQUEST после последнего писателя).
    pub fn close(self) -> FcgiResult<()> {
        self.req.close_stream(self.channel)
    }
}

impl<'r, 'c, T: Read + Write> Write for Writer<'r, 'c, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.req.write_channel(self.channel, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.req.flush_channel(self.channel)?)
    }
}
