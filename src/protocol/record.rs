//! Кодек записей FastCGI.
//!
//! Формат заголовка (8 байт, BigEndian для u16):
//! [version u8][type u8][request_id u16][content_len u16][padding_len u8][reserved u8]
//!
//! Затем content_len байт содержимого и padding_len байт выравнивания.
//! Писатель всегда выравнивает до кратного 8 нулями; читатель принимает любой padding_len
//! и обязан дочитать content + padding до следующего заголовка.

use byteorder::{BigEndian, ByteOrder};
use std::io::{ErrorKind, Read};

use crate::consts::*;
use crate::error::{FcgiError, FcgiResult};
use crate::util::align8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl RecordType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            FCGI_BEGIN_REQUEST => RecordType::BeginRequest,
            FCGI_ABORT_REQUEST => RecordType::AbortRequest,
            FCGI_END_REQUEST => RecordType::EndRequest,
            FCGI_PARAMS => RecordType::Params,
            FCGI_STDIN => RecordType::Stdin,
            FCGI_STDOUT => RecordType::Stdout,
            FCGI_STDERR => RecordType::Stderr,
            FCGI_DATA => RecordType::Data,
            FCGI_GET_VALUES => RecordType::GetValues,
            FCGI_GET_VALUES_RESULT => RecordType::GetValuesResult,
            FCGI_UNKNOWN_TYPE => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => FCGI_BEGIN_REQUEST,
            RecordType::AbortRequest => FCGI_ABORT_REQUEST,
            RecordType::EndRequest => FCGI_END_REQUEST,
            RecordType::Params => FCGI_PARAMS,
            RecordType::Stdin => FCGI_STDIN,
            RecordType::Stdout => FCGI_STDOUT,
            RecordType::Stderr => FCGI_STDERR,
            RecordType::Data => FCGI_DATA,
            RecordType::GetValues => FCGI_GET_VALUES,
            RecordType::GetValuesResult => FCGI_GET_VALUES_RESULT,
            RecordType::UnknownType => FCGI_UNKNOWN_TYPE,
            RecordType::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            FCGI_RESPONDER => Some(Role::Responder),
            FCGI_AUTHORIZER => Some(Role::Authorizer),
            FCGI_FILTER => Some(Role::Filter),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Role::Responder => FCGI_RESPONDER,
            Role::Authorizer => FCGI_AUTHORIZER,
            Role::Filter => FCGI_FILTER,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Responder => "RESPONDER",
            Role::Authorizer => "AUTHORIZER",
            Role::Filter => "FILTER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
}

impl ProtocolStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolStatus::RequestComplete => FCGI_REQUEST_COMPLETE,
            ProtocolStatus::CantMpxConn => FCGI_CANT_MPX_CONN,
            ProtocolStatus::Overloaded => FCGI_OVERLOADED,
            ProtocolStatus::UnknownRole => FCGI_UNKNOWN_ROLE,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            FCGI_REQUEST_COMPLETE => Some(ProtocolStatus::RequestComplete),
            FCGI_CANT_MPX_CONN => Some(ProtocolStatus::CantMpxConn),
            FCGI_OVERLOADED => Some(ProtocolStatus::Overloaded),
            FCGI_UNKNOWN_ROLE => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// Число нулевых байт выравнивания для содержимого длины len.
#[inline]
pub fn padding_for(len: usize) -> u8 {
    (align8(len) - len) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub rtype: RecordType,
    pub request_id: u16,
    pub content_len: u16,
    pub padding_len: u8,
}

impl RecordHeader {
    pub fn new(rtype: RecordType, request_id: u16, content_len: u16) -> Self {
        Self {
            version: FCGI_VERSION_1,
            rtype,
            request_id,
            content_len,
            padding_len: padding_for(content_len as usize),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[HDR_OFF_VERSION] = self.version;
        out[HDR_OFF_TYPE] = self.rtype.as_u8();
        BigEndian::write_u16(&mut out[HDR_OFF_REQUEST_ID..HDR_OFF_REQUEST_ID + 2], self.request_id);
        BigEndian::write_u16(&mut out[HDR_OFF_CONTENT_LEN..HDR_OFF_CONTENT_LEN + 2], self.content_len);
        out[HDR_OFF_PADDING_LEN] = self.padding_len;
        out[HDR_OFF_RESERVED] = 0;
    }

    /// Разбор заголовка. Версия проверяется здесь: несовпадение - фатальная ошибка протокола.
    pub fn decode(buf: &[u8]) -> FcgiResult<Self> {
        if buf.len() < FCGI_HEADER_LEN {
            return Err(FcgiError::protocol(format!(
                "short record header: {} bytes",
                buf.len()
            )));
        }
        let version = buf[HDR_OFF_VERSION];
        if version != FCGI_VERSION_1 {
            return Err(FcgiError::protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        Ok(Self {
            version,
            rtype: RecordType::from_u8(buf[HDR_OFF_TYPE]),
            request_id: BigEndian::read_u16(&buf[HDR_OFF_REQUEST_ID..HDR_OFF_REQUEST_ID + 2]),
            content_len: BigEndian::read_u16(&buf[HDR_OFF_CONTENT_LEN..HDR_OFF_CONTENT_LEN + 2]),
            padding_len: buf[HDR_OFF_PADDING_LEN],
        })
    }

    pub fn is_management(&self) -> bool {
        self.request_id == FCGI_NULL_REQUEST_ID
    }
}

/// Тело BEGIN_REQUEST: role u16, flags u8, 5 reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn decode(content: &[u8]) -> FcgiResult<Self> {
        if content.len() != FCGI_BEGIN_BODY_LEN {
            return Err(FcgiError::protocol(format!(
                "BEGIN_REQUEST body must be {} bytes, got {}",
                FCGI_BEGIN_BODY_LEN,
                content.len()
            )));
        }
        Ok(Self {
            role: BigEndian::read_u16(&content[0..2]),
            flags: content[2],
        })
    }

    pub fn encode(&self) -> [u8; FCGI_BEGIN_BODY_LEN] {
        let mut out = [0u8; FCGI_BEGIN_BODY_LEN];
        BigEndian::write_u16(&mut out[0..2], self.role);
        out[2] = self.flags;
        out
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

/// Тело END_REQUEST: app_status u32, protocol_status u8, 3 reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn new(app_status: u32, status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status: status.as_u8(),
        }
    }

    pub fn encode(&self) -> [u8; FCGI_END_BODY_LEN] {
        let mut out = [0u8; FCGI_END_BODY_LEN];
        BigEndian::write_u32(&mut out[0..4], self.app_status);
        out[4] = self.protocol_status;
        out
    }

    pub fn decode(content: &[u8]) -> FcgiResult<Self> {
        if content.len() != FCGI_END_BODY_LEN {
            return Err(FcgiError::protocol(format!(
                "END_REQUEST body must be {} bytes, got {}",
                FCGI_END_BODY_LEN,
                content.len()
            )));
        }
        Ok(Self {
            app_status: BigEndian::read_u32(&content[0..4]),
            protocol_status: content[4],
        })
    }
}

/// Тело UNKNOWN_TYPE: type u8, 7 reserved.
pub fn unknown_type_body(rtype: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = rtype;
    out
}

/// Полная запись (заголовок + content + нулевой padding) в один буфер.
pub fn encode_record(rtype: RecordType, request_id: u16, content: &[u8]) -> FcgiResult<Vec<u8>> {
    if content.len() > FCGI_MAX_CONTENT_LEN {
        return Err(FcgiError::protocol(format!(
            "record content too long: {} > {}",
            content.len(),
            FCGI_MAX_CONTENT_LEN
        )));
    }
    let hdr = RecordHeader::new(rtype, request_id, content.len() as u16);
    let total = FCGI_HEADER_LEN + content.len() + hdr.padding_len as usize;
    let mut out = vec![0u8; total];
    hdr.encode(&mut out[..FCGI_HEADER_LEN]);
    out[FCGI_HEADER_LEN..FCGI_HEADER_LEN + content.len()].copy_from_slice(content);
    Ok(out)
}

/// Декодированная запись; padding уже отброшен.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Vec<u8>,
}

impl Record {
    pub fn rtype(&self) -> RecordType {
        self.header.rtype
    }

    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }
}

/// Читает одну запись целиком.
///
/// Ok(None) - чистый EOF на границе записи (пир закрыл соединение).
/// EOF посреди заголовка или тела - Transport(UnexpectedEof).
pub fn read_record<R: Read>(r: &mut R) -> FcgiResult<Option<Record>> {
    let mut hdr = [0u8; FCGI_HEADER_LEN];
    let mut got = 0usize;
    while got < FCGI_HEADER_LEN {
        match r.read(&mut hdr[got..]) {
            Ok(0) if got == 0 => return Ok(None),
            Ok(0) => return Err(FcgiError::unexpected_eof("record header")),
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FcgiError::Transport(e)),
        }
    }
    let header = RecordHeader::decode(&hdr)?;

    let mut content = vec![0u8; header.content_len as usize];
    read_full(r, &mut content, "record content")?;

    if header.padding_len > 0 {
        let mut pad = [0u8; 255];
        read_full(r, &mut pad[..header.padding_len as usize], "record padding")?;
    }

    Ok(Some(Record { header, content }))
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> FcgiResult<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FcgiError::unexpected_eof(what)),
        Err(e) => Err(FcgiError::Transport(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let hdr = RecordHeader::new(RecordType::Stdout, 0x0102, 0x0304);
        let mut buf = [0u8; 8];
        hdr.encode(&mut buf);
        assert_eq!(buf, [1, 6, 0x01, 0x02, 0x03, 0x04, 4, 0]);
        assert_eq!(RecordHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn bad_version_is_protocol_error() {
        let buf = [2u8, 6, 0, 1, 0, 0, 0, 0];
        let err = RecordHeader::decode(&buf).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn begin_body_length_is_checked() {
        assert!(BeginRequestBody::decode(&[0, 1, 1]).unwrap_err().is_protocol());
        let b = BeginRequestBody::decode(&[0, 1, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(Role::from_u16(b.role), Some(Role::Responder));
        assert!(b.keep_conn());
    }

    #[test]
    fn eof_mid_record_is_transport_error() {
        let mut bytes = encode_record(RecordType::Stdin, 1, b"hello").unwrap();
        bytes.truncate(10);
        let err = read_record(&mut bytes.as_slice()).unwrap_err();
        assert!(err.is_transport());

        let empty: &[u8] = &[];
        assert!(read_record(&mut &*empty).unwrap().is_none());
    }

    #[test]
    fn foreign_padding_is_consumed() {
        // padding_len не обязан быть минимальным у чужого писателя
        let mut bytes = vec![1u8, 5, 0, 1, 0, 2, 10, 0, b'o', b'k'];
        bytes.extend_from_slice(&[0xAA; 10]);
        bytes.extend(encode_record(RecordType::Stdin, 1, b"").unwrap());
        let mut cur = bytes.as_slice();
        let a = read_record(&mut cur).unwrap().unwrap();
        assert_eq!(a.content, b"ok");
        let b = read_record(&mut cur).unwrap().unwrap();
        assert_eq!(b.rtype(), RecordType::Stdin);
        assert!(b.content.is_empty());
        assert!(cur.is_empty());
    }
}
