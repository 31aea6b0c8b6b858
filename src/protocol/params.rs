//! Пары name/value (PARAMS, GET_VALUES, GET_VALUES_RESULT) и окружение запроса.
//!
//! Длина < 128 кодируется одним байтом, иначе 4 байта BigEndian со старшим битом = 1.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{FcgiError, FcgiResult};

fn encode_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, (len as u32) | 0x8000_0000);
        out.extend_from_slice(&b);
    }
}

fn decode_len(buf: &[u8], pos: &mut usize) -> FcgiResult<usize> {
    let Some(&first) = buf.get(*pos) else {
        return Err(FcgiError::protocol("name/value pair: truncated length"));
    };
    if first & 0x80 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    if *pos + 4 > buf.len() {
        return Err(FcgiError::protocol("name/value pair: truncated 4-byte length"));
    }
    let v = BigEndian::read_u32(&buf[*pos..*pos + 4]) & 0x7fff_ffff;
    *pos += 4;
    Ok(v as usize)
}

pub fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    encode_len(out, name.len());
    encode_len(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

/// Разбирает буфер пар целиком. Хвост, не покрывающий пару, - ошибка протокола.
pub fn decode_pairs(buf: &[u8]) -> FcgiResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let nlen = decode_len(buf, &mut pos)?;
        let vlen = decode_len(buf, &mut pos)?;
        let end = pos
            .checked_add(nlen)
            .and_then(|p| p.checked_add(vlen))
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| {
                FcgiError::protocol(format!(
                    "name/value pair overruns buffer ({} + {} at {} of {})",
                    nlen,
                    vlen,
                    pos,
                    buf.len()
                ))
            })?;
        let name = buf[pos..pos + nlen].to_vec();
        let value = buf[pos + nlen..end].to_vec();
        out.push((name, value));
        pos = end;
    }
    Ok(out)
}

/// Окружение запроса: упорядоченный список "key=value" без NUL.
///
/// Порядок - порядок прихода. Повторный ключ не затирает первый (get отдаёт первый),
/// как и в остальных таблицах сервера.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    entries: Vec<Vec<u8>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &[u8], value: &[u8]) -> FcgiResult<()> {
        if name.is_empty() {
            return Err(FcgiError::protocol("PARAMS: empty name"));
        }
        if name.contains(&0) || value.contains(&0) || name.contains(&b'=') {
            return Err(FcgiError::protocol(format!(
                "PARAMS: invalid byte in {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        let mut e = Vec::with_capacity(name.len() + 1 + value.len());
        e.extend_from_slice(name);
        e.push(b'=');
        e.extend_from_slice(value);
        self.entries.push(e);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        let n = name.as_bytes();
        self.entries.iter().find_map(|e| {
            if e.len() > n.len() && e.starts_with(n) && e[n.len()] == b'=' {
                Some(&e[n.len() + 1..])
            } else {
                None
            }
        })
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Пары (name, value) в порядке прихода.
    pub fn pairs(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().filter_map(|e| {
            let eq = e.iter().position(|&b| b == b'=')?;
            Some((&e[..eq], &e[eq + 1..]))
        })
    }

    /// Сырые строки "key=value".
    pub fn entries(&self) -> &[Vec<u8>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        let long = vec![b'v'; 200];
        let mut buf = Vec::new();
        encode_pair(&mut buf, b"A", b"1");
        encode_pair(&mut buf, b"LONG", &long);
        assert_eq!(&buf[..2], &[1, 1]);
        assert_eq!(&buf[4..9], &[4, 0x80, 0, 0, 200]);

        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0, b"LONG");
        assert_eq!(pairs[1].1, long);
    }

    #[test]
    fn overrun_is_rejected() {
        let buf = [3u8, 10, b'a', b'b', b'c', b'x'];
        assert!(decode_pairs(&buf).unwrap_err().is_protocol());
        assert!(decode_pairs(&[0x80, 0, 0]).unwrap_err().is_protocol());
    }

    #[test]
    fn environment_first_entry_wins() {
        let mut env = Environment::new();
        env.push(b"DOCUMENT_URI", b"/hello").unwrap();
        env.push(b"DOC", b"short").unwrap();
        env.push(b"DOCUMENT_URI", b"/other").unwrap();
        assert_eq!(env.get_str("DOCUMENT_URI"), Some("/hello"));
        assert_eq!(env.get_str("DOC"), Some("short"));
        assert_eq!(env.get("DOCU"), None);
        assert_eq!(env.entries()[0], b"DOCUMENT_URI=/hello".to_vec());
        assert!(env.push(b"BAD", b"a\0b").is_err());
    }
}
