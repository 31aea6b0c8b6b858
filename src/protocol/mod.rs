//! FastCGI protocol stream engine.
//!
//! Слои снизу вверх:
//! - record  - заголовок 8 байт, тела BEGIN/END_REQUEST, read_record / encode_record;
//! - params  - пары name/value и окружение запроса;
//! - conn    - Conn<T>: management-записи, отказ во втором BEGIN, пропуск чужих id;
//! - stream  - Reader/Writer каналов поверх записей;
//! - request - Request: PARAMS, потоки, закрытие и END_REQUEST.

pub mod conn;
pub mod params;
pub mod record;
pub mod request;
pub mod stream;

pub use conn::{Conn, ConnStats};
pub use params::{decode_pairs, encode_pair, Environment};
pub use record::{
    encode_record, read_record, BeginRequestBody, EndRequestBody, ProtocolStatus, Record,
    RecordHeader, RecordType, Role,
};
pub use request::Request;
pub use stream::{Channel, Reader, Writer};
