//! Общие константы протокола FastCGI (v1) и значения по умолчанию.

// -------- Record header --------
pub const FCGI_VERSION_1: u8 = 1;
pub const FCGI_HEADER_LEN: usize = 8; // [version u8][type u8][request_id u16 BE][content_len u16 BE][padding u8][reserved u8]
pub const FCGI_MAX_CONTENT_LEN: usize = 65535;
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

// Offsets inside record header
pub const HDR_OFF_VERSION: usize = 0;
pub const HDR_OFF_TYPE: usize = 1;
pub const HDR_OFF_REQUEST_ID: usize = 2;
pub const HDR_OFF_CONTENT_LEN: usize = 4;
pub const HDR_OFF_PADDING_LEN: usize = 6;
pub const HDR_OFF_RESERVED: usize = 7;

// Типы записей
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

// -------- BEGIN_REQUEST body (8 bytes) --------
// [role u16 BE][flags u8][reserved 5]
pub const FCGI_BEGIN_BODY_LEN: usize = 8;
pub const FCGI_KEEP_CONN: u8 = 0x01;

pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_AUTHORIZER: u16 = 2;
pub const FCGI_FILTER: u16 = 3;

// -------- END_REQUEST body (8 bytes) --------
// [app_status u32 BE][protocol_status u8][reserved 3]
pub const FCGI_END_BODY_LEN: usize = 8;

pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

// -------- Management (GET_VALUES) --------
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

// Один запрос на соединение, без мультиплексирования.
pub const CAP_MAX_CONNS: &str = "1";
pub const CAP_MAX_REQS: &str = "1";
pub const CAP_MPXS_CONNS: &str = "0";

// -------- Streams --------
pub const DEFAULT_STREAM_BUFFER: usize = 8192;

// -------- Server defaults --------
pub const DEFAULT_LISTEN: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SUPERVISE_MS: u64 = 500;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;
pub const ACCEPT_POLL_MS: u64 = 50;

// -------- Sessions --------
pub const SESSION_FILE_PREFIX: &str = "sess_";
pub const SESSION_TS_LEN: usize = 10; // десятичный Unix timestamp, дополненный нулями
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3 * 60 * 60;
pub const DEFAULT_SESSION_SWEEP_SECS: u64 = 600;
pub const DEFAULT_SESSION_DIR: &str = "quivercgi-sessions";

// -------- Routing --------
pub const ROUTE_PARAMS: [&str; 2] = ["DOCUMENT_URI", "SCRIPT_NAME"];
pub const ROUTE_INDEX: &str = "index";
