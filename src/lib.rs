#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod metrics;
pub mod config;
pub mod logging;

// Листовые структуры: пул памяти и упорядоченный индекс (red-black)
pub mod pool;   // src/pool/{mod,alloc}.rs
pub mod index;  // src/index/{mod,key}.rs
pub mod acl;

// Протокол FastCGI: записи, пары name/value, соединение, потоки, запрос
pub mod protocol; // src/protocol/{mod,record,params,conn,stream,request}.rs

// Граница вызова обработчиков
pub mod handler;  // src/handler/{mod,exec}.rs

// Приём соединений, воркеры, dispatch
pub mod server;   // src/server/{mod,listener,connection,worker,dispatch,status}.rs

// Файловое хранилище сессий
pub mod session;

// Утилиты (now_secs, align8, ...)
pub mod util;

// CLI-обвязка бинаря quivercgi
pub mod cli;

// Удобные реэкспорты
pub use config::{ConfigTable, ServerConfig};
pub use error::{FcgiError, FcgiResult};
pub use handler::{Handler, RequestHandle};
pub use index::{Key, NodeId, OrderedIndex};
pub use pool::{BlockId, Pool};
pub use protocol::{Conn, Request, Role};
pub use server::{DispatchTable, ServerContext, Supervisor};
pub use session::{Lookup, SessionStore};
