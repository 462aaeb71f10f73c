//! A high-throughput RESP server framework: pipelined command parsing,
//! per-connection worker tasks, and pooled buffers over a tokio TCP engine.

pub mod conn;
pub mod engine;
pub mod hub;
pub mod pool;
pub mod resp;

pub use conn::Conn;
pub use engine::{EventHandler, LoadBalancing, NetConn, Options};
pub use hub::{listen_and_serve, Action, Hub};
pub use resp::{Command, ParseError, ReplyWriter, Value};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
