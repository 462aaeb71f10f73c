pub mod command;
pub mod encode;
pub mod writer;

pub use command::{read_commands, Command, ParseError};
pub use encode::Value;
pub use writer::ReplyWriter;
