//! Event sinks for tlsprobe

pub mod console;
pub mod fanout;
pub mod jsonl;

pub use console::{hex_dump, ConsoleSink};
pub use fanout::FanoutSink;
pub use jsonl::{JsonlSink, JsonlSinkConfig};
