//! Console sink

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::io::{self, Write};
use tlsprobe_core::{Event, EventSink, SinkResult};

/// Prints one block per event: a header line, then the payload
pub struct ConsoleSink {
    hex: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    /// Print to stdout, as text or as a hex dump
    pub fn stdout(hex: bool) -> Self {
        Self::with_writer(hex, Box::new(io::stdout()))
    }

    pub fn with_writer(hex: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            hex,
            out: Mutex::new(out),
        }
    }

    fn render(&self, event: &Event) -> String {
        let mut block = format!(
            "PID:{}, Comm:{}, TID:{}, Module:{}, Direction:{}, Length:{}",
            event.pid(),
            event.comm(),
            event.tid(),
            event.module(),
            event.direction(),
            event.length()
        );
        if event.is_truncated() {
            let _ = write!(block, " (truncated to {})", event.payload().len());
        }
        block.push('\n');
        if self.hex {
            block.push_str(&hex_dump(event.payload()));
        } else {
            block.push_str(&event.payload_text());
            block.push('\n');
        }
        block
    }
}

/// Classic 16-byte hex dump with an ASCII column
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[async_trait]
impl EventSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn accept(&self, event: Event) -> SinkResult<()> {
        let block = self.render(&event);
        let mut out = self.out.lock();
        out.write_all(block.as_bytes())?;
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.out.lock().flush()?;
        Ok(())
    }
}
