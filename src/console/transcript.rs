//! Console transcript
//!
//! Serial consoles emit colour codes, cursor movement and carriage returns.
//! The transcript runs raw bytes through a `vte` state machine, keeps only
//! printable text, and hands out complete lines for logging.

use vte::{Parser, Perform};

/// Longest line kept before it is flushed unterminated
const MAX_LINE_LEN: usize = 4096;

/// Line assembler fed with raw console bytes
pub struct Transcript {
    parser: Parser,
    sink: LineSink,
}

#[derive(Default)]
struct LineSink {
    current: String,
    complete: Vec<String>,
}

impl Perform for LineSink {
    fn print(&mut self, c: char) {
        self.current.push(c);
        if self.current.len() >= MAX_LINE_LEN {
            self.complete.push(std::mem::take(&mut self.current));
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.complete.push(std::mem::take(&mut self.current)),
            b'\t' => self.current.push('\t'),
            // \r, bell, backspace and friends carry no transcript content
            _ => {}
        }
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: LineSink::default(),
        }
    }

    /// Feed raw bytes, returning every line completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.parser.advance(&mut self.sink, bytes);
        std::mem::take(&mut self.sink.complete)
    }

    /// Text received since the last newline
    pub fn pending(&self) -> &str {
        &self.sink.current
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}
