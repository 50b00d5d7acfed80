//! Line assembly for streamed command output.
//!
//! Container output arrives in arbitrary byte chunks. The assembler cuts
//! them into `\n`-delimited lines, splitting any line longer than the
//! buffer cap at the cap boundary so no data is lost.

/// Maximum bytes buffered for a single line before it is force-split
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Incremental splitter from byte chunks to complete lines
#[derive(Debug)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    cap: usize,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::with_cap(MAX_LINE_BYTES)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
        }
    }

    /// Feed a chunk; returns every line completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.buffer.push(byte);
                if self.buffer.len() >= self.cap {
                    lines.push(self.take_line());
                }
            }
        }

        lines
    }

    /// Flush whatever is buffered as a final partial line
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.buffer);
        let mut line = String::from_utf8_lossy(&bytes).into_owned();
        // Container output is CRLF on some images
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}
