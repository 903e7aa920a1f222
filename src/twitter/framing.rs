// Line framing for the streaming response body.
//
// The filter stream is a never-ending chunked body of "\r\n"-delimited JSON
// objects. Chunk boundaries do not line up with message boundaries, and the
// server sends bare newlines as keep-alives every few seconds.

/// Reassembles complete lines from arbitrary body chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completed.
    ///
    /// Lines are trimmed; keep-alive (blank) lines are dropped. Invalid UTF-8
    /// is replaced rather than rejected so one bad byte can't stall the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Flush whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        let trimmed = line.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Bytes buffered towards an incomplete line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
