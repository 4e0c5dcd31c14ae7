//! In-RAM text buffers for the log output and the last panic message.

/// Fixed-size text sink, writes that do not fit are truncated.
pub struct DebugBuffer<const N: usize> {
    len: usize,
    buffer: [u8; N],
}

impl<const N: usize> DebugBuffer<N> {
    pub const fn new() -> Self {
        Self {
            len: 0,
            buffer: [0; N],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.get(..self.len).unwrap_or(&[])
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Hands the buffered bytes to `reader`, dropping as many as it reports consumed.
    pub fn consume(&mut self, reader: impl FnOnce(&[u8]) -> usize) {
        let len = usize::min(self.len, N);
        let consumed = usize::min(reader(&self.buffer[..len]), len);
        self.buffer.copy_within(consumed..len, 0);
        self.len = len - consumed;
    }
}

impl<const N: usize> Default for DebugBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::fmt::Write for DebugBuffer<N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.len > N {
            // invalid state, that sucks
            self.len = 0;
        }
        let len = core::cmp::min(N - self.len, s.len());
        let start = self.len;
        self.buffer[start..start + len].copy_from_slice(&s.as_bytes()[..len]);
        self.len += len;
        Ok(())
    }
}

/// Formats a log record the way it lands in the debug buffer.
pub fn write_record(w: &mut impl core::fmt::Write, record: &log::Record) -> core::fmt::Result {
    write!(w, "{:<5} {}\r\n", record.level(), record.args())
}
