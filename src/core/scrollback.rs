//! Bounded in-memory scrollback
//!
//! Holds the filtered output of a session. Once the byte cap is exceeded the
//! oldest bytes are dropped, with some slack so trimming is not done on every
//! chunk, and the cut is moved forward to a UTF-8 character start.

/// Extra bytes allowed above the cap before trimming (fraction of the cap)
const TRIM_SLACK_DIVISOR: usize = 8;

#[derive(Debug, Clone)]
pub struct Scrollback {
    buf: Vec<u8>,
    max_bytes: usize,
}

impl Scrollback {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Start from recovered bytes, trimmed to the cap
    pub fn with_seed(max_bytes: usize, seed: &[u8]) -> Self {
        let mut scrollback = Self::new(max_bytes);
        scrollback.buf.extend_from_slice(seed);
        scrollback.trim_to(scrollback.max_bytes);
        scrollback
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let slack = self.max_bytes / TRIM_SLACK_DIVISOR;
        if self.buf.len() > self.max_bytes + slack {
            self.trim_to(self.max_bytes);
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    fn trim_to(&mut self, limit: usize) {
        if self.buf.len() <= limit {
            return;
        }
        let cut = self.buf.len() - limit;
        let cut = align_to_char_boundary(&self.buf, cut);
        self.buf.drain(..cut);
    }
}

/// Smallest index `>= start` that is not a UTF-8 continuation byte
///
/// Gives up after 3 bytes so binary output cannot move the cut far.
pub fn align_to_char_boundary(data: &[u8], start: usize) -> usize {
    let mut idx = start.min(data.len());
    let limit = (start + 3).min(data.len());
    while idx < limit && is_continuation(data[idx]) {
        idx += 1;
    }
    idx
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}
