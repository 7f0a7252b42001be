use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SCROLLBACK_MAX_LINES: usize = 10_000;
pub const DEFAULT_SCROLLBACK_MAX_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbackLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for ScrollbackLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_SCROLLBACK_MAX_LINES,
            max_bytes: DEFAULT_SCROLLBACK_MAX_BYTES,
        }
    }
}

impl ScrollbackLimits {
    pub fn normalized(self) -> Self {
        Self {
            max_lines: self.max_lines.max(1),
            max_bytes: self.max_bytes.max(1),
        }
    }
}

/// Raw output history. Oldest bytes go first once either cap is exceeded.
#[derive(Debug, Clone)]
pub struct Scrollback {
    bytes: VecDeque<u8>,
    newline_count: usize,
    dropped_bytes: u64,
    limits: ScrollbackLimits,
}

impl Scrollback {
    pub fn new(limits: ScrollbackLimits) -> Self {
        Self {
            bytes: VecDeque::new(),
            newline_count: 0,
            dropped_bytes: 0,
            limits: limits.normalized(),
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk.iter().copied());
        self.newline_count += count_newlines(chunk.iter());
        self.trim();
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.newline_count
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Drops all history and frees the buffer.
    pub fn clear(&mut self) {
        self.dropped_bytes += self.bytes.len() as u64;
        self.bytes = VecDeque::new();
        self.newline_count = 0;
    }

    fn trim(&mut self) {
        if self.bytes.len() > self.limits.max_bytes {
            let excess = self.bytes.len() - self.limits.max_bytes;
            self.newline_count -= count_newlines(self.bytes.range(..excess));
            self.bytes.drain(..excess);
            self.dropped_bytes += excess as u64;
        }

        while self.newline_count > self.limits.max_lines {
            let Some(position) = self.bytes.iter().position(|byte| *byte == b'\n') else {
                break;
            };
            self.bytes.drain(..=position);
            self.newline_count -= 1;
            self.dropped_bytes += position as u64 + 1;
        }
    }
}

fn count_newlines<'a>(bytes: impl Iterator<Item = &'a u8>) -> usize {
    bytes.filter(|byte| **byte == b'\n').count()
}

#[cfg(test)]
mod tests {
    use super::{Scrollback, ScrollbackLimits};

    fn scrollback(max_lines: usize, max_bytes: usize) -> Scrollback {
        Scrollback::new(ScrollbackLimits {
            max_lines,
            max_bytes,
        })
    }

    #[test]
    fn drops_oldest_lines_past_line_cap() {
        let mut buffer = scrollback(3, 1024);

        buffer.append(b"one\ntwo\nthree\n");
        buffer.append(b"four\nfive");

        assert_eq!(buffer.to_vec(), b"two\nthree\nfour\nfive");
        assert_eq!(buffer.line_count(), 3);
        assert_eq!(buffer.dropped_bytes(), 4);
    }

    #[test]
    fn drops_oldest_bytes_past_byte_cap() {
        let mut buffer = scrollback(100, 8);

        buffer.append(b"abcdef");
        buffer.append(b"gh\nij");

        assert_eq!(buffer.to_vec(), b"defgh\nij");
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.line_count(), 1);
    }

    #[test]
    fn byte_cap_keeps_newline_count_consistent() {
        let mut buffer = scrollback(100, 4);

        buffer.append(b"a\nb\nc\nd\n");

        assert_eq!(buffer.to_vec(), b"c\nd\n");
        assert_eq!(buffer.line_count(), 2);
    }

    #[test]
    fn a_single_long_line_is_bounded_by_bytes_only() {
        let mut buffer = scrollback(1, 16);

        buffer.append(&[b'x'; 64]);

        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.line_count(), 0);
    }

    #[test]
    fn zero_limits_normalize_to_one() {
        let limits = ScrollbackLimits {
            max_lines: 0,
            max_bytes: 0,
        }
        .normalized();

        assert_eq!(limits.max_lines, 1);
        assert_eq!(limits.max_bytes, 1);
    }
}
