//! Escape Filter
//!
//! Streaming filter for the persisted copy of a session's output. It strips
//! the replies a terminal sends back to queries (which end up in the stream
//! when the shell echoes them) so replaying scrollback does not print them:
//!
//! - cursor position reports `ESC [ r ; c R` and `ESC [ ? r ; c R`
//! - device attribute replies `ESC [ ? ... c` and `ESC [ > ... ; ... c`
//! - mode reports `ESC [ ... $ y`
//! - OSC color replies `ESC ] 4 ; n ; rgb:... ST` and `ESC ] 1x ; rgb:... ST`,
//!   terminated by BEL or `ESC \`
//!
//! A sequence cut off at the end of a chunk is held back and resolved against
//! the next one. `ESC [ 3 J` (erase saved lines) is reported to the caller as
//! a clear-scrollback request.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Longest CSI sequence held back waiting for its final byte
const MAX_CSI_LEN: usize = 64;
/// Longest OSC sequence held back waiting for its terminator
const MAX_OSC_LEN: usize = 4096;

/// Result of filtering one chunk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterOutput {
    /// Bytes to persist. After a clear request, only what followed it
    pub data: Vec<u8>,
    /// The chunk contained a clear-scrollback sequence
    pub clear_scrollback: bool,
}

#[derive(Debug, Default)]
pub struct EscapeFilter {
    /// Unresolved trailing sequence from the previous chunk
    pending: Vec<u8>,
}

/// Outcome of scanning one sequence starting at ESC
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Sequence runs past the end of the available bytes
    Incomplete,
    /// Emit this many bytes unchanged
    Keep(usize),
    /// Drop this many bytes
    Drop(usize),
    /// Clear-scrollback sequence of this length
    Clear(usize),
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, chunk: &[u8]) -> FilterOutput {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = FilterOutput {
            data: Vec::with_capacity(input.len()),
            clear_scrollback: false,
        };
        let mut plain_start = 0;
        let mut i = 0;

        while i < input.len() {
            if input[i] != ESC {
                i += 1;
                continue;
            }
            out.data.extend_from_slice(&input[plain_start..i]);

            match scan(&input[i..]) {
                Scan::Incomplete => {
                    self.pending = input[i..].to_vec();
                    return out;
                }
                Scan::Keep(len) => {
                    out.data.extend_from_slice(&input[i..i + len]);
                    i += len;
                }
                Scan::Drop(len) => i += len,
                Scan::Clear(len) => {
                    out.data.clear();
                    out.clear_scrollback = true;
                    i += len;
                }
            }
            plain_start = i;
        }

        out.data.extend_from_slice(&input[plain_start..]);
        out
    }

    /// Release a held-back suffix unchanged (end of stream)
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// `seq[0]` is ESC
fn scan(seq: &[u8]) -> Scan {
    match seq.get(1) {
        None => Scan::Incomplete,
        Some(b'[') => scan_csi(seq),
        Some(b']') => scan_osc(seq),
        Some(_) => Scan::Keep(1),
    }
}

fn scan_csi(seq: &[u8]) -> Scan {
    let mut i = 2;
    loop {
        if i >= MAX_CSI_LEN {
            return Scan::Keep(1);
        }
        let Some(&byte) = seq.get(i) else {
            return Scan::Incomplete;
        };
        match byte {
            // parameter and intermediate bytes
            0x20..=0x3f => i += 1,
            0x40..=0x7e => break,
            _ => return Scan::Keep(1),
        }
    }

    let len = i + 1;
    let body = &seq[2..i];
    let final_byte = seq[i];

    if final_byte == b'J' && body == b"3" {
        return Scan::Clear(len);
    }
    if is_query_reply(body, final_byte) {
        Scan::Drop(len)
    } else {
        Scan::Keep(len)
    }
}

fn is_query_reply(body: &[u8], final_byte: u8) -> bool {
    match final_byte {
        // cursor position report
        b'R' => {
            let params = body.strip_prefix(b"?").unwrap_or(body);
            is_numeric_list(params) && params.contains(&b';')
        }
        // primary / secondary device attributes
        b'c' => match body.split_first() {
            Some((b'?', rest)) => is_numeric_list(rest) && !rest.is_empty(),
            Some((b'>', rest)) => is_numeric_list(rest) && rest.contains(&b';'),
            _ => false,
        },
        // DECRPM / RQM replies
        b'y' => body.ends_with(b"$"),
        _ => false,
    }
}

fn is_numeric_list(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_digit() || *b == b';')
}

fn scan_osc(seq: &[u8]) -> Scan {
    let mut i = 2;
    let (body_end, len) = loop {
        if i >= MAX_OSC_LEN {
            return Scan::Keep(1);
        }
        match seq.get(i) {
            None => return Scan::Incomplete,
            Some(&BEL) => break (i, i + 1),
            Some(&ESC) => match seq.get(i + 1) {
                None => return Scan::Incomplete,
                Some(b'\\') => break (i, i + 2),
                // unterminated OSC interrupted by another sequence
                Some(_) => return Scan::Keep(1),
            },
            Some(_) => i += 1,
        }
    };

    if is_color_reply(&seq[2..body_end]) {
        Scan::Drop(len)
    } else {
        Scan::Keep(len)
    }
}

/// `4;<index>;rgb:...` or `<10..19>;rgb:...`
fn is_color_reply(body: &[u8]) -> bool {
    let mut fields = body.splitn(3, |b| *b == b';');
    let Some(command) = fields.next() else {
        return false;
    };
    let value = match command {
        b"4" => {
            let index = fields.next().unwrap_or_default();
            if index.is_empty() || !index.iter().all(u8::is_ascii_digit) {
                return false;
            }
            fields.next()
        }
        &[b'1', digit] if digit.is_ascii_digit() => {
            // the rest may itself contain ';' so rejoin it
            let rest = &body[command.len()..];
            rest.strip_prefix(b";")
        }
        _ => return false,
    };
    value.is_some_and(|v| v.starts_with(b"rgb:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_all(chunks: &[&[u8]]) -> (Vec<u8>, bool) {
        let mut filter = EscapeFilter::new();
        let mut data = Vec::new();
        let mut cleared = false;
        for chunk in chunks {
            let out = filter.filter(chunk);
            if out.clear_scrollback {
                data.clear();
                cleared = true;
            }
            data.extend_from_slice(&out.data);
        }
        data.extend_from_slice(&filter.flush());
        (data, cleared)
    }

    #[test]
    fn printable_text_passes_through() {
        let text = b"hello world\r\n$ ls -la\r\n";
        let mut filter = EscapeFilter::new();
        assert_eq!(filter.filter(text).data, text.to_vec());
        assert!(filter.flush().is_empty());
    }

    #[test]
    fn styling_sequences_are_kept() {
        let text: &[u8] = b"\x1b[1;31mred\x1b[0m \x1b]0;title\x07 \x1b[2J\x1b[?25l";
        let (data, cleared) = filter_all(&[text]);
        assert_eq!(data, text.to_vec());
        assert!(!cleared);
    }

    #[test]
    fn query_replies_are_removed() {
        let input: &[u8] = b"a\x1b[12;40Rb\x1b[?1;2cc\x1b[>0;276;0cd\x1b[?2004;1$ye\x1b[?12;5Rf";
        let (data, _) = filter_all(&[input]);
        assert_eq!(data, b"abcdef".to_vec());
    }

    #[test]
    fn queries_themselves_are_kept() {
        // DA / CPR requests sent by programs
        let input: &[u8] = b"\x1b[c\x1b[>c\x1b[6n";
        let (data, _) = filter_all(&[input]);
        assert_eq!(data, input.to_vec());
    }

    #[test]
    fn osc_color_replies_are_removed_with_either_terminator() {
        let input: &[u8] =
            b"x\x1b]11;rgb:1e1e/1e1e/1e1e\x07y\x1b]4;1;rgb:cdcd/0000/0000\x1b\\z\x1b]10;?\x07";
        let (data, _) = filter_all(&[input]);
        // the query form (`10;?`) stays
        assert_eq!(data, b"xyz\x1b]10;?\x07".to_vec());
    }

    #[test]
    fn split_sequences_match_whole_input() {
        let input: &[u8] =
            b"pre\x1b[12;40R mid \x1b]11;rgb:0000/0000/0000\x1b\\ \x1b[1mbold\x1b[?1;2c post";
        let (whole, _) = filter_all(&[input]);
        assert_eq!(whole, b"pre mid  \x1b[1mbold post".to_vec());

        for split in 0..=input.len() {
            let (head, tail) = input.split_at(split);
            let (parts, _) = filter_all(&[head, tail]);
            assert_eq!(parts, whole, "split at {}", split);
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole_input() {
        let input: &[u8] = b"\x1b[?1;2c\x1b]4;0;rgb:0/0/0\x07ok\x1b[0m";
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(filter_all(&chunks).0, b"ok\x1b[0m".to_vec());
    }

    #[test]
    fn trailing_partial_is_held_until_flush() {
        let mut filter = EscapeFilter::new();
        let out = filter.filter(b"text\x1b[12;");
        assert_eq!(out.data, b"text".to_vec());
        assert!(filter.has_pending());
        assert_eq!(filter.flush(), b"\x1b[12;".to_vec());
        assert!(!filter.has_pending());
    }

    #[test]
    fn lone_escape_is_resolved_by_next_chunk() {
        let mut filter = EscapeFilter::new();
        assert!(filter.filter(b"a\x1b").data == b"a");
        assert_eq!(filter.filter(b"Mb").data, b"\x1bMb".to_vec());
    }

    #[test]
    fn clear_scrollback_is_reported() {
        let mut filter = EscapeFilter::new();
        let out = filter.filter(b"old output\x1b[3Jnew");
        assert!(out.clear_scrollback);
        assert_eq!(out.data, b"new".to_vec());

        let (data, cleared) = filter_all(&[&b"before\x1b[3"[..], &b"J after"[..]]);
        assert!(cleared);
        assert_eq!(data, b" after".to_vec());
    }

    #[test]
    fn overlong_sequences_are_not_held_forever() {
        let mut input = b"\x1b[".to_vec();
        input.extend(std::iter::repeat(b'1').take(MAX_CSI_LEN + 10));
        let mut filter = EscapeFilter::new();
        let out = filter.filter(&input);
        assert_eq!(out.data, input);
        assert!(!filter.has_pending());
    }

    #[test]
    fn reset_discards_pending() {
        let mut filter = EscapeFilter::new();
        filter.filter(b"\x1b]11;rgb:");
        filter.reset();
        assert!(filter.flush().is_empty());
    }
}
