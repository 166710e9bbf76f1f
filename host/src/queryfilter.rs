//! Filters terminal query sequences out of the byte stream that is
//! echoed to the host's own terminal.
//!
//! When a remote viewer attaches, its terminal emulator may answer the
//! color and device queries present in the replayed output.  Those
//! answers travel down the viewer's stdin, through the shared pty, and
//! would be read by the host shell as typed input.  Suppressing the
//! queries on the host's stdout (and only there) keeps the host's own
//! terminal from ever emitting answers into the shell.
//!
//! Dropped sequences:
//!   `ESC ] 10|11|12 ; ? BEL` and `ESC ] 10|11|12 ; ? ESC \`  (OSC color queries)
//!   `ESC [ 5 n`, `ESC [ 6 n`                                 (status/cursor reports)
//!   `ESC [ c`, `ESC [ 0 c`, `ESC [ > c`, `ESC [ > 0 c`,
//!   `ESC [ = c`, `ESC [ = 0 c`                               (device attribute queries)
//!
//! Everything else — OSC title sets, OSC color *sets*, OSC 52 clipboard,
//! palette queries — passes through byte-for-byte.  The stream is not
//! line framed: a sequence may straddle any number of writes, so an
//! unfinished prefix is held until the following bytes decide its fate.

use std::io;

use async_trait::async_trait;

use crate::multiwriter::OutputSink;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Esc,
    Csi,
    CsiParam,
    Osc,
    OscParam,
    OscSemi,
    OscQuery,
    OscQueryEsc,
    OscContent,
    OscContentEsc,
}

/// Cap on a buffered OSC body; a sequence that never terminates is
/// flushed through rather than held forever.
const MAX_HOLD: usize = 8192;

pub struct QueryFilter {
    state: State,
    buf: Vec<u8>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryFilter {
    pub fn new() -> Self {
        Self {
            state: State::Normal,
            buf: Vec::new(),
        }
    }

    /// Push `input` through the filter, collecting passed-through bytes
    /// into `out`.  Bytes belonging to an undecided sequence stay
    /// buffered until a later call (or `finish`) resolves them.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            self.step(b, out);
        }
    }

    /// Flush whatever prefix is still held.  Called when the stream
    /// ends so that a trailing partial sequence is not swallowed.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.buf);
        self.state = State::Normal;
    }

    fn flush(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.buf);
        self.state = State::Normal;
    }

    fn discard(&mut self) {
        self.buf.clear();
        self.state = State::Normal;
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>) {
        match self.state {
            State::Normal => {
                if b == ESC {
                    self.buf.push(b);
                    self.state = State::Esc;
                } else {
                    out.push(b);
                }
            }
            State::Esc => match b {
                b'[' => {
                    self.buf.push(b);
                    self.state = State::Csi;
                }
                b']' => {
                    self.buf.push(b);
                    self.state = State::Osc;
                }
                ESC => {
                    // The held ESC was not ours; emit it and hold the new one.
                    out.append(&mut self.buf);
                    self.buf.push(ESC);
                }
                _ => {
                    self.buf.push(b);
                    self.flush(out);
                }
            },
            State::Csi => match b {
                b'5' | b'6' | b'0' | b'>' | b'=' => {
                    self.buf.push(b);
                    self.state = State::CsiParam;
                }
                b'c' => self.discard(),
                _ => {
                    self.buf.push(b);
                    self.flush(out);
                }
            },
            State::CsiParam => {
                let params = &self.buf[2..];
                match b {
                    b'n' if params == b"5" || params == b"6" => self.discard(),
                    b'c' if matches!(params, b"0" | b">" | b"=" | b">0" | b"=0") => self.discard(),
                    b'0' if matches!(params, b">" | b"=") => {
                        self.buf.push(b);
                    }
                    _ => {
                        self.buf.push(b);
                        self.flush(out);
                    }
                }
            }
            State::Osc => {
                if b.is_ascii_digit() {
                    self.buf.push(b);
                    self.state = State::OscParam;
                    self.check_osc_code(out);
                } else {
                    self.buf.push(b);
                    self.flush(out);
                }
            }
            State::OscParam => match b {
                b';' => {
                    let code = &self.buf[2..];
                    let is_color_code = matches!(code, b"10" | b"11" | b"12");
                    self.buf.push(b);
                    if is_color_code {
                        self.state = State::OscSemi;
                    } else {
                        self.flush(out);
                    }
                }
                _ if b.is_ascii_digit() => {
                    self.buf.push(b);
                    self.check_osc_code(out);
                }
                _ => {
                    self.buf.push(b);
                    self.flush(out);
                }
            },
            State::OscSemi => match b {
                b'?' => {
                    self.buf.push(b);
                    self.state = State::OscQuery;
                }
                ESC => {
                    self.buf.push(b);
                    self.state = State::OscContentEsc;
                }
                BEL => {
                    self.buf.push(b);
                    self.flush(out);
                }
                _ => {
                    self.buf.push(b);
                    self.state = State::OscContent;
                }
            },
            State::OscQuery => match b {
                BEL => self.discard(),
                ESC => {
                    self.buf.push(b);
                    self.state = State::OscQueryEsc;
                }
                _ => {
                    self.buf.push(b);
                    self.state = State::OscContent;
                }
            },
            State::OscQueryEsc => match b {
                b'\\' => self.discard(),
                ESC => {
                    self.buf.push(b);
                }
                _ => {
                    self.buf.push(b);
                    self.state = State::OscContent;
                }
            },
            State::OscContent => match b {
                BEL => {
                    self.buf.push(b);
                    self.flush(out);
                }
                ESC => {
                    self.buf.push(b);
                    self.state = State::OscContentEsc;
                }
                _ => {
                    self.buf.push(b);
                    if self.buf.len() > MAX_HOLD {
                        self.flush(out);
                    }
                }
            },
            State::OscContentEsc => match b {
                b'\\' => {
                    self.buf.push(b);
                    self.flush(out);
                }
                ESC => {
                    self.buf.push(b);
                }
                _ => {
                    self.buf.push(b);
                    self.state = State::OscContent;
                }
            },
        }
    }

    /// In Osc/OscParam, bail out as soon as the accumulated digits can
    /// no longer be one of 10, 11 or 12.
    fn check_osc_code(&mut self, out: &mut Vec<u8>) {
        let code = &self.buf[2..];
        let viable = matches!(code, b"1" | b"10" | b"11" | b"12");
        if !viable {
            self.flush(out);
        }
    }
}

/// Wraps the host stdout sink with the filter.  Remote session sinks
/// receive the raw stream.
pub struct FilteredSink {
    filter: QueryFilter,
    inner: Box<dyn OutputSink>,
    scratch: Vec<u8>,
}

impl FilteredSink {
    pub fn new(inner: Box<dyn OutputSink>) -> Self {
        Self {
            filter: QueryFilter::new(),
            inner,
            scratch: Vec::new(),
        }
    }
}

#[async_trait]
impl OutputSink for FilteredSink {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.scratch.clear();
        self.filter.feed(data, &mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(());
        }
        let scratch = std::mem::take(&mut self.scratch);
        let res = self.inner.send(&scratch).await;
        self.scratch = scratch;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_all(chunks: &[&[u8]]) -> Vec<u8> {
        let mut f = QueryFilter::new();
        let mut out = Vec::new();
        for chunk in chunks {
            f.feed(chunk, &mut out);
        }
        f.finish(&mut out);
        out
    }

    #[test]
    fn plain_text_is_identity() {
        let input: &[u8] = b"ls -la\r\ntotal 0\r\n";
        k9::assert_equal!(filter_all(&[input]).as_slice(), input);
    }

    #[test]
    fn drops_each_listed_sequence_entirely() {
        let dropped: &[&[u8]] = &[
            b"\x1b]10;?\x07",
            b"\x1b]11;?\x07",
            b"\x1b]12;?\x07",
            b"\x1b]10;?\x1b\\",
            b"\x1b]11;?\x1b\\",
            b"\x1b]12;?\x1b\\",
            b"\x1b[5n",
            b"\x1b[6n",
            b"\x1b[c",
            b"\x1b[0c",
            b"\x1b[>c",
            b"\x1b[>0c",
            b"\x1b[=c",
            b"\x1b[=0c",
        ];
        for &seq in dropped {
            assert!(
                filter_all(&[seq]).is_empty(),
                "expected {seq:?} to be dropped"
            );
        }
    }

    #[test]
    fn sequences_split_across_writes() {
        // The seed scenario: "hello\x1b" + "[6nworld" -> "helloworld".
        k9::assert_equal!(
            filter_all(&[b"hello\x1b", b"[6nworld"]).as_slice(),
            b"helloworld"
        );
    }

    #[test]
    fn byte_at_a_time_still_filters() {
        let input: &[u8] = b"a\x1b]11;?\x1b\\b";
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        k9::assert_equal!(filter_all(&chunks).as_slice(), b"ab");
    }

    #[test]
    fn passes_through_non_query_sequences() {
        let passed: &[&[u8]] = &[
            b"\x1b]0;window title\x07",
            b"\x1b]11;#112233\x07",
            b"\x1b]52;c;aGVsbG8=\x07",
            b"\x1b]4;1;?\x07",
            b"\x1b[31m",
            b"\x1b[2J",
            b"\x1b[5;5H",
            b"\x1b(B",
        ];
        for &seq in passed {
            k9::assert_equal!(
                filter_all(&[seq]).as_slice(),
                seq,
                "expected {seq:?} to pass through"
            );
        }
    }

    #[test]
    fn osc_11_set_followed_by_query_filters_only_query() {
        let input: &[u8] = b"\x1b]11;rgb:aa/bb/cc\x07then\x1b]11;?\x07end";
        k9::assert_equal!(
            filter_all(&[input]).as_slice(),
            b"\x1b]11;rgb:aa/bb/cc\x07thenend"
        );
    }

    #[test]
    fn csi_5c_is_not_a_query() {
        // Only 5n/6n report; ESC[5c is device-attribute-ish but not in
        // the filtered set and must pass.
        let input: &[u8] = b"\x1b[5c";
        k9::assert_equal!(filter_all(&[input]).as_slice(), input);
    }

    #[test]
    fn double_esc_holds_only_latest() {
        k9::assert_equal!(filter_all(&[b"\x1b\x1b[6n"]).as_slice(), b"\x1b");
    }

    #[test]
    fn trailing_partial_sequence_is_flushed_on_finish() {
        k9::assert_equal!(filter_all(&[b"tail\x1b["]).as_slice(), b"tail\x1b[");
    }

    #[test]
    fn query_with_extra_content_passes_through() {
        // ESC]11;?x... is not the exact query form.
        let input: &[u8] = b"\x1b]11;?x\x07";
        k9::assert_equal!(filter_all(&[input]).as_slice(), input);
    }
}
