//! Streaming, value-by-value message serializer.
//!
//! Generic over the byte sink so the same logic backs both the growable
//! [`Serializer`] (heap-doubling, default) and the fixed-capacity
//! [`FixedSerializer`] (`heapless`-backed, no allocator required).

use crate::ascii;
use crate::buffer::{ByteSink, FixedBuf};
#[cfg(feature = "alloc")]
use crate::buffer::GrowableBuf;
use crate::crc;
use crate::subcode::{self, FORMAT_INT, FORMAT_STRING, FORMAT_WORD};

/// Default ASCII-mode value separator.
pub const DEFAULT_SEPARATOR: u8 = b' ';

/// What kind of value the serializer is currently (or about to be) writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncoderState {
    Idle,
    EncodingInt,
    EncodingWord,
    EncodingStr,
    Ascii,
    Error,
}

/// A message serializer generic over its backing byte sink.
///
/// See [`Serializer`] and [`FixedSerializer`] for the two concrete storage
/// strategies described in the design notes.
pub struct GenericSerializer<B: ByteSink> {
    buf: B,
    state: EncoderState,
    prev_code: i64,
    repeat_counter: u64,
    separator: u8,
    quote_pending: bool,
    finalized_len: Option<usize>,
}

impl<B: ByteSink + Default> GenericSerializer<B> {
    /// A fresh binary-mode serializer.
    pub fn new() -> Self {
        Self {
            buf: B::default(),
            state: EncoderState::Idle,
            prev_code: 0,
            repeat_counter: 0,
            separator: DEFAULT_SEPARATOR,
            quote_pending: false,
            finalized_len: None,
        }
    }

    /// A fresh ASCII-mirror-mode serializer, space-separated.
    pub fn new_ascii() -> Self {
        let mut s = Self::new();
        s.state = EncoderState::Ascii;
        s
    }

    /// A fresh ASCII-mirror-mode serializer with a custom value separator.
    pub fn with_separator(separator: u8) -> Self {
        let mut s = Self::new_ascii();
        s.separator = separator;
        s
    }
}

impl<B: ByteSink + Default> Default for GenericSerializer<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ByteSink> GenericSerializer<B> {
    /// Clear the buffer for reuse without reallocating; preserves the
    /// binary/ASCII mode and separator, but not the finalized state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = if self.state == EncoderState::Ascii {
            EncoderState::Ascii
        } else {
            EncoderState::Idle
        };
        self.prev_code = 0;
        self.repeat_counter = 0;
        self.quote_pending = false;
        self.finalized_len = None;
    }

    pub fn is_error(&self) -> bool {
        self.state == EncoderState::Error
    }

    pub fn is_ascii_mode(&self) -> bool {
        self.state == EncoderState::Ascii
    }

    pub fn separator(&self) -> u8 {
        self.separator
    }

    /// The finalized bytes. Before `finalize`/`write_crc` this is whatever
    /// has been written so far (no panic, matching the reference's
    /// tolerance of reading an un-finalized buffer).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len()]
    }

    pub fn len(&self) -> usize {
        self.finalized_len.unwrap_or_else(|| self.buf.as_slice().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, byte: u8) {
        if !self.buf.push(byte) {
            self.state = EncoderState::Error;
        }
    }

    fn emit_fmtcrc(&mut self, value: u64) {
        let mut failed = false;
        subcode::encode_fmtcrc(
            |b| {
                if !self.buf.push(b) {
                    failed = true;
                }
            },
            value,
        );
        if failed {
            self.state = EncoderState::Error;
        }
    }

    fn emit_rep(&mut self, count: u64) {
        let mut failed = false;
        subcode::encode_rep(
            |b| {
                if !self.buf.push(b) {
                    failed = true;
                }
            },
            count,
        );
        if failed {
            self.state = EncoderState::Error;
        }
    }

    fn flush_repeat(&mut self) {
        if self.repeat_counter > 0 {
            let count = self.repeat_counter;
            self.repeat_counter = 0;
            self.emit_rep(count);
        }
    }

    /// Emit an integer code, folding it into a pending repetition if it
    /// matches the previous value written while in `state_after`. Does not
    /// itself decide whether a format switch is needed.
    fn emit_int_no_switch(&mut self, value: i64, state_after: EncoderState) {
        if !self.buf.is_empty() && self.state == state_after && value == self.prev_code {
            self.repeat_counter += 1;
            return;
        }
        self.flush_repeat();
        let mut failed = false;
        subcode::encode_i64(
            |b| {
                if !self.buf.push(b) {
                    failed = true;
                }
            },
            value,
        );
        if failed {
            self.state = EncoderState::Error;
        }
        self.prev_code = value;
        self.state = state_after;
    }

    fn maybe_write_separator(&mut self) {
        if !self.buf.is_empty() {
            let sep = self.separator;
            self.push(sep);
        }
    }

    fn write_decimal(&mut self, value: i64) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        let magnitude = value.unsigned_abs();
        if magnitude == 0 {
            i -= 1;
            digits[i] = b'0';
        } else {
            let mut m = magnitude;
            while m > 0 {
                i -= 1;
                digits[i] = b'0' + (m % 10) as u8;
                m /= 10;
            }
        }
        if value < 0 {
            i -= 1;
            digits[i] = b'-';
        }
        for &b in &digits[i..] {
            self.push(b);
        }
    }

    /// Emit a signed 64-bit integer.
    pub fn write_i64(&mut self, value: i64) {
        if self.state == EncoderState::Error {
            return;
        }
        if self.state == EncoderState::Ascii {
            self.maybe_write_separator();
            self.write_decimal(value);
            return;
        }
        if self.state != EncoderState::EncodingInt && self.state != EncoderState::Idle {
            self.flush_repeat();
            self.emit_fmtcrc(FORMAT_INT);
        }
        self.emit_int_no_switch(value, EncoderState::EncodingInt);
    }

    /// Emit a signed 32-bit integer (there is no narrower wire form).
    pub fn write_i32(&mut self, value: i32) {
        self.write_i64(value as i64);
    }

    fn begin_word(&mut self) {
        if self.state == EncoderState::Ascii {
            self.maybe_write_separator();
        } else {
            self.flush_repeat();
            self.emit_fmtcrc(FORMAT_WORD);
            self.state = EncoderState::EncodingWord;
        }
    }

    fn write_word_char(&mut self, c: u8) {
        if self.state == EncoderState::Ascii {
            self.push(c);
        } else {
            self.emit_int_no_switch((c as i64) - 64, EncoderState::EncodingWord);
        }
    }

    fn begin_string(&mut self) {
        if self.state == EncoderState::Ascii {
            self.maybe_write_separator();
            self.push(b'"');
            self.quote_pending = true;
        } else {
            self.flush_repeat();
            self.emit_fmtcrc(FORMAT_STRING);
            self.state = EncoderState::EncodingStr;
        }
    }

    fn write_string_char(&mut self, c: u8) {
        if self.state == EncoderState::Ascii {
            if c == b'"' || c == b'\\' || !ascii::is_printable(c) {
                self.push(b'\\');
                self.push(b'x');
                self.push(ascii::encode_hex_digit(c >> 4));
                self.push(ascii::encode_hex_digit(c));
            } else {
                self.push(c);
            }
        } else {
            self.emit_int_no_switch((c as i64) - 64, EncoderState::EncodingStr);
        }
    }

    fn end_string(&mut self) {
        if self.state == EncoderState::Ascii && self.quote_pending {
            self.push(b'"');
            self.quote_pending = false;
        }
    }

    /// Emit an unquoted identifier-like word. An empty word silently falls
    /// back to an empty string in binary mode, since a zero-length WORD
    /// would otherwise be indistinguishable from no word at all.
    pub fn write_word(&mut self, s: &str) {
        if self.state == EncoderState::Error {
            return;
        }
        let bytes = s.as_bytes();
        if bytes.is_empty() && self.state != EncoderState::Ascii {
            self.write_string("");
            return;
        }
        self.begin_word();
        for &c in bytes {
            self.write_word_char(c);
        }
    }

    /// Emit an arbitrary 7-bit ASCII string.
    pub fn write_string(&mut self, s: &str) {
        if self.state == EncoderState::Error {
            return;
        }
        self.begin_string();
        for &c in s.as_bytes() {
            self.write_string_char(c);
        }
        self.end_string();
    }

    /// Low-level streaming word/string writers, used by the word/string
    /// public API above and by transcoding (`Unserializer::to_serializer`),
    /// which only sees one character at a time.
    pub(crate) fn begin_word_stream(&mut self) {
        self.begin_word();
    }
    pub(crate) fn write_word_stream_char(&mut self, c: u8) {
        self.write_word_char(c);
    }
    pub(crate) fn begin_string_stream(&mut self) {
        self.begin_string();
    }
    pub(crate) fn write_string_stream_char(&mut self, c: u8) {
        self.write_string_char(c);
    }
    pub(crate) fn end_string_stream(&mut self) {
        self.end_string();
    }

    /// Finalize without a CRC, flushing any pending repetition (and closing
    /// a pending ASCII quote).
    pub fn finalize(&mut self) {
        if self.state == EncoderState::Error {
            return;
        }
        if self.state == EncoderState::Ascii {
            self.end_string();
        } else {
            self.flush_repeat();
        }
        self.finalized_len = Some(self.buf.as_slice().len());
    }

    /// Finalize with a trailing CRC-32 (the standard zlib/PNG variant).
    pub fn write_crc(&mut self) {
        self.write_crc_with(crc::crc32);
    }

    /// Finalize with a trailing CRC computed by a caller-supplied function,
    /// for interop with a different CRC variant than this crate's own.
    pub fn write_crc_with<F: Fn(&[u8]) -> u32>(&mut self, f: F) {
        if self.state == EncoderState::Error {
            return;
        }
        if self.state == EncoderState::Ascii {
            // The ASCII mirror form has no wire representation for a CRC;
            // finalize plainly.
            self.finalize();
            return;
        }
        self.flush_repeat();
        let crc = f(self.buf.as_slice()) as u64;
        self.emit_fmtcrc(crc);
        self.finalized_len = Some(self.buf.as_slice().len());
    }
}

/// Growable binary-or-ASCII serializer backed by a doubling heap buffer.
#[cfg(feature = "alloc")]
pub type Serializer = GenericSerializer<GrowableBuf>;

/// Fixed-capacity binary-or-ASCII serializer backed by `heapless::Vec<u8, N>`.
pub type FixedSerializer<const N: usize> = GenericSerializer<FixedBuf<N>>;

#[cfg(test)]
mod tests {
    use super::*;

    type TestSerializer = FixedSerializer<64>;

    #[test]
    fn scenario_a_zero() {
        let mut s = TestSerializer::new();
        s.write_i64(0);
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x40]);
    }

    #[test]
    fn scenario_b_minus_one() {
        let mut s = TestSerializer::new();
        s.write_i64(-1);
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x20]);
    }

    #[test]
    fn scenario_c_multibyte() {
        let mut s = TestSerializer::new();
        s.write_i64(1000);
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x68, 0x8F]);
    }

    #[test]
    fn scenario_d_repetition() {
        let mut s = TestSerializer::new();
        s.write_i64(7);
        s.write_i64(7);
        s.write_i64(7);
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x47, 0x0A]);
    }

    #[test]
    fn scenario_e_word() {
        let mut s = TestSerializer::new();
        s.write_word("Hi");
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x11, 0x48, 0x69]);
    }

    #[test]
    fn empty_word_falls_back_to_string() {
        let mut s = TestSerializer::new();
        s.write_word("");
        s.finalize();
        assert_eq!(s.as_bytes(), &[0x12]);
    }

    #[test]
    fn fixed_buffer_overflow_sets_error() {
        let mut s: FixedSerializer<1> = FixedSerializer::new();
        s.write_i64(1000);
        assert!(s.is_error());
    }

    #[test]
    fn ascii_mode_separates_values() {
        let mut s = GenericSerializer::<FixedBuf<64>>::new_ascii();
        s.write_i64(1);
        s.write_i64(2);
        s.write_word("hi");
        s.finalize();
        assert_eq!(s.as_bytes(), b"1 2 hi");
    }

    #[test]
    fn ascii_mode_escapes_string() {
        let mut s = GenericSerializer::<FixedBuf<64>>::new_ascii();
        s.write_string("a\"b");
        s.finalize();
        assert_eq!(s.as_bytes(), b"\"a\\x22b\"");
    }
}
