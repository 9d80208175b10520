//! Streaming, value-by-value message reader.
//!
//! Borrows a byte slice rather than owning one; a `'a` lifetime parameter
//! replaces the reference implementation's manual "must not outlive its
//! producer" discipline with a compile-time guarantee.

use crate::ascii;
use crate::buffer::ByteSink;
use crate::crc;
use crate::receiver::{Encoding, Receiver};
use crate::serializer::GenericSerializer;
use crate::subcode::{self, CodeClass, FORMAT_INT, FORMAT_STRING, FORMAT_WORD};
use crate::trace::trace_warn;

/// What kind of value the cursor is positioned to yield next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecoderState {
    NextIsInteger,
    NextIsWord,
    NextIsString,
    EndOfMsg,
    AsciiNumber,
    AsciiWord,
    AsciiString,
    Error,
}

/// Outcome of validating a trailing CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CrcStatus {
    /// The trailing CRC was present and matched.
    Ok,
    /// No CRC code was present (or the unserializer was built `new_no_crc`).
    Absent,
    /// A trailing CRC was present but did not match.
    Mismatch,
}

/// A read cursor over a borrowed, finalized message buffer.
#[derive(Debug, Clone, Copy)]
pub struct Unserializer<'a> {
    bytes: &'a [u8],
    read_pos: usize,
    state: DecoderState,
    current_code: i64,
    repeat_counter: u64,
}

impl<'a> Unserializer<'a> {
    fn empty() -> Self {
        Self {
            bytes: &[],
            read_pos: 0,
            state: DecoderState::EndOfMsg,
            current_code: 0,
            repeat_counter: 0,
        }
    }

    /// Begin binary decoding at offset 0 without verifying any CRC.
    pub fn new_no_crc(bytes: &'a [u8]) -> Self {
        let mut u = Self {
            bytes,
            read_pos: 0,
            state: DecoderState::NextIsInteger,
            current_code: 0,
            repeat_counter: 0,
        };
        u.take_special();
        u
    }

    /// Verify the last code is a FMTCRC equal to `crc32` of the preceding
    /// bytes, then begin decoding the bytes before it.
    pub fn new_take_crc(bytes: &'a [u8]) -> (Self, CrcStatus) {
        Self::new_take_crc_with(bytes, crc::crc32)
    }

    /// As [`Self::new_take_crc`], but with a caller-supplied CRC function.
    pub fn new_take_crc_with<F: Fn(&[u8]) -> u32>(bytes: &'a [u8], f: F) -> (Self, CrcStatus) {
        match subcode::decode_last_code(bytes) {
            Some((start, CodeClass::FmtCrc, value)) => {
                let computed = f(&bytes[..start]) as u64;
                if computed == value {
                    (Self::new_no_crc(&bytes[..start]), CrcStatus::Ok)
                } else {
                    (Self::empty(), CrcStatus::Mismatch)
                }
            }
            _ => (Self::empty(), CrcStatus::Absent),
        }
    }

    /// Borrow a serializer's finalized bytes and begin decoding in whichever
    /// mode (binary or ASCII) the serializer was writing.
    pub fn from_serializer<B: ByteSink>(s: &'a GenericSerializer<B>) -> Self {
        if s.is_ascii_mode() {
            Self::new_ascii(s.as_bytes())
        } else {
            Self::new_no_crc(s.as_bytes())
        }
    }

    /// Begin ASCII-mode decoding of `bytes`.
    pub fn new_ascii(bytes: &'a [u8]) -> Self {
        let mut u = Self {
            bytes,
            read_pos: 0,
            state: DecoderState::AsciiNumber,
            current_code: 0,
            repeat_counter: 0,
        };
        u.take_ascii_space();
        u
    }

    /// Infer the mode from a receiver's finished-message state and begin
    /// decoding its buffer.
    pub fn from_receiver(r: &'a Receiver) -> Self {
        match r.encoding() {
            Encoding::Binary => Self::new_no_crc(r.message()),
            Encoding::Ascii => Self::new_ascii(r.message()),
            Encoding::None => Self::empty(),
        }
    }

    /// A cheap copy of the current read position, e.g. for `string_length`.
    pub fn clone_cursor(&self) -> Self {
        *self
    }

    fn take_special(&mut self) {
        if self.repeat_counter > 0 {
            return;
        }
        if self.read_pos >= self.bytes.len() {
            self.state = DecoderState::EndOfMsg;
            return;
        }
        match subcode::classify(self.bytes[self.read_pos]) {
            CodeClass::Pint | CodeClass::Nint => {}
            CodeClass::FmtCrc => {
                let (_, value, end) = subcode::decode_forward(self.bytes, self.read_pos);
                self.read_pos = end;
                self.state = match value {
                    FORMAT_INT => DecoderState::NextIsInteger,
                    FORMAT_WORD => DecoderState::NextIsWord,
                    FORMAT_STRING => DecoderState::NextIsString,
                    _ => DecoderState::EndOfMsg,
                };
            }
            CodeClass::Rep => {
                let (_, value, end) = subcode::decode_forward(self.bytes, self.read_pos);
                self.read_pos = end;
                self.repeat_counter = value;
            }
            CodeClass::Ext | CodeClass::Nothing => {
                trace_warn!("dbf: unexpected sub-code where a value was expected");
                self.state = DecoderState::EndOfMsg;
            }
        }
    }

    fn take_ascii_space(&mut self) {
        while self.read_pos < self.bytes.len() && self.bytes[self.read_pos] <= b' ' {
            self.read_pos += 1;
        }
        if self.read_pos >= self.bytes.len() {
            self.state = DecoderState::EndOfMsg;
            return;
        }
        let b = self.bytes[self.read_pos];
        self.state = if b == b'"' {
            DecoderState::AsciiString
        } else if b == b'-' || b == b'+' || b.is_ascii_digit() {
            DecoderState::AsciiNumber
        } else {
            DecoderState::AsciiWord
        };
    }

    /// Yield the next signed 64-bit integer. Returns -1 (and logs) if the
    /// cursor is not positioned on an integer.
    pub fn read_i64(&mut self) -> i64 {
        match self.state {
            DecoderState::NextIsInteger => {
                let value = if self.repeat_counter > 0 {
                    self.repeat_counter -= 1;
                    self.current_code
                } else {
                    let (class, raw, end) = subcode::decode_forward(self.bytes, self.read_pos);
                    self.read_pos = end;
                    let v = subcode::decode_i64(class, raw);
                    self.current_code = v;
                    v
                };
                self.take_special();
                value
            }
            DecoderState::AsciiNumber => {
                let (value, consumed) = ascii::parse_int(&self.bytes[self.read_pos..]);
                self.read_pos += consumed;
                self.take_ascii_space();
                value
            }
            _ => {
                trace_warn!("dbf: read_i64 called outside an integer decoder state");
                -1
            }
        }
    }

    /// Yield the next signed 32-bit integer (narrowing); see [`Self::read_i64`].
    pub fn read_i32(&mut self) -> i32 {
        self.read_i64() as i32
    }

    pub fn is_next_int(&self) -> bool {
        matches!(self.state, DecoderState::NextIsInteger | DecoderState::AsciiNumber)
    }

    pub fn is_next_string(&self) -> bool {
        matches!(
            self.state,
            DecoderState::NextIsWord
                | DecoderState::NextIsString
                | DecoderState::AsciiWord
                | DecoderState::AsciiString
        )
    }

    pub fn is_next_end(&self) -> bool {
        matches!(self.state, DecoderState::EndOfMsg | DecoderState::Error)
    }

    /// Non-destructively compute the logical length (content only, no
    /// quoting) of the next string/word without consuming it.
    pub fn string_length(&self) -> usize {
        let mut tmp = *self;
        tmp.drain(|_| {})
    }

    /// Yield the next string/word into `out`, truncating if it does not
    /// fit. Returns the logical length of the source, which may exceed
    /// `out.len()`. `StringState` output is bracketed with `"`; `WordState`
    /// output is not.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        if !self.is_next_string() {
            trace_warn!("dbf: read_into called outside a string/word decoder state");
            return 0;
        }
        let bracket = matches!(self.state, DecoderState::NextIsString | DecoderState::AsciiString);
        let cap = out.len();
        let mut content_pos = 0usize;
        if bracket {
            if content_pos < cap {
                out[content_pos] = b'"';
            }
            content_pos += 1;
        }
        let logical = self.drain(|c| {
            if content_pos < cap {
                out[content_pos] = c;
            }
            content_pos += 1;
        });
        if bracket && content_pos < cap {
            out[content_pos] = b'"';
        }
        logical
    }

    fn drain(&mut self, sink: impl FnMut(u8)) -> usize {
        match self.state {
            DecoderState::NextIsWord | DecoderState::NextIsString => self.drain_binary(sink),
            DecoderState::AsciiWord => self.drain_ascii_word(sink),
            DecoderState::AsciiString => self.drain_ascii_string(sink),
            _ => 0,
        }
    }

    fn drain_binary(&mut self, mut sink: impl FnMut(u8)) -> usize {
        let mut logical_len = 0usize;
        loop {
            if self.repeat_counter > 0 {
                let c = ((self.current_code + 64) & 0xFF) as u8;
                self.repeat_counter -= 1;
                logical_len += 1;
                sink(c);
                continue;
            }
            if self.read_pos >= self.bytes.len() {
                self.state = DecoderState::EndOfMsg;
                break;
            }
            match subcode::classify(self.bytes[self.read_pos]) {
                CodeClass::Pint | CodeClass::Nint => {
                    let (class, raw, end) = subcode::decode_forward(self.bytes, self.read_pos);
                    self.read_pos = end;
                    let v = subcode::decode_i64(class, raw);
                    self.current_code = v;
                    logical_len += 1;
                    sink(((v + 64) & 0xFF) as u8);
                }
                CodeClass::Rep => {
                    let (_, raw, end) = subcode::decode_forward(self.bytes, self.read_pos);
                    self.read_pos = end;
                    self.repeat_counter = raw;
                }
                CodeClass::FmtCrc => break,
                CodeClass::Ext | CodeClass::Nothing => {
                    trace_warn!("dbf: unexpected sub-code while reading a string/word");
                    self.state = DecoderState::EndOfMsg;
                    break;
                }
            }
        }
        self.take_special();
        logical_len
    }

    fn drain_ascii_word(&mut self, mut sink: impl FnMut(u8)) -> usize {
        let mut logical = 0usize;
        while self.read_pos < self.bytes.len() {
            let c = self.bytes[self.read_pos];
            if !ascii::is_word_byte(c) || c == b'"' || c == b'\\' {
                break;
            }
            self.read_pos += 1;
            logical += 1;
            sink(c);
        }
        self.take_ascii_space();
        logical
    }

    fn drain_ascii_string(&mut self, mut sink: impl FnMut(u8)) -> usize {
        self.read_pos += 1; // consume opening quote
        let mut logical = 0usize;
        loop {
            if self.read_pos >= self.bytes.len() {
                break;
            }
            let c = self.bytes[self.read_pos];
            if c == b'"' {
                self.read_pos += 1;
                break;
            }
            if c == b'\\' {
                self.read_pos += 1;
                if self.read_pos >= self.bytes.len() {
                    break;
                }
                self.read_pos += 1; // skip the (unvalidated) 'x' of \xHH
                if self.read_pos + 1 >= self.bytes.len() {
                    trace_warn!("dbf: truncated hex escape in ascii string");
                    self.state = DecoderState::EndOfMsg;
                    break;
                }
                let hi = ascii::decode_hex_digit(self.bytes[self.read_pos]);
                let lo = ascii::decode_hex_digit(self.bytes[self.read_pos + 1]);
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        self.read_pos += 2;
                        logical += 1;
                        sink((h << 4) | l);
                    }
                    _ => {
                        trace_warn!("dbf: invalid hex escape in ascii string");
                        self.state = DecoderState::EndOfMsg;
                        break;
                    }
                }
                continue;
            }
            self.read_pos += 1;
            logical += 1;
            sink(c);
        }
        if self.state != DecoderState::EndOfMsg {
            self.take_ascii_space();
        }
        logical
    }

    /// Explicit CRC validation of the tail, independent of how this
    /// unserializer was constructed.
    pub fn read_crc(&self) -> CrcStatus {
        self.read_crc_with(crc::crc32)
    }

    /// As [`Self::read_crc`], with a caller-supplied CRC function.
    pub fn read_crc_with<F: Fn(&[u8]) -> u32>(&self, f: F) -> CrcStatus {
        match subcode::decode_last_code(self.bytes) {
            Some((start, CodeClass::FmtCrc, value)) => {
                if f(&self.bytes[..start]) as u64 == value {
                    CrcStatus::Ok
                } else {
                    CrcStatus::Mismatch
                }
            }
            _ => CrcStatus::Absent,
        }
    }

    /// Copy the next value from this unserializer into `dst`, respecting
    /// both endpoints' binary/ASCII modes (enables transcoding either way).
    pub fn to_serializer<B: ByteSink>(&mut self, dst: &mut GenericSerializer<B>) {
        match self.state {
            DecoderState::NextIsInteger | DecoderState::AsciiNumber => {
                let v = self.read_i64();
                dst.write_i64(v);
            }
            DecoderState::NextIsString | DecoderState::AsciiString => {
                dst.begin_string_stream();
                self.drain(|c| dst.write_string_stream_char(c));
                dst.end_string_stream();
            }
            DecoderState::NextIsWord | DecoderState::AsciiWord => {
                dst.begin_word_stream();
                self.drain(|c| dst.write_word_stream_char(c));
            }
            DecoderState::EndOfMsg | DecoderState::Error => {}
        }
    }

    /// Copy every remaining value into `dst`.
    pub fn to_serializer_all<B: ByteSink>(&mut self, dst: &mut GenericSerializer<B>) {
        while !self.is_next_end() {
            self.to_serializer(dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FixedBuf;
    use crate::serializer::FixedSerializer;

    #[test]
    fn scenario_a_zero() {
        let mut u = Unserializer::new_no_crc(&[0x40]);
        assert_eq!(u.read_i64(), 0);
        assert!(u.is_next_end());
    }

    #[test]
    fn scenario_b_minus_one() {
        let mut u = Unserializer::new_no_crc(&[0x20]);
        assert_eq!(u.read_i64(), -1);
    }

    #[test]
    fn scenario_c_multibyte() {
        let mut u = Unserializer::new_no_crc(&[0x68, 0x8F]);
        assert_eq!(u.read_i64(), 1000);
    }

    #[test]
    fn scenario_d_repetition() {
        let mut u = Unserializer::new_no_crc(&[0x47, 0x0A]);
        assert_eq!(u.read_i64(), 7);
        assert_eq!(u.read_i64(), 7);
        assert_eq!(u.read_i64(), 7);
        assert!(u.is_next_end());
    }

    #[test]
    fn scenario_e_word() {
        let mut u = Unserializer::new_no_crc(&[0x11, 0x48, 0x69]);
        assert!(u.is_next_string());
        let mut buf = [0u8; 16];
        let len = u.read_into(&mut buf);
        assert_eq!(len, 2);
        assert_eq!(&buf[..len], b"Hi");
    }

    #[test]
    fn string_is_bracketed_in_output() {
        let mut s: FixedSerializer<64> = FixedSerializer::new();
        s.write_string("ab");
        s.finalize();
        let mut u = Unserializer::new_no_crc(s.as_bytes());
        let mut buf = [0u8; 16];
        let logical = u.read_into(&mut buf);
        assert_eq!(logical, 2);
        assert_eq!(&buf[..4], b"\"ab\"");
    }

    #[test]
    fn crc_roundtrip_detects_ok_and_mismatch() {
        let mut s: FixedSerializer<64> = FixedSerializer::new();
        s.write_i64(42);
        s.write_crc();
        let good = s.as_bytes().to_vec();
        let (_u, status) = Unserializer::new_take_crc(&good);
        assert_eq!(status, CrcStatus::Ok);

        let mut bad = good.clone();
        bad[0] ^= 0xFF;
        let (_u, status) = Unserializer::new_take_crc(&bad);
        assert_eq!(status, CrcStatus::Mismatch);
    }

    #[test]
    fn ascii_roundtrip_numbers_and_words() {
        let mut u = Unserializer::new_ascii(b"1 2 hello \"a b\"");
        assert_eq!(u.read_i64(), 1);
        assert_eq!(u.read_i64(), 2);
        let mut buf = [0u8; 16];
        let len = u.read_into(&mut buf);
        assert_eq!(&buf[..len], b"hello");
        let len = u.read_into(&mut buf);
        assert_eq!(len, 3);
        assert_eq!(&buf[..5], b"\"a b\"");
        assert!(u.is_next_end());
    }

    #[test]
    fn transcoding_binary_to_ascii_identity() {
        let mut src: FixedSerializer<64> = FixedSerializer::new();
        src.write_i64(7);
        src.write_word("hi");
        src.write_string("a b");
        src.finalize();

        let mut ascii_dst = GenericSerializer::<FixedBuf<128>>::new_ascii();
        let mut reader = Unserializer::new_no_crc(src.as_bytes());
        reader.to_serializer_all(&mut ascii_dst);
        ascii_dst.finalize();

        let mut bin_dst: FixedSerializer<64> = FixedSerializer::new();
        let mut ascii_reader = Unserializer::new_ascii(ascii_dst.as_bytes());
        ascii_reader.to_serializer_all(&mut bin_dst);
        bin_dst.finalize();

        assert_eq!(bin_dst.as_bytes(), src.as_bytes());
    }
}
