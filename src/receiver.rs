//! Byte-at-a-time stream framing.
//!
//! Demultiplexes a raw, untrusted transport stream into complete messages,
//! each classified as binary DBF or plain ASCII text, tolerating noise and
//! recovering from stalled partial messages via caller-driven timeouts.

use crate::ascii;
use crate::subcode::{BEGIN_BYTE, END_BYTE};
use crate::trace::trace_warn;

/// Receiver buffer capacity.
pub const RECEIVER_BUFFER_SIZE: usize = 1024;
/// Default inactivity timeout for a partially received message.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 5000;
/// How long the receiver must see no further noise before reinterpreting
/// the next byte as a potential message start.
pub const NOISE_QUIESCENCE_MS: u64 = 100;

/// Receiver state, keyed on incoming byte per the framing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiverState {
    Initial,
    ReceivingTxt,
    ReceivingMessage,
    MessageReady,
    TxtReceived,
    DbfReceived,
    DbfReceivedMoreExpected,
    IgnoreInput,
    Error,
}

/// The wire dialect of a finished message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Encoding {
    Binary,
    Ascii,
    None,
}

/// Receiver-level error conditions. Both are logged; the receiver self-heals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiverError {
    /// The message buffer filled before a terminator arrived; discarded.
    BufferOverflow,
    /// A partial message aged past the configured timeout; discarded.
    Timeout,
    /// A byte arrived while in a terminal state without an intervening
    /// `reset()`.
    NotReset,
}

impl core::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReceiverError::BufferOverflow => write!(f, "receiver buffer overflow"),
            ReceiverError::Timeout => write!(f, "receiver message timeout"),
            ReceiverError::NotReset => write!(f, "receiver byte arrived in a terminal state without reset"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ReceiverError {}

/// Outcome of feeding one byte to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProcessOutcome {
    /// The message is not yet complete.
    Pending,
    /// A message of this length is ready; see [`Receiver::message`].
    Complete(usize),
    /// A protocol-level error occurred; the receiver may have self-healed.
    Error(ReceiverError),
}

/// A byte-level stream framer with a fixed internal buffer.
pub struct Receiver {
    buf: heapless::Vec<u8, RECEIVER_BUFFER_SIZE>,
    msgtimestamp: u64,
    state: ReceiverState,
    timeout_ms: u64,
    noise_quiescence_ms: u64,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    /// A fresh receiver with the default 5 s message timeout.
    pub fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
            msgtimestamp: 0,
            state: ReceiverState::Initial,
            timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            noise_quiescence_ms: NOISE_QUIESCENCE_MS,
        }
    }

    /// A fresh receiver with a caller-chosen message timeout.
    pub fn with_timeout(timeout_ms: u64) -> Self {
        let mut r = Self::new();
        r.timeout_ms = timeout_ms;
        r
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// The bytes of the most recently completed message.
    pub fn message(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// The wire dialect of the most recently completed message.
    pub fn encoding(&self) -> Encoding {
        match self.state {
            ReceiverState::DbfReceived | ReceiverState::DbfReceivedMoreExpected => Encoding::Binary,
            ReceiverState::TxtReceived => Encoding::Ascii,
            _ => Encoding::None,
        }
    }

    /// Feed one byte of the transport stream.
    pub fn process_byte(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        match self.state {
            ReceiverState::Initial => self.process_initial(c, now_ms),
            ReceiverState::ReceivingTxt => self.process_receiving_txt(c, now_ms),
            ReceiverState::ReceivingMessage => self.process_receiving_message(c, now_ms),
            ReceiverState::IgnoreInput => self.process_ignore_input(c, now_ms),
            ReceiverState::TxtReceived
            | ReceiverState::DbfReceived
            | ReceiverState::DbfReceivedMoreExpected
            | ReceiverState::MessageReady
            | ReceiverState::Error => {
                trace_warn!("dbf receiver: byte arrived in a terminal state without reset");
                ProcessOutcome::Error(ReceiverError::NotReset)
            }
        }
    }

    fn process_initial(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        match c {
            BEGIN_BYTE => {
                self.buf.clear();
                self.msgtimestamp = now_ms;
                self.state = ReceiverState::ReceivingMessage;
                ProcessOutcome::Pending
            }
            END_BYTE | b'\r' | b'\n' => ProcessOutcome::Pending,
            c if ascii::is_printable(c) => {
                self.buf.clear();
                let _ = self.buf.push(c);
                self.msgtimestamp = now_ms;
                self.state = ReceiverState::ReceivingTxt;
                ProcessOutcome::Pending
            }
            _ => {
                self.msgtimestamp = now_ms;
                self.state = ReceiverState::IgnoreInput;
                ProcessOutcome::Pending
            }
        }
    }

    fn process_receiving_txt(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        match c {
            BEGIN_BYTE => {
                trace_warn!("dbf receiver: BEGIN while receiving text, restarting as a binary message");
                self.buf.clear();
                self.msgtimestamp = now_ms;
                self.state = ReceiverState::ReceivingMessage;
                ProcessOutcome::Pending
            }
            END_BYTE => {
                trace_warn!("dbf receiver: END while receiving text, discarding");
                self.buf.clear();
                self.state = ReceiverState::Initial;
                ProcessOutcome::Pending
            }
            b'\r' | b'\n' => {
                self.state = ReceiverState::TxtReceived;
                ProcessOutcome::Complete(self.buf.len())
            }
            c if ascii::is_printable(c) => {
                if self.buf.push(c).is_ok() {
                    ProcessOutcome::Pending
                } else {
                    self.state = ReceiverState::TxtReceived;
                    ProcessOutcome::Complete(self.buf.len())
                }
            }
            _ => {
                self.msgtimestamp = now_ms;
                self.state = ReceiverState::IgnoreInput;
                ProcessOutcome::Pending
            }
        }
    }

    fn process_receiving_message(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        match c {
            BEGIN_BYTE => {
                if self.buf.is_empty() {
                    self.msgtimestamp = now_ms;
                    ProcessOutcome::Pending
                } else {
                    // The completed message stays in the buffer, readable via
                    // `message()`, until the caller calls `reset()`.
                    let len = self.buf.len();
                    self.msgtimestamp = now_ms;
                    self.state = ReceiverState::DbfReceivedMoreExpected;
                    ProcessOutcome::Complete(len)
                }
            }
            END_BYTE => {
                if self.buf.is_empty() {
                    self.state = ReceiverState::Initial;
                    ProcessOutcome::Pending
                } else {
                    let len = self.buf.len();
                    self.state = ReceiverState::DbfReceived;
                    ProcessOutcome::Complete(len)
                }
            }
            _ => {
                if self.buf.push(c).is_ok() {
                    ProcessOutcome::Pending
                } else {
                    trace_warn!("dbf receiver: buffer overflow receiving message");
                    self.buf.clear();
                    self.state = ReceiverState::Initial;
                    ProcessOutcome::Error(ReceiverError::BufferOverflow)
                }
            }
        }
    }

    fn process_ignore_input(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        if c == BEGIN_BYTE {
            self.buf.clear();
            self.msgtimestamp = now_ms;
            self.state = ReceiverState::ReceivingMessage;
            ProcessOutcome::Pending
        } else {
            self.process_noise(c, now_ms)
        }
    }

    /// A printable or whitespace byte seen while ignoring input is a no-op
    /// and leaves the timestamp untouched; only genuine noise (neither
    /// printable nor whitespace) extends it. Once the *previous* timestamp
    /// is already more than `noise_quiescence_ms` stale, the byte is
    /// reclassified from scratch as if it were the first byte of a new
    /// message, whatever it is.
    fn process_noise(&mut self, c: u8, now_ms: u64) -> ProcessOutcome {
        let quiet = now_ms.saturating_sub(self.msgtimestamp) > self.noise_quiescence_ms;
        if quiet {
            self.process_initial(c, now_ms)
        } else {
            if !(ascii::is_printable(c) || matches!(c, b'\t' | b'\r' | b'\n')) {
                self.msgtimestamp = now_ms;
            }
            ProcessOutcome::Pending
        }
    }

    /// Force a return to `Initial` if a partial message has aged past the
    /// configured timeout without progress.
    pub fn check_timeout(&mut self, now_ms: u64) -> Option<ReceiverError> {
        let partial = matches!(
            self.state,
            ReceiverState::ReceivingMessage | ReceiverState::ReceivingTxt
        );
        if partial && now_ms.saturating_sub(self.msgtimestamp) >= self.timeout_ms {
            trace_warn!("dbf receiver: message timed out");
            self.buf.clear();
            self.state = ReceiverState::Initial;
            Some(ReceiverError::Timeout)
        } else {
            None
        }
    }

    /// Apply the receiver's configured timeout (the default 5 s unless
    /// overridden at construction).
    pub fn tick(&mut self, now_ms: u64) -> Option<ReceiverError> {
        self.check_timeout(now_ms)
    }

    /// Acknowledge a completed message (`TxtReceived`/`DbfReceived`/
    /// `DbfReceivedMoreExpected`) and prepare for the next one. A no-op in
    /// any other state.
    pub fn reset(&mut self) {
        match self.state {
            ReceiverState::DbfReceivedMoreExpected => {
                // The BEGIN byte that completed the previous message already
                // opened this one and stamped the timestamp; the buffer
                // still holds the completed message, so clear it here.
                self.buf.clear();
                self.state = ReceiverState::ReceivingMessage;
            }
            ReceiverState::TxtReceived | ReceiverState::DbfReceived => {
                self.buf.clear();
                self.state = ReceiverState::Initial;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_f_receiver_framing() {
        let mut r = Receiver::new();
        let stream = [0x00u8, 0x47, 0x01, 0x00, 0x48, 0x01];
        let mut completed = Vec::new();
        for &b in &stream {
            if let ProcessOutcome::Complete(len) = r.process_byte(b, 0) {
                completed.push(r.message()[..len].to_vec());
                assert_eq!(r.encoding(), Encoding::Binary);
                r.reset();
            }
        }
        assert_eq!(completed, vec![vec![0x47], vec![0x48]]);
    }

    #[test]
    fn back_to_back_begin_preserves_completed_message() {
        // A BEGIN while a message is already in progress completes the
        // current one (DbfReceivedMoreExpected) and opens the next; the
        // just-completed bytes must still be readable before reset().
        let mut r = Receiver::new();
        let stream = [0x00u8, 0x47, 0x00, 0x48, 0x01];
        let mut completed = Vec::new();
        for &b in &stream {
            if let ProcessOutcome::Complete(len) = r.process_byte(b, 0) {
                completed.push(r.message()[..len].to_vec());
                assert_eq!(r.encoding(), Encoding::Binary);
                r.reset();
            }
        }
        assert_eq!(completed, vec![vec![0x47], vec![0x48]]);
    }

    #[test]
    fn ascii_line_terminates_on_newline() {
        let mut r = Receiver::new();
        for &b in b"hello" {
            assert_eq!(r.process_byte(b, 0), ProcessOutcome::Pending);
        }
        let outcome = r.process_byte(b'\n', 0);
        assert_eq!(outcome, ProcessOutcome::Complete(5));
        assert_eq!(r.message(), b"hello");
        assert_eq!(r.encoding(), Encoding::Ascii);
    }

    #[test]
    fn ignore_input_extends_only_on_genuine_noise() {
        let mut r = Receiver::new();
        // Arbitrary non-printable byte pushes us into IgnoreInput at t=0.
        assert_eq!(r.process_byte(0x02, 0), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::IgnoreInput);

        // A further non-printable, non-whitespace byte at t=50 is genuine
        // noise: it extends the stamp and stays in IgnoreInput.
        assert_eq!(r.process_byte(0x03, 50), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::IgnoreInput);

        // A printable byte at t=100 is not noise: it leaves the stamp at 50
        // untouched (gap since the last extension is only 50ms) and is a
        // silent no-op rather than extending the window.
        assert_eq!(r.process_byte(b'x', 100), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::IgnoreInput);

        // At t=151 the gap since the stamp (50) is finally > 100ms, so the
        // byte is reclassified from scratch as the first char of a text
        // line, same as processFirstChar would.
        assert_eq!(r.process_byte(b'y', 151), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::ReceivingTxt);
        assert_eq!(r.message(), b"y");
    }

    #[test]
    fn quiescent_noise_byte_is_reclassified_not_just_printable_ones() {
        let mut r = Receiver::new();
        assert_eq!(r.process_byte(0x02, 0), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::IgnoreInput);
        // Once quiescent, even a non-printable byte goes back through
        // first-character classification (here: more silence).
        assert_eq!(r.process_byte(0x03, 200), ProcessOutcome::Pending);
        assert_eq!(r.state(), ReceiverState::IgnoreInput);
    }

    #[test]
    fn buffer_overflow_in_message_discards_and_resets() {
        let mut r = Receiver::new();
        r.process_byte(BEGIN_BYTE, 0);
        for _ in 0..RECEIVER_BUFFER_SIZE {
            assert_eq!(r.process_byte(0x47, 0), ProcessOutcome::Pending);
        }
        let outcome = r.process_byte(0x47, 0);
        assert_eq!(outcome, ProcessOutcome::Error(ReceiverError::BufferOverflow));
        assert_eq!(r.state(), ReceiverState::Initial);
    }

    #[test]
    fn timeout_discards_partial_message() {
        let mut r = Receiver::new();
        r.process_byte(BEGIN_BYTE, 0);
        r.process_byte(0x47, 0);
        assert!(r.check_timeout(1000).is_none());
        let fired = r.check_timeout(DEFAULT_MESSAGE_TIMEOUT_MS + 1);
        assert_eq!(fired, Some(ReceiverError::Timeout));
        assert_eq!(r.state(), ReceiverState::Initial);
    }

    #[test]
    fn byte_in_terminal_state_without_reset_is_an_error() {
        let mut r = Receiver::new();
        r.process_byte(BEGIN_BYTE, 0);
        r.process_byte(0x47, 0);
        r.process_byte(END_BYTE, 0);
        assert_eq!(r.state(), ReceiverState::DbfReceived);
        let outcome = r.process_byte(0x00, 0);
        assert_eq!(outcome, ProcessOutcome::Error(ReceiverError::NotReset));
    }
}
