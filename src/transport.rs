//! Transport abstraction over the physical adapter link.
//!
//! The engine does not own the Bluetooth socket. The surrounding application
//! injects a pair of byte-stream halves once, before any command runs, and
//! tears the session down by closing the underlying channel. Read side and
//! write side are guarded by independent locks so that initialization and
//! polling callers can never interleave partial writes or reads.

use crate::error::TransportError;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Readable half of the adapter link.
///
/// `read_byte` blocks until a byte arrives or the stream closes;
/// `bytes_available` must never block (the executor uses it to bound the
/// wait with its own deadline).
pub trait ReadHalf: Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Blocking single-byte read. `Ok(None)` means the stream closed.
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError>;
}

/// Writable half of the adapter link.
pub trait WriteHalf: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;
}

/// The injected channel pair, each half behind its own lock.
///
/// The executor's protocol guarantees exactly one write followed by one
/// read per command, so the locks never contend in practice; they exist to
/// keep any other logical caller from touching the line mid-command.
pub struct ChannelPair {
    input: Mutex<Box<dyn ReadHalf>>,
    output: Mutex<Box<dyn WriteHalf>>,
}

impl ChannelPair {
    pub fn new(input: Box<dyn ReadHalf>, output: Box<dyn WriteHalf>) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    /// Acquire the read-side lock.
    pub fn input(&self) -> MutexGuard<'_, Box<dyn ReadHalf>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the write-side lock.
    pub fn output(&self) -> MutexGuard<'_, Box<dyn WriteHalf>> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub mod mock {
    //! Scripted in-memory channel for tests and downstream consumers.
    //!
    //! A `ScriptedChannel` hands out a [`ChannelPair`] whose read half pops
    //! from a scripted inbound buffer and whose write half records outbound
    //! bytes. Closing the script unblocks any pending read with
    //! end-of-stream, mirroring how a Bluetooth teardown unblocks the
    //! engine.

    use super::{ChannelPair, ReadHalf, WriteHalf};
    use crate::error::TransportError;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptState {
        inbound: VecDeque<u8>,
        written: Vec<u8>,
        closed: bool,
    }

    /// Test-side handle for scripting responses and inspecting writes.
    #[derive(Clone, Default)]
    pub struct ScriptedChannel {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedChannel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Build the channel pair the engine consumes.
        pub fn channel_pair(&self) -> ChannelPair {
            ChannelPair::new(
                Box::new(ScriptedReader {
                    state: Arc::clone(&self.state),
                }),
                Box::new(ScriptedWriter {
                    state: Arc::clone(&self.state),
                }),
            )
        }

        /// Queue raw inbound bytes.
        pub fn push_bytes(&self, bytes: &[u8]) {
            self.lock().inbound.extend(bytes.iter().copied());
        }

        /// Queue one response frame, appending the `>` prompt terminator.
        pub fn push_frame(&self, frame: &str) {
            self.push_bytes(frame.as_bytes());
            self.push_bytes(b">");
        }

        /// Close the inbound stream; pending reads see end-of-stream.
        pub fn close(&self) {
            self.lock().closed = true;
        }

        /// Everything the engine has written so far.
        pub fn written(&self) -> Vec<u8> {
            self.lock().written.clone()
        }

        /// Outbound data split at carriage returns, for request assertions.
        pub fn written_lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.written())
                .split('\r')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    struct ScriptedReader {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ReadHalf for ScriptedReader {
        fn bytes_available(&mut self) -> Result<usize, TransportError> {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(state.inbound.len())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
            loop {
                {
                    let mut state =
                        self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(byte) = state.inbound.pop_front() {
                        return Ok(Some(byte));
                    }
                    if state.closed {
                        return Ok(None);
                    }
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    struct ScriptedWriter {
        state: Arc<Mutex<ScriptState>>,
    }

    impl WriteHalf for ScriptedWriter {
        fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(TransportError::StreamClosed);
            }
            state.written.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedChannel;

    #[test]
    fn scripted_channel_records_writes() {
        let script = ScriptedChannel::new();
        let pair = script.channel_pair();

        pair.output().write_all(b"ATZ\r").unwrap();
        pair.output().write_all(b"0100\r").unwrap();

        assert_eq!(script.written_lines(), vec!["ATZ", "0100"]);
    }

    #[test]
    fn scripted_channel_serves_inbound_bytes() {
        let script = ScriptedChannel::new();
        let pair = script.channel_pair();
        script.push_bytes(b"OK");

        let mut input = pair.input();
        assert_eq!(input.bytes_available().unwrap(), 2);
        assert_eq!(input.read_byte().unwrap(), Some(b'O'));
        assert_eq!(input.read_byte().unwrap(), Some(b'K'));
    }

    #[test]
    fn closed_channel_reports_end_of_stream() {
        let script = ScriptedChannel::new();
        let pair = script.channel_pair();
        script.close();

        assert_eq!(pair.input().read_byte().unwrap(), None);
        assert!(pair.output().write_all(b"AT\r").is_err());
    }
}
