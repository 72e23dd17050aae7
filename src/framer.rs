//! Response framing for prompt-terminated adapter output.
//!
//! OBD adapters do not length-prefix their responses; the only reliable
//! delimiter is the trailing prompt character. Some adapters additionally
//! pad the payload with spaces between hex byte pairs for readability, so
//! the framer filters a designated filler character while accumulating.

use crate::error::TransportError;
use crate::transport::ReadHalf;
use tracing::debug;

/// Default prompt terminator sent by ELM327-style adapters.
pub const DEFAULT_TERMINATOR: u8 = b'>';
/// Default inter-byte padding filtered out of the payload.
pub const DEFAULT_FILLER: u8 = b' ';

/// Extracts discrete response frames from the raw input stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamFramer {
    terminator: u8,
    filler: u8,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATOR, DEFAULT_FILLER)
    }
}

impl StreamFramer {
    pub fn new(terminator: u8, filler: u8) -> Self {
        Self { terminator, filler }
    }

    /// Read one complete frame, blocking until the terminator arrives.
    ///
    /// All intervening bytes except the filler are accumulated; the result
    /// is trimmed of surrounding whitespace (carriage returns and line
    /// feeds the adapter emits around the payload). The wait is unbounded;
    /// callers enforce their own deadline before invoking this.
    pub fn read_frame(&self, input: &mut dyn ReadHalf) -> Result<String, TransportError> {
        let mut buf = Vec::new();

        loop {
            match input.read_byte()? {
                Some(byte) if byte == self.terminator => break,
                Some(byte) if byte == self.filler => continue,
                Some(byte) => buf.push(byte),
                None => {
                    debug!("input stream closed mid-frame after {} bytes", buf.len());
                    return Err(TransportError::StreamClosed);
                }
            }
        }

        let frame = String::from_utf8_lossy(&buf).trim().to_string();
        debug!("RX frame: {:?}", frame);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedChannel;

    fn read_one(script: &ScriptedChannel) -> Result<String, TransportError> {
        let pair = script.channel_pair();
        let mut input = pair.input();
        StreamFramer::default().read_frame(&mut **input)
    }

    #[test]
    fn frame_is_payload_until_terminator() {
        let script = ScriptedChannel::new();
        script.push_bytes(b"41 0D 2A\r\r>");
        assert_eq!(read_one(&script).unwrap(), "410D2A");
    }

    #[test]
    fn filler_bytes_are_filtered_wherever_they_appear() {
        let script = ScriptedChannel::new();
        script.push_bytes(b"  4 1 0C1AF8  \r>");
        assert_eq!(read_one(&script).unwrap(), "410C1AF8");
    }

    #[test]
    fn stops_at_first_terminator_only() {
        let script = ScriptedChannel::new();
        script.push_bytes(b"OK\r>ELM327\r>");
        assert_eq!(read_one(&script).unwrap(), "OK");

        // The second frame is still intact on the stream.
        assert_eq!(read_one(&script).unwrap(), "ELM327");
    }

    #[test]
    fn closed_stream_before_terminator_is_an_error() {
        let script = ScriptedChannel::new();
        script.push_bytes(b"410D");
        script.close();

        match read_one(&script) {
            Err(TransportError::StreamClosed) => {}
            other => panic!("expected StreamClosed, got {other:?}"),
        }
    }

    #[test]
    fn empty_frame_yields_empty_string() {
        let script = ScriptedChannel::new();
        script.push_bytes(b"\r\r>");
        assert_eq!(read_one(&script).unwrap(), "");
    }
}
