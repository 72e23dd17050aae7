//! Synchronous request/response family: ELM327 and compatible clones.
//!
//! One command, one reply. The handshake is the usual AT sequence (reset,
//! echo/linefeed/space suppression, automatic protocol selection) followed
//! by a mode-01 supported-PIDs probe whose bitmask both verifies the
//! connection and filters the measurement list.

use crate::adapter::AdapterProtocol;
use crate::command::Command;
use crate::error::DecodeError;
use crate::pid::{
    decode_mode01_frame, hex_to_bytes, supported_from_bitmask, DecodedMeasurement, Pid,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Device-name fragments announced by common ELM-family dongles.
const DEVICE_NAME_HINTS: [&str; 3] = ["elm327", "obdii", "obdlink"];

pub struct Elm327Protocol {
    supported: HashSet<Pid>,
    verified: bool,
}

impl Default for Elm327Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Elm327Protocol {
    pub fn new() -> Self {
        Self {
            supported: HashSet::new(),
            verified: false,
        }
    }

    /// Supported quantities discovered during the handshake. Empty until
    /// a `4100..` bitmask has been observed.
    pub fn supported_pids(&self) -> &HashSet<Pid> {
        &self.supported
    }

    fn process_supported_bitmask(&mut self, frame: &str) {
        match hex_to_bytes(&frame[4..]) {
            Ok(mask) => {
                let pids = supported_from_bitmask(0x00, &mask);
                info!("supported PIDs: {:?}", pids);
                self.supported.extend(pids);
                self.verified = true;
            }
            Err(err) => warn!("unreadable supported-PID bitmask {frame:?}: {err}"),
        }
    }
}

impl AdapterProtocol for Elm327Protocol {
    fn name(&self) -> &'static str {
        "ELM327"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        let name = device_name.to_lowercase();
        DEVICE_NAME_HINTS.iter().any(|hint| name.contains(hint))
    }

    fn initialization_commands(&mut self) -> Vec<Command> {
        vec![
            // The reset banner carries no parseable data and some clones
            // never answer it at all.
            Command::new("reset", "ATZ").no_data_probe().response_optional(),
            Command::new("echo off", "ATE0"),
            Command::new("line feeds off", "ATL0"),
            Command::new("spaces off", "ATS0"),
            Command::new("select auto protocol", "ATSP0"),
            Command::new("supported PIDs", "0100").expecting_prefix("4100"),
        ]
    }

    fn process_initialization_command(&mut self, cmd: &Command) {
        let Some(frame) = cmd.raw_response() else {
            return;
        };

        if frame.starts_with("4100") {
            self.process_supported_bitmask(frame);
        } else if frame.contains("ELM327") {
            debug!("adapter banner: {frame}");
        } else if frame.contains("OK") {
            debug!("{} acknowledged", cmd.name());
        } else {
            debug!("unrecognized handshake reply for {}: {frame:?}", cmd.name());
        }
    }

    fn connection_verified(&self) -> bool {
        self.verified
    }

    fn request_commands(&mut self) -> Vec<Command> {
        Pid::ALL
            .iter()
            .copied()
            .filter(|pid| self.supported.is_empty() || self.supported.contains(pid))
            .map(|pid| {
                Command::new(pid.name(), format!("01{}", pid.identifier()))
                    .expecting_prefix(format!("41{}", pid.identifier()))
            })
            .collect()
    }

    fn handle_data_frame(
        &mut self,
        frame: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DecodedMeasurement>, DecodeError> {
        decode_mode01_frame(frame, at).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn finished_command(name: &'static str, request: &str, response: &str) -> Command {
        let mut cmd = Command::new(name, request.to_string());
        cmd.mark_running();
        cmd.attach_response(response.to_string(), Utc::now());
        cmd
    }

    #[test]
    fn device_name_matching() {
        let protocol = Elm327Protocol::new();
        assert!(protocol.supports_device("OBDII ELM327 v1.5"));
        assert!(protocol.supports_device("OBDLink MX+"));
        assert!(!protocol.supports_device("DriveDeck Sport W4"));
    }

    #[test]
    fn handshake_starts_with_reset_and_ends_with_pid_probe() {
        let mut protocol = Elm327Protocol::new();
        let cmds = protocol.initialization_commands();

        let requests: Vec<&str> = cmds.iter().map(|c| c.request()).collect();
        assert_eq!(
            requests,
            vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATSP0", "0100"]
        );
        assert!(cmds[0].is_no_data_probe());
        assert!(!cmds[0].response_always_required());
        assert_eq!(cmds[5].expected_prefix(), Some("4100"));
    }

    #[test]
    fn bitmask_response_verifies_and_filters_requests() {
        let mut protocol = Elm327Protocol::new();
        assert!(!protocol.connection_verified());

        // Speed (bit 13) and RPM (bit 12) only.
        let cmd = finished_command("supported PIDs", "0100", "41000018000");
        // Odd-length payload is noise; verification must not happen.
        protocol.process_initialization_command(&cmd);
        assert!(!protocol.connection_verified());

        let cmd = finished_command("supported PIDs", "0100", "410000180000");
        protocol.process_initialization_command(&cmd);
        assert!(protocol.connection_verified());

        let requests: Vec<String> = protocol
            .request_commands()
            .iter()
            .map(|c| c.request().to_string())
            .collect();
        assert_eq!(requests, vec!["010D", "010C"]);
    }

    #[test]
    fn ok_and_banner_replies_do_not_verify() {
        let mut protocol = Elm327Protocol::new();
        protocol.process_initialization_command(&finished_command("reset", "ATZ", "ELM327 v1.5"));
        protocol.process_initialization_command(&finished_command("echo off", "ATE0", "OK"));
        assert!(!protocol.connection_verified());
    }

    #[test]
    fn all_pids_polled_until_a_bitmask_narrows_the_list() {
        let mut protocol = Elm327Protocol::new();
        assert_eq!(protocol.request_commands().len(), Pid::ALL.len());
    }

    #[test]
    fn data_frames_decode_through_the_catalogue() {
        let mut protocol = Elm327Protocol::new();
        let m = protocol
            .handle_data_frame("410C1AF8", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(m.pid, Pid::Rpm);
        assert_eq!(m.value, 1726.0);
    }
}
