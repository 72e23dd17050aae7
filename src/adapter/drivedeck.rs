//! Asynchronous/cyclic family: DriveDeck Sport W4 adapters.
//!
//! The adapter pushes a multiplexed stream of responses after a one-time
//! setup. Handshake metadata ('B'-prefixed status frames plus a
//! 'C'-prefixed protocol announcement) establishes vehicle identity; two
//! supported-capability responses must arrive and be merged before the
//! single cyclic polling command is synthesized. After that, measurement
//! frames flow without further requests, sustained by a periodic
//! keep-alive re-issue of the cyclic command.

use crate::adapter::AdapterProtocol;
use crate::command::Command;
use crate::error::DecodeError;
use crate::pid::{hex_to_bytes, supported_from_bitmask, DecodedMeasurement, Pid};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RESPONSE_PREFIX: char = 'B';
const PROTOCOL_PREFIX: char = 'C';
const CYCLIC_TOKEN_SEPARATOR: char = '<';

/// Offset between standard OBD parameter codes and the DriveDeck request
/// identifiers (e.g. RPM 0x19 = 0x0C + 0x0D).
const DRIVEDECK_PID_OFFSET: u8 = 0x0D;

/// Shortest well-formed capability frame: `B70` + group + 4-byte bitmask
/// as hex text. Anything shorter is a corrupted receive.
const MIN_CAPABILITY_FRAME: usize = 13;
/// Shortest well-formed measurement frame: `B` + identifier + one value
/// byte as hex text.
const MIN_PID_FRAME: usize = 5;

/// How often the cyclic command is re-issued to keep the push stream
/// alive.
const CYCLE_RESEND_INTERVAL: Duration = Duration::from_secs(60);

/// Transport variant announced by the adapter during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportVariant {
    Can11Bit500k,
    Can11Bit250k,
    Can29Bit500k,
    Can29Bit250k,
    KwpSlow,
    KwpFast,
    Iso9141,
}

impl TransportVariant {
    fn from_announcement(code: u32) -> Option<Self> {
        match code {
            1 => Some(TransportVariant::Can11Bit500k),
            2 => Some(TransportVariant::Can11Bit250k),
            3 => Some(TransportVariant::Can29Bit500k),
            4 => Some(TransportVariant::Can29Bit250k),
            5 => Some(TransportVariant::KwpSlow),
            6 => Some(TransportVariant::KwpFast),
            7 => Some(TransportVariant::Iso9141),
            _ => None,
        }
    }
}

pub struct DriveDeckProtocol {
    variant: Option<TransportVariant>,
    vin: Option<String>,
    supported: HashSet<Pid>,
    capability_responses_seen: u8,
    cycle_command: Option<Command>,
    pending: VecDeque<Command>,
    last_cycle_sent: Option<Instant>,
    cycle_resend_interval: Duration,
    logged_ids: HashSet<String>,
}

impl Default for DriveDeckProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveDeckProtocol {
    pub fn new() -> Self {
        let mut pending = VecDeque::new();
        // A lone carriage return wakes the adapter up.
        pending.push_back(Command::new("wake-up", "").fire_and_forget());

        Self {
            variant: None,
            vin: None,
            supported: HashSet::new(),
            capability_responses_seen: 0,
            cycle_command: None,
            pending,
            last_cycle_sent: None,
            cycle_resend_interval: CYCLE_RESEND_INTERVAL,
            logged_ids: HashSet::new(),
        }
    }

    /// Shrink the keep-alive interval (test hook).
    pub fn with_cycle_resend_interval(mut self, interval: Duration) -> Self {
        self.cycle_resend_interval = interval;
        self
    }

    pub fn vin(&self) -> Option<&str> {
        self.vin.as_deref()
    }

    pub fn transport_variant(&self) -> Option<TransportVariant> {
        self.variant
    }

    pub fn supported_pids(&self) -> &HashSet<Pid> {
        &self.supported
    }

    fn process_vin(&mut self, vin: &str) {
        info!("VIN is: {vin}");
        self.vin = Some(vin.to_string());
    }

    fn determine_protocol(&mut self, announcement: &str) {
        let announcement = announcement.trim();
        if announcement.is_empty() {
            return;
        }
        let code = match announcement.parse::<u32>() {
            Ok(code) => code,
            Err(err) => {
                warn!("unparseable protocol announcement {announcement:?}: {err}");
                return;
            }
        };
        if let Some(variant) = TransportVariant::from_announcement(code) {
            info!("negotiated transport variant: {variant:?}");
            self.variant = Some(variant);
        }
    }

    /// Merge one supported-capability response. The cyclic command is
    /// synthesized once exactly two responses have been merged; the set is
    /// frozen afterwards.
    fn process_supported_capabilities(&mut self, frame: &str) {
        if frame.len() < MIN_CAPABILITY_FRAME {
            debug!("capability response too small: {} chars", frame.len());
            return;
        }
        if self.capability_responses_seen >= 2 {
            debug!("capability set already frozen, ignoring {frame:?}");
            return;
        }

        let group = match u8::from_str_radix(&frame[3..5], 16) {
            Ok(group) => group,
            Err(_) => {
                warn!("capability response with non-hex group: {frame:?}");
                return;
            }
        };
        let mask = match hex_to_bytes(&frame[5..MIN_CAPABILITY_FRAME]) {
            Ok(mask) => mask,
            Err(err) => {
                warn!("capability response with non-hex bitmask: {err}");
                return;
            }
        };

        self.supported.extend(supported_from_bitmask(group, &mask));
        info!("supported PIDs: {:?}", self.supported);

        self.capability_responses_seen += 1;
        if self.capability_responses_seen == 2 {
            info!("received two capability responses, creating cycle command");
            self.create_and_queue_cycle_command();
        }
    }

    fn create_and_queue_cycle_command(&mut self) {
        let mut request = String::from("a17");
        for pid in Pid::ALL {
            if !self.supported.is_empty() && !self.supported.contains(&pid) {
                debug!("PID {:?} not supported, skipping", pid);
                continue;
            }
            request.push_str(&format!("{:02X}", pid.code() + DRIVEDECK_PID_OFFSET));
        }

        let cycle = Command::new("cycle", request).fire_and_forget();
        debug!("static cycle command: {}", cycle.request());
        self.cycle_command = Some(cycle.clone());
        self.pending.push_back(cycle);
    }

    fn measurement_pid(id: &str) -> Option<Pid> {
        // Response identifiers do not line up with request identifiers;
        // this table reproduces the adapter's observed behavior.
        match id {
            "41" => Some(Pid::Speed),
            "42" => Some(Pid::Maf),
            "40" | "51" => Some(Pid::Rpm),
            "49" => Some(Pid::IntakePressure),
            "52" => Some(Pid::IntakeTemperature),
            _ => None,
        }
    }

    fn one_time_pid_log(&mut self, id: &str, frame: &str) {
        if self.logged_ids.insert(id.to_string()) {
            info!("first response for PID {id}: {frame:?}");
        }
    }

    fn process_measurement(
        &mut self,
        id: &str,
        frame: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DecodedMeasurement>, DecodeError> {
        if frame.len() < MIN_PID_FRAME {
            // A corrupted receive; drop it as noise.
            return Err(DecodeError::NoData);
        }

        let value_text: &str = frame[3..]
            .split(CYCLIC_TOKEN_SEPARATOR)
            .next()
            .unwrap_or_default();
        if value_text.is_empty() {
            return Ok(None);
        }

        let pid = Self::measurement_pid(id)
            .ok_or_else(|| DecodeError::UnknownIdentifier(id.to_string()))?;

        self.one_time_pid_log(id, frame);

        let data = hex_to_bytes(value_text)?;
        let value = pid.decode(&data)?;

        Ok(Some(DecodedMeasurement {
            pid,
            value,
            timestamp: at,
        }))
    }
}

impl AdapterProtocol for DriveDeckProtocol {
    fn name(&self) -> &'static str {
        "DriveDeck"
    }

    fn supports_device(&self, device_name: &str) -> bool {
        let name = device_name.to_lowercase();
        name.contains("drivedeck") && name.contains("w4")
    }

    fn initialization_commands(&mut self) -> Vec<Command> {
        // The handshake is push-driven; everything goes through the
        // pending queue and the cyclic poll.
        Vec::new()
    }

    fn process_initialization_command(&mut self, _cmd: &Command) {}

    fn connection_verified(&self) -> bool {
        self.vin.is_some() || self.variant.is_some()
    }

    fn poll_next_command(&mut self) -> Option<Command> {
        if let Some(cmd) = self.pending.pop_front() {
            if cmd.name() == "cycle" {
                self.last_cycle_sent = Some(Instant::now());
                info!("sending cyclic command, data should be received now");
            }
            return Some(cmd);
        }

        // Re-issue the cycle command once in a while to keep the push
        // stream subscribed.
        let cycle = self.cycle_command.as_ref()?;
        if self.variant.is_some()
            && self
                .last_cycle_sent
                .is_some_and(|sent| sent.elapsed() >= self.cycle_resend_interval)
        {
            self.last_cycle_sent = Some(Instant::now());
            info!("re-sending cyclic command to keep the stream alive");
            return Some(cycle.clone());
        }

        None
    }

    fn expected_init_period(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle_data_frame(
        &mut self,
        frame: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DecodedMeasurement>, DecodeError> {
        if frame.is_empty() {
            return Ok(None);
        }
        // Lossy decoding turns a corrupted byte into a multi-byte
        // replacement character; the identifier slicing below assumes
        // ASCII, so such a frame is discarded as noise.
        if !frame.is_ascii() {
            debug!("discarding frame with corrupted bytes: {frame:?}");
            return Ok(None);
        }

        let mut chars = frame.chars();
        match chars.next() {
            Some(RESPONSE_PREFIX) => {
                if frame.len() < 3 {
                    warn!("response with too few bytes, length {}", frame.len());
                    return Ok(None);
                }
                let id = &frame[1..3];
                match id {
                    "14" => {
                        debug!("status: connecting");
                        Ok(None)
                    }
                    "15" => {
                        self.process_vin(&frame[3..]);
                        Ok(None)
                    }
                    "70" => {
                        self.process_supported_capabilities(frame);
                        Ok(None)
                    }
                    "71" => {
                        debug!("discovered control units");
                        Ok(None)
                    }
                    "31" => {
                        debug!("engine: on");
                        Ok(None)
                    }
                    "32" => {
                        debug!("engine: off");
                        Ok(None)
                    }
                    _ => self.process_measurement(id, frame, at),
                }
            }
            Some(PROTOCOL_PREFIX) => {
                self.determine_protocol(&frame[1..]);
                Ok(None)
            }
            Some(other) => Err(DecodeError::UnknownIdentifier(other.to_string())),
            None => Ok(None),
        }
    }
}
