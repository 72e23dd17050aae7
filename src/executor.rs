//! Sequential command execution over the shared channel pair.
//!
//! One thread drives the executor per connection: write a command, wait for
//! the one matching reply, hand the frame to the protocol. The wait is a
//! wall-clock deadline checked at a fixed poll interval; teardown happens
//! by closing the underlying channel, which surfaces here as
//! `StreamClosed`.

use crate::adapter::AdapterProtocol;
use crate::command::{Command, CommandState};
use crate::error::{ExecutionError, TransportError};
use crate::framer::StreamFramer;
use crate::pid::DecodedMeasurement;
use crate::transport::ChannelPair;
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Session connection state, latched one-way per connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    NotEstablished,
    Verified,
    Lost,
}

/// Receives discrete connection-state transitions for relay to the rest of
/// the application (status broadcasting is out of scope here).
pub trait ConnectionListener: Send {
    fn on_state_changed(&self, state: ConnectionState);
}

/// Timing and retry knobs. Defaults match what real ELM-family adapters
/// tolerate; tests shrink them.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Total budget for "any response at all" per command.
    pub response_timeout: Duration,
    /// Granularity of the bounded wait for inbound data.
    pub poll_interval: Duration,
    /// Pause after the adapter reports it is still searching.
    pub searching_pause: Duration,
    /// Consecutive unmatched responses tolerated while stale before the
    /// connection counts as lost.
    pub max_invalid_responses: u8,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(25),
            searching_pause: Duration::from_millis(1000),
            max_invalid_responses: 5,
        }
    }
}

/// Drives commands over the channel pair, one outstanding exchange at a
/// time.
pub struct SequentialExecutor {
    channel: ChannelPair,
    framer: StreamFramer,
    config: ExecutorConfig,
    state: ConnectionState,
    stale: bool,
    invalid_response_count: u8,
    listener: Option<Box<dyn ConnectionListener>>,
}

impl SequentialExecutor {
    pub fn new(channel: ChannelPair) -> Self {
        Self::with_config(channel, ExecutorConfig::default())
    }

    pub fn with_config(channel: ChannelPair, config: ExecutorConfig) -> Self {
        Self {
            channel,
            framer: StreamFramer::default(),
            config,
            state: ConnectionState::NotEstablished,
            stale: false,
            invalid_response_count: 0,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn ConnectionListener>) {
        self.listener = Some(listener);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == ConnectionState::Verified
    }

    /// Run the protocol's ordered setup commands.
    ///
    /// Unmatched responses during the handshake are logged, not escalated:
    /// the stale-counter machinery exists for the steady measurement loop.
    /// A transport failure before verification becomes `AdapterFailed` so
    /// that the selection loop can try the next registered family.
    pub fn execute_initialization_commands(
        &mut self,
        protocol: &mut dyn AdapterProtocol,
    ) -> Result<(), ExecutionError> {
        for mut cmd in protocol.initialization_commands() {
            match self.execute_command(&mut cmd, protocol) {
                Ok(()) => {}
                Err(err @ (ExecutionError::UnmatchedResponse { .. } | ExecutionError::ConnectionLost)) => {
                    warn!("unexpected during initialization: {err}");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Run the protocol's measurement-polling commands once and decode the
    /// finished responses. Decode failures cost one sample each, never the
    /// session.
    pub fn execute_request_commands(
        &mut self,
        protocol: &mut dyn AdapterProtocol,
    ) -> Result<Vec<DecodedMeasurement>, ExecutionError> {
        let mut measurements = Vec::new();

        for mut cmd in protocol.request_commands() {
            self.execute_command(&mut cmd, protocol)?;
            if let Some(measurement) = collect_measurement(protocol, &mut cmd) {
                measurements.push(measurement);
            }
        }

        Ok(measurements)
    }

    /// One cycle of the asynchronous family: send the next queued command
    /// if the protocol has one, then handle at most one pushed frame.
    ///
    /// An empty window is not an error; the adapter simply had nothing to
    /// push yet.
    pub fn poll_cyclic(
        &mut self,
        protocol: &mut dyn AdapterProtocol,
    ) -> Result<Vec<DecodedMeasurement>, ExecutionError> {
        if let Some(mut cmd) = protocol.poll_next_command() {
            cmd.mark_running();
            if let Err(err) = self.send_command(&cmd) {
                return Err(self.transport_failure(protocol.name(), err));
            }
        }

        match self.wait_for_data() {
            Ok(true) => {}
            Ok(false) => return Ok(Vec::new()),
            Err(err) => return Err(self.transport_failure(protocol.name(), err)),
        }

        let frame_result = {
            let mut input = self.channel.input();
            self.framer.read_frame(&mut **input)
        };
        let frame = match frame_result {
            Ok(frame) => frame,
            Err(err) => return Err(self.transport_failure(protocol.name(), err)),
        };

        let mut measurements = Vec::new();
        match protocol.handle_data_frame(&frame, Utc::now()) {
            Ok(Some(measurement)) => measurements.push(measurement),
            Ok(None) => {}
            Err(err) => debug!("ignoring undecodable frame {frame:?}: {err}"),
        }

        if !self.is_verified() && protocol.connection_verified() {
            self.set_state(ConnectionState::Verified);
        }

        Ok(measurements)
    }

    /// Execute one command: exchange, classify, update session state.
    fn execute_command(
        &mut self,
        cmd: &mut Command,
        protocol: &mut dyn AdapterProtocol,
    ) -> Result<(), ExecutionError> {
        if cmd.state() == CommandState::New {
            cmd.mark_running();
            if let Err(err) = self.run_exchange(cmd) {
                return Err(self.transport_failure(protocol.name(), err));
            }
        }

        if !cmd.awaits_response() {
            return Ok(());
        }

        // A tolerated timeout: the command had no response by design.
        // Leaves the stale flag and counter untouched; silence is no
        // evidence either way.
        if cmd.raw_response().is_none() && cmd.state() == CommandState::Running {
            debug!("no response for optional command {}", cmd.name());
            return Ok(());
        }

        match cmd.state() {
            CommandState::UnmatchedResult => {
                warn!(
                    "unmatched response for {}, expected prefix {:?}",
                    cmd.name(),
                    cmd.expected_prefix()
                );
                if self.stale {
                    self.invalid_response_count += 1;
                    if self.invalid_response_count >= self.config.max_invalid_responses {
                        self.set_state(ConnectionState::Lost);
                        return Err(ExecutionError::ConnectionLost);
                    }
                }
                self.stale = true;
                Err(ExecutionError::UnmatchedResponse {
                    expected: cmd.expected_prefix().unwrap_or_default().to_string(),
                })
            }
            CommandState::Searching => {
                info!("adapter still searching, waiting a bit");
                std::thread::sleep(self.config.searching_pause);
                Ok(())
            }
            CommandState::Running => {
                if !self.is_verified() && !cmd.is_no_data_probe() {
                    protocol.process_initialization_command(cmd);
                    if protocol.connection_verified() {
                        self.set_state(ConnectionState::Verified);
                    }
                } else {
                    cmd.mark_finished();
                    if self.stale {
                        self.stale = false;
                        self.invalid_response_count = 0;
                    }
                }
                Ok(())
            }
            CommandState::New | CommandState::Finished | CommandState::ExecutionError => Ok(()),
        }
    }

    /// Write the request, then wait for and read the one reply.
    fn run_exchange(&mut self, cmd: &mut Command) -> Result<(), TransportError> {
        debug!("sending command {} / {}", cmd.name(), cmd.request());
        self.send_command(cmd)?;

        if !cmd.awaits_response() {
            return Ok(());
        }

        let mut input = self.channel.input();

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if input.bytes_available()? > 0 {
                break;
            }
            if Instant::now() >= deadline {
                if cmd.response_always_required() {
                    return Err(TransportError::Timeout {
                        waited_ms: self.config.response_timeout.as_millis() as u64,
                    });
                }
                return Ok(());
            }
            std::thread::sleep(self.config.poll_interval);
        }

        let frame = self.framer.read_frame(&mut **input)?;
        cmd.attach_response(frame.clone(), Utc::now());

        if is_searching(&frame) || cmd.is_no_data_probe() {
            cmd.mark_searching();
        } else if !cmd.matches(&frame) {
            cmd.mark_unmatched();
        }

        Ok(())
    }

    fn send_command(&self, cmd: &Command) -> Result<(), TransportError> {
        let mut output = self.channel.output();
        output.write_all(cmd.request().as_bytes())?;
        output.write_all(b"\r")?;
        output.flush()
    }

    /// Bounded wait for any inbound data. `Ok(false)` = window elapsed.
    fn wait_for_data(&self) -> Result<bool, TransportError> {
        let mut input = self.channel.input();
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            if input.bytes_available()? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Reinterpret a transport failure according to session phase: before
    /// verification it means "wrong adapter guess", afterwards it is real.
    fn transport_failure(&mut self, adapter: &str, err: TransportError) -> ExecutionError {
        if !self.is_verified() {
            debug!("transport failure before verification: {err}");
            return ExecutionError::AdapterFailed {
                adapter: adapter.to_string(),
                source: err,
            };
        }
        if err.is_fatal() {
            self.set_state(ConnectionState::Lost);
        }
        ExecutionError::Transport(err)
    }

    fn set_state(&mut self, state: ConnectionState) {
        // Verified is latched; only loss supersedes it.
        if self.state == state
            || (self.state == ConnectionState::Verified && state != ConnectionState::Lost)
            || self.state == ConnectionState::Lost
        {
            return;
        }
        info!("connection state: {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(listener) = &self.listener {
            listener.on_state_changed(state);
        }
    }

    #[cfg(test)]
    fn stale_counter(&self) -> (bool, u8) {
        (self.stale, self.invalid_response_count)
    }
}

fn is_searching(frame: &str) -> bool {
    frame.contains("SEARCHING") || frame.contains("STOPPED")
}

/// Decode a finished command's response into a measurement.
///
/// A decode failure finalizes the command as an execution error and costs
/// that sample only; the session stays alive.
fn collect_measurement(
    protocol: &mut dyn AdapterProtocol,
    cmd: &mut Command,
) -> Option<DecodedMeasurement> {
    if cmd.state() != CommandState::Finished {
        return None;
    }
    let frame = cmd.raw_response()?.to_owned();
    let at = cmd.result_time().unwrap_or_else(Utc::now);

    match protocol.handle_data_frame(&frame, at) {
        Ok(measurement) => measurement,
        Err(err) => {
            cmd.mark_execution_error();
            warn!("dropping sample for {}: {err}", cmd.name());
            None
        }
    }
}
