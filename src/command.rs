//! One OBD-II request/response exchange and its per-attempt lifecycle.
//!
//! A `Command` is created fresh per execution attempt, handed to the
//! executor for the duration of that attempt, and discarded once its
//! outcome has been reported. State lives in a plain field because
//! ownership is exclusive; there is never a second observer of a running
//! command.

use chrono::{DateTime, Utc};

/// Lifecycle of a single execution attempt.
///
/// `New -> Running -> {Finished | ExecutionError | UnmatchedResult |
/// Searching}`. `Searching` re-enters `Running` on the caller's next poll;
/// the other outcomes are terminal for this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    New,
    Running,
    Finished,
    ExecutionError,
    UnmatchedResult,
    Searching,
}

/// One unit of work against the adapter.
#[derive(Debug, Clone)]
pub struct Command {
    name: &'static str,
    request: String,
    expected_prefix: Option<String>,
    awaits_response: bool,
    response_always_required: bool,
    no_data_probe: bool,
    state: CommandState,
    raw_response: Option<String>,
    result_time: Option<DateTime<Utc>>,
}

impl Command {
    /// A regular request that expects exactly one matching reply.
    pub fn new(name: &'static str, request: impl Into<String>) -> Self {
        Self {
            name,
            request: request.into(),
            expected_prefix: None,
            awaits_response: true,
            response_always_required: true,
            no_data_probe: false,
            state: CommandState::New,
            raw_response: None,
            result_time: None,
        }
    }

    /// Response frames must start with this identifier to count as matched.
    pub fn expecting_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.expected_prefix = Some(prefix.into());
        self
    }

    /// Fire-and-forget: the executor skips the response wait entirely.
    pub fn fire_and_forget(mut self) -> Self {
        self.awaits_response = false;
        self
    }

    /// A missing response is tolerable; the timeout returns silently
    /// instead of failing the exchange.
    pub fn response_optional(mut self) -> Self {
        self.response_always_required = false;
        self
    }

    /// Probe whose reply carries no data worth parsing (e.g. an adapter
    /// reset banner); treated like a still-searching response.
    pub fn no_data_probe(mut self) -> Self {
        self.no_data_probe = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wire-level request string, without the line terminator.
    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn expected_prefix(&self) -> Option<&str> {
        self.expected_prefix.as_deref()
    }

    pub fn awaits_response(&self) -> bool {
        self.awaits_response
    }

    pub fn response_always_required(&self) -> bool {
        self.response_always_required
    }

    pub fn is_no_data_probe(&self) -> bool {
        self.no_data_probe
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn raw_response(&self) -> Option<&str> {
        self.raw_response.as_deref()
    }

    pub fn result_time(&self) -> Option<DateTime<Utc>> {
        self.result_time
    }

    /// Whether a received frame belongs to this command.
    ///
    /// Commands without an expected prefix accept any frame.
    pub fn matches(&self, frame: &str) -> bool {
        match &self.expected_prefix {
            Some(prefix) => frame.starts_with(prefix.as_str()),
            None => true,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = CommandState::Running;
    }

    pub fn mark_finished(&mut self) {
        self.state = CommandState::Finished;
    }

    pub fn mark_execution_error(&mut self) {
        self.state = CommandState::ExecutionError;
    }

    pub fn mark_searching(&mut self) {
        self.state = CommandState::Searching;
    }

    pub fn mark_unmatched(&mut self) {
        self.state = CommandState::UnmatchedResult;
    }

    /// Store the raw response frame and its arrival time. Validation is
    /// protocol-specific and happens later.
    pub fn attach_response(&mut self, frame: String, at: DateTime<Utc>) {
        self.raw_response = Some(frame);
        self.result_time = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_command_defaults() {
        let cmd = Command::new("speed", "010D");
        assert_eq!(cmd.state(), CommandState::New);
        assert!(cmd.awaits_response());
        assert!(cmd.response_always_required());
        assert!(!cmd.is_no_data_probe());
        assert!(cmd.raw_response().is_none());
    }

    #[test]
    fn every_attempt_outcome_is_reachable_from_running() {
        let transitions: [(&str, fn(&mut Command)); 4] = [
            ("finished", Command::mark_finished),
            ("error", Command::mark_execution_error),
            ("unmatched", Command::mark_unmatched),
            ("searching", Command::mark_searching),
        ];

        for (label, apply) in transitions {
            let mut cmd = Command::new("probe", "0100");
            cmd.mark_running();
            assert_eq!(cmd.state(), CommandState::Running, "{label}");
            apply(&mut cmd);
            assert_ne!(cmd.state(), CommandState::Running, "{label}");
        }
    }

    #[test]
    fn searching_can_reenter_running() {
        let mut cmd = Command::new("auto protocol", "ATSP0");
        cmd.mark_running();
        cmd.mark_searching();
        assert_eq!(cmd.state(), CommandState::Searching);
        cmd.mark_running();
        assert_eq!(cmd.state(), CommandState::Running);
    }

    #[test]
    fn prefix_matching() {
        let cmd = Command::new("rpm", "010C").expecting_prefix("410C");
        assert!(cmd.matches("410C1AF8"));
        assert!(!cmd.matches("410D2A"));

        let open = Command::new("reset", "ATZ");
        assert!(open.matches("ELM327 v1.5"));
    }

    #[test]
    fn attach_response_stores_frame_and_timestamp() {
        let mut cmd = Command::new("speed", "010D").expecting_prefix("410D");
        let now = Utc::now();
        cmd.attach_response("410D2A".into(), now);
        assert_eq!(cmd.raw_response(), Some("410D2A"));
        assert_eq!(cmd.result_time(), Some(now));
    }
}
