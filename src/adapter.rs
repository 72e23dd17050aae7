//! The per-adapter-family protocol capability and its registry.
//!
//! Concrete protocol families implement [`AdapterProtocol`]; an external
//! selection loop picks one via the registry's name predicate and falls
//! over to the next family when the handshake fails with `AdapterFailed`.

use crate::command::Command;
use crate::error::DecodeError;
use crate::pid::DecodedMeasurement;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod drivedeck;
pub mod elm327;

pub use drivedeck::DriveDeckProtocol;
pub use elm327::Elm327Protocol;

/// Behavior of one adapter family.
///
/// The synchronous request/response family drives `request_commands`; the
/// asynchronous/cyclic family leaves that empty and feeds the engine
/// through `poll_next_command` plus pushed frames handled by
/// `handle_data_frame`.
pub trait AdapterProtocol: Send {
    /// Short family name, used in logs and failure reports.
    fn name(&self) -> &'static str;

    /// Whether this family matches a discovered device name.
    fn supports_device(&self, device_name: &str) -> bool;

    /// Ordered setup commands for the handshake.
    fn initialization_commands(&mut self) -> Vec<Command>;

    /// Inspect a completed initialization command and update handshake
    /// state (vehicle identifier, negotiated transport variant, ...).
    fn process_initialization_command(&mut self, cmd: &Command);

    /// True once enough handshake evidence has been gathered. Latched:
    /// never reverts within a session.
    fn connection_verified(&self) -> bool;

    /// Ordered measurement-polling commands (synchronous family).
    fn request_commands(&mut self) -> Vec<Command> {
        Vec::new()
    }

    /// Next queued command, if any (asynchronous family). Implementations
    /// may re-issue a keep-alive/cyclic command here to sustain the push
    /// stream.
    fn poll_next_command(&mut self) -> Option<Command> {
        None
    }

    /// How long the handshake may reasonably take before the selection
    /// loop should give up on this family.
    fn expected_init_period(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Decode one response frame into a typed measurement.
    ///
    /// `Ok(None)` means the frame was meaningful but carried no sample
    /// (handshake metadata, status chatter). Decode errors are localized
    /// to this frame; callers log and drop them.
    fn handle_data_frame(
        &mut self,
        frame: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DecodedMeasurement>, DecodeError>;
}

type ProtocolFactory = Box<dyn Fn() -> Box<dyn AdapterProtocol> + Send + Sync>;

/// Ordered list of registered protocol families.
///
/// Selection is a predicate scan; fail-over is simply "construct the next
/// family in order".
pub struct AdapterRegistry {
    factories: Vec<ProtocolFactory>,
}

impl Default for AdapterRegistry {
    /// Registry with the two built-in families, ELM327 first.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(|| Box::new(Elm327Protocol::new()));
        registry.register(|| Box::new(DriveDeckProtocol::new()));
        registry
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn AdapterProtocol> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    /// First registered family whose predicate matches the device name.
    pub fn select(&self, device_name: &str) -> Option<Box<dyn AdapterProtocol>> {
        self.candidates().find(|p| p.supports_device(device_name))
    }

    /// Fresh instances of every registered family, in registration order.
    /// The selection loop walks this for fail-over after `AdapterFailed`.
    pub fn candidates(&self) -> impl Iterator<Item = Box<dyn AdapterProtocol>> + '_ {
        self.factories.iter().map(|f| f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_selects_by_device_name() {
        let registry = AdapterRegistry::default();

        let elm = registry.select("OBDII ELM327 v1.5").unwrap();
        assert_eq!(elm.name(), "ELM327");

        let drivedeck = registry.select("DriveDeck Sport W4").unwrap();
        assert_eq!(drivedeck.name(), "DriveDeck");

        assert!(registry.select("JBL Flip 5").is_none());
    }

    #[test]
    fn candidates_preserve_registration_order() {
        let names: Vec<&str> = AdapterRegistry::default()
            .candidates()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["ELM327", "DriveDeck"]);
    }
}
