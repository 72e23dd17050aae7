//! OBD-II adapter communication engine.
//!
//! Talks to Bluetooth OBD-II dongles over an opaque byte channel: frames
//! the inbound stream, executes commands strictly one at a time, and
//! abstracts over adapter families behind [`adapter::AdapterProtocol`].
//! Two families are built in: the synchronous request/response ELM327
//! family and the asynchronous/cyclic DriveDeck family.
//!
//! The crate is transport-agnostic. Callers supply the byte channel
//! (Bluetooth RFCOMM socket, serial port, TCP bridge) as a
//! [`transport::ReadHalf`]/[`transport::WriteHalf`] pair and drive a
//! [`executor::SequentialExecutor`] through the handshake and the polling
//! loop.

pub mod adapter;
pub mod command;
pub mod error;
pub mod executor;
pub mod framer;
pub mod pid;
pub mod transport;

pub use adapter::{AdapterProtocol, AdapterRegistry, DriveDeckProtocol, Elm327Protocol};
pub use command::{Command, CommandState};
pub use error::{DecodeError, ExecutionError, TransportError};
pub use executor::{ConnectionListener, ConnectionState, ExecutorConfig, SequentialExecutor};
pub use framer::StreamFramer;
pub use pid::{DecodedMeasurement, Pid};
pub use transport::{ChannelPair, ReadHalf, WriteHalf};
