use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which side of the connection produces a message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// The fuzzer sends `payload` to the target.
    Send,
    /// The fuzzer expects a message from the target.
    Receive,
}

/// A single step of a protocol conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProtocolAction {
    pub direction: Direction,
    /// Message type name, e.g. `ClientHello`. Only meaningful to the protocol engine.
    pub message: String,
    pub payload: Vec<u8>,
    /// Set by the engine once the action ran against a live connection.
    #[serde(default)]
    pub executed: bool,
    /// Bytes the engine actually observed for a `Receive` action.
    #[serde(default)]
    pub recorded: Option<Vec<u8>>,
    /// Session-specific value captured during a run (a session id, a cookie).
    /// Must be stripped before the action is replayed on a new connection.
    #[serde(default)]
    pub binding: Option<Vec<u8>>,
}

impl ProtocolAction {
    pub fn send(message: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Send,
            message: message.into(),
            payload,
            executed: false,
            recorded: None,
            binding: None,
        }
    }

    pub fn receive(message: impl Into<String>) -> Self {
        Self {
            direction: Direction::Receive,
            message: message.into(),
            payload: Vec::new(),
            executed: false,
            recorded: None,
            binding: None,
        }
    }
}

/// An ordered, replayable protocol conversation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub actions: Vec<ProtocolAction>,
}

impl Trace {
    pub fn new(actions: Vec<ProtocolAction>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drops everything a previous execution wrote into the trace so it can run again.
    pub fn reset(&mut self) {
        for action in &mut self.actions {
            action.executed = false;
            action.recorded = None;
        }
    }

    /// Strips connection-specific bindings so the trace can be replayed against a new session.
    pub fn make_generic(&mut self) {
        for action in &mut self.actions {
            action.binding = None;
        }
    }
}

/// Key material the protocol engine presents on one side of the connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CertificateStructure {
    pub certificate: PathBuf,
    pub key: PathBuf,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_alias() -> String {
    "alias".to_string()
}

fn default_password() -> String {
    "password".to_string()
}

impl Default for CertificateStructure {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("resources/cert.pem"),
            key: PathBuf::from("resources/key.pem"),
            alias: default_alias(),
            password: default_password(),
        }
    }
}

/// Selects the engine variant (and transport) that runs a trace.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Stream,
    Datagram,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 2] = [ExecutionMode::Stream, ExecutionMode::Datagram];

    /// Picks one of `modes` uniformly, falling back to [`ExecutionMode::Stream`] when empty.
    pub fn random<R: Rng + ?Sized>(modes: &[ExecutionMode], rng: &mut R) -> Self {
        if modes.is_empty() {
            return ExecutionMode::default();
        }
        modes[rng.random_range(0..modes.len())]
    }
}

/// One candidate fuzzing input.
///
/// `Clone` is a deep copy: every field is owned, so a clone handed to an
/// executor shares nothing with the corpus entry it was loaded from.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TestVector {
    pub trace: Trace,
    pub server_certificate: CertificateStructure,
    pub client_certificate: CertificateStructure,
    pub mode: ExecutionMode,
}

impl TestVector {
    pub fn new(
        trace: Trace,
        server_certificate: CertificateStructure,
        client_certificate: CertificateStructure,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            trace,
            server_certificate,
            client_certificate,
            mode,
        }
    }
}
