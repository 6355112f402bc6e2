//! EEA type definitions
//!
//! Core types shared by the host runtime: errors, result codes, messages

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result codes exchanged across the host/guest boundary
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
}

/// MQTT quality of service carried by every [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<i32> for QoS {
    fn from(v: i32) -> Self {
        match v {
            i32::MIN..=0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Unit exchanged between the guest and the transport, in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Work queued for the transport forwarder
///
/// Guest publishes and agent requests share one FIFO queue, so a request
/// never overtakes a message queued before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Publish(Message),
    Subscribe { topics: Vec<String>, qos: QoS },
    /// Flush what is queued ahead, disconnect and stop forwarding
    Disconnect,
}

impl Outbound {
    pub fn message(&self) -> Option<&Message> {
        match self {
            Outbound::Publish(message) => Some(message),
            _ => None,
        }
    }
}

pub type OutboundSender = tokio::sync::mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = tokio::sync::mpsc::UnboundedReceiver<Outbound>;

/// Guest trace levels as passed to `eea_trace` and `eea_config_set_trace_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TraceLevel {
    None = 0,
    Error = 1,
    Verbose = 2,
}

impl From<i32> for TraceLevel {
    fn from(v: i32) -> Self {
        match v {
            1 => TraceLevel::Error,
            2 => TraceLevel::Verbose,
            _ => TraceLevel::None,
        }
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceLevel::None => write!(f, "NONE"),
            TraceLevel::Error => write!(f, "ERROR"),
            TraceLevel::Verbose => write!(f, "INFO"),
        }
    }
}

/// Reasons a candidate artifact is rejected before instantiation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Interface version of {0:?} is not supported")]
    UnsupportedInterfaceVersion(Option<String>),

    #[error("WASM bundle identifier is missing")]
    MissingBundleIdentifier,

    #[error("Malformed WASM artifact: {0}")]
    Malformed(String),
}

/// EEA host errors
#[derive(Debug, Error)]
pub enum EeaError {
    #[error("Artifact validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to compile WASM module: {0}")]
    Compilation(String),

    #[error("Failed to instantiate WASM module: {0}")]
    Instantiation(String),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Memory access out of bounds: offset={offset}, size={size}")]
    MemoryOutOfBounds { offset: u32, size: u32 },

    #[error("Buffer too small: capacity {capacity}, required {required}")]
    BufferTooSmall { capacity: u32, required: u32 },

    #[error("Message buffers have not been negotiated by the guest")]
    BuffersNotNegotiated,

    #[error("Invalid UTF-8 in guest memory: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Guest export {export} returned error code {code}")]
    GuestCallFailure { export: &'static str, code: i32 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Invalid instance state: {0}")]
    InvalidState(String),

    #[error("Registered function error: {0}")]
    Registration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error: {0}")]
    Persistence(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Agent is not running")]
    AgentStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EeaError {
    /// Errors that reject a candidate artifact without touching the active instance
    pub fn is_candidate_rejection(&self) -> bool {
        matches!(
            self,
            EeaError::Validation(_)
                | EeaError::Compilation(_)
                | EeaError::Instantiation(_)
                | EeaError::ExportNotFound(_)
        )
    }
}

/// EEA result type
pub type EeaResult<T> = Result<T, EeaError>;

/// Turn a guest result code into a `Result`
pub fn check_code(export: &'static str, code: i32) -> EeaResult<()> {
    if code == result_code::SUCCESS {
        Ok(())
    } else {
        Err(EeaError::GuestCallFailure { export, code })
    }
}
