//! Embedded Edge Agent host runtime
//!
//! Runs a sandboxed WebAssembly workflow engine and bridges its messages to a
//! publish/subscribe transport:
//! - Bounds-checked marshalling across the guest's linear memory
//! - The `env` host import table plus user-registered native functions
//! - Artifact validation, instance lifecycle and hot replacement
//! - A timer-driven execution pump that never re-enters the guest
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         EdgeAgent task                       │
//! │   interval tick ─┐                                           │
//! │   AgentHandle ───┼──► ModuleInstance ──► Store<HostState>    │
//! │   (events, swap, │        │                 │                │
//! │    triggers)     │   GuestExports      host imports (env)    │
//! │                  │                          │                │
//! └──────────────────┴──────────────────────────┼────────────────┘
//!            hello, subscribe, disconnect  │  guest sends
//!                                    ▼     ▼
//!                         outbound mpsc ──► forwarder ──► Transport
//! ```

pub mod agent;
pub mod artifact;
pub mod buffers;
pub mod codec;
pub mod config;
pub mod exports;
pub mod host;
pub mod instance;
pub mod memory;
pub mod registered;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod types;

pub use agent::{AgentHandle, AgentInfo, AgentOptions, EdgeAgent};
pub use artifact::{ModuleArtifact, NULL_BUNDLE, SUPPORTED_INTERFACE_VERSION};
pub use buffers::{BufferRegistry, MessageBuffers};
pub use codec::{Encoded, Scalar, ScalarType};
pub use config::AgentConfig;
pub use exports::GuestSettings;
pub use host::{HostState, StoreLimits};
pub use instance::{InstanceConfig, InstanceState, ModuleInstance};
pub use memory::{GuestPtr, GuestSlice, MemoryView};
pub use registered::{GuestCall, RegisteredFunction, RegisteredFunctions, ValueType};
pub use runtime::{EeaRuntime, OptimizationLevel, RuntimeConfig, RuntimeStats};
pub use storage::{ArtifactStore, BlobStore, FileBlobStore, MemoryBlobStore};
pub use transport::{
    CompilerOptions, HelloMessage, MemoryTransport, Route, TopicLayout, Transport, TransportEvent,
    forward_outbound, pump_events,
};
pub use types::{
    EeaError, EeaResult, Message, Outbound, OutboundReceiver, OutboundSender, QoS, TraceLevel,
    ValidationError,
};
