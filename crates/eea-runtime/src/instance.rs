//! A single instantiated workflow engine
//!
//! Owns the wasmtime `Store` (and with it the guest memory and buffer
//! registry) plus the resolved exports. Every guest call takes `&mut self`,
//! so an export can never be entered while another one is running.

use std::fmt;
use tracing::{debug, info, warn};
use wasmtime::{Engine, ExternType, Linker, Memory, MemoryType, Module, Store};

use super::artifact::ModuleArtifact;
use super::exports::{GuestExports, GuestSettings, tolerate_code};
use super::host::{self, HostState, IMPORT_MODULE};
use super::memory::MemoryView;
use super::registered::RegisteredFunctions;
use super::types::{EeaError, EeaResult};

/// Lifecycle of a [`ModuleInstance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Configured, `eea_init` not yet called
    Instantiated,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Instantiated => write!(f, "instantiated"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::ShuttingDown => write!(f, "shutting down"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-instance construction parameters
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub settings: GuestSettings,
    /// Initial pages for host-allocated memory
    pub memory_pages: u32,
    /// Upper bound for host-allocated memory
    pub max_memory_pages: u32,
    /// Connection status announced before `eea_init`
    pub connected: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            settings: GuestSettings::default(),
            memory_pages: 8,
            max_memory_pages: 256,
            connected: false,
        }
    }
}

pub struct ModuleInstance {
    store: Store<HostState>,
    exports: GuestExports,
    state: InstanceState,
    bundle_identifier: String,
}

/// Memory import declared by the module, if any
fn memory_import(module: &Module) -> Option<MemoryType> {
    module.imports().find_map(|import| match import.ty() {
        ExternType::Memory(ty) if import.module() == IMPORT_MODULE && import.name() == "memory" => {
            Some(ty)
        }
        _ => None,
    })
}

fn allocate_memory(
    store: &mut Store<HostState>,
    declared: &MemoryType,
    config: &InstanceConfig,
) -> EeaResult<Memory> {
    let minimum = (declared.minimum() as u32).max(config.memory_pages);
    let maximum = declared
        .maximum()
        .map(|m| m as u32)
        .unwrap_or(config.max_memory_pages)
        .max(minimum);

    debug!(minimum, maximum, "Allocating guest memory");
    Memory::new(&mut *store, MemoryType::new(minimum, Some(maximum)))
        .map_err(|e| EeaError::Instantiation(format!("memory allocation failed: {}", e)))
}

impl ModuleInstance {
    /// Compile, link and configure a validated artifact
    ///
    /// Leaves the instance in [`InstanceState::Instantiated`]; nothing outside
    /// the new store is touched on failure.
    pub fn instantiate(
        engine: &Engine,
        artifact: &ModuleArtifact,
        host_state: HostState,
        registered: &RegisteredFunctions,
        config: &InstanceConfig,
    ) -> EeaResult<Self> {
        let module = Module::new(engine, artifact.wasm())
            .map_err(|e| EeaError::Compilation(e.to_string()))?;

        let mut store = Store::new(engine, host_state);
        store.limiter(|state| &mut state.limits);

        let mut linker = Linker::new(engine);
        host::add_host_functions(&mut linker)?;
        registered.link(&mut linker)?;

        if let Some(declared) = memory_import(&module) {
            let memory = allocate_memory(&mut store, &declared, config)?;
            linker
                .define(&store, IMPORT_MODULE, "memory", memory)
                .map_err(|e| EeaError::Instantiation(e.to_string()))?;
            store.data_mut().memory = Some(memory);
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| EeaError::Instantiation(e.to_string()))?;

        if store.data().memory.is_none() {
            let memory = instance
                .get_memory(&mut store, "memory")
                .ok_or_else(|| EeaError::ExportNotFound("memory".to_string()))?;
            store.data_mut().memory = Some(memory);
        }

        let exports = GuestExports::resolve(&instance, &mut store)?;
        exports.configure(&mut store, &config.settings)?;
        tolerate_code(exports.set_connection_status(&mut store, config.connected))?;

        info!(
            bundle = %artifact.bundle_identifier,
            registered = registered.len(),
            "Module instantiated"
        );

        Ok(Self {
            store,
            exports,
            state: InstanceState::Instantiated,
            bundle_identifier: artifact.bundle_identifier.clone(),
        })
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn bundle_identifier(&self) -> &str {
        &self.bundle_identifier
    }

    pub fn buffers_negotiated(&self) -> bool {
        self.store.data().buffers.is_negotiated()
    }

    fn require(&self, expected: InstanceState, operation: &str) -> EeaResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EeaError::InvalidState(format!(
                "cannot {} while {}",
                operation, self.state
            )))
        }
    }

    /// Call `eea_init`; the instance is running afterwards even if init reports an error
    pub fn start(&mut self) -> EeaResult<()> {
        self.require(InstanceState::Instantiated, "start")?;
        self.state = InstanceState::Running;
        info!(bundle = %self.bundle_identifier, "Starting workflow engine");
        self.exports.init(&mut self.store)
    }

    /// Advance the guest scheduler by one step
    pub fn tick(&mut self, now_ms: i64) -> EeaResult<()> {
        self.require(InstanceState::Running, "tick")?;
        self.exports.tick(&mut self.store, now_ms)
    }

    /// Copy topic/payload into the negotiated buffers and call `eea_message_received`
    pub fn deliver_message(&mut self, topic: &str, payload: &str) -> EeaResult<()> {
        self.require(InstanceState::Running, "deliver a message")?;
        let (topic_len, payload_len) = self.write_buffers(topic, payload)?;
        self.exports
            .message_received(&mut self.store, topic_len, payload_len)
    }

    /// Same encoding path as [`deliver_message`](Self::deliver_message), via `eea_direct_trigger`
    pub fn direct_trigger(&mut self, trigger_id: &str, payload: &str) -> EeaResult<()> {
        self.require(InstanceState::Running, "fire a direct trigger")?;
        let (id_len, payload_len) = self.write_buffers(trigger_id, payload)?;
        self.exports
            .direct_trigger(&mut self.store, id_len, payload_len)
    }

    fn write_buffers(&mut self, first: &str, payload: &str) -> EeaResult<(u32, u32)> {
        let buffers = self.store.data().buffers.get()?;
        let memory = host_memory(&self.store)?;
        let mut view = MemoryView::new(memory.data_mut(&mut self.store));
        let (first, payload) = buffers.write(&mut view, first, payload)?;
        Ok((first.written, payload.written))
    }

    pub fn set_connection_status(&mut self, connected: bool) -> EeaResult<()> {
        match self.state {
            InstanceState::Instantiated | InstanceState::Running => self
                .exports
                .set_connection_status(&mut self.store, connected),
            other => Err(EeaError::InvalidState(format!(
                "cannot set connection status while {}",
                other
            ))),
        }
    }

    /// Call `eea_shutdown` once; later calls are no-ops
    pub fn shutdown(&mut self) -> EeaResult<()> {
        match self.state {
            InstanceState::ShuttingDown | InstanceState::Terminated => {
                debug!(bundle = %self.bundle_identifier, "Instance already shut down");
                Ok(())
            }
            InstanceState::Instantiated | InstanceState::Running => {
                self.state = InstanceState::ShuttingDown;
                info!(bundle = %self.bundle_identifier, "Shutting down workflow engine");
                let result = self.exports.shutdown(&mut self.store);
                self.state = InstanceState::Terminated;
                result
            }
        }
    }
}

fn host_memory(store: &Store<HostState>) -> EeaResult<Memory> {
    store
        .data()
        .memory
        .ok_or_else(|| EeaError::ExportNotFound("memory".to_string()))
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        if matches!(self.state, InstanceState::Instantiated | InstanceState::Running) {
            warn!(
                bundle = %self.bundle_identifier,
                state = %self.state,
                "Discarding instance without shutdown"
            );
        }
    }
}
