//! Engine ownership and instance construction
//!
//! [`EeaRuntime`] holds the wasmtime engine and everything a fresh
//! [`ModuleInstance`] is wired to: device identity, registered functions, the
//! storage blob and the outbound message channel.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use wasmtime::{Config, Engine};

use super::artifact::ModuleArtifact;
use super::host::{HostState, StoreLimits};
use super::instance::{InstanceConfig, ModuleInstance};
use super::registered::RegisteredFunctions;
use super::storage::BlobStore;
use super::types::{EeaError, EeaResult, OutboundSender};

/// Optimization level for compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub optimization_level: OptimizationLevel,
    pub parallel_compilation: bool,
    /// Keep DWARF info for guest backtraces
    pub debug_info: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::Speed,
            parallel_compilation: true,
            debug_info: false,
        }
    }
}

impl RuntimeConfig {
    /// Convert to wasmtime Config
    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();

        config.debug_info(self.debug_info);
        config.parallel_compilation(self.parallel_compilation);

        match self.optimization_level {
            OptimizationLevel::None => {
                config.cranelift_opt_level(wasmtime::OptLevel::None);
            }
            OptimizationLevel::Speed => {
                config.cranelift_opt_level(wasmtime::OptLevel::Speed);
            }
            OptimizationLevel::SpeedAndSize => {
                config.cranelift_opt_level(wasmtime::OptLevel::SpeedAndSize);
            }
        }

        config
    }
}

/// Runtime statistics
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub instances_created: u64,
    pub failed_instantiations: u64,
    pub total_instantiate_time_ms: u64,
}

/// Builds module instances against a shared engine
pub struct EeaRuntime {
    engine: Engine,
    device_id: String,
    instance_config: InstanceConfig,
    registered: RegisteredFunctions,
    storage: Arc<dyn BlobStore>,
    outbound: OutboundSender,
    stats: RuntimeStats,
}

impl EeaRuntime {
    pub fn new(
        config: &RuntimeConfig,
        device_id: impl Into<String>,
        instance_config: InstanceConfig,
        registered: RegisteredFunctions,
        storage: Arc<dyn BlobStore>,
        outbound: OutboundSender,
    ) -> EeaResult<Self> {
        let engine = Engine::new(&config.to_wasmtime_config())
            .map_err(|e| EeaError::Config(format!("Failed to create engine: {}", e)))?;

        info!(
            "WASM runtime created with config: {:?}",
            config.optimization_level
        );

        Ok(Self {
            engine,
            device_id: device_id.into(),
            instance_config,
            registered,
            storage,
            outbound,
            stats: RuntimeStats::default(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn instance_config(&self) -> &InstanceConfig {
        &self.instance_config
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Queue shared by every instance's `eea_send_message` and the agent
    pub fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Build a configured instance with a fresh store and buffer registry
    pub fn instantiate(
        &mut self,
        artifact: &ModuleArtifact,
        connected: bool,
    ) -> EeaResult<ModuleInstance> {
        let start = Instant::now();
        let host_state = HostState::new(
            self.device_id.clone(),
            self.outbound.clone(),
            self.storage.clone(),
            StoreLimits::from_pages(self.instance_config.max_memory_pages),
        );
        let config = InstanceConfig {
            connected,
            ..self.instance_config.clone()
        };

        let result =
            ModuleInstance::instantiate(&self.engine, artifact, host_state, &self.registered, &config);

        match &result {
            Ok(_) => {
                self.stats.instances_created += 1;
                self.stats.total_instantiate_time_ms += start.elapsed().as_millis() as u64;
            }
            Err(_) => self.stats.failed_instantiations += 1,
        }
        result
    }
}
