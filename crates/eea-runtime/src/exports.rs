//! Typed wrappers over the guest's exported entry points

use tracing::{debug, warn};
use wasmtime::{Instance, Store, TypedFunc, WasmParams};

use super::host::HostState;
use super::types::{EeaError, EeaResult, check_code};

/// Configuration values pushed into the guest before `eea_init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSettings {
    pub debug_enabled: bool,
    pub topic_buffer_length: u32,
    pub payload_buffer_length: u32,
    pub queue_size: u32,
    pub storage_interval_ms: u32,
    pub storage_size: u32,
    pub trace_level: i32,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            debug_enabled: true,
            topic_buffer_length: 256,
            payload_buffer_length: 4096,
            queue_size: 1_024_000,
            storage_interval_ms: 60_000,
            storage_size: 1_024_000,
            trace_level: 1,
        }
    }
}

/// Optional configuration setters
struct ConfigExports {
    debug_enabled: Option<TypedFunc<i32, i32>>,
    buffer_lengths: Option<TypedFunc<(i32, i32), i32>>,
    queue_size: Option<TypedFunc<i32, i32>>,
    storage_interval: Option<TypedFunc<i32, i32>>,
    storage_size: Option<TypedFunc<i32, i32>>,
    trace_level: Option<TypedFunc<i32, i32>>,
}

/// Resolved guest export table
pub struct GuestExports {
    config: ConfigExports,
    init: TypedFunc<(), i32>,
    tick: TypedFunc<i64, i32>,
    message_received: TypedFunc<(i32, i32), i32>,
    direct_trigger: TypedFunc<(i32, i32), i32>,
    set_connection_status: TypedFunc<i32, i32>,
    shutdown: TypedFunc<(), i32>,
}

fn required<P: WasmParams>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> EeaResult<TypedFunc<P, i32>> {
    if instance.get_func(&mut *store, name).is_none() {
        return Err(EeaError::ExportNotFound(name.to_string()));
    }
    instance
        .get_typed_func::<P, i32>(&mut *store, name)
        .map_err(|e| EeaError::ExportNotFound(format!("{}: {}", name, e)))
}

fn optional<P: WasmParams>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> EeaResult<Option<TypedFunc<P, i32>>> {
    if instance.get_func(&mut *store, name).is_none() {
        debug!(export = name, "Optional export not present");
        return Ok(None);
    }
    required(instance, store, name).map(Some)
}

fn call<P: WasmParams>(
    store: &mut Store<HostState>,
    func: &TypedFunc<P, i32>,
    export: &'static str,
    params: P,
) -> EeaResult<()> {
    let code = func
        .call(store, params)
        .map_err(|e| EeaError::Execution(format!("{} trapped: {}", export, e)))?;
    check_code(export, code)
}

/// Log a non-zero result code and carry on; traps still propagate
pub fn tolerate_code(result: EeaResult<()>) -> EeaResult<()> {
    match result {
        Err(EeaError::GuestCallFailure { export, code }) => {
            warn!(export, code, "Guest rejected call");
            Ok(())
        }
        other => other,
    }
}

impl GuestExports {
    /// Look up every export; missing required entry points reject the module
    pub fn resolve(instance: &Instance, store: &mut Store<HostState>) -> EeaResult<Self> {
        let config = ConfigExports {
            debug_enabled: optional(instance, store, "eea_config_set_debug_enabled")?,
            buffer_lengths: optional(instance, store, "eea_config_set_message_buffer_lengths")?,
            queue_size: optional(instance, store, "eea_config_set_queue_size")?,
            storage_interval: optional(instance, store, "eea_config_set_storage_interval")?,
            storage_size: optional(instance, store, "eea_config_set_storage_size")?,
            trace_level: optional(instance, store, "eea_config_set_trace_level")?,
        };

        Ok(Self {
            config,
            init: required(instance, store, "eea_init")?,
            tick: required(instance, store, "eea_loop")?,
            message_received: required(instance, store, "eea_message_received")?,
            direct_trigger: required(instance, store, "eea_direct_trigger")?,
            set_connection_status: required(instance, store, "eea_set_connection_status")?,
            shutdown: required(instance, store, "eea_shutdown")?,
        })
    }

    /// Apply every available setter
    ///
    /// A setter returning a non-zero code is logged; only a trap is an error.
    pub fn configure(&self, store: &mut Store<HostState>, settings: &GuestSettings) -> EeaResult<()> {
        let c = &self.config;
        if let Some(f) = &c.debug_enabled {
            tolerate_code(call(store, f, "eea_config_set_debug_enabled", settings.debug_enabled as i32))?;
        }
        if let Some(f) = &c.buffer_lengths {
            tolerate_code(call(
                store,
                f,
                "eea_config_set_message_buffer_lengths",
                (
                    settings.topic_buffer_length as i32,
                    settings.payload_buffer_length as i32,
                ),
            ))?;
        }
        if let Some(f) = &c.queue_size {
            tolerate_code(call(store, f, "eea_config_set_queue_size", settings.queue_size as i32))?;
        }
        if let Some(f) = &c.storage_interval {
            tolerate_code(call(store, f, "eea_config_set_storage_interval", settings.storage_interval_ms as i32))?;
        }
        if let Some(f) = &c.storage_size {
            tolerate_code(call(store, f, "eea_config_set_storage_size", settings.storage_size as i32))?;
        }
        if let Some(f) = &c.trace_level {
            tolerate_code(call(store, f, "eea_config_set_trace_level", settings.trace_level))?;
        }
        Ok(())
    }

    pub fn init(&self, store: &mut Store<HostState>) -> EeaResult<()> {
        call(store, &self.init, "eea_init", ())
    }

    pub fn tick(&self, store: &mut Store<HostState>, now_ms: i64) -> EeaResult<()> {
        call(store, &self.tick, "eea_loop", now_ms)
    }

    pub fn message_received(
        &self,
        store: &mut Store<HostState>,
        topic_len: u32,
        payload_len: u32,
    ) -> EeaResult<()> {
        call(
            store,
            &self.message_received,
            "eea_message_received",
            (topic_len as i32, payload_len as i32),
        )
    }

    pub fn direct_trigger(
        &self,
        store: &mut Store<HostState>,
        id_len: u32,
        payload_len: u32,
    ) -> EeaResult<()> {
        call(
            store,
            &self.direct_trigger,
            "eea_direct_trigger",
            (id_len as i32, payload_len as i32),
        )
    }

    pub fn set_connection_status(&self, store: &mut Store<HostState>, connected: bool) -> EeaResult<()> {
        call(
            store,
            &self.set_connection_status,
            "eea_set_connection_status",
            connected as i32,
        )
    }

    pub fn shutdown(&self, store: &mut Store<HostState>) -> EeaResult<()> {
        call(store, &self.shutdown, "eea_shutdown", ())
    }
}
