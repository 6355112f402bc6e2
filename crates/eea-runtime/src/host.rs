//! Host functions imported by the guest
//!
//! Every import lives in module `env` and returns an `i32` result code. Bad
//! guest pointers never trap: they are logged and reported as
//! [`result_code::GENERAL_ERROR`], except for the calls the guest is promised
//! always succeed, which log and return [`result_code::SUCCESS`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Linker, Memory, ResourceLimiter, Result};

use super::buffers::{BufferRegistry, MessageBuffers};
use super::codec::{self, ScalarType};
use super::memory::{GuestPtr, GuestSlice, MemoryView};
use super::storage::BlobStore;
use super::types::{EeaError, EeaResult, Message, Outbound, OutboundSender, QoS, result_code};

/// Module name for every host import
pub const IMPORT_MODULE: &str = "env";

/// Names reserved by the core host table
pub const CORE_IMPORTS: [&str; 9] = [
    "eea_get_device_id",
    "eea_get_time",
    "eea_send_message",
    "eea_set_message_buffers",
    "eea_sleep",
    "eea_storage_read",
    "eea_storage_save",
    "eea_trace",
    "memory",
];

const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Guest memory and table growth limits
pub struct StoreLimits {
    pub max_memory_bytes: u64,
    pub max_table_elements: usize,
}

impl StoreLimits {
    pub fn from_pages(max_memory_pages: u32) -> Self {
        Self {
            max_memory_bytes: max_memory_pages as u64 * WASM_PAGE_SIZE,
            ..Self::default()
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * WASM_PAGE_SIZE, // 16MB
            max_table_elements: 10000,
        }
    }
}

impl ResourceLimiter for StoreLimits {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_memory_bytes as usize);
        let allowed = desired <= max && desired <= self.max_memory_bytes as usize;
        if !allowed {
            warn!(current, desired, "Guest memory growth denied");
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements);
        Ok(desired <= max && desired <= self.max_table_elements)
    }
}

/// Per-instance state stored in the wasmtime `Store`
pub struct HostState {
    /// Identifier returned by `eea_get_device_id`
    pub device_id: String,
    /// Linear memory, set once it is known
    pub memory: Option<Memory>,
    /// Fresh for every instance
    pub buffers: BufferRegistry,
    /// Guest-originated messages bound for the transport
    pub outbound: OutboundSender,
    pub storage: Arc<dyn BlobStore>,
    pub limits: StoreLimits,
}

impl HostState {
    pub fn new(
        device_id: impl Into<String>,
        outbound: OutboundSender,
        storage: Arc<dyn BlobStore>,
        limits: StoreLimits,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            memory: None,
            buffers: BufferRegistry::new(),
            outbound,
            storage,
            limits,
        }
    }
}

/// Resolve the guest memory for the current call
pub(crate) fn guest_memory(caller: &mut Caller<'_, HostState>) -> EeaResult<Memory> {
    if let Some(memory) = caller.data().memory {
        return Ok(memory);
    }
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| EeaError::ExportNotFound("memory".to_string()))
}

/// Run `f` with a bounds-checked view over guest memory and the host state
pub(crate) fn with_memory<R>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut MemoryView<'_>, &mut HostState) -> EeaResult<R>,
) -> EeaResult<R> {
    let memory = guest_memory(caller)?;
    let (data, state) = memory.data_and_store_mut(caller);
    let mut view = MemoryView::new(data);
    f(&mut view, state)
}

/// Result code for a fallible import
fn code(import: &str, result: EeaResult<()>) -> i32 {
    match result {
        Ok(()) => result_code::SUCCESS,
        Err(e) => {
            error!(import, error = %e, "Host import failed");
            result_code::GENERAL_ERROR
        }
    }
}

/// Result code for an import that always reports success
fn always_ok(import: &str, result: EeaResult<()>) -> i32 {
    if let Err(e) = result {
        error!(import, error = %e, "Host import failed");
    }
    result_code::SUCCESS
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Emit a guest trace line at the mapped level
pub fn trace_message(device_id: &str, level: i32, message: &str) {
    match level {
        1 => error!(target: "eea::guest", device_id, "{}", message),
        2 => info!(target: "eea::guest", device_id, "{}", message),
        _ => debug!(target: "eea::guest", device_id, level, "{}", message),
    }
}

fn get_device_id(view: &mut MemoryView<'_>, state: &HostState, out: i32, cap: i32, len: i32) -> EeaResult<()> {
    codec::encode_string_and_length(
        view,
        &state.device_id,
        GuestPtr::from(out),
        cap.max(0) as u32,
        GuestPtr::from(len),
        ScalarType::U8,
    )
    .map(|_| ())
}

fn send_message(
    view: &mut MemoryView<'_>,
    state: &HostState,
    topic: GuestSlice,
    payload: GuestSlice,
    qos: i32,
) -> EeaResult<()> {
    let topic = codec::decode_string(view, topic.ptr, topic.len)?;
    let payload = codec::decode_string(view, payload.ptr, payload.len)?;
    debug!(%topic, qos, "Guest sent message");

    state
        .outbound
        .send(Outbound::Publish(Message::new(topic, payload, QoS::from(qos))))
        .map_err(|_| EeaError::Transport("outbound channel closed".to_string()))
}

fn set_message_buffers(
    view: &mut MemoryView<'_>,
    state: &mut HostState,
    topic: GuestSlice,
    payload: GuestSlice,
) -> EeaResult<()> {
    view.check(topic.ptr, topic.len)?;
    view.check(payload.ptr, payload.len)?;
    state.buffers.negotiate(MessageBuffers::new(topic, payload))
}

fn storage_read(view: &mut MemoryView<'_>, state: &HostState, out: i32, cap: i32, len: i32) -> EeaResult<()> {
    let Some(blob) = state.storage.load()? else {
        debug!("No stored blob; leaving guest buffer untouched");
        return Ok(());
    };

    let encoded = codec::encode_bytes_and_length(
        view,
        &blob,
        GuestPtr::from(out),
        cap.max(0) as u32,
        GuestPtr::from(len),
        ScalarType::U32,
    )?;
    debug!(bytes = encoded.written, "Storage read into guest");
    Ok(())
}

fn storage_save(view: &mut MemoryView<'_>, state: &HostState, blob: GuestSlice) -> EeaResult<()> {
    let bytes = view.read_slice(blob)?;
    state.storage.save(bytes)
}

/// Register the core host table on `linker`
pub fn add_host_functions(linker: &mut Linker<HostState>) -> EeaResult<()> {
    let link_err = |e: wasmtime::Error| EeaError::Instantiation(e.to_string());

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_get_device_id",
            |mut caller: Caller<'_, HostState>, out: i32, cap: i32, len: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    get_device_id(view, state, out, cap, len)
                });
                always_ok("eea_get_device_id", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_get_time",
            |mut caller: Caller<'_, HostState>, out: i32| -> i32 {
                let result = with_memory(&mut caller, |view, _| {
                    codec::encode_scalar(view, now_ms(), GuestPtr::from(out), ScalarType::U64)
                });
                code("eea_get_time", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_send_message",
            |mut caller: Caller<'_, HostState>, t: i32, tl: i32, p: i32, pl: i32, qos: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    send_message(
                        view,
                        state,
                        GuestSlice::from_raw(t, tl),
                        GuestSlice::from_raw(p, pl),
                        qos,
                    )
                });
                always_ok("eea_send_message", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_set_message_buffers",
            |mut caller: Caller<'_, HostState>, t: i32, tc: i32, p: i32, pc: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    set_message_buffers(
                        view,
                        state,
                        GuestSlice::from_raw(t, tc),
                        GuestSlice::from_raw(p, pc),
                    )
                });
                code("eea_set_message_buffers", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_sleep",
            |_caller: Caller<'_, HostState>, ms: i32| -> i32 {
                // Stalls the calling thread, and with it the agent task
                std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
                result_code::SUCCESS
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_storage_read",
            |mut caller: Caller<'_, HostState>, out: i32, cap: i32, len: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    storage_read(view, state, out, cap, len)
                });
                code("eea_storage_read", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_storage_save",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    storage_save(view, state, GuestSlice::from_raw(ptr, len))
                });
                always_ok("eea_storage_save", result)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            IMPORT_MODULE,
            "eea_trace",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32, level: i32| -> i32 {
                let result = with_memory(&mut caller, |view, state| {
                    let message = codec::decode_string_lossy(view, GuestPtr::from(ptr), len.max(0) as u32)?;
                    trace_message(&state.device_id, level, &message);
                    Ok(())
                });
                always_ok("eea_trace", result)
            },
        )
        .map_err(link_err)?;

    Ok(())
}
