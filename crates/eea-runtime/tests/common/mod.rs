//! Shared guest fixtures for the integration tests

#![allow(dead_code)]

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wasm_encoder::{CustomSection, Module};

use eea_runtime::{
    BlobStore, EeaRuntime, InstanceConfig, Message, Outbound, OutboundReceiver,
    RegisteredFunctions, RuntimeConfig,
};

pub const DEVICE_ID: &str = "device-1234";

/// Guest that behaves like a minimal workflow engine
///
/// - `eea_init` negotiates buffers (topic @1024/256, payload @2048/4096),
///   then reports its device id on `init` and its stored blob on `storage`
/// - `eea_direct_trigger` queues one workflow (payload copied into one of 8
///   slots); `eea_loop` runs at most one queued workflow per call, oldest
///   first, and reports its payload on `workflow`
/// - `eea_message_received` echoes the payload on `echo`
/// - `eea_set_connection_status` reports `0`/`1` on `status`
/// - `eea_shutdown` saves `saved` and reports it on `shutdown`
pub fn engine_wat(saved: &str) -> String {
    let saved_len = saved.len();
    format!(
        r#"
(module
  (import "env" "memory" (memory 1))
  (import "env" "eea_set_message_buffers" (func $set_buffers (param i32 i32 i32 i32) (result i32)))
  (import "env" "eea_get_device_id" (func $device_id (param i32 i32 i32) (result i32)))
  (import "env" "eea_storage_read" (func $storage_read (param i32 i32 i32) (result i32)))
  (import "env" "eea_storage_save" (func $storage_save (param i32 i32) (result i32)))
  (import "env" "eea_send_message" (func $send (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "eea_trace" (func $trace (param i32 i32 i32) (result i32)))
  (import "env" "eea_get_time" (func $time (param i32) (result i32)))
  (import "env" "eea_sleep" (func $sleep (param i32) (result i32)))

  (data (i32.const 100) "workflow")
  (data (i32.const 120) "echo")
  (data (i32.const 140) "init")
  (data (i32.const 160) "storage")
  (data (i32.const 180) "01")
  (data (i32.const 190) "status")
  (data (i32.const 200) "shutdown")
  (data (i32.const 220) "guest ready")
  (data (i32.const 300) "{saved}")

  (global $head (mut i32) (i32.const 0))
  (global $tail (mut i32) (i32.const 0))
  (global $trace_level (mut i32) (i32.const 0))

  (func (export "eea_config_set_trace_level") (param i32) (result i32)
    (global.set $trace_level (local.get 0))
    (i32.const 0))

  (func (export "eea_config_set_message_buffer_lengths") (param i32 i32) (result i32)
    (i32.const 0))

  (func (export "eea_init") (result i32)
    (drop (call $set_buffers (i32.const 1024) (i32.const 256) (i32.const 2048) (i32.const 4096)))
    (drop (call $device_id (i32.const 512) (i32.const 64) (i32.const 600)))
    (drop (call $storage_read (i32.const 8192) (i32.const 1024) (i32.const 9300)))
    (drop (call $trace (i32.const 220) (i32.const 11) (i32.const 2)))
    (drop (call $sleep (i32.const 1)))
    (drop (call $send (i32.const 140) (i32.const 4)
      (i32.const 512) (i32.load8_u (i32.const 600)) (i32.const 0)))
    (drop (call $send (i32.const 160) (i32.const 7)
      (i32.const 8192) (i32.load (i32.const 9300)) (i32.const 0)))
    (i32.const 0))

  ;; Queue slot: 4-byte length followed by up to 512 payload bytes
  (func $slot (param i32) (result i32)
    (i32.add (i32.const 16384)
      (i32.mul (i32.rem_u (local.get 0) (i32.const 8)) (i32.const 516))))

  (func (export "eea_loop") (param i64) (result i32)
    (local $s i32)
    (drop (call $time (i32.const 9400)))
    (if (i32.lt_u (global.get $head) (global.get $tail))
      (then
        (local.set $s (call $slot (global.get $head)))
        (global.set $head (i32.add (global.get $head) (i32.const 1)))
        (drop (call $send (i32.const 100) (i32.const 8)
          (i32.add (local.get $s) (i32.const 4)) (i32.load (local.get $s)) (i32.const 0)))))
    (i32.const 0))

  (func (export "eea_message_received") (param i32 i32) (result i32)
    (call $send (i32.const 120) (i32.const 4) (i32.const 2048) (local.get 1) (i32.const 1)))

  (func (export "eea_direct_trigger") (param i32 i32) (result i32)
    (local $s i32)
    (local $len i32)
    (local.set $s (call $slot (global.get $tail)))
    (local.set $len
      (select (local.get 1) (i32.const 512) (i32.lt_u (local.get 1) (i32.const 512))))
    (i32.store (local.get $s) (local.get $len))
    (memory.copy (i32.add (local.get $s) (i32.const 4)) (i32.const 2048) (local.get $len))
    (global.set $tail (i32.add (global.get $tail) (i32.const 1)))
    (i32.const 0))

  (func (export "eea_set_connection_status") (param i32) (result i32)
    (call $send (i32.const 190) (i32.const 6)
      (i32.add (i32.const 180) (local.get 0)) (i32.const 1) (i32.const 0)))

  (func (export "eea_shutdown") (result i32)
    (drop (call $storage_save (i32.const 300) (i32.const {saved_len})))
    (call $send (i32.const 200) (i32.const 8) (i32.const 300) (i32.const {saved_len}) (i32.const 0)))
)
"#
    )
}

/// Guest with no-op entry points; `init_body` replaces the body of `eea_init`
pub fn minimal_wat(init_body: &str, loop_body: &str) -> String {
    format!(
        r#"
(module
  (import "env" "eea_set_message_buffers" (func $set_buffers (param i32 i32 i32 i32) (result i32)))
  (import "env" "eea_send_message" (func $send (param i32 i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "oob")
  (func (export "eea_init") (result i32) {init_body})
  (func (export "eea_loop") (param i64) (result i32) {loop_body})
  (func (export "eea_message_received") (param i32 i32) (result i32) (i32.const 0))
  (func (export "eea_direct_trigger") (param i32 i32) (result i32) (i32.const 0))
  (func (export "eea_set_connection_status") (param i32) (result i32) (i32.const 0))
  (func (export "eea_shutdown") (result i32) (i32.const 0))
)
"#
    )
}

/// Compile `wat` and append the given custom sections
pub fn artifact_sections(wat: &str, custom: &[(&str, &str)]) -> Vec<u8> {
    let mut wasm = wat::parse_str(wat).expect("invalid test WAT");

    let mut sections = Module::new();
    for (name, data) in custom {
        sections.section(&CustomSection {
            name: Cow::Borrowed(*name),
            data: Cow::Borrowed(data.as_bytes()),
        });
    }
    // Skip the preamble; only the sections are appended
    wasm.extend_from_slice(&sections.finish()[8..]);
    wasm
}

pub fn artifact_with(wat: &str, interface_version: &str, bundle: &str) -> Vec<u8> {
    artifact_sections(
        wat,
        &[("interfaceVersion", interface_version), ("bundleIdentifier", bundle)],
    )
}

pub fn artifact(wat: &str, bundle: &str) -> Vec<u8> {
    artifact_with(wat, "1.0.0", bundle)
}

pub fn runtime(
    storage: Arc<dyn BlobStore>,
    registered: RegisteredFunctions,
) -> (EeaRuntime, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let runtime = EeaRuntime::new(
        &RuntimeConfig::default(),
        DEVICE_ID,
        InstanceConfig::default(),
        registered,
        storage,
        tx,
    )
    .expect("engine");
    (runtime, rx)
}

/// Drain everything currently queued
pub fn drain_outbound(rx: &mut OutboundReceiver) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(request) = rx.try_recv() {
        out.push(request);
    }
    out
}

/// Drain the queue, keeping only published messages
pub fn drain(rx: &mut OutboundReceiver) -> Vec<Message> {
    drain_outbound(rx)
        .into_iter()
        .filter_map(|request| match request {
            Outbound::Publish(message) => Some(message),
            _ => None,
        })
        .collect()
}

pub fn topics(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.topic.as_str()).collect()
}

/// Wait until a message on `topic` arrives, collecting everything seen
pub async fn recv_until(rx: &mut OutboundReceiver, seen: &mut Vec<Message>, topic: &str) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let Outbound::Publish(message) = rx.recv().await.expect("channel closed") else {
                continue;
            };
            seen.push(message.clone());
            if message.topic == topic {
                return message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", topic))
}
