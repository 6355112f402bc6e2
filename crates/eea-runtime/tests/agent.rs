//! Agent task: swaps, routing and connection handling

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use eea_runtime::{
    AgentHandle, AgentOptions, ArtifactStore, EdgeAgent, EeaError, HelloMessage, MemoryBlobStore,
    MemoryTransport, Message, NULL_BUNDLE, Outbound, OutboundReceiver, QoS, RegisteredFunctions,
    TopicLayout, forward_outbound,
};

struct Harness {
    handle: AgentHandle,
    outbound: OutboundReceiver,
    store: Arc<MemoryBlobStore>,
    layout: TopicLayout,
}

fn options(layout: &TopicLayout, interval: Duration) -> AgentOptions {
    let mut options = AgentOptions::new(layout.clone());
    options.loop_interval = interval;
    options.agent_version = "test-agent".to_string();
    options
}

fn start(artifacts: Option<ArtifactStore>, interval: Duration) -> Harness {
    let store = Arc::new(MemoryBlobStore::new());
    let (runtime, outbound) = runtime(store.clone(), RegisteredFunctions::new());
    let layout = TopicLayout::new("losant", DEVICE_ID);

    let (agent, handle) = EdgeAgent::new(runtime, artifacts, options(&layout, interval));
    agent.spawn();

    Harness {
        handle,
        outbound,
        store,
        layout,
    }
}

fn hellos(messages: &[Message], layout: &TopicLayout) -> Vec<HelloMessage> {
    messages
        .iter()
        .filter(|m| m.topic == layout.hello())
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect()
}

const IDLE: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_swap_hands_storage_to_next_version() {
    let mut h = start(None, IDLE);

    let v1 = artifact(&engine_wat("v1-state"), "bundle-v1");
    let v2 = artifact(&engine_wat("v2-state"), "bundle-v2");

    assert_eq!(h.handle.load_artifact(v1).await.unwrap(), "bundle-v1");
    assert_eq!(h.handle.load_artifact(v2).await.unwrap(), "bundle-v2");

    let messages = drain(&mut h.outbound);
    let shutdown = messages.iter().position(|m| m.topic == "shutdown").unwrap();
    let storage = messages.iter().rposition(|m| m.topic == "storage").unwrap();

    // The old instance saves before the new one reads
    assert!(shutdown < storage);
    assert_eq!(messages[shutdown].payload, "v1-state");
    assert_eq!(messages[storage].payload, "v1-state");

    let info = h.handle.info().await.unwrap();
    assert_eq!(info.bundle, "bundle-v2");
    assert_eq!(info.state.as_deref(), Some("running"));
    assert_eq!(info.instances_created, 2);

    let bundles: Vec<String> = hellos(&messages, &h.layout)
        .into_iter()
        .map(|hello| hello.bundle)
        .collect();
    assert_eq!(bundles, vec!["bundle-v1", "bundle-v2"]);

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.store.snapshot().unwrap(), b"v2-state");
}

#[tokio::test]
async fn test_rejected_candidate_keeps_current_instance() {
    let mut h = start(None, IDLE);
    h.handle
        .load_artifact(artifact(&engine_wat("v1-state"), "bundle-v1"))
        .await
        .unwrap();
    drain(&mut h.outbound);

    let wrong_version = artifact_with(&engine_wat("x"), "2.0.0", "bundle-v2");
    assert!(matches!(
        h.handle.load_artifact(wrong_version).await,
        Err(EeaError::Validation(_))
    ));

    let no_bundle = artifact_sections(&engine_wat("x"), &[("interfaceVersion", "1.0.0")]);
    assert!(matches!(
        h.handle.load_artifact(no_bundle).await,
        Err(EeaError::Validation(_))
    ));

    assert!(matches!(
        h.handle.load_artifact(b"not a module".to_vec()).await,
        Err(EeaError::Validation(_))
    ));

    // Compiles but lacks the required exports
    let partial = artifact("(module (memory (export \"memory\") 1))", "bundle-v3");
    assert!(h.handle.load_artifact(partial).await.is_err());

    let after = drain(&mut h.outbound);
    assert!(after.iter().all(|m| m.topic != "shutdown"));
    assert!(hellos(&after, &h.layout).is_empty());

    let info = h.handle.info().await.unwrap();
    assert_eq!(info.bundle, "bundle-v1");
    assert_eq!(info.rejected_candidates, 4);
    assert_eq!(info.instances_created, 1);

    // Still serving
    h.handle.message_received("losant/device-1234/command", "ping").await.unwrap();
    let mut seen = Vec::new();
    let echo = recv_until(&mut h.outbound, &mut seen, "echo").await;
    assert_eq!(echo.payload, "ping");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_flows_topic_triggers_swap() {
    let h = start(None, IDLE);
    let flows = h.layout.flows();

    h.handle
        .message_received(flows, artifact(&engine_wat("x"), "from-broker"))
        .await
        .unwrap();

    let info = h.handle.info().await.unwrap();
    assert_eq!(info.bundle, "from-broker");
    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_subscribes_and_says_hello() {
    let mut h = start(None, IDLE);
    h.handle.set_connection_status(true).await.unwrap();

    let info = h.handle.info().await.unwrap();
    assert!(info.connected);
    assert_eq!(info.bundle, NULL_BUNDLE);

    let queued = drain_outbound(&mut h.outbound);
    let Some(Outbound::Subscribe { topics, qos }) = queued.first() else {
        panic!("expected a subscription first, got {:?}", queued);
    };
    assert_eq!(*qos, QoS::AtLeastOnce);
    assert_eq!(topics, &h.layout.subscriptions());
    assert!(topics.contains(&"losant/device-1234/toAgent/#".to_string()));
    assert!(topics.contains(&"losant/device-1234/command".to_string()));

    let published: Vec<Message> = queued.iter().filter_map(|q| q.message().cloned()).collect();
    let hello = hellos(&published, &h.layout);
    assert_eq!(hello.len(), 1);
    assert_eq!(hello[0].bundle, NULL_BUNDLE);
    assert_eq!(hello[0].version, "test-agent");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_status_reaches_guest() {
    let mut h = start(None, IDLE);
    h.handle.set_connection_status(true).await.unwrap();
    h.handle
        .load_artifact(artifact(&engine_wat("x"), "bundle-v1"))
        .await
        .unwrap();

    // Announced at construction and again after init
    let statuses: Vec<String> = drain(&mut h.outbound)
        .into_iter()
        .filter(|m| m.topic == "status")
        .map(|m| m.payload)
        .collect();
    assert_eq!(statuses, vec!["1", "1"]);

    h.handle.set_connection_status(false).await.unwrap();
    let mut seen = Vec::new();
    let status = recv_until(&mut h.outbound, &mut seen, "status").await;
    assert_eq!(status.payload, "0");

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_direct_trigger_runs_on_tick() {
    let mut h = start(None, Duration::from_millis(10));

    assert!(matches!(
        h.handle.direct_trigger("t1", "{}").await,
        Err(EeaError::InvalidState(_))
    ));

    h.handle
        .load_artifact(artifact(&engine_wat("x"), "bundle-v1"))
        .await
        .unwrap();
    h.handle.direct_trigger("t1", "{\"on\":true}").await.unwrap();
    h.handle.direct_trigger("t2", "{\"on\":false}").await.unwrap();

    let mut seen = Vec::new();
    let first = recv_until(&mut h.outbound, &mut seen, "workflow").await;
    assert_eq!(first.payload, "{\"on\":true}");
    let second = recv_until(&mut h.outbound, &mut seen, "workflow").await;
    assert_eq!(second.payload, "{\"on\":false}");

    assert!(h.handle.info().await.unwrap().ticks > 0);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_persisted_artifact_loaded_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.wasm");
    std::fs::write(&path, artifact(&engine_wat("x"), "persisted")).unwrap();

    let mut h = start(Some(ArtifactStore::new(&path)), IDLE);

    let info = h.handle.info().await.unwrap();
    assert_eq!(info.bundle, "persisted");

    let mut seen = Vec::new();
    recv_until(&mut h.outbound, &mut seen, "init").await;
    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_loaded_artifact_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.wasm");
    let bytes = artifact(&engine_wat("x"), "fresh");

    let h = start(Some(ArtifactStore::new(&path)), IDLE);
    h.handle.load_artifact(bytes.clone()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), bytes);

    // A rejected candidate does not overwrite it
    let _ = h.handle.load_artifact(b"garbage".to_vec()).await;
    assert_eq!(std::fs::read(&path).unwrap(), bytes);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_follows_guest_shutdown_messages() {
    let mut h = start(None, IDLE);
    h.handle
        .load_artifact(artifact(&engine_wat("bye"), "bundle-v1"))
        .await
        .unwrap();
    drain(&mut h.outbound);

    h.handle.shutdown().await.unwrap();
    let queued = drain_outbound(&mut h.outbound);
    let shutdown = queued
        .iter()
        .position(|q| q.message().is_some_and(|m| m.topic == "shutdown"))
        .unwrap();
    assert!(shutdown < queued.len() - 1);
    assert_eq!(queued.last(), Some(&Outbound::Disconnect));

    assert!(matches!(h.handle.info().await, Err(EeaError::AgentStopped)));
}

#[tokio::test]
async fn test_forwarder_delivers_final_messages() {
    let store = Arc::new(MemoryBlobStore::new());
    let (runtime, outbound) = runtime(store, RegisteredFunctions::new());
    let layout = TopicLayout::new("losant", DEVICE_ID);
    let transport = Arc::new(MemoryTransport::new());

    let (agent, handle) = EdgeAgent::new(runtime, None, options(&layout, IDLE));
    let agent_task = agent.spawn();
    let forwarder = forward_outbound(outbound, transport.clone());

    handle.set_connection_status(true).await.unwrap();
    handle
        .load_artifact(artifact(&engine_wat("bye"), "bundle-v1"))
        .await
        .unwrap();
    handle.shutdown().await.unwrap();
    agent_task.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), forwarder)
        .await
        .expect("forwarder did not stop")
        .unwrap();

    assert!(transport.is_disconnected());
    assert_eq!(transport.subscriptions().len(), layout.subscriptions().len());
    let published = transport.published();
    let last = published.last().unwrap();
    assert_eq!(last.topic, "shutdown");
    assert_eq!(last.payload, "bye");
}
