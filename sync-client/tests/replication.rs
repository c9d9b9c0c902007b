//! End-to-end replication tests: coordinators talking through the in-process
//! transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use patchsync_client::{
    Coordinator, EventKind, MockTransport, Origin, Plugin, PluginError, Strategy, SyncConfig,
    SyncEvent, TransportFactory,
};
use patchsync_core::{ConflictEngine, ConflictPolicy};
use patchsync_types::{InstanceId, Operation, Patch, PointerPath, SourceId};
use serde_json::{json, Value};

fn ptr(s: &str) -> PointerPath {
    s.parse().unwrap()
}

fn replica(factory: &TransportFactory) -> Coordinator {
    Coordinator::builder().factory(factory.clone()).build()
}

/// Poll until `coordinator` holds `expected`, or fail after a few seconds.
async fn wait_for_state(coordinator: &Coordinator, expected: &Value) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if coordinator.state().await.as_ref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "replica never reached {expected}, has {:?}",
        coordinator.state().await
    );
}

// ===========================================
// Scenarios
// ===========================================

#[tokio::test]
async fn scenario_a_update_emits_one_versioned_patch() {
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    coordinator
        .watch(json!({"name": "John"}), SyncConfig::new("person"))
        .await
        .unwrap();

    let patch = coordinator
        .update(vec![Operation::replace(ptr("/name"), json!("Jane"))])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        patch.operations,
        vec![Operation::replace(ptr("/name"), json!("Jane"))]
    );
    assert_eq!(patch.version, 1);

    let next = coordinator
        .update(vec![Operation::replace(ptr("/name"), json!("Jo"))])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.version, 2);

    let sent = transport.sent_envelopes();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].to_patch().unwrap(), patch);
}

#[tokio::test]
async fn scenario_b_later_incoming_patch_wins() {
    let engine = ConflictEngine::new();
    let source = SourceId::random();
    let local = Patch::new(
        source,
        InstanceId::new("doc"),
        vec![Operation::replace(ptr("/x"), json!(1))],
        1,
    )
    .with_timestamp(100);
    let incoming = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::replace(ptr("/x"), json!(2))],
        1,
    )
    .with_timestamp(200);

    assert!(engine.has_conflict(&local, &incoming));
    let resolved = engine.resolve(&local, &incoming, None).patch;
    assert_eq!(resolved.operations, incoming.operations);

    // The same outcome through a coordinator.
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport));
    coordinator
        .watch(json!({"x": 0}), SyncConfig::new("doc"))
        .await
        .unwrap();
    let mine = coordinator
        .update(vec![Operation::replace(ptr("/x"), json!(1))])
        .await
        .unwrap()
        .unwrap();
    let theirs = incoming.clone().with_timestamp(mine.timestamp + 100);
    coordinator
        .handle_envelope(patchsync_types::Envelope::patch(&theirs).unwrap())
        .await;

    assert_eq!(coordinator.state().await.unwrap(), json!({"x": 2}));
}

#[tokio::test]
async fn scenario_c_offline_sync_is_queued_and_flushed() {
    let transport = MockTransport::new();
    transport.set_offline();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    coordinator
        .watch(json!({"count": 0}), SyncConfig::new("counter"))
        .await
        .unwrap();
    assert!(!coordinator.status().await.is_connected());

    coordinator
        .mutate(|state| state["count"] = json!(1))
        .await
        .unwrap();
    let patch = coordinator.sync().await.unwrap().unwrap();
    assert_eq!(coordinator.queue_status().await.unwrap().pending, 1);

    transport.set_online();
    let report = coordinator.flush_queue().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(coordinator.queue_status().await.unwrap().pending, 0);
    assert_eq!(transport.sent_envelopes()[0].to_patch().unwrap(), patch);
}

#[tokio::test]
async fn scenario_d_path_based_keeps_every_disjoint_operation() {
    let a = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::replace(ptr("/a"), json!(1))],
        1,
    )
    .with_timestamp(10);
    let b = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::replace(ptr("/b"), json!(2))],
        1,
    )
    .with_timestamp(20);

    let resolved = ConflictEngine::new()
        .resolve(&a, &b, Some(ConflictPolicy::PathBased))
        .patch;

    assert_eq!(resolved.operations.len(), 2);
    assert!(resolved.operations.contains(&a.operations[0]));
    assert!(resolved.operations.contains(&b.operations[0]));
}

// ===========================================
// Replication properties
// ===========================================

#[tokio::test]
async fn two_replicas_converge_over_broadcast() {
    let factory = TransportFactory::new();
    let a = replica(&factory);
    let b = replica(&factory);
    let start = json!({"title": "draft", "tags": []});
    a.watch(start.clone(), SyncConfig::new("doc")).await.unwrap();
    b.watch(start, SyncConfig::new("doc")).await.unwrap();

    a.update(vec![Operation::replace(ptr("/title"), json!("from a"))])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.update(vec![
        Operation::replace(ptr("/title"), json!("from b")),
        Operation::add(ptr("/tags/-"), json!("urgent")),
    ])
    .await
    .unwrap();

    let expected = json!({"title": "from b", "tags": ["urgent"]});
    wait_for_state(&a, &expected).await;
    wait_for_state(&b, &expected).await;
}

#[tokio::test]
async fn replies_to_applied_edits_converge() {
    // Edits that follow each other causally, often within one millisecond.
    for _ in 0..50 {
        let a_transport = MockTransport::new();
        let b_transport = MockTransport::new();
        let a = Coordinator::new(Arc::new(a_transport.clone()));
        let b = Coordinator::new(Arc::new(b_transport.clone()));
        a.watch(json!({"x": 0}), SyncConfig::new("doc")).await.unwrap();
        b.watch(json!({"x": 0}), SyncConfig::new("doc")).await.unwrap();

        b.update(vec![Operation::replace(ptr("/x"), json!(2))])
            .await
            .unwrap();
        for envelope in b_transport.sent_envelopes() {
            a.handle_envelope(envelope).await;
        }

        a.update(vec![Operation::replace(ptr("/x"), json!(3))])
            .await
            .unwrap();
        for envelope in a_transport.sent_envelopes() {
            b.handle_envelope(envelope).await;
        }

        assert_eq!(a.state().await.unwrap(), json!({"x": 3}));
        assert_eq!(b.state().await.unwrap(), json!({"x": 3}));
    }
}

#[tokio::test]
async fn replicas_converge_over_storage_polling() {
    let factory = TransportFactory::new().with_poll_interval(Duration::from_millis(5));
    let a = replica(&factory);
    let b = replica(&factory);
    let config = || SyncConfig::new("doc").with_strategy(Strategy::Storage);
    a.watch(json!({"n": 0}), config()).await.unwrap();
    b.watch(json!({"n": 0}), config()).await.unwrap();

    a.update(vec![Operation::replace(ptr("/n"), json!(7))])
        .await
        .unwrap();

    wait_for_state(&b, &json!({"n": 7})).await;
}

#[tokio::test]
async fn own_patches_are_not_applied_twice() {
    let factory = TransportFactory::new();
    let a = replica(&factory);
    a.watch(json!({"list": []}), SyncConfig::new("doc")).await.unwrap();
    let mut rx = a.events().subscribe();

    a.update(vec![Operation::add(ptr("/list/-"), json!(1))])
        .await
        .unwrap();
    // Broadcast echoes to the sender; give the receive loop time to see it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.state().await.unwrap(), json!({"list": [1]}));
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, SyncEvent::Update { origin: Origin::Remote, .. }),
            "own patch was applied as remote"
        );
    }
}

#[tokio::test]
async fn first_sync_after_watch_is_silent() {
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    coordinator
        .watch(json!({"already": "populated"}), SyncConfig::new("doc"))
        .await
        .unwrap();

    assert!(coordinator.sync().await.unwrap().is_none());
    assert!(transport.sent_messages().is_empty());
}

#[tokio::test]
async fn changes_outside_paths_never_leave() {
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    let config = SyncConfig::new("doc").with_paths(["profile.name"]);
    coordinator
        .watch(
            json!({"profile": {"name": "a", "age": 1}, "local": 0}),
            config,
        )
        .await
        .unwrap();

    coordinator
        .mutate(|s| {
            s["local"] = json!(1);
            s["profile"]["age"] = json!(2);
        })
        .await
        .unwrap();
    assert!(coordinator.sync().await.unwrap().is_none());

    coordinator
        .mutate(|s| s["profile"]["name"] = json!("b"))
        .await
        .unwrap();
    let patch = coordinator.sync().await.unwrap().unwrap();
    assert_eq!(
        patch.operations,
        vec![Operation::replace(ptr("/profile/name"), json!("b"))]
    );
}

#[tokio::test]
async fn redelivered_patch_applies_once() {
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    coordinator
        .watch(json!({"items": []}), SyncConfig::new("doc"))
        .await
        .unwrap();

    let patch = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::add(ptr("/items/-"), json!("milk"))],
        1,
    );
    let envelope = patchsync_types::Envelope::patch(&patch).unwrap();
    transport.inject(&envelope);
    transport.inject(&envelope);

    wait_for_state(&coordinator, &json!({"items": ["milk"]})).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        coordinator.state().await.unwrap(),
        json!({"items": ["milk"]})
    );
}

// ===========================================
// Durability
// ===========================================

#[tokio::test]
async fn queued_patches_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("queue.db");
    let config = || SyncConfig::new("doc").with_database(&db);

    let first = MockTransport::new();
    first.set_offline();
    let coordinator = Coordinator::new(Arc::new(first));
    coordinator.watch(json!({"n": 0}), config()).await.unwrap();
    coordinator
        .update(vec![Operation::replace(ptr("/n"), json!(1))])
        .await
        .unwrap();
    coordinator.unwatch().await;
    drop(coordinator);

    let second = MockTransport::new();
    let restarted = Coordinator::new(Arc::new(second.clone()));
    second.fail_next_connect("still offline");
    restarted.watch(json!({"n": 1}), config()).await.unwrap();
    assert_eq!(restarted.queue_status().await.unwrap().pending, 1);

    let report = restarted.flush_queue().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(second.sent_envelopes().len(), 1);
}

// ===========================================
// Plugins and resolvers
// ===========================================

#[derive(Default)]
struct Recorder {
    hooks: Mutex<Vec<&'static str>>,
}

struct RecordingPlugin(Arc<Recorder>);

#[async_trait]
impl Plugin for RecordingPlugin {
    fn id(&self) -> &str {
        "recorder"
    }

    async fn on_init(&self, _ctx: &patchsync_client::PluginContext) -> Result<(), PluginError> {
        self.0.hooks.lock().unwrap().push("init");
        Ok(())
    }

    async fn on_send(&self, patch: Patch) -> Result<Option<Patch>, PluginError> {
        self.0.hooks.lock().unwrap().push("send");
        // Keep private fields local.
        if patch
            .operations
            .iter()
            .any(|op| op.path.to_string().starts_with("/private"))
        {
            return Ok(None);
        }
        Ok(Some(patch))
    }

    async fn on_apply(&self, _patch: &Patch) -> Result<(), PluginError> {
        self.0.hooks.lock().unwrap().push("apply");
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), PluginError> {
        self.0.hooks.lock().unwrap().push("destroy");
        Ok(())
    }
}

#[tokio::test]
async fn plugin_sees_the_whole_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport.clone()));
    let mut rx = coordinator.events().subscribe();
    let config = SyncConfig::new("doc")
        .with_plugin(Arc::new(RecordingPlugin(recorder.clone())))
        .with_plugin(Arc::new(RecordingPlugin(recorder.clone())));

    coordinator
        .watch(json!({"private": 0, "public": 0}), config)
        .await
        .unwrap();
    coordinator
        .update(vec![Operation::replace(ptr("/private"), json!(1))])
        .await
        .unwrap();
    coordinator
        .update(vec![Operation::replace(ptr("/public"), json!(1))])
        .await
        .unwrap();
    let remote = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::add(ptr("/shared"), json!(true))],
        1,
    );
    coordinator
        .handle_envelope(patchsync_types::Envelope::patch(&remote).unwrap())
        .await;
    coordinator.unwatch().await;

    // The duplicate registration was ignored, so each hook ran once.
    assert_eq!(
        *recorder.hooks.lock().unwrap(),
        vec!["init", "send", "send", "apply", "destroy"]
    );
    // Only the public change reached the transport.
    let sent = transport.sent_envelopes();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].to_patch().unwrap().operations[0].path,
        ptr("/public")
    );

    let mut loaded = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind() == EventKind::PluginLoaded {
            loaded += 1;
        }
    }
    assert_eq!(loaded, 1);
}

struct PanickingResolver;

impl patchsync_core::ConflictResolver for PanickingResolver {
    fn resolve(
        &self,
        _local: &Patch,
        _incoming: &Patch,
    ) -> Result<Patch, patchsync_core::ResolverError> {
        panic!("resolver bug");
    }
}

#[tokio::test]
async fn failing_resolver_falls_back_to_last_write_wins() {
    let transport = MockTransport::new();
    let coordinator = Coordinator::new(Arc::new(transport));
    let config = SyncConfig::new("doc").with_resolver(Arc::new(PanickingResolver));
    coordinator.watch(json!({"x": 0}), config).await.unwrap();
    let mut rx = coordinator.events().subscribe();

    let local = coordinator
        .update(vec![Operation::replace(ptr("/x"), json!("local"))])
        .await
        .unwrap()
        .unwrap();
    let incoming = Patch::new(
        SourceId::random(),
        InstanceId::new("doc"),
        vec![Operation::replace(ptr("/x"), json!("remote"))],
        1,
    )
    .with_timestamp(local.timestamp + 50);
    coordinator
        .handle_envelope(patchsync_types::Envelope::patch(&incoming).unwrap())
        .await;

    assert_eq!(coordinator.state().await.unwrap(), json!({"x": "remote"}));
    let mut saw_resolver_error = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::Error { source, .. } = event {
            saw_resolver_error |= source == patchsync_client::ErrorSource::Resolver;
        }
    }
    assert!(saw_resolver_error);
}
