//! End-to-end scenarios over the loopback transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use weft::{
    ContextDescriptor, ContextId, Mode, PortEvent, RequestDescriptor, ResourceType,
    RouteError, Rule, RuleAction, RuleSource, Runtime, RuntimeConfig, StartupHandler, Tier,
    WakeSchedule,
};

fn ctx(s: &str) -> ContextId {
    ContextId::from_raw(s)
}

fn config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/// A context that answers every request with a fixed payload.
fn spawn_responder(mut handle: weft::ContextHandle, reply: &'static [u8]) {
    tokio::spawn(async move {
        while let Some(envelope) = handle.recv().await {
            if envelope.mode == Mode::Request {
                handle.respond(&envelope, Bytes::from_static(reply)).await.ok();
            }
        }
    });
}

#[tokio::test]
async fn request_response_between_contexts() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let page = runtime.attach(ContextDescriptor::page_bound("page-1", "https://example.com/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    spawn_responder(page, b"pong");

    let payload = ui.request(ctx("page-1"), "PING", Bytes::from_static(b"ping")).await?;
    assert_eq!(payload, Bytes::from_static(b"pong"));
    Ok(())
}

#[tokio::test]
async fn ping_to_never_started_context_is_unreachable_not_timeout() -> anyhow::Result<()> {
    let (runtime, transport) = Runtime::loopback(config())?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;

    let err = ui
        .request_with_deadline(ctx("page-b"), "PING", Bytes::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Unreachable(id) if id == ctx("page-b")));
    // One recovery attempt, then terminal.
    assert_eq!(transport.materialize_count(&ctx("page-b")), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_at_deadline_not_earlier() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let mut page = runtime.attach(ContextDescriptor::page_bound("page-1", "https://a/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    // Drain without ever responding.
    tokio::spawn(async move { while page.recv().await.is_some() {} });

    let started = tokio::time::Instant::now();
    let err = ui
        .request_with_deadline(ctx("page-1"), "PING", Bytes::new(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn coordinator_reinstantiation_refires_startup_handlers() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    runtime.register_at_startup(vec![StartupHandler::for_kind(
        "record",
        "EVENT",
        move |envelope| {
            seen2
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&envelope.payload).into_owned());
        },
    )]);

    let first = runtime.ensure_coordinator();
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    ui.notify(runtime.coordinator_id(), "EVENT", Bytes::from_static(b"one")).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["one".to_string()]);

    // Idle out the coordinator.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!runtime.snapshot().coordinator_alive);

    // The next inbound event re-materializes it; the handler table is
    // reinstalled before the event is dequeued, so nothing is lost.
    ui.notify(runtime.coordinator_id(), "EVENT", Bytes::from_static(b"two")).await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    assert!(runtime.snapshot().coordinator_generation > first.generation);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduled_wake_revives_terminated_coordinator() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let fired = Arc::new(Mutex::new(0u32));
    let fired2 = fired.clone();
    runtime.register_at_startup(vec![StartupHandler::for_kind("wakes", "wake", move |_| {
        *fired2.lock().unwrap() += 1;
    })]);

    runtime.schedule_wake("refresh", WakeSchedule::Every(Duration::from_secs(60)));
    assert!(!runtime.snapshot().coordinator_alive);

    tokio::time::sleep(Duration::from_secs(61)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(runtime.snapshot().coordinator_alive);
    assert_eq!(*fired.lock().unwrap(), 1);

    assert!(runtime.cancel_wake("refresh"));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*fired.lock().unwrap(), 1);
    Ok(())
}

#[tokio::test]
async fn port_messages_keep_order_across_two_concurrent_ports() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let page = runtime.attach(ContextDescriptor::page_bound("page-1", "https://a/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    let mut incoming = page.incoming_ports();

    let a = ui.connect(ctx("page-1"), "a");
    let b = ui.connect(ctx("page-1"), "b");
    for i in 1..=3u8 {
        a.post(Bytes::from(vec![i]))?;
    }
    for i in 10..=11u8 {
        b.post(Bytes::from(vec![i]))?;
    }

    let mut first = incoming.recv().await.unwrap();
    let mut second = incoming.recv().await.unwrap();
    if first.name() == "b" {
        std::mem::swap(&mut first, &mut second);
    }

    let mut collect = Vec::new();
    while collect.len() < 3 {
        match first.recv().await.unwrap() {
            PortEvent::Message(m) => collect.push(m[0]),
            PortEvent::Opened => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(collect, vec![1, 2, 3]);

    let mut collect = Vec::new();
    while collect.len() < 2 {
        match second.recv().await.unwrap() {
            PortEvent::Message(m) => collect.push(m[0]),
            PortEvent::Opened => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
    assert_eq!(collect, vec![10, 11]);
    Ok(())
}

#[tokio::test]
async fn detached_page_disconnects_its_ports_on_both_ends() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let page = runtime.attach(ContextDescriptor::page_bound("page-1", "https://a/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    let mut incoming = page.incoming_ports();

    let mut port = ui.connect(ctx("page-1"), "sync");
    let _accepted = incoming.recv().await.unwrap();
    assert!(matches!(port.recv().await, Some(PortEvent::Opened)));

    page.detach();
    assert_eq!(
        port.recv().await,
        Some(PortEvent::Disconnected(weft::DisconnectReason::HostEvicted))
    );
    // Closed is terminal; further posts are rejected synchronously.
    assert!(port.post(Bytes::from_static(b"x")).is_err());
    Ok(())
}

#[tokio::test]
async fn store_roundtrip_and_ordered_change_events() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let store = runtime.store();
    let mut changes = store.subscribe(Tier::DurableLocal);

    store.set(Tier::DurableLocal, vec![("theme".into(), json!("dark"))])?;
    store.set(Tier::DurableLocal, vec![("theme".into(), json!("light"))])?;

    let values = store.get(Tier::DurableLocal, &["theme"]);
    assert_eq!(values["theme"], json!("light"));

    let first = changes.recv().await?;
    assert_eq!(first.key, "theme");
    assert_eq!(first.old_value, None);
    assert_eq!(first.new_value, Some(json!("dark")));
    let second = changes.recv().await?;
    assert_eq!(second.old_value, Some(json!("dark")));
    assert_eq!(second.new_value, Some(json!("light")));
    Ok(())
}

#[tokio::test]
async fn concurrent_quota_exceeding_set_leaves_safe_set_intact() -> anyhow::Result<()> {
    let mut cfg = config();
    cfg.quotas.synced_max_bytes = 120;
    cfg.quotas.synced_max_entry_bytes = 0;
    let (runtime, _transport) = Runtime::loopback(cfg)?;
    let store = runtime.store().clone();

    let big = "x".repeat(200);
    let s1 = store.clone();
    let exceeding = tokio::task::spawn_blocking(move || {
        s1.set(Tier::DurableSynced, vec![("big".into(), json!(big))])
    });
    let s2 = store.clone();
    let safe = tokio::task::spawn_blocking(move || {
        s2.set(Tier::DurableSynced, vec![("small".into(), json!("v"))])
    });

    assert!(exceeding.await?.is_err());
    assert!(safe.await?.is_ok());

    let values = store.get(Tier::DurableSynced, &["big", "small"]);
    assert!(!values.contains_key("big"));
    assert_eq!(values["small"], json!("v"));
    assert!(store.usage(Tier::DurableSynced).used_bytes <= 120);
    Ok(())
}

#[tokio::test]
async fn rule_tie_break_fixture_block_beats_allow_at_equal_priority() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let rules = runtime.rules();
    rules.replace_source(
        RuleSource::Dynamic,
        vec![
            Rule::new(1, 5, r"tracker\.example", RuleAction::Allow),
            Rule::new(2, 5, r"tracker\.example", RuleAction::Block),
            // Carve-outs need strictly higher priority.
            Rule::new(3, 6, r"tracker\.example/status", RuleAction::Allow),
        ],
    )?;

    let blocked = RequestDescriptor::new("https://tracker.example/t.gif", "GET", ResourceType::Image);
    let carved = RequestDescriptor::new("https://tracker.example/status", "GET", ResourceType::Xhr);
    assert_eq!(rules.evaluate(&blocked), RuleAction::Block);
    assert_eq!(rules.evaluate(&carved), RuleAction::Allow);
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_all_other_contexts() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    runtime.ensure_coordinator();
    let mut page = runtime.attach(ContextDescriptor::page_bound("page-1", "https://a/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;

    let outcomes = ui.broadcast("notice", Bytes::from_static(b"hello")).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

    let envelope = page.recv().await.unwrap();
    assert_eq!(envelope.kind, "notice");
    assert_eq!(envelope.payload, Bytes::from_static(b"hello"));
    Ok(())
}

#[tokio::test]
async fn snapshot_reports_contexts_ports_store_and_rules() -> anyhow::Result<()> {
    let (runtime, _transport) = Runtime::loopback(config())?;
    let descriptor: weft::PackageDescriptor = serde_json::from_value(json!({
        "name": "sample",
        "coordinator": {"entry": "coordinator.js"},
        "pages": [{"pattern": "https://example.com/*"}]
    }))?;
    runtime.load_topology(&descriptor);

    let page = runtime.attach(ContextDescriptor::page_bound("page-0", "https://example.com/*"))?;
    let ui = runtime.attach(ContextDescriptor::ui_surface("ui"))?;
    let mut incoming = page.incoming_ports();
    let _port = ui.connect(ctx("page-0"), "sync");
    let _accepted = incoming.recv().await.unwrap();

    runtime.store().set(Tier::VolatileSession, vec![("k".into(), json!(1))])?;
    runtime
        .rules()
        .replace_source(RuleSource::Static, vec![Rule::new(1, 1, "ads", RuleAction::Block)])?;

    let snapshot = runtime.snapshot();
    assert!(snapshot.contexts.len() >= 3);
    assert_eq!(snapshot.ports.len(), 2);
    assert_eq!(snapshot.rules.len(), 1);
    let session = snapshot
        .store
        .iter()
        .find(|u| u.tier == Tier::VolatileSession)
        .unwrap();
    assert_eq!(session.entry_count, 1);
    Ok(())
}
