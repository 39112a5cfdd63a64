//! End-to-end tuning scenarios: debounced reload, normalization
//! failures, the dead-letter queue lifecycle, and the watcher-to-manager
//! pipeline.

use slabpool::error::Error;
use slabpool::weight::config::{Format, SizeClassDetail};
use slabpool::weight::dlq::{DeadLetterQueue, DlqEvent};
use slabpool::weight::hub::{Event, EventHub};
use slabpool::weight::processor::WeightProcessor;
use slabpool::weight::watcher::FileWatcher;
use slabpool::weight::{spawn_tuning_pipeline, CancelToken};
use slabpool::{Config, SizeCategory};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn config_body(version: &str) -> String {
    format!(
        r#"{{
  "version": "{version}",
  "global": {{"small": 0.3, "medium": 0.3, "large": 0.4}},
  "size_class": {{
    "small":  {{"description": "small",  "weights": [{{"size": 64,     "weight": 0.5}}, {{"size": 1024,   "weight": 0.5}}]}},
    "medium": {{"description": "medium", "weights": [{{"size": 8192,   "weight": 1.0}}]}},
    "large":  {{"description": "large",  "weights": [{{"size": 1048576, "weight": 1.0}}]}}
  }}
}}"#
    )
}

fn write_config(path: &Path, version: &str) {
    fs::write(path, config_body(version)).expect("failed to write config");
}

async fn recv_within(
    rx: &mut tokio::sync::mpsc::Receiver<Config>,
    millis: u64,
) -> Option<Config> {
    timeout(Duration::from_millis(millis), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debounced_reload_emits_last_of_burst() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    write_config(&path, "1.0");

    let watcher = FileWatcher::new(Format::Json, &path).unwrap();
    let mut rx = watcher.watch().unwrap();
    assert_eq!(recv_within(&mut rx, 500).await.unwrap().version, "1.0");

    // Three rewrites inside the debounce window.
    for version in ["1.1", "1.2", "1.3"] {
        write_config(&path, version);
        sleep(Duration::from_millis(150)).await;
    }

    // One emission, carrying the final version, and nothing after it.
    let cfg = recv_within(&mut rx, 3000).await.expect("no reload emitted");
    assert_eq!(cfg.version, "1.3");
    assert!(recv_within(&mut rx, 700).await.is_none());
    watcher.close();
}

#[tokio::test]
async fn test_normalization_rejects_bad_global_sum() {
    let raw = r#"{
        "version": "1.0",
        "global": {"small": 0.7, "medium": 0.3, "large": 0.1},
        "size_class": {
            "small":  {"description": "s", "weights": [{"size": 64, "weight": 1.0}]},
            "medium": {"description": "m", "weights": [{"size": 8192, "weight": 1.0}]},
            "large":  {"description": "l", "weights": [{"size": 1048576, "weight": 1.0}]}
        }
    }"#;
    let cfg = Format::Json.decode(raw).unwrap();

    let processor = WeightProcessor::new();
    match processor.normalize(&cfg).unwrap_err() {
        Error::InvalidConfiguration { scope, detail } => {
            assert_eq!(scope, "global");
            assert!(detail.contains("1.1"), "detail was {detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_dlq_lifecycle() {
    let dlq = DeadLetterQueue::new();
    let ctx = CancelToken::new();

    let mut ids = Vec::new();
    for i in 0..10 {
        let entry = DlqEvent::new(
            Event::size_class_change(SizeCategory::Small, SizeClassDetail::default()),
            format!("dispatch failure {i}"),
            None,
        );
        ids.push(dlq.push(entry, &ctx).unwrap());
    }
    assert_eq!(dlq.len(), 10);

    for expected in ids {
        let popped = dlq.pop(&ctx).unwrap().expect("queue drained early");
        assert_eq!(popped.id, expected);
    }
    assert_eq!(dlq.len(), 0);
    assert!(dlq.pop(&ctx).unwrap().is_none());

    dlq.close();
    assert!(matches!(
        dlq.push(
            DlqEvent::new(
                Event::size_class_change(SizeCategory::Small, SizeClassDetail::default()),
                "late".to_string(),
                None,
            ),
            &ctx,
        ),
        Err(Error::QueueClosed)
    ));
    assert!(matches!(dlq.pop(&ctx), Err(Error::QueueClosed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_to_hub_pipeline_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    write_config(&path, "1.0");

    let hub = Arc::new(EventHub::new());
    let mut all = hub.register("observer", SizeCategory::All, 0).unwrap();
    let mut medium_only = hub.register("medium", SizeCategory::Medium, 0).unwrap();

    let watcher = FileWatcher::new(Format::Json, &path).unwrap();
    let rx = watcher.watch().unwrap();
    let cancel = CancelToken::new();
    let pipeline = spawn_tuning_pipeline(rx, Arc::clone(&hub), cancel.clone());

    // The initial configuration becomes one global event plus one
    // size-class event per category.
    let mut observed = Vec::new();
    for _ in 0..4 {
        let event = timeout(Duration::from_secs(2), all.recv())
            .await
            .expect("pipeline stalled")
            .expect("hub closed early");
        observed.push(event.category);
    }
    assert!(observed.contains(&SizeCategory::All));
    assert!(observed.contains(&SizeCategory::Small));
    assert!(observed.contains(&SizeCategory::Medium));
    assert!(observed.contains(&SizeCategory::Large));

    // The filtered listener sees the global event and its own category.
    let mut medium_seen = Vec::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(2), medium_only.recv())
            .await
            .expect("pipeline stalled")
            .expect("hub closed early");
        medium_seen.push(event.category);
    }
    assert!(medium_seen.contains(&SizeCategory::All));
    assert!(medium_seen.contains(&SizeCategory::Medium));

    cancel.cancel();
    pipeline.await.unwrap();
    watcher.close();
    hub.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_keeps_last_good_config_on_bad_update() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    write_config(&path, "1.0");

    let hub = Arc::new(EventHub::new());
    let mut stream = hub.register("observer", SizeCategory::All, 0).unwrap();

    let watcher = FileWatcher::new(Format::Json, &path).unwrap();
    let rx = watcher.watch().unwrap();
    let cancel = CancelToken::new();
    let pipeline = spawn_tuning_pipeline(rx, Arc::clone(&hub), cancel.clone());

    // Drain the four events of the initial configuration.
    for _ in 0..4 {
        timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("pipeline stalled")
            .expect("hub closed early");
    }

    // An update with a broken global sum is rejected wholesale.
    fs::write(
        &path,
        r#"{"version": "bad", "global": {"small": 0.9, "medium": 0.9, "large": 0.9}}"#,
    )
    .unwrap();
    sleep(Duration::from_millis(900)).await;
    assert!(
        timeout(Duration::from_millis(300), stream.recv())
            .await
            .is_err(),
        "rejected configuration must not be dispatched"
    );

    // A good follow-up flows through again.
    write_config(&path, "2.0");
    let event = timeout(Duration::from_secs(3), stream.recv())
        .await
        .expect("pipeline stalled")
        .expect("hub closed early");
    assert_eq!(event.category, SizeCategory::All);

    cancel.cancel();
    pipeline.await.unwrap();
    watcher.close();
    hub.close();
}
