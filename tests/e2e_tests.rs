use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::{HistoryStore, InstanceStatus};
use duraflow::{
    ActivityContext, ActivityErrorKind, ActivityRegistry, BackoffStrategy, Client, ClientError, EventKind,
    OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, RetryPolicy, Runtime, RuntimeOptions,
    StartOutcome, TriggerAdapter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

mod common;

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        recovery_interval: Duration::from_millis(50),
        activity_retry: RetryPolicy::no_retry(),
        ..Default::default()
    }
}

fn pipeline_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("ImagePipeline", |ctx: OrchestrationContext, file: String| async move {
            let metadata = ctx.schedule_activity("Extract", file).await?;
            duraflow::durable_info!(ctx, metadata = %metadata, "metadata extracted");
            let result = ctx.schedule_activity("Thumbnail", metadata).await?;
            Ok(result)
        })
        .build()
        .unwrap()
}

fn pipeline_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Extract", |_ctx, file: String| async move {
            assert_eq!(file, "file123");
            Ok(r#"{"size": 42}"#.to_string())
        })
        .register("Thumbnail", |_ctx, metadata: String| async move {
            if metadata == r#"{"size": 42}"# {
                Ok("ok".to_string())
            } else {
                Err(format!("unexpected metadata: {metadata}"))
            }
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_file123_pipeline_end_to_end() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let rt = Runtime::start_with_options(
        store.clone(),
        pipeline_activities(),
        pipeline_orchestrations(),
        fast_options(),
    )
    .await;
    let client = rt.client();

    let instance = client.start_orchestration("ImagePipeline", "file123").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "ok".to_string()
        }
    );

    let hist = client.read_history(&instance).await.unwrap();
    assert_eq!(
        common::event_types(&hist),
        vec![
            "OrchestrationStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityCompleted",
            "OrchestrationCompleted",
        ]
    );
    assert!(matches!(&hist[1].kind, EventKind::ActivityScheduled { step: 0, name, .. } if name == "Extract"));
    assert!(matches!(&hist[2].kind, EventKind::ActivityCompleted { source_event_id: 2, .. }));
    assert!(
        matches!(&hist[3].kind, EventKind::ActivityScheduled { step: 1, name, input } if name == "Thumbnail" && input == r#"{"size": 42}"#)
    );

    let info = client.get_status(&instance).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Completed);
    assert_eq!(info.input, "file123");

    let metrics = rt.metrics_snapshot();
    assert_eq!(metrics.activity_success, 2);
    assert_eq!(metrics.orch_completions, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_one_scheduled_event_per_step_under_extra_signals() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register("Slow", |_ctx, input: String| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(input)
        })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Chain", |ctx: OrchestrationContext, _input: String| async move {
            let mut acc = String::new();
            for i in 0..5 {
                acc.push_str(&ctx.schedule_activity("Slow", i.to_string()).await?);
            }
            Ok(acc)
        })
        .build()
        .unwrap();
    let options = RuntimeOptions {
        recovery_interval: Duration::from_millis(1),
        ..fast_options()
    };
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, options).await;
    let client = rt.client();
    let instance = client.start_orchestration("Chain", "").await.unwrap();
    // duplicate starts are no-ops that also wake the instance
    for _ in 0..5 {
        assert_eq!(
            client.start_orchestration_with_id(&instance, "Chain", "").await.unwrap(),
            StartOutcome::AlreadyExists
        );
    }

    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "01234".to_string()
        }
    );
    let hist = store.read(&instance).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, "Slow"), 5);
    let completions = hist
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 5);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_completes_out_of_order() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register("A", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok("a".to_string())
        })
        .register("B", |_ctx, _input: String| async move { Ok("b".to_string()) })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("A", "");
            let b = ctx.schedule_activity("B", "");
            let results = ctx.join(vec![a, b]).await;
            let mut out = Vec::new();
            for r in results {
                out.push(r?);
            }
            Ok(out.join(","))
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client.start_orchestration("FanOut", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "a,b".to_string()
        }
    );

    let hist = store.read(&instance).await.unwrap();
    // both calls issued in one turn, B finished first
    assert_eq!(common::event_types(&hist)[1..3], ["ActivityScheduled", "ActivityScheduled"]);
    assert!(matches!(hist[3].kind, EventKind::ActivityCompleted { source_event_id: 3, .. }));
    assert!(matches!(hist[4].kind, EventKind::ActivityCompleted { source_event_id: 2, .. }));
    rt.shutdown().await;
}

#[tokio::test]
async fn test_activity_failure_fails_orchestration() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register("Thumbnail", |_ctx, _input: String| async move { Err("disk full".to_string()) })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, input: String| async move {
            Ok(ctx.schedule_activity("Thumbnail", input).await?)
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client.start_orchestration("Pipeline", "x").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    match status {
        OrchestrationStatus::Failed { error } => assert_eq!(error, "activity 'Thumbnail' failed: disk full"),
        other => panic!("unexpected status: {other:?}"),
    }
    let hist = store.read(&instance).await.unwrap();
    let failure = hist
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ActivityFailed { error, .. } => Some(error.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure.kind, ActivityErrorKind::Application);
    assert_eq!(failure.attempts, 1);
    assert_eq!(rt.metrics_snapshot().orch_failures, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_activity_retried_per_policy() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = calls.clone();
    let activities = ActivityRegistry::builder()
        .register_with_retry(
            "Flaky",
            RetryPolicy::new(3).with_backoff(BackoffStrategy::None),
            move |ctx: ActivityContext, _input: String| {
                let calls = calls_in_activity.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Err(format!("transient failure on attempt {}", ctx.attempt()))
                    } else {
                        Ok(format!("ok after {}", ctx.attempt()))
                    }
                }
            },
        )
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Retrying", |ctx: OrchestrationContext, _input: String| async move {
            Ok(ctx.schedule_activity("Flaky", "").await?)
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client.start_orchestration("Retrying", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "ok after 3".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(rt.metrics_snapshot().activity_retries, 2);
    // retries are invisible in history
    assert_eq!(common::count_scheduled(&store.read(&instance).await.unwrap(), "Flaky"), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_activity_timeout_and_panic_become_failures() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register_with_retry(
            "Hang",
            RetryPolicy::new(2)
                .with_backoff(BackoffStrategy::None)
                .with_timeout(Duration::from_millis(20)),
            |_ctx, _input: String| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            },
        )
        .register("Boom", |_ctx, _input: String| async move {
            if true {
                panic!("kaboom");
            }
            Ok(String::new())
        })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Both", |ctx: OrchestrationContext, _input: String| async move {
            let hang = ctx.schedule_activity("Hang", "").await;
            let boom = ctx.schedule_activity("Boom", "").await;
            let hang = hang.unwrap_err();
            let boom = boom.unwrap_err();
            Ok(format!("{:?}/{}|{:?}/{}", hang.kind, hang.attempts, boom.kind, boom.message))
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store, activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client.start_orchestration("Both", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "TimedOut/2|Application/activity panicked: kaboom".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_activity_fails_without_retry() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let orchestrations = OrchestrationRegistry::builder()
        .register("UsesMissing", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Missing", "").await {
                Ok(_) => Ok("unexpected".to_string()),
                Err(e) if e.kind == ActivityErrorKind::Unregistered => Err(e.message),
                Err(e) => Err(e.to_string()),
            }
        })
        .build()
        .unwrap();
    let options = RuntimeOptions {
        activity_retry: RetryPolicy::new(5),
        ..fast_options()
    };
    let rt = Runtime::start_with_options(store, ActivityRegistry::default(), orchestrations, options).await;
    let client = rt.client();
    let instance = client.start_orchestration("UsesMissing", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Failed {
            error: "unregistered activity: Missing".to_string()
        }
    );
    assert_eq!(rt.metrics_snapshot().activity_retries, 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_orchestration_fails_instance() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let rt = Runtime::start_with_options(
        store,
        ActivityRegistry::default(),
        OrchestrationRegistry::default(),
        fast_options(),
    )
    .await;
    let client = rt.client();
    let instance = client.start_orchestration("Nope", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Failed {
            error: "unregistered orchestration: Nope".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_orchestration_error_and_panic() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let orchestrations = OrchestrationRegistry::builder()
        .register("Refuses", |_ctx: OrchestrationContext, input: String| async move {
            Err(format!("bad input: {input}"))
        })
        .register("Panics", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("orchestration bug");
            }
            Ok(String::new())
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store, ActivityRegistry::default(), orchestrations, fast_options()).await;
    let client = rt.client();

    let refused = client.start_orchestration("Refuses", "x").await.unwrap();
    let panicked = client.start_orchestration("Panics", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration(&refused, WAIT).await.unwrap(),
        OrchestrationStatus::Failed {
            error: "bad input: x".to_string()
        }
    );
    match client.wait_for_orchestration(&panicked, WAIT).await.unwrap() {
        OrchestrationStatus::Failed { error } => assert!(error.contains("orchestration bug"), "{error}"),
        other => panic!("unexpected status: {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn test_terminate_is_monotonic() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let release = Arc::new(tokio::sync::Notify::new());
    let release_in_activity = release.clone();
    let activities = ActivityRegistry::builder()
        .register("Blocking", move |_ctx: ActivityContext, _input: String| {
            let release = release_in_activity.clone();
            async move {
                release.notified().await;
                Ok("late".to_string())
            }
        })
        .register("Never", |_ctx, _input: String| async move { Ok(String::new()) })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Long", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Blocking", "").await?;
            Ok(ctx.schedule_activity("Never", "").await?)
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client.start_orchestration("Long", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            &instance,
            |h| common::count_scheduled(h, "Blocking") == 1,
            2_000
        )
        .await
    );

    client.terminate(&instance, "operator request").await.unwrap();
    // terminating again is a no-op
    client.terminate(&instance, "second").await.unwrap();
    release.notify_one();

    assert!(
        common::wait_for_history(
            store.clone(),
            &instance,
            |h| h.iter().any(|e| matches!(e.kind, EventKind::ActivityCompleted { .. })),
            2_000
        )
        .await
    );
    // give the runtime a few recovery sweeps to misbehave
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = client.get_orchestration_status(&instance).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Terminated {
            reason: "operator request".to_string()
        }
    );
    let hist = store.read(&instance).await.unwrap();
    assert_eq!(common::count_scheduled(&hist, "Never"), 0);
    let terminals = hist
        .iter()
        .filter(|e| matches!(e.kind, EventKind::OrchestrationCompleted { .. }))
        .count();
    assert_eq!(terminals, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_trigger_starts_single_instance() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let rt = Runtime::start_with_options(
        store.clone(),
        pipeline_activities(),
        pipeline_orchestrations(),
        fast_options(),
    )
    .await;
    let trigger = TriggerAdapter::new(rt.client(), "ImagePipeline");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let trigger = trigger.clone();
        handles.push(tokio::spawn(async move { trigger.notify_new_work("file123").await }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let client = rt.client();
    let status = client.wait_for_orchestration(&ids[0], WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "ok".to_string()
        }
    );
    assert_eq!(client.list_instances(None).await.unwrap(), vec![ids[0].clone()]);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_system_activities_are_replay_stable() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let orchestrations = OrchestrationRegistry::builder()
        .register("Clock", |ctx: OrchestrationContext, _input: String| async move {
            let now = ctx.utc_now().await?;
            let guid = ctx.new_guid().await?;
            let millis = now
                .duration_since(std::time::UNIX_EPOCH)
                .map_err(|e| e.to_string())?
                .as_millis();
            Ok(format!("{millis}|{guid}"))
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store.clone(), ActivityRegistry::default(), orchestrations, fast_options())
        .await;
    let client = rt.client();
    let instance = client.start_orchestration("Clock", "").await.unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status: {status:?}");
    };

    let hist = store.read(&instance).await.unwrap();
    let recorded: Vec<String> = hist
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityCompleted { result, .. } => Some(result.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(output, recorded.join("|"));
    assert!(uuid::Uuid::parse_str(&recorded[1]).is_ok());
    rt.shutdown().await;
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ResizeRequest {
    file: String,
    width: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ResizeResult {
    file: String,
    bytes: u64,
}

#[tokio::test]
async fn test_typed_orchestration_and_activity() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register_typed("Resize", |_ctx, req: ResizeRequest| async move {
            Ok(ResizeResult {
                file: format!("{}-{}px", req.file, req.width),
                bytes: u64::from(req.width) * 10,
            })
        })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("Resizer", |ctx: OrchestrationContext, req: ResizeRequest| async move {
            let res: ResizeResult = ctx.schedule_activity_typed("Resize", &req).await?;
            Ok(res)
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store, activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client
        .start_orchestration_typed(
            "Resizer",
            &ResizeRequest {
                file: "cat.png".to_string(),
                width: 64,
            },
        )
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    let out: ResizeResult = status.output_typed().unwrap().unwrap();
    assert_eq!(
        out,
        ResizeResult {
            file: "cat.png-64px".to_string(),
            bytes: 640
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_typed_string_payloads_keep_quotes() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let activities = ActivityRegistry::builder()
        .register_typed("Echo", |_ctx, text: String| async move { Ok(text) })
        .build()
        .unwrap();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("EchoTwice", |ctx: OrchestrationContext, text: String| async move {
            let first: String = ctx.schedule_activity_typed("Echo", &text).await?;
            let second: String = ctx.schedule_activity_typed("Echo", &first).await?;
            Ok(second)
        })
        .build()
        .unwrap();
    let rt = Runtime::start_with_options(store, activities, orchestrations, fast_options()).await;
    let client = rt.client();
    let instance = client
        .start_orchestration_typed("EchoTwice", &"\"quoted\"".to_string())
        .await
        .unwrap();
    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    let out: String = status.output_typed().unwrap().unwrap();
    assert_eq!(out, "\"quoted\"");
    rt.shutdown().await;
}

#[tokio::test]
async fn test_many_instances_with_bounded_concurrency() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let options = RuntimeOptions {
        orchestration_concurrency: 2,
        worker_concurrency: 2,
        dispatch_queue_capacity: 2,
        ..fast_options()
    };
    let rt = Runtime::start_with_options(
        store,
        ActivityRegistry::builder()
            .register("Extract", |_ctx, _file: String| async move { Ok(r#"{"size": 42}"#.to_string()) })
            .register("Thumbnail", |_ctx, _metadata: String| async move { Ok("ok".to_string()) })
            .build()
            .unwrap(),
        pipeline_orchestrations(),
        options,
    )
    .await;
    let client = rt.client();
    let mut instances = Vec::new();
    for i in 0..20 {
        instances.push(client.start_orchestration("ImagePipeline", format!("file{i}")).await.unwrap());
    }
    for instance in &instances {
        let status = client.wait_for_orchestration(instance, WAIT).await.unwrap();
        assert_eq!(
            status,
            OrchestrationStatus::Completed {
                output: "ok".to_string()
            }
        );
    }
    assert_eq!(client.list_instances(Some(InstanceStatus::Completed)).await.unwrap().len(), 20);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_client_errors_and_purge() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let client = Client::new(store.clone());

    assert_eq!(
        client.get_orchestration_status("ghost").await.unwrap(),
        OrchestrationStatus::NotFound
    );
    assert!(matches!(client.get_status("ghost").await, Err(ClientError::NotFound(_))));
    assert!(matches!(client.read_history("ghost").await, Err(ClientError::NotFound(_))));
    assert!(matches!(client.terminate("ghost", "r").await, Err(ClientError::NotFound(_))));
    assert!(matches!(client.purge_instance("ghost").await, Err(ClientError::NotFound(_))));

    // no runtime attached: the instance stays running
    let instance = client.start_orchestration("Anything", "").await.unwrap();
    assert!(matches!(
        client.wait_for_orchestration(&instance, Duration::from_millis(30)).await,
        Err(ClientError::Timeout(_))
    ));
    assert!(matches!(
        client.purge_instance(&instance).await,
        Err(ClientError::InstanceRunning(_))
    ));

    client.terminate(&instance, "cleanup").await.unwrap();
    client.purge_instance(&instance).await.unwrap();
    assert_eq!(
        client.get_orchestration_status(&instance).await.unwrap(),
        OrchestrationStatus::NotFound
    );
}

#[tokio::test]
async fn test_storage_unavailable_retried_then_surfaced() {
    let inner: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let flaky = Arc::new(common::FlakyStore::new(inner));
    let client = Client::new(flaky.clone());

    flaky.fail_next(2);
    let instance = client.start_orchestration("Anything", "").await.unwrap();
    assert_eq!(flaky.injected(), 2);
    assert!(client.get_status(&instance).await.is_ok());

    let impatient = client.clone().with_retry(RetryPolicy::new(2).with_backoff(BackoffStrategy::None));
    flaky.fail_next(10);
    match impatient.get_status(&instance).await {
        Err(ClientError::StorageUnavailable(e)) => assert!(e.is_retryable()),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_runtime_survives_transient_store_failures() {
    let inner: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let flaky = Arc::new(common::FlakyStore::new(inner.clone()));
    let rt = Runtime::start_with_options(
        flaky.clone(),
        pipeline_activities(),
        pipeline_orchestrations(),
        fast_options(),
    )
    .await;
    let client = Client::new(inner.clone());
    let instance = client.start_orchestration("ImagePipeline", "file123").await.unwrap();
    flaky.fail_next(3);

    let status = client.wait_for_orchestration(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "ok".to_string()
        }
    );
    assert_eq!(common::event_types(&inner.read(&instance).await.unwrap()).len(), 6);
    rt.shutdown().await;
}
