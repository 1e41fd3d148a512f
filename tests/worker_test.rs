//! End-to-end consumer flow over the public client API, against the mock
//! store: publish, reserve, handle, ack, and drain on stop.

use omniq::testing::{MockStore, StoreCall};
use omniq::{
    Client, ConsumeOptions, JobContext, PublishOptions, ReserveOutcome, ScriptBundle, SCRIPT_NAMES,
};
use redis::Value;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

fn arr(items: Vec<Value>) -> Value {
    Value::Array(items)
}

fn s(text: &str) -> Value {
    Value::BulkString(text.as_bytes().to_vec())
}

async fn mock_client(store: &MockStore) -> Client {
    let sources = SCRIPT_NAMES
        .iter()
        .map(|name| (*name, format!("-- stub: {name}")))
        .collect::<Vec<_>>();
    let bundle = ScriptBundle::from_sources(store, sources).await.unwrap();
    Client::with_store(Arc::new(store.clone()), Arc::new(bundle))
}

#[tokio::test]
async fn publish_then_reserve_round_trip() {
    let store = MockStore::new();
    let client = mock_client(&store).await;

    store.push_reply(arr(vec![s("OK"), s("job-1")]));
    let id = client
        .publish(
            "demo",
            &json!({"hello": "world"}),
            PublishOptions::default().timeout_ms(30_000),
        )
        .await
        .unwrap();
    assert_eq!(id, "job-1");

    store.push_reply(arr(vec![
        s("JOB"),
        s("job-1"),
        s(r#"{"hello":"world"}"#),
        Value::Int(1_700_000_030_000),
        Value::Int(0),
        s(""),
        s("lease-1"),
    ]));
    let outcome = client.reserve("demo").await.unwrap();
    let job = match outcome {
        ReserveOutcome::Job(job) => job,
        other => panic!("expected a job, got {other:?}"),
    };
    assert_eq!(job.payload_raw, r#"{"hello":"world"}"#);

    store.push_reply(arr(vec![s("OK")]));
    client
        .ack_success("demo", &job.id, &job.lease_token)
        .await
        .unwrap();

    store.push_reply(arr(vec![s("EMPTY")]));
    assert_eq!(
        client.reserve("demo").await.unwrap(),
        ReserveOutcome::Empty
    );
}

#[tokio::test(start_paused = true)]
async fn consume_drains_one_job_and_exposes_exec() {
    let store = MockStore::new();
    let client = mock_client(&store).await;
    let (tx, rx) = watch::channel(false);

    store.push_reply(arr(vec![s("OK"), Value::Int(0)])); // promote_delayed
    store.push_reply(arr(vec![s("OK"), Value::Int(0)])); // reap_expired
    store.push_reply(arr(vec![
        s("JOB"),
        s("job-9"),
        s(r#"{"page": 3}"#),
        Value::Int(1_700_000_030_000),
        Value::Int(1),
        s("tenant-a"),
        s("lease-9"),
    ]));
    // Heartbeat and child_ack/ack interleave; keep replies cross-compatible.
    store.push_reply(arr(vec![s("OK"), Value::Int(2)]));
    store.push_reply(arr(vec![s("OK"), Value::Int(2)]));
    store.push_reply(arr(vec![s("OK"), Value::Int(2)]));

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_count = seen.clone();
    let stopper = tx.clone();
    client
        .consume_with_shutdown(
            "demo",
            move |ctx: JobContext| {
                let seen_count = seen_count.clone();
                let stopper = stopper.clone();
                async move {
                    assert_eq!(ctx.queue, "demo");
                    assert_eq!(ctx.attempt, 1);
                    assert_eq!(ctx.gid, "tenant-a");
                    assert_eq!(ctx.exec.default_child_id(), "job-9");
                    // Fan-in: report this child done under the job's own id.
                    let remaining = ctx.exec.child_ack("document:doc_1", None).await?;
                    assert!(remaining >= -1);
                    seen_count.fetch_add(1, Ordering::SeqCst);
                    let _ = stopper.send(true);
                    Ok(())
                }
            },
            ConsumeOptions::default().stop_on_ctrl_c(false),
            rx,
        )
        .await
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // The child_ack went to the child anchor, not the queue anchor.
    let child_calls: Vec<Vec<String>> = store
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            StoreCall::EvalSha { keys, .. } if keys[0].starts_with("{cc:") => Some(keys),
            _ => None,
        })
        .collect();
    assert_eq!(child_calls, vec![vec!["{cc:document:doc_1}:meta".to_string()]]);
}

#[tokio::test]
async fn unparseable_payload_falls_back_to_raw_string() {
    let store = MockStore::new();
    let client = mock_client(&store).await;
    let (tx, rx) = watch::channel(false);

    store.push_reply(arr(vec![s("OK"), Value::Int(0)]));
    store.push_reply(arr(vec![s("OK"), Value::Int(0)]));
    store.push_reply(arr(vec![
        s("JOB"),
        s("job-raw"),
        s("not json at all"),
        Value::Int(1_700_000_030_000),
        Value::Int(0),
        s(""),
        s("lease-raw"),
    ]));
    store.push_reply(arr(vec![s("OK"), Value::Int(1)]));
    store.push_reply(arr(vec![s("OK"), Value::Int(1)]));

    let stopper = tx.clone();
    client
        .consume_with_shutdown(
            "demo",
            move |ctx: JobContext| {
                let stopper = stopper.clone();
                async move {
                    assert_eq!(ctx.payload_raw, "not json at all");
                    assert_eq!(ctx.payload, serde_json::Value::String("not json at all".into()));
                    let _ = stopper.send(true);
                    Ok(())
                }
            },
            ConsumeOptions::default().stop_on_ctrl_c(false),
            rx,
        )
        .await
        .unwrap();
}
