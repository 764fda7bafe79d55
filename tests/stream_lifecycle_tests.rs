mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use kafka_streamer::rebalance::RebalanceEvent;
use kafka_streamer::{Partition, StreamError, StreamOptions};

use common::{mock_stream, wait_until};

#[tokio::test]
async fn test_close_interrupts_blocked_poll() {
    // A timeout far longer than the test: close must not wait it out.
    let options = StreamOptions {
        poll_timeout: Duration::from_secs(30),
        ..StreamOptions::default()
    };
    let (stream, handle) = mock_stream(options);
    handle.create_topic("events", 1);

    let ended = Arc::new(AtomicUsize::new(0));
    {
        let ended = ended.clone();
        stream.on_end(move || {
            ended.fetch_add(1, Ordering::SeqCst);
        });
    }
    stream.on_record(|_record| {});
    stream
        .subscribe(vec!["events".to_string()])
        .unwrap()
        .await
        .unwrap();

    // Let the dispatch loop get deep into its blocking poll.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    stream.close().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "close waited out the poll timeout"
    );
    assert!(handle.is_closed());

    wait_until("end handler fired", || ended.load(Ordering::SeqCst) == 1).await;

    // Idempotent, and later commands are rejected.
    stream.close().await.unwrap();
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert!(matches!(
        stream.assignment().await,
        Err(StreamError::Closed)
    ));
}

#[tokio::test]
async fn test_rebalance_events_reach_handlers_in_order_off_the_polling_thread() {
    let (stream, handle) = mock_stream(StreamOptions::default());
    handle.create_topic("events", 1);
    let p0 = Partition::new("events", 0);

    type Seen = Arc<Mutex<Vec<(&'static str, ThreadId)>>>;
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        stream.on_partitions_assigned(move |partitions| {
            assert!(partitions.is_empty() || partitions.contains(&Partition::new("events", 0)));
            seen.lock()
                .unwrap()
                .push(("assigned", std::thread::current().id()));
        });
    }
    {
        let seen = seen.clone();
        stream.on_partitions_revoked(move |partitions| {
            assert!(partitions.contains(&Partition::new("events", 0)));
            seen.lock()
                .unwrap()
                .push(("revoked", std::thread::current().id()));
        });
    }
    stream.on_record(|_record| {});

    stream
        .subscribe(vec!["events".to_string()])
        .unwrap()
        .await
        .unwrap();
    wait_until("initial assignment", || seen.lock().unwrap().len() == 1).await;

    handle.push_rebalance(RebalanceEvent::Revoked(vec![p0.clone()]));
    handle.push_rebalance(RebalanceEvent::Assigned(vec![p0.clone()]));
    wait_until("rebalance round trip", || seen.lock().unwrap().len() == 3).await;

    let seen = seen.lock().unwrap();
    let labels: Vec<&str> = seen.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, vec!["assigned", "revoked", "assigned"]);

    // The callbacks originate inside poll, on the worker thread; the handlers
    // must run anywhere but there.
    let poll_thread = handle.poll_thread().unwrap();
    for (label, thread) in seen.iter() {
        assert_ne!(*thread, poll_thread, "{label} handler ran on the poll thread");
    }

    drop(seen);
    stream.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_facade_is_safe_under_concurrent_callers() {
    let (stream, handle) = mock_stream(StreamOptions::default());
    handle.create_topic("events", 2);
    for i in 0..100 {
        handle.produce("events", i % 2, "k", &i.to_string());
    }

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        stream.on_record(move |_record| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    stream
        .subscribe(vec!["events".to_string()])
        .unwrap()
        .await
        .unwrap();
    wait_until("records flowing", || count.load(Ordering::SeqCst) >= 1).await;

    // Hammer the facade from many tasks at once. The mock panics the worker if
    // the consumer is ever entered concurrently, which would surface here as
    // failed commands.
    let mut tasks = Vec::new();
    for task_number in 0..16 {
        let stream = stream.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                match (task_number + i) % 4 {
                    0 => {
                        stream.assignment().await.unwrap();
                    }
                    1 => {
                        stream.subscription().await.unwrap();
                    }
                    2 => {
                        let p = Partition::new("events", 1);
                        stream.pause_partitions(vec![p.clone()]).await.unwrap();
                        stream.resume_partitions(vec![p]).await.unwrap();
                    }
                    _ => {
                        stream.end_offsets(vec![Partition::new("events", 0)])
                            .await
                            .unwrap();
                    }
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_until("all records delivered", || {
        count.load(Ordering::SeqCst) == 100
    })
    .await;
    stream.close().await.unwrap();
}

#[tokio::test]
async fn test_commands_execute_in_submission_order() {
    let (stream, handle) = mock_stream(StreamOptions::default());
    handle.create_topic("events", 1);
    let p0 = Partition::new("events", 0);

    stream.on_record(|_record| {});
    // Queue everything before awaiting anything; execution order must still be
    // submission order.
    let assign = stream.assign(vec![p0.clone()]).unwrap();
    let seek = stream.seek(p0.clone(), 5);
    let commit = stream.commit();

    assign.await.unwrap();
    seek.await.unwrap();
    let committed = commit.await.unwrap();
    assert_eq!(committed.get(&p0).map(|om| om.offset), Some(5));
    assert_eq!(handle.committed_offset(&p0), Some(5));

    let interesting: Vec<String> = handle
        .calls()
        .into_iter()
        .filter(|call| matches!(call.as_str(), "assign" | "seek" | "commit"))
        .collect();
    assert_eq!(interesting, vec!["assign", "seek", "commit"]);

    stream.close().await.unwrap();
}
