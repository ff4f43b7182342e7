//! End-to-end behaviour of the relay: device → edge → cloud
//!
//! Run with: cargo test --test pipeline

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use edgerelay::config::DEFAULT_DEVICE_HEADER;
use edgerelay::*;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn device(id: &str) -> HashMap<String, String> {
    HashMap::from([("device_id".to_string(), id.to_string())])
}

fn relay(upstream: &Arc<MemoryUpstream>, workers: usize, processor: Arc<dyn Processor>) -> Arc<RelayNode> {
    let connector = Arc::new(MemoryConnector::new(Arc::clone(upstream)));
    let config = RelayConfig::new("edge-1").with_workers(workers);
    Arc::new(RelayNode::with_connector(config, processor, connector).unwrap())
}

async fn start(node: &Arc<RelayNode>) -> JoinHandle<Result<()>> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runner = Arc::clone(node);
    let handle = tokio::spawn(async move { runner.run_with_listener(listener).await });
    let deadline = Instant::now() + Duration::from_secs(5);
    while !node.is_upstream_connected() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    handle
}

fn results(messages: &[UpstreamMessage]) -> Vec<Vec<Value>> {
    messages
        .iter()
        .filter_map(|m| match m {
            UpstreamMessage::Results(batch) => Some(batch.items.clone()),
            UpstreamMessage::Stats(_) => None,
        })
        .collect()
}

fn classify(items: &[WorkItem]) -> std::result::Result<Vec<Value>, ProcessingError> {
    Ok(items
        .iter()
        .map(|item| match item.as_str() {
            Some("a.jpg") => json!("catA"),
            Some("b.jpg") => json!("catB"),
            _ => json!("unknown"),
        })
        .collect())
}

#[tokio::test]
async fn test_batch_is_forwarded_then_stats() {
    let upstream = Arc::new(MemoryUpstream::with_latency(Duration::from_millis(1)));
    let node = relay(&upstream, 1, Arc::new(classify));
    let runner = start(&node).await;

    let before = node.ledger().snapshot();
    node.handle_connect("conn-1", &device("d1"));
    node.handle_message("conn-1", &json!({"data": ["a.jpg", "b.jpg"]}))
        .unwrap();
    assert!(upstream.wait_for(2, Duration::from_secs(5)).await);

    let messages = upstream.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[0].to_payload(),
        json!({"data": ["catA", "catB"]})
    );
    assert_eq!(messages[1].to_payload()["data"], Value::Null);

    let after = node.ledger().snapshot();
    assert!(after.processing > before.processing);
    assert!(after.transmission > before.transmission);

    node.stop().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_report_from_unregistered_connection_changes_nothing() {
    let upstream = Arc::new(MemoryUpstream::new());
    let node = relay(&upstream, 1, Arc::new(processor::Echo));
    let runner = start(&node).await;

    let result = node.handle_message("conn-404", &json!({"accTransmissionTime": 2.5}));
    assert!(matches!(result, Err(RelayError::UnknownSession(_))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.ledger().snapshot(), LedgerSnapshot::default());
    assert!(upstream.is_empty());

    node.stop().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_devices_sum_processing_time() {
    let upstream = Arc::new(MemoryUpstream::new());
    let slow = |items: &[WorkItem]| -> std::result::Result<Vec<Value>, ProcessingError> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(items.to_vec())
    };
    let node = relay(&upstream, 2, Arc::new(slow));
    let runner = start(&node).await;

    node.handle_connect("conn-1", &device("d1"));
    node.handle_connect("conn-2", &device("d2"));

    let pushes: Vec<_> = [("conn-1", "d1.jpg"), ("conn-2", "d2.jpg")]
        .into_iter()
        .map(|(conn, item)| {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.handle_message(conn, &json!({"data": [item]})) })
        })
        .collect();
    for push in pushes {
        push.await.unwrap().unwrap();
    }

    assert!(upstream.wait_for(4, Duration::from_secs(5)).await);
    node.stop().await;
    runner.await.unwrap().unwrap();

    let mut forwarded = results(&upstream.messages());
    forwarded.sort_by_key(|items| items[0].to_string());
    assert_eq!(forwarded, vec![vec![json!("d1.jpg")], vec![json!("d2.jpg")]]);

    let snapshot = node.ledger().snapshot();
    assert!(snapshot.processing >= 0.04, "processing {}", snapshot.processing);
    assert!(snapshot.processing < 5.0);
}

#[tokio::test]
async fn test_failed_batch_never_reaches_upstream() {
    let upstream = Arc::new(MemoryUpstream::new());
    let picky = |items: &[WorkItem]| -> std::result::Result<Vec<Value>, ProcessingError> {
        if items.iter().any(|item| item == "corrupt.jpg") {
            return Err(ProcessingError::Failed("cannot decode image".to_string()));
        }
        Ok(items.to_vec())
    };
    let node = relay(&upstream, 1, Arc::new(picky));
    let runner = start(&node).await;

    node.handle_connect("conn-1", &device("d1"));
    node.handle_connect("conn-2", &device("d2"));
    node.handle_message("conn-1", &json!({"data": ["corrupt.jpg"]}))
        .unwrap();
    node.handle_message("conn-1", &json!({"data": ["ok-1.jpg"]}))
        .unwrap();
    node.handle_message("conn-2", &json!({"data": ["ok-2.jpg"]}))
        .unwrap();

    assert!(upstream.wait_for(4, Duration::from_secs(5)).await);
    node.stop().await;
    runner.await.unwrap().unwrap();

    let forwarded = results(&upstream.messages());
    assert_eq!(forwarded, vec![vec![json!("ok-1.jpg")], vec![json!("ok-2.jpg")]]);
    assert_eq!(node.stats().batches_failed, 1);
    assert_eq!(node.stats().batches_processed, 2);
}

#[tokio::test]
async fn test_stop_drains_queued_batches() {
    let upstream = Arc::new(MemoryUpstream::with_latency(Duration::from_millis(5)));
    let node = relay(&upstream, 1, Arc::new(processor::Echo));
    let runner = start(&node).await;

    node.handle_connect("conn-1", &device("d1"));
    for i in 0..10 {
        node.handle_message("conn-1", &json!({"data": [i]})).unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), node.stop())
        .await
        .expect("stop should finish");
    runner.await.unwrap().unwrap();

    assert!(node.queue().is_closed());
    assert!(node.queue().is_empty());
    let forwarded = results(&upstream.messages());
    let expected: Vec<Vec<Value>> = (0..10).map(|i| vec![json!(i)]).collect();
    assert_eq!(forwarded, expected);
    assert_eq!(upstream.close_count(), 1);
}

#[tokio::test]
async fn test_device_to_cloud_over_tcp() {
    // Cloud
    let cloud = Arc::new(CloudAggregator::new("cloud-1"));
    let cloud_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cloud_addr = cloud_listener.local_addr().unwrap();
    let (cloud_stop, cloud_stopped) = watch::channel(false);
    let cloud_task = tokio::spawn(tcp::serve(cloud_listener, Arc::clone(&cloud), cloud_stopped));

    // Edge
    let config = RelayConfig::new("edge-9").with_cloud_addr(cloud_addr.to_string());
    let edge = Arc::new(RelayNode::new(config, Arc::new(classify)).unwrap());
    let edge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let edge_addr = edge_listener.local_addr().unwrap();
    let edge_task = tokio::spawn({
        let edge = Arc::clone(&edge);
        async move { edge.run_with_listener(edge_listener).await }
    });

    // Device
    let session = TcpSession::connect(&edge_addr.to_string(), DEFAULT_DEVICE_HEADER, "iot-1-t1")
        .await
        .unwrap();
    session
        .send_payload(json!({"data": ["a.jpg", "b.jpg"]}))
        .await
        .unwrap();
    session
        .send_payload(json!({"acc_transtime": 0.5}))
        .await
        .unwrap();
    session.disconnect().await;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let report = cloud.report();
        let done = report.result_items == 2
            && edge.ledger().snapshot().transmission >= 0.5
            && edge.sessions().is_empty();
        if done || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    edge.stop().await;
    edge_task.await.unwrap().unwrap();

    // Give the cloud a moment to read the frames written before the close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cloud_stop.send_replace(true);
    cloud_task.await.unwrap().unwrap();

    let report = cloud.report();
    assert_eq!(report.edges.len(), 1);
    let summary = &report.edges[0];
    assert_eq!(summary.edge_id, "edge-9");
    assert_eq!(summary.result_batches, 1);
    assert_eq!(summary.result_items, 2);
    assert!(summary.latest.is_some());

    let ledger = edge.ledger().snapshot();
    assert!(ledger.transmission >= 0.5);
    assert!(edge.sessions().is_empty());
}

#[test]
fn test_ledger_sums_concurrent_deltas() {
    let ledger = Arc::new(MetricsLedger::new());
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for i in 0..250 {
                    let delta = (t * 250 + i) as f64 * 0.001;
                    if i % 2 == 0 {
                        ledger.add_processing_time(delta);
                    } else {
                        ledger.add_transmission_time(delta);
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let total: f64 = (0..1000).map(|n| n as f64 * 0.001).sum();
    assert_relative_eq!(ledger.snapshot().total(), total, epsilon = 1e-9);
}
