// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end pipeline scenarios: real agent, real server, real mTLS gRPC,
//! live WebSocket subscribers, memory store behind the storage writer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tripwire_agent::transport::proto;
use tripwire_specs::{
    agent_config, free_port, observed_event, raw_client, start_agent, start_server,
    start_server_on, wait_until, TestCerts,
};
use tripwire_server::storage::MemoryStore;

const TIMEOUT: Duration = Duration::from_secs(15);

// -- Scenario 1: live delivery ------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn live_events_arrive_in_order_and_queue_drains() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;

    let dir = tempfile::tempdir()?;
    let agent = start_agent(agent_config(
        &certs,
        "web-01",
        server.ingest_addr.port(),
        dir.path(),
        vec![],
    ))
    .await?;

    let sink = agent.sink();
    for rule in ["r1", "r2", "r3"] {
        sink.send(observed_event(rule, serde_json::json!({"path": "/etc/hosts", "op": "modify"})))
            .await?;
    }

    wait_until(TIMEOUT, || store.alert_count() == 3).await?;
    let names: Vec<String> = store.alerts().into_iter().map(|r| r.rule_name).collect();
    assert_eq!(names, ["r1", "r2", "r3"]);

    wait_until(TIMEOUT, || agent.queue_depth() == 0).await?;
    wait_until(TIMEOUT, || agent.metrics.alerts_sent() == 3).await?;

    agent.stop().await;
    server.stop().await;
    Ok(())
}

// -- Scenario 2: server outage, queue carries the events ----------------------

#[tokio::test(flavor = "multi_thread")]
async fn events_survive_server_outage_and_drain_in_order() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let ingest_port = free_port()?;

    // Agent first; the server is down.
    let dir = tempfile::tempdir()?;
    let agent =
        start_agent(agent_config(&certs, "web-01", ingest_port, dir.path(), vec![])).await?;

    let sink = agent.sink();
    for rule in ["r1", "r2", "r3", "r4", "r5"] {
        sink.send(observed_event(rule, serde_json::json!({"op": "create"}))).await?;
    }
    wait_until(TIMEOUT, || agent.queue_depth() == 5).await?;

    // Let a few dials fail before the server appears.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(agent.metrics.reconnects() >= 1, "agent should have counted failed dials");

    let store = Arc::new(MemoryStore::new());
    let server = start_server_on(&certs, Arc::clone(&store), ingest_port).await?;

    wait_until(TIMEOUT, || store.alert_count() == 5).await?;
    let names: Vec<String> = store.alerts().into_iter().map(|r| r.rule_name).collect();
    assert_eq!(names, ["r1", "r2", "r3", "r4", "r5"], "drain must preserve enqueue order");
    wait_until(TIMEOUT, || agent.queue_depth() == 0).await?;

    agent.stop().await;
    server.stop().await;
    Ok(())
}

// -- Scenario 3: slow subscriber does not stall a fast one --------------------

#[tokio::test(flavor = "multi_thread")]
async fn fast_subscriber_unaffected_by_stalled_one() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;
    let ws_url = format!("ws://127.0.0.1:{}/ws", server.subscriber_addr.port());

    // A connects and never reads; B reads promptly.
    let (_stalled, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (mut prompt, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    wait_until(TIMEOUT, || server.state.broadcaster.client_count() == 2).await?;

    let dir = tempfile::tempdir()?;
    let agent = start_agent(agent_config(
        &certs,
        "web-01",
        server.ingest_addr.port(),
        dir.path(),
        vec![],
    ))
    .await?;
    let sink = agent.sink();
    for i in 0..10 {
        sink.send(observed_event(&format!("rule-{i}"), serde_json::json!({"seq": i}))).await?;
    }

    for i in 0..10 {
        let frame = tokio::time::timeout(TIMEOUT, prompt.next())
            .await
            .map_err(|_| anyhow::anyhow!("fast subscriber starved at frame {i}"))?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        let Message::Text(text) = frame else {
            anyhow::bail!("unexpected frame type");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str())?;
        assert_eq!(value["type"], "alert");
        assert_eq!(value["data"]["rule_name"], format!("rule-{i}"));
    }

    agent.stop().await;
    server.stop().await;
    Ok(())
}

// -- Scenario 4: hostname identity survives reinstall -------------------------

#[tokio::test(flavor = "multi_thread")]
async fn reregistration_returns_the_same_host_id() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;

    // Two registrations on two separate connections, as after a reinstall.
    let mut first = raw_client(&certs, server.ingest_addr).await?;
    let response = first
        .register_agent(proto::RegisterAgentRequest {
            hostname: "web-01".to_owned(),
            platform: "linux".to_owned(),
            agent_version: "0.3.1".to_owned(),
        })
        .await?
        .into_inner();
    let first_id = response.host_id;
    assert!(response.server_time_us > 0);

    let mut second = raw_client(&certs, server.ingest_addr).await?;
    let second_id = second
        .register_agent(proto::RegisterAgentRequest {
            hostname: "web-01".to_owned(),
            platform: "linux".to_owned(),
            agent_version: "0.3.2".to_owned(),
        })
        .await?
        .into_inner()
        .host_id;

    assert_eq!(first_id, second_id);
    assert_eq!(store.host_count(), 1, "no second Host row");

    server.stop().await;
    Ok(())
}

// -- Scenario 5: duplicate alert_id across connections ------------------------

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_alert_id_stores_exactly_one_row() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;

    let mut client = raw_client(&certs, server.ingest_addr).await?;
    let host_id = client
        .register_agent(proto::RegisterAgentRequest {
            hostname: "web-01".to_owned(),
            platform: "linux".to_owned(),
            agent_version: "0.3.2".to_owned(),
        })
        .await?
        .into_inner()
        .host_id;

    let alert_id = Uuid::new_v4().to_string();
    let event = proto::AgentEvent {
        alert_id: alert_id.clone(),
        host_id,
        timestamp_us: 1_700_000_000_000_000,
        tripwire_type: "FILE".to_owned(),
        rule_name: "etc-watch".to_owned(),
        severity: "CRITICAL".to_owned(),
        event_detail_json: None,
    };

    // Two deliveries of the same alert over two different streams.
    for connection in 0..2 {
        let mut client = raw_client(&certs, server.ingest_addr).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let mut inbound =
            client.stream_alerts(ReceiverStream::new(rx)).await?.into_inner();
        tx.send(event.clone()).await?;

        let command = tokio::time::timeout(TIMEOUT, inbound.message())
            .await
            .map_err(|_| anyhow::anyhow!("no reply on connection {connection}"))??
            .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
        assert_eq!(
            command.r#type,
            proto::server_command::CommandType::Ack as i32,
            "both deliveries are ACKed"
        );
    }

    wait_until(TIMEOUT, || store.alert_count() >= 1).await?;
    // Give a few flush cycles the chance to (incorrectly) add a second row.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.alert_count(), 1, "exactly one row for {alert_id}");

    server.stop().await;
    Ok(())
}

// -- Scenario 6: event_detail round-trips byte-for-byte -----------------------

#[tokio::test(flavor = "multi_thread")]
async fn event_detail_roundtrips_through_storage_and_broadcast() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;
    let ws_url = format!("ws://127.0.0.1:{}/ws", server.subscriber_addr.port());
    let (mut subscriber, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    wait_until(TIMEOUT, || server.state.broadcaster.client_count() == 1).await?;

    let dir = tempfile::tempdir()?;
    let agent = start_agent(agent_config(
        &certs,
        "web-01",
        server.ingest_addr.port(),
        dir.path(),
        vec![],
    ))
    .await?;

    let detail = serde_json::json!({"path": "/etc/passwd", "op": "write", "bytes": 42});
    let event = observed_event("etc-watch", detail.clone());
    let sent_text = event.event_detail.clone().ok_or_else(|| anyhow::anyhow!("no detail"))?;
    agent.sink().send(event).await?;

    // Stored text is byte-identical to what the agent serialized.
    wait_until(TIMEOUT, || store.alert_count() == 1).await?;
    assert_eq!(store.alerts()[0].event_detail.as_deref(), Some(sent_text.as_str()));

    // The subscriber sees the same values and structure.
    let frame = tokio::time::timeout(TIMEOUT, subscriber.next())
        .await
        .map_err(|_| anyhow::anyhow!("no frame"))?
        .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
    let Message::Text(text) = frame else {
        anyhow::bail!("unexpected frame type");
    };
    let value: serde_json::Value = serde_json::from_str(text.as_str())?;
    assert_eq!(value["data"]["event_detail"], detail);
    assert_eq!(value["data"]["hostname"], "web-01");

    agent.stop().await;
    server.stop().await;
    Ok(())
}
