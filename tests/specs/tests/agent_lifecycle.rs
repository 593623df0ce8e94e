// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent lifecycle scenarios: health endpoint, restart identity, and queue
//! persistence across an agent restart.

use std::sync::Arc;
use std::time::Duration;

use tripwire_specs::{
    agent_config, free_port, observed_event, start_agent, start_server, wait_until, TestCerts,
};
use tripwire_server::storage::MemoryStore;

const TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread")]
async fn healthz_tracks_the_pipeline() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;

    let dir = tempfile::tempdir()?;
    let health_port = free_port()?;
    let mut config =
        agent_config(&certs, "web-01", server.ingest_addr.port(), dir.path(), vec![]);
    config.health_addr = Some(format!("127.0.0.1:{health_port}"));
    let agent = start_agent(config).await?;

    let url = format!("http://127.0.0.1:{health_port}/healthz");
    // Wait until the transport reaches the streaming state.
    wait_until(TIMEOUT, || agent.metrics.is_connected()).await?;

    for rule in ["r1", "r2", "r3"] {
        agent.sink().send(observed_event(rule, serde_json::json!({"op": "modify"}))).await?;
    }
    wait_until(TIMEOUT, || agent.metrics.alerts_sent() == 3).await?;

    let body: serde_json::Value = reqwest::get(&url).await?.json().await?;
    assert_eq!(body["status"], "connected");
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["alerts_sent_total"], 3);
    assert!(body["uptime_s"].is_number());
    assert!(body["reconnect_total"].is_number());

    agent.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_restart_keeps_host_identity() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let store = Arc::new(MemoryStore::new());
    let server = start_server(&certs, Arc::clone(&store)).await?;

    let dir = tempfile::tempdir()?;
    let config = agent_config(&certs, "web-01", server.ingest_addr.port(), dir.path(), vec![]);

    let agent = start_agent(config.clone()).await?;
    wait_until(TIMEOUT, || store.host_count() == 1).await?;
    let first = store.host("web-01").map(|h| h.host_id);
    agent.stop().await;

    // "Reinstall": a fresh agent process with the same hostname.
    let dir2 = tempfile::tempdir()?;
    let config2 = agent_config(&certs, "web-01", server.ingest_addr.port(), dir2.path(), vec![]);
    let agent = start_agent(config2).await?;
    wait_until(TIMEOUT, || agent.metrics.is_connected()).await?;

    assert_eq!(store.host_count(), 1, "no second Host row after restart");
    assert_eq!(store.host("web-01").map(|h| h.host_id), first);

    agent.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_events_survive_an_agent_restart() -> anyhow::Result<()> {
    let certs = TestCerts::generate("web-01")?;
    let ingest_port = free_port()?;
    let dir = tempfile::tempdir()?;

    // First agent process: server down, events land in the queue.
    let config = agent_config(&certs, "web-01", ingest_port, dir.path(), vec![]);
    let agent = start_agent(config.clone()).await?;
    for rule in ["r1", "r2", "r3"] {
        agent.sink().send(observed_event(rule, serde_json::json!({"op": "create"}))).await?;
    }
    wait_until(TIMEOUT, || agent.queue_depth() == 3).await?;
    agent.stop().await;

    // Second agent process on the same queue file, server now up.
    let store = Arc::new(MemoryStore::new());
    let server =
        tripwire_specs::start_server_on(&certs, Arc::clone(&store), ingest_port).await?;
    let agent = start_agent(config).await?;

    wait_until(TIMEOUT, || store.alert_count() == 3).await?;
    let names: Vec<String> = store.alerts().into_iter().map(|r| r.rule_name).collect();
    assert_eq!(names, ["r1", "r2", "r3"]);
    wait_until(TIMEOUT, || agent.queue_depth() == 0).await?;

    agent.stop().await;
    server.stop().await;
    Ok(())
}
