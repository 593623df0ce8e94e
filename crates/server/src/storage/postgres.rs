// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Postgres backend for the partitioned alert store.
//!
//! Queries are runtime-checked (`sqlx::query`) so builds do not need a live
//! database. The base schema is applied via sqlx migrations on connect.
//! Monthly partitions of `alerts` are operator-provisioned; an insert into
//! a missing partition fails and agents retry from their queues until the
//! operator provisions it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{AlertRow, AlertStore, HostStatus};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply the base schema migrations.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn us_to_ts(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Build the single-round-trip batch insert.
///
/// The CTE + anti-join skips alert_ids that are already stored (redelivery
/// after a lost ACK arrives with a fresh `received_at`, so the primary-key
/// conflict alone would not catch it); the `ON CONFLICT` clause additionally
/// covers concurrent flushes racing on the same key.
fn build_insert_query(rows: &[AlertRow]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "WITH batch (alert_id, host_id, timestamp_us, received_at, tripwire_type, rule_name, severity, event_detail) AS (",
    );
    qb.push_values(rows, |mut b, row| {
        let detail: Option<serde_json::Value> =
            row.event_detail.as_deref().and_then(|s| serde_json::from_str(s).ok());
        b.push_bind(row.alert_id)
            .push_bind(row.host_id)
            .push_bind(row.timestamp_us)
            .push_bind(us_to_ts(row.received_at_us))
            .push_bind(row.tripwire_type.clone())
            .push_bind(row.rule_name.clone())
            .push_bind(row.severity.clone())
            .push_bind(detail);
    });
    qb.push(
        ") INSERT INTO alerts (alert_id, host_id, timestamp_us, received_at, tripwire_type, rule_name, severity, event_detail) \
         SELECT b.alert_id, b.host_id, b.timestamp_us, b.received_at, b.tripwire_type, b.rule_name, b.severity, b.event_detail \
         FROM batch b \
         WHERE NOT EXISTS (SELECT 1 FROM alerts a WHERE a.alert_id = b.alert_id) \
         ON CONFLICT (alert_id, received_at) DO NOTHING",
    );
    qb
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alerts(&self, rows: &[AlertRow]) -> anyhow::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query = build_insert_query(rows);
        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_host(
        &self,
        hostname: &str,
        platform: &str,
        agent_version: &str,
        ip_address: Option<&str>,
    ) -> anyhow::Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO hosts (host_id, hostname, platform, agent_version, ip_address, last_seen, status) \
             VALUES ($1, $2, $3, $4, $5, now(), 'ONLINE') \
             ON CONFLICT (hostname) DO UPDATE SET \
                 platform = EXCLUDED.platform, \
                 agent_version = EXCLUDED.agent_version, \
                 ip_address = COALESCE(EXCLUDED.ip_address, hosts.ip_address), \
                 last_seen = now(), \
                 status = 'ONLINE' \
             RETURNING host_id",
        )
        .bind(Uuid::new_v4())
        .bind(hostname)
        .bind(platform)
        .bind(agent_version)
        .bind(ip_address)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("host_id")?)
    }

    async fn hostname_of(&self, host_id: Uuid) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT hostname FROM hosts WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("hostname")).transpose()?)
    }

    async fn set_host_status(&self, host_id: Uuid, status: HostStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE hosts SET status = $2 WHERE host_id = $1")
            .bind(host_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_seen(&self, host_id: Uuid, at_us: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE hosts SET last_seen = $2 WHERE host_id = $1")
            .bind(host_id)
            .bind(us_to_ts(at_us))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[path = "postgres_tests.rs"]
mod tests;
