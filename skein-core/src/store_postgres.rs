use crate::events::JobEvent;
use crate::state::dimensioned_path;
use crate::store::{JobStore, TxnOp, TxnReply};
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;

/// Convert an epoch-ms i64 to a `chrono::DateTime<chrono::Utc>` for
/// TIMESTAMPTZ binding.
fn epoch_ms_to_datetime(epoch_ms: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    chrono::Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}

fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> i64 {
    dt.timestamp_millis()
}

/// PostgreSQL-backed implementation of `JobStore`. Every `commit` buffer
/// runs inside one sqlx transaction, which is what single-commit atomicity
/// means here.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run skein migrations")?;
        Ok(())
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let error_json: Option<Value> = row.get("error");
        let parent_json: Option<Value> = row.get("parent");
        let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
        let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");
        let expires_at: Option<chrono::DateTime<chrono::Utc>> = row.get("expires_at");
        Ok(Job {
            job_id: row.get("job_id"),
            app_id: row.get("app_id"),
            topic: row.get("topic"),
            generation_id: row.get("generation_id"),
            semaphore: row.get("semaphore"),
            error: error_json.map(serde_json::from_value).transpose()?,
            parent: parent_json.map(serde_json::from_value).transpose()?,
            created_at: datetime_to_epoch_ms(created_at),
            updated_at: datetime_to_epoch_ms(updated_at),
            expire_ms: row.get("expire_ms"),
            expires_at: expires_at.map(datetime_to_epoch_ms),
        })
    }

    async fn apply(txn: &mut Transaction<'_, Postgres>, op: TxnOp) -> Result<TxnReply> {
        match op {
            TxnOp::CreateJobIfAbsent { job } => {
                let error = job.error.as_ref().map(serde_json::to_value).transpose()?;
                let parent = job.parent.as_ref().map(serde_json::to_value).transpose()?;
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        job_id, app_id, topic, generation_id, semaphore, error,
                        parent, created_at, updated_at, expire_ms, expires_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (job_id) DO NOTHING
                    "#,
                )
                .bind(&job.job_id)
                .bind(&job.app_id)
                .bind(&job.topic)
                .bind(&job.generation_id)
                .bind(job.semaphore)
                .bind(&error)
                .bind(&parent)
                .bind(epoch_ms_to_datetime(job.created_at))
                .bind(epoch_ms_to_datetime(job.updated_at))
                .bind(job.expire_ms)
                .bind(job.expires_at.map(epoch_ms_to_datetime))
                .execute(&mut **txn)
                .await?
                .rows_affected();

                let semaphore: i64 =
                    sqlx::query("SELECT semaphore FROM jobs WHERE job_id = $1")
                        .bind(&job.job_id)
                        .fetch_one(&mut **txn)
                        .await?
                        .get("semaphore");
                Ok(TxnReply::Created {
                    created: inserted == 1,
                    semaphore,
                })
            }

            TxnOp::IncrementLedger {
                job_id,
                activity_id,
                dads,
                delta,
            } => {
                let mut first = None;
                for dad in &dads {
                    let value: i64 = sqlx::query(
                        r#"
                        INSERT INTO activity_ledgers (job_id, activity_id, dad, value)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (job_id, activity_id, dad)
                        DO UPDATE SET value = activity_ledgers.value + EXCLUDED.value
                        RETURNING value
                        "#,
                    )
                    .bind(&job_id)
                    .bind(&activity_id)
                    .bind(dad.trimmed().as_str())
                    .bind(delta)
                    .fetch_one(&mut **txn)
                    .await?
                    .get("value");
                    if first.is_none() {
                        first = Some(value);
                    }
                }
                Ok(TxnReply::Ledger(first.unwrap_or(0)))
            }

            TxnOp::IncrementGuidLedger { job_id, guid, delta } => {
                let value: i64 = sqlx::query(
                    r#"
                    INSERT INTO guid_ledgers (job_id, guid, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (job_id, guid)
                    DO UPDATE SET value = guid_ledgers.value + EXCLUDED.value
                    RETURNING value
                    "#,
                )
                .bind(&job_id)
                .bind(&guid)
                .bind(delta)
                .fetch_one(&mut **txn)
                .await?
                .get("value");
                Ok(TxnReply::Ledger(value))
            }

            TxnOp::SetStatusAndCollateGuid {
                job_id,
                delta,
                threshold,
                guid,
                snapshot_weight,
            } => {
                // One statement: apply the semaphore delta, detect the
                // threshold crossing, and capture the snapshot bit.
                let row = sqlx::query(
                    r#"
                    WITH prior AS (
                        SELECT semaphore FROM jobs WHERE job_id = $1 FOR UPDATE
                    ),
                    moved AS (
                        UPDATE jobs
                           SET semaphore = CASE
                                   WHEN jobs.semaphore + $2 < $3 AND jobs.semaphore > $3
                                   THEN $3
                                   ELSE jobs.semaphore + $2
                               END,
                               updated_at = now()
                          FROM prior
                         WHERE jobs.job_id = $1
                     RETURNING jobs.semaphore AS after, prior.semaphore AS before
                    ),
                    captured AS (
                        INSERT INTO guid_ledgers (job_id, guid, value)
                        SELECT $1, $4, $5 FROM moved
                         WHERE moved.after = $3 AND moved.before <> $3
                        ON CONFLICT (job_id, guid)
                        DO UPDATE SET value = guid_ledgers.value + EXCLUDED.value
                    )
                    SELECT (after = $3 AND before <> $3) AS hit FROM moved
                    "#,
                )
                .bind(&job_id)
                .bind(delta)
                .bind(threshold)
                .bind(&guid)
                .bind(snapshot_weight)
                .fetch_optional(&mut **txn)
                .await?
                .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
                Ok(TxnReply::ThresholdHit(row.get("hit")))
            }

            TxnOp::WriteFlatState { job_id, dad, entries } => {
                for (path, value) in entries {
                    let stored = dimensioned_path(&path, &dad);
                    let symbol_id: i32 = sqlx::query(
                        r#"
                        INSERT INTO symbols (path) VALUES ($1)
                        ON CONFLICT (path) DO UPDATE SET path = EXCLUDED.path
                        RETURNING symbol_id
                        "#,
                    )
                    .bind(&stored)
                    .fetch_one(&mut **txn)
                    .await?
                    .get("symbol_id");
                    sqlx::query(
                        r#"
                        INSERT INTO job_state (job_id, symbol_id, value)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (job_id, symbol_id) DO UPDATE SET value = EXCLUDED.value
                        "#,
                    )
                    .bind(&job_id)
                    .bind(symbol_id)
                    .bind(&value)
                    .execute(&mut **txn)
                    .await?;
                }
                Ok(TxnReply::Unit)
            }

            TxnOp::StreamAppend { stream, message } => {
                let payload = serde_json::to_value(&message)?;
                let id: i64 = sqlx::query(
                    "INSERT INTO stream_messages (stream, message) VALUES ($1, $2) RETURNING id",
                )
                .bind(&stream)
                .bind(&payload)
                .fetch_one(&mut **txn)
                .await?
                .get("id");
                Ok(TxnReply::MessageId(id.to_string()))
            }

            TxnOp::StreamAckDelete { stream, id, .. } => {
                let id: i64 = id.parse().unwrap_or(-1);
                sqlx::query("DELETE FROM stream_messages WHERE stream = $1 AND id = $2")
                    .bind(&stream)
                    .bind(id)
                    .execute(&mut **txn)
                    .await?;
                Ok(TxnReply::Unit)
            }

            TxnOp::RegisterHook { binding } => {
                sqlx::query(
                    r#"
                    INSERT INTO hooks (topic, key, job_id, activity_id, dad)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (topic, key) DO UPDATE SET
                        job_id = EXCLUDED.job_id,
                        activity_id = EXCLUDED.activity_id,
                        dad = EXCLUDED.dad
                    "#,
                )
                .bind(&binding.topic)
                .bind(&binding.key)
                .bind(&binding.job_id)
                .bind(&binding.activity_id)
                .bind(binding.dad.as_str())
                .execute(&mut **txn)
                .await?;
                Ok(TxnReply::Unit)
            }

            TxnOp::RemoveHook { topic, key } => {
                sqlx::query("DELETE FROM hooks WHERE topic = $1 AND key = $2")
                    .bind(&topic)
                    .bind(&key)
                    .execute(&mut **txn)
                    .await?;
                Ok(TxnReply::Unit)
            }

            TxnOp::RegisterTimer { binding } => {
                sqlx::query(
                    r#"
                    INSERT INTO timers (job_id, activity_id, dad, deadline_ms)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(&binding.job_id)
                .bind(&binding.activity_id)
                .bind(binding.dad.as_str())
                .bind(binding.deadline_ms)
                .execute(&mut **txn)
                .await?;
                Ok(TxnReply::Unit)
            }

            TxnOp::AppendEvent { job_id, event } => {
                let payload = serde_json::to_value(&event)?;
                let seq: i64 = sqlx::query(
                    r#"
                    INSERT INTO job_events (job_id, seq, event)
                    SELECT $1, COALESCE(MAX(seq), 0) + 1, $2
                      FROM job_events WHERE job_id = $1
                    RETURNING seq
                    "#,
                )
                .bind(&job_id)
                .bind(&payload)
                .fetch_one(&mut **txn)
                .await?
                .get("seq");
                Ok(TxnReply::Seq(seq as u64))
            }

            TxnOp::MarkJobInterrupted { job_id, error } => {
                let error = error.map(|e| serde_json::to_value(e)).transpose()?;
                let affected = sqlx::query(
                    r#"
                    UPDATE jobs SET semaphore = $2, error = $3, updated_at = now()
                     WHERE job_id = $1
                    "#,
                )
                .bind(&job_id)
                .bind(INTERRUPT_SENTINEL)
                .bind(&error)
                .execute(&mut **txn)
                .await?
                .rows_affected();
                if affected == 0 {
                    return Err(anyhow!("job not found: {job_id}"));
                }
                Ok(TxnReply::Unit)
            }

            TxnOp::SetJobError { job_id, error } => {
                let error = serde_json::to_value(&error)?;
                sqlx::query("UPDATE jobs SET error = $2, updated_at = now() WHERE job_id = $1")
                    .bind(&job_id)
                    .bind(&error)
                    .execute(&mut **txn)
                    .await?;
                Ok(TxnReply::Unit)
            }

            TxnOp::ScheduleExpire { job_id, at } => {
                sqlx::query("UPDATE jobs SET expires_at = $2 WHERE job_id = $1")
                    .bind(&job_id)
                    .bind(epoch_ms_to_datetime(at))
                    .execute(&mut **txn)
                    .await?;
                Ok(TxnReply::Unit)
            }
        }
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn read_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, app_id, topic, generation_id, semaphore, error,
                   parent, created_at, updated_at, expire_ms, expires_at
              FROM jobs WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn read_flat_state(
        &self,
        job_id: &str,
        paths: &[String],
        dad: &DimensionalAddress,
    ) -> Result<Option<(BTreeMap<String, Value>, i64)>> {
        let Some(job) = self.read_job(job_id).await? else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        if paths.is_empty() {
            let rows = sqlx::query(
                r#"
                SELECT s.path, st.value
                  FROM job_state st JOIN symbols s ON s.symbol_id = st.symbol_id
                 WHERE st.job_id = $1
                "#,
            )
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.insert(row.get("path"), row.get("value"));
            }
        } else {
            // Fetch both the dimensional and root spellings, preferring the
            // dimensional subspace.
            let mut lookups: Vec<String> = Vec::with_capacity(paths.len() * 2);
            for path in paths {
                lookups.push(dimensioned_path(path, dad));
                lookups.push(path.clone());
            }
            let rows = sqlx::query(
                r#"
                SELECT s.path, st.value
                  FROM job_state st JOIN symbols s ON s.symbol_id = st.symbol_id
                 WHERE st.job_id = $1 AND s.path = ANY($2)
                "#,
            )
            .bind(job_id)
            .bind(&lookups)
            .fetch_all(&self.pool)
            .await?;
            let mut found: BTreeMap<String, Value> = BTreeMap::new();
            for row in rows {
                found.insert(row.get("path"), row.get("value"));
            }
            for path in paths {
                let stored = dimensioned_path(path, dad);
                if let Some(v) = found.get(&stored).or_else(|| found.get(path)) {
                    out.insert(path.clone(), v.clone());
                }
            }
        }
        Ok(Some((out, job.semaphore)))
    }

    async fn read_activity_ledger(
        &self,
        job_id: &str,
        activity_id: &str,
        dad: &DimensionalAddress,
    ) -> Result<LedgerValue> {
        let row = sqlx::query(
            r#"
            SELECT value FROM activity_ledgers
             WHERE job_id = $1 AND activity_id = $2 AND dad = $3
            "#,
        )
        .bind(job_id)
        .bind(activity_id)
        .bind(dad.trimmed().as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")).unwrap_or(0))
    }

    async fn read_guid_ledger(&self, job_id: &str, guid: &str) -> Result<LedgerValue> {
        let row = sqlx::query("SELECT value FROM guid_ledgers WHERE job_id = $1 AND guid = $2")
            .bind(job_id)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")).unwrap_or(0))
    }

    async fn read_events(&self, job_id: &str, from_seq: u64) -> Result<Vec<(u64, JobEvent)>> {
        let rows = sqlx::query(
            "SELECT seq, event FROM job_events WHERE job_id = $1 AND seq >= $2 ORDER BY seq",
        )
        .bind(job_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let event: Value = row.get("event");
            out.push((seq as u64, serde_json::from_value(event)?));
        }
        Ok(out)
    }

    async fn hooks_for_topic(&self, topic: &str) -> Result<Vec<HookBinding>> {
        let rows = sqlx::query(
            "SELECT topic, key, job_id, activity_id, dad FROM hooks WHERE topic = $1",
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_hook).collect())
    }

    async fn hook_by_key(&self, topic: &str, key: &str) -> Result<Option<HookBinding>> {
        let row = sqlx::query(
            "SELECT topic, key, job_id, activity_id, dad FROM hooks WHERE topic = $1 AND key = $2",
        )
        .bind(topic)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_hook))
    }

    async fn hooks_for_job(&self, job_id: &str) -> Result<Vec<HookBinding>> {
        let rows = sqlx::query(
            "SELECT topic, key, job_id, activity_id, dad FROM hooks WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_hook).collect())
    }

    async fn child_jobs(&self, job_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT job_id FROM jobs WHERE parent->>'job_id' = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("job_id")).collect())
    }

    async fn claim_due_timers(&self, now: Timestamp, limit: usize) -> Result<Vec<TimerBinding>> {
        let rows = sqlx::query(
            r#"
            DELETE FROM timers
             WHERE id IN (
                 SELECT id FROM timers WHERE deadline_ms <= $1
                  ORDER BY deadline_ms LIMIT $2 FOR UPDATE SKIP LOCKED
             )
            RETURNING job_id, activity_id, dad, deadline_ms
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TimerBinding {
                job_id: row.get("job_id"),
                activity_id: row.get("activity_id"),
                dad: DimensionalAddress::parse(row.get("dad")),
                deadline_ms: row.get("deadline_ms"),
            })
            .collect())
    }

    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stream_groups (stream, grp) VALUES ($1, $2)
            ON CONFLICT (stream, grp) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stream_read(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEnvelope>> {
        let deadline = now_ms() + block_ms as i64;
        loop {
            let rows = sqlx::query(
                r#"
                UPDATE stream_messages
                   SET claimed_by = $2, claimed_at = now(),
                       delivery_count = delivery_count + 1
                 WHERE id IN (
                     SELECT id FROM stream_messages
                      WHERE stream = $1 AND claimed_by IS NULL
                      ORDER BY id LIMIT $3
                        FOR UPDATE SKIP LOCKED
                 )
                RETURNING id, message, delivery_count
                "#,
            )
            .bind(stream)
            .bind(consumer)
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
            if !rows.is_empty() {
                return rows.into_iter().map(row_to_envelope).collect();
            }
            if now_ms() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    async fn stream_claim_pending(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        idle_ms: u64,
        limit: usize,
    ) -> Result<Vec<StreamEnvelope>> {
        let rows = sqlx::query(
            r#"
            UPDATE stream_messages
               SET claimed_by = $2, claimed_at = now(),
                   delivery_count = delivery_count + 1
             WHERE id IN (
                 SELECT id FROM stream_messages
                  WHERE stream = $1 AND claimed_by IS NOT NULL
                    AND claimed_at < now() - ($3 * interval '1 millisecond')
                  ORDER BY id LIMIT $4
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING id, message, delivery_count
            "#,
        )
        .bind(stream)
        .bind(consumer)
        .bind(idle_ms as f64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_envelope).collect()
    }

    async fn stream_depth(&self, stream: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM stream_messages WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    async fn sweep_expired(&self, now: Timestamp) -> Result<u64> {
        let mut txn = self.pool.begin().await?;
        let rows = sqlx::query(
            "DELETE FROM jobs WHERE expires_at IS NOT NULL AND expires_at <= $1 RETURNING job_id",
        )
        .bind(epoch_ms_to_datetime(now))
        .fetch_all(&mut *txn)
        .await?;
        let ids: Vec<String> = rows.into_iter().map(|r| r.get("job_id")).collect();
        if !ids.is_empty() {
            sqlx::query("DELETE FROM job_state WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
            sqlx::query("DELETE FROM activity_ledgers WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
            sqlx::query("DELETE FROM guid_ledgers WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
            sqlx::query("DELETE FROM job_events WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
            sqlx::query("DELETE FROM hooks WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
            sqlx::query("DELETE FROM timers WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *txn)
                .await?;
        }
        txn.commit().await?;
        Ok(ids.len() as u64)
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnReply>> {
        let mut txn = self.pool.begin().await?;
        let mut replies = Vec::with_capacity(ops.len());
        for op in ops {
            replies.push(Self::apply(&mut txn, op).await?);
        }
        txn.commit().await?;
        Ok(replies)
    }
}

fn row_to_hook(row: sqlx::postgres::PgRow) -> HookBinding {
    HookBinding {
        topic: row.get("topic"),
        key: row.get("key"),
        job_id: row.get("job_id"),
        activity_id: row.get("activity_id"),
        dad: DimensionalAddress::parse(row.get("dad")),
    }
}

fn row_to_envelope(row: sqlx::postgres::PgRow) -> Result<StreamEnvelope> {
    let id: i64 = row.get("id");
    let message: Value = row.get("message");
    let delivery_count: i32 = row.get("delivery_count");
    Ok(StreamEnvelope {
        id: id.to_string(),
        delivery_count: delivery_count as u32,
        message: serde_json::from_value(message).context("malformed stream message")?,
    })
}
