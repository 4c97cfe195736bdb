//! Database controller backend
//!
//! Session state is partitioned into independently addressable, independently
//! lockable items inside one session record: `state:<vmid>`, `future:<vmid>`,
//! `arec:<ptr>`, `stdout`, plus meta columns on the session row itself. Item
//! locks are optimistic compare-and-set flag flips, retried with a fixed
//! backoff until the configured bound, after which acquisition raises
//! `LockTimeout`. Reference counts and stdout appends use single atomic
//! `UPDATE`s so no lock is needed for them.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use uuid::Uuid;

use crate::arec::ActivationRecord;
use crate::config::{Config, LockConfig};
use crate::controller::{arec_key, future_key, state_key, Controller, Event};
use crate::errors::{StoreError, VmError, VmResult};
use crate::executable::Executable;
use crate::future::FutureState;
use crate::state::State;
use crate::value::{ArecPtr, Value, Vmid};

/// Controller persisting one session in Postgres
pub struct DatabaseController {
    pool: PgPool,
    session_id: String,
    lock_cfg: LockConfig,
    exe_cache: OnceLock<Arc<Executable>>,
}

impl DatabaseController {
    /// Create a fresh session
    pub async fn create(pool: PgPool, lock_cfg: LockConfig) -> VmResult<Self> {
        let session_id = Uuid::new_v4().to_string();

        let mut tx = pool.begin().await.map_err(StoreError::from)?;
        sqlx::query("INSERT INTO sessions (id) VALUES ($1)")
            .bind(&session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        sqlx::query(
            "INSERT INTO session_items (session_id, key, value) VALUES ($1, 'stdout', '[]'::jsonb)",
        )
        .bind(&session_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        tx.commit().await.map_err(StoreError::from)?;

        Ok(DatabaseController {
            pool,
            session_id,
            lock_cfg,
            exe_cache: OnceLock::new(),
        })
    }

    /// Attach to an existing session (the resume path)
    pub async fn attach(pool: PgPool, lock_cfg: LockConfig, session_id: String) -> VmResult<Self> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE id = $1")
            .bind(&session_id)
            .fetch_optional(&pool)
            .await
            .map_err(StoreError::from)?;
        if exists.is_none() {
            return Err(StoreError::Session(format!("no session '{session_id}'")).into());
        }
        Ok(DatabaseController {
            pool,
            session_id,
            lock_cfg,
            exe_cache: OnceLock::new(),
        })
    }

    /// Connect a pool from configuration
    pub async fn connect(config: &Config) -> VmResult<PgPool> {
        let url = config
            .database
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Session("database URL not configured".into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect(url)
            .await
            .map_err(StoreError::from)?;
        Ok(pool)
    }

    /// Run schema migrations
    pub async fn migrate(pool: &PgPool) -> VmResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Session(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /* ----- Item helpers ----- */

    async fn get_item<T: DeserializeOwned>(&self, key: &str) -> VmResult<T> {
        let row: Option<(JsonValue,)> =
            sqlx::query_as("SELECT value FROM session_items WHERE session_id = $1 AND key = $2")
                .bind(&self.session_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?;
        let (value,) = row.ok_or_else(|| StoreError::MissingItem {
            key: key.to_string(),
        })?;
        Ok(serde_json::from_value(value).map_err(StoreError::from)?)
    }

    async fn put_item<T: Serialize>(&self, key: &str, value: &T) -> VmResult<()> {
        let value = serde_json::to_value(value).map_err(StoreError::from)?;
        sqlx::query(
            r#"
            INSERT INTO session_items (session_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id, key)
            DO UPDATE SET value = $3, updated_at = NOW()
            "#,
        )
        .bind(&self.session_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn item_exists(&self, key: &str) -> VmResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM session_items WHERE session_id = $1 AND key = $2")
                .bind(&self.session_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?;
        Ok(row.is_some())
    }

    /// Adjust an activation record's ref count atomically, returning the new
    /// count
    async fn bump_ref(&self, ptr: ArecPtr, delta: i64) -> VmResult<i64> {
        let key = arec_key(ptr);
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE session_items
            SET value = jsonb_set(
                    value,
                    '{ref_count}',
                    to_jsonb(((value->>'ref_count')::bigint) + $3)
                ),
                updated_at = NOW()
            WHERE session_id = $1 AND key = $2
            RETURNING ((value->>'ref_count')::bigint)
            "#,
        )
        .bind(&self.session_id)
        .bind(&key)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let (count,) = row.ok_or(StoreError::MissingItem { key })?;
        if count < 0 {
            return Err(VmError::unexpected(format!(
                "activation record {ptr} ref count went negative"
            )));
        }
        Ok(count)
    }

    async fn begin_on(
        &self,
        pool: &PgPool,
    ) -> VmResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        Ok(pool.begin().await.map_err(StoreError::from)?)
    }
}

#[async_trait]
impl Controller for DatabaseController {
    /* ----- Executable ----- */

    async fn set_executable(&self, exe: &Executable) -> VmResult<()> {
        let document = exe.to_wire();
        let result = sqlx::query(
            "UPDATE sessions SET executable = $2 WHERE id = $1 AND executable IS NULL",
        )
        .bind(&self.session_id)
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Session("executable already set".into()).into());
        }
        Ok(())
    }

    async fn executable(&self) -> VmResult<Arc<Executable>> {
        if let Some(exe) = self.exe_cache.get() {
            return Ok(exe.clone());
        }
        let row: (Option<JsonValue>,) =
            sqlx::query_as("SELECT executable FROM sessions WHERE id = $1")
                .bind(&self.session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from)?;
        let document = row
            .0
            .ok_or_else(|| StoreError::Session("executable not set".into()))?;
        let exe = Arc::new(Executable::from_wire(&document)?);
        // Another task may have raced the fill; both decoded the same
        // immutable document
        let _ = self.exe_cache.set(exe.clone());
        Ok(exe)
    }

    /* ----- Threads ----- */

    async fn new_thread(&self) -> VmResult<Vmid> {
        let mut tx = self.begin_on(&self.pool).await?;
        let vmid: i64 = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET thread_count = thread_count + 1
            WHERE id = $1
            RETURNING thread_count - 1
            "#,
        )
        .bind(&self.session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        let vmid = vmid as Vmid;

        let state = serde_json::to_value(State::empty()).map_err(StoreError::from)?;
        let future = serde_json::to_value(FutureState::new()).map_err(StoreError::from)?;
        sqlx::query(
            r#"
            INSERT INTO session_items (session_id, key, value)
            VALUES ($1, $2, $3), ($1, $4, $5)
            "#,
        )
        .bind(&self.session_id)
        .bind(state_key(vmid))
        .bind(state)
        .bind(future_key(vmid))
        .bind(future)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(vmid)
    }

    async fn thread_count(&self) -> VmResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT thread_count FROM sessions WHERE id = $1")
            .bind(&self.session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(count as u32)
    }

    async fn get_state(&self, vmid: Vmid) -> VmResult<State> {
        self.get_item(&state_key(vmid)).await
    }

    async fn set_state(&self, vmid: Vmid, state: &State) -> VmResult<()> {
        self.put_item(&state_key(vmid), state).await
    }

    async fn get_future(&self, vmid: Vmid) -> VmResult<FutureState> {
        self.get_item(&future_key(vmid)).await
    }

    async fn set_future(&self, vmid: Vmid, future: &FutureState) -> VmResult<()> {
        self.put_item(&future_key(vmid), future).await
    }

    async fn add_continuation(&self, target: Vmid, waiter: Vmid) -> VmResult<()> {
        let key = future_key(target);
        let result = sqlx::query(
            r#"
            UPDATE session_items
            SET value = jsonb_set(
                    value,
                    '{continuations}',
                    (value->'continuations') || to_jsonb($3::bigint)
                ),
                updated_at = NOW()
            WHERE session_id = $1 AND key = $2
            "#,
        )
        .bind(&self.session_id)
        .bind(&key)
        .bind(waiter as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingItem { key }.into());
        }
        Ok(())
    }

    /* ----- Activation records ----- */

    async fn new_arec(&self, rec: &ActivationRecord) -> VmResult<ArecPtr> {
        let mut tx = self.begin_on(&self.pool).await?;
        let ptr: i64 = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET arec_count = arec_count + 1
            WHERE id = $1
            RETURNING arec_count - 1
            "#,
        )
        .bind(&self.session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        let ptr = ptr as ArecPtr;

        let value = serde_json::to_value(rec).map_err(StoreError::from)?;
        sqlx::query("INSERT INTO session_items (session_id, key, value) VALUES ($1, $2, $3)")
            .bind(&self.session_id)
            .bind(arec_key(ptr))
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(ptr)
    }

    async fn get_arec(&self, ptr: ArecPtr) -> VmResult<ActivationRecord> {
        self.get_item(&arec_key(ptr)).await
    }

    async fn set_arec(&self, ptr: ArecPtr, rec: &ActivationRecord) -> VmResult<()> {
        let key = arec_key(ptr);
        if !self.item_exists(&key).await? {
            return Err(StoreError::MissingItem { key }.into());
        }
        self.put_item(&key, rec).await
    }

    async fn delete_arec(&self, ptr: ArecPtr) -> VmResult<()> {
        let key = arec_key(ptr);
        let result =
            sqlx::query("DELETE FROM session_items WHERE session_id = $1 AND key = $2")
                .bind(&self.session_id)
                .bind(&key)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingItem { key }.into());
        }
        Ok(())
    }

    async fn increment_ref(&self, ptr: ArecPtr) -> VmResult<i64> {
        self.bump_ref(ptr, 1).await
    }

    async fn decrement_ref(&self, ptr: ArecPtr) -> VmResult<i64> {
        self.bump_ref(ptr, -1).await
    }

    /* ----- Item locks ----- */

    async fn lock(&self, key: &str, owner: Vmid) -> VmResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.lock_cfg.timeout_ms);
        loop {
            // Fresh acquisition: flip the flag only if nobody holds it
            let acquired = sqlx::query(
                r#"
                UPDATE session_items
                SET locked = TRUE, lock_owner = $3, lock_depth = 1
                WHERE session_id = $1 AND key = $2 AND locked = FALSE
                "#,
            )
            .bind(&self.session_id)
            .bind(key)
            .bind(owner as i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
            if acquired.rows_affected() == 1 {
                return Ok(());
            }

            // Re-entrant acquisition for the current holder
            let reentered = sqlx::query(
                r#"
                UPDATE session_items
                SET lock_depth = lock_depth + 1
                WHERE session_id = $1 AND key = $2 AND locked = TRUE AND lock_owner = $3
                "#,
            )
            .bind(&self.session_id)
            .bind(key)
            .bind(owner as i64)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
            if reentered.rows_affected() == 1 {
                return Ok(());
            }

            if !self.item_exists(key).await? {
                return Err(StoreError::MissingItem {
                    key: key.to_string(),
                }
                .into());
            }

            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                }
                .into());
            }
            tracing::debug!(key, owner, "lock contended, retrying");
            tokio::time::sleep(Duration::from_millis(self.lock_cfg.retry_ms)).await;
        }
    }

    async fn unlock(&self, key: &str, owner: Vmid) -> VmResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE session_items
            SET lock_depth = lock_depth - 1,
                locked = lock_depth > 1,
                lock_owner = CASE WHEN lock_depth > 1 THEN lock_owner END
            WHERE session_id = $1 AND key = $2 AND locked = TRUE AND lock_owner = $3
            "#,
        )
        .bind(&self.session_id)
        .bind(key)
        .bind(owner as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(VmError::unexpected(format!(
                "thread {owner} released lock '{key}' it does not hold"
            )));
        }
        Ok(())
    }

    /* ----- Session ----- */

    async fn write_stdout(&self, text: &str) -> VmResult<()> {
        sqlx::query(
            r#"
            UPDATE session_items
            SET value = value || to_jsonb($3::text), updated_at = NOW()
            WHERE session_id = $1 AND key = $2
            "#,
        )
        .bind(&self.session_id)
        .bind("stdout")
        .bind(text)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn read_stdout(&self) -> VmResult<String> {
        let chunks: Vec<String> = self.get_item("stdout").await?;
        Ok(chunks.concat())
    }

    async fn set_broken(&self) -> VmResult<()> {
        sqlx::query("UPDATE sessions SET broken = TRUE WHERE id = $1")
            .bind(&self.session_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn is_broken(&self) -> VmResult<bool> {
        let broken: bool = sqlx::query_scalar("SELECT broken FROM sessions WHERE id = $1")
            .bind(&self.session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(broken)
    }

    async fn set_result(&self, value: &Value) -> VmResult<()> {
        let json = serde_json::to_value(value).map_err(StoreError::from)?;
        sqlx::query("UPDATE sessions SET result = $2 WHERE id = $1")
            .bind(&self.session_id)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn result(&self) -> VmResult<Option<Value>> {
        let row: (Option<JsonValue>,) =
            sqlx::query_as("SELECT result FROM sessions WHERE id = $1")
                .bind(&self.session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from)?;
        match row.0 {
            Some(json) => Ok(Some(serde_json::from_value(json).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    async fn all_stopped(&self) -> VmResult<bool> {
        let stopped: bool = sqlx::query_scalar(
            r#"
            SELECT COALESCE(bool_and((value->>'stopped')::boolean), FALSE)
            FROM session_items
            WHERE session_id = $1 AND key LIKE 'state:%'
            "#,
        )
        .bind(&self.session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(stopped)
    }

    async fn log_event(&self, vmid: Vmid, kind: &str, data: JsonValue) -> VmResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_events (session_id, vmid, kind, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&self.session_id)
        .bind(vmid as i64)
        .bind(kind)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn events(&self) -> VmResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT vmid, kind, data, created_at
            FROM session_events
            WHERE session_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(&self.session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let vmid: i64 = row.get("vmid");
            events.push(Event {
                at: row.get("created_at"),
                vmid: vmid as Vmid,
                kind: row.get("kind"),
                data: row.get("data"),
            });
        }
        Ok(events)
    }
}
