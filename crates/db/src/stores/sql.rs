use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use loanflow_core::context::{ContextStore, StoreError, StoredSessionSummary};
use loanflow_core::domain::conversation::{ConversationContext, ConversationStage, SessionId};
use sqlx::{sqlite::SqliteRow, Row};

use super::{corrupt, decode, encode};
use crate::{connection, DbPool};

pub struct SqlContextStore {
    pool: DbPool,
}

impl SqlContextStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ContextStore for SqlContextStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let row = sqlx::query(
            "SELECT payload, digest FROM conversation_context WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload").map_err(backend_error)?;
        let digest: String = row.try_get("digest").map_err(backend_error)?;
        decode(session_id, &payload, &digest).map(Some)
    }

    async fn put(&self, context: &ConversationContext) -> Result<(), StoreError> {
        let encoded = encode(context)?;

        sqlx::query(
            "INSERT INTO conversation_context (
                session_id,
                customer_id,
                stage,
                payload,
                digest,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                customer_id = excluded.customer_id,
                stage = excluded.stage,
                payload = excluded.payload,
                digest = excluded.digest,
                updated_at = excluded.updated_at",
        )
        .bind(context.session_id.as_str())
        .bind(context.customer_id.as_deref())
        .bind(context.conversation_stage.as_str())
        .bind(&encoded.payload)
        .bind(&encoded.digest)
        .bind(sortable_timestamp(context.updated_at))
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredSessionSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, customer_id, stage, updated_at
             FROM conversation_context
             ORDER BY updated_at DESC, session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.into_iter().map(summary_from_row).collect()
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversation_context WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        connection::ping(&self.pool).await.map_err(backend_error)
    }
}

fn summary_from_row(row: SqliteRow) -> Result<StoredSessionSummary, StoreError> {
    let session_id = SessionId(row.try_get("session_id").map_err(backend_error)?);
    let stage_raw: String = row.try_get("stage").map_err(backend_error)?;
    let stage = ConversationStage::parse(&stage_raw)
        .ok_or_else(|| corrupt(&session_id, &format!("unknown stage `{stage_raw}`")))?;
    let updated_raw: String = row.try_get("updated_at").map_err(backend_error)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| {
            corrupt(&session_id, &format!("invalid updated_at `{updated_raw}` ({error})"))
        })?;

    Ok(StoredSessionSummary {
        customer_id: row.try_get("customer_id").map_err(backend_error)?,
        session_id,
        stage,
        updated_at,
    })
}

// Fixed-width so lexical order in SQLite matches chronological order.
fn sortable_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn backend_error(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use loanflow_core::context::{ContextStore, StoreError};
    use loanflow_core::domain::conversation::{
        AgentType, ConversationContext, ConversationStage, SessionId,
    };
    use serde_json::{json, Map};

    use super::SqlContextStore;
    use crate::migrations;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_context(id: &str) -> ConversationContext {
        let mut context =
            ConversationContext::new(SessionId::from(id), Some("CUST001".to_string()));
        context.add_collected_data("loan_amount", json!(150000));
        let mut shared = Map::new();
        shared.insert("loan_amount".to_string(), json!(100000));
        context.shared_data.put(AgentType::Sales, AgentType::Verification, shared);
        context.switch_agent(AgentType::Sales, ConversationStage::SalesNegotiation);
        context
    }

    #[tokio::test]
    async fn sql_store_round_trips_full_context() {
        let pool = setup_pool().await;
        let store = SqlContextStore::new(pool.clone());
        let context = sample_context("session_111111111111");

        store.put(&context).await.expect("put");
        let found = store.get(&context.session_id).await.expect("get");

        assert_eq!(found, Some(context));
        pool.close().await;
    }

    #[tokio::test]
    async fn missing_session_is_none_and_delete_reports_absence() {
        let pool = setup_pool().await;
        let store = SqlContextStore::new(pool.clone());
        let missing = SessionId::from("session_000000000000");

        assert_eq!(store.get(&missing).await.expect("get"), None);
        assert!(!store.delete(&missing).await.expect("delete"));

        let context = sample_context("session_222222222222");
        store.put(&context).await.expect("put");
        assert!(store.delete(&context.session_id).await.expect("delete"));
        assert_eq!(store.get(&context.session_id).await.expect("get"), None);
        pool.close().await;
    }

    #[tokio::test]
    async fn overwrite_replaces_payload_and_stage() {
        let pool = setup_pool().await;
        let store = SqlContextStore::new(pool.clone());
        let mut context = sample_context("session_333333333333");
        store.put(&context).await.expect("first put");

        context.set_stage(ConversationStage::Verification);
        store.put(&context).await.expect("second put");

        let summaries = store.list().await.expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].stage, ConversationStage::Verification);
        let found = store.get(&context.session_id).await.expect("get").expect("present");
        assert_eq!(found.conversation_stage, ConversationStage::Verification);
        pool.close().await;
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let pool = setup_pool().await;
        let store = SqlContextStore::new(pool.clone());

        let mut older = sample_context("session_444444444444");
        older.updated_at = Utc::now() - Duration::minutes(10);
        let newer = sample_context("session_555555555555");
        store.put(&older).await.expect("put older");
        store.put(&newer).await.expect("put newer");

        let ids: Vec<String> =
            store.list().await.expect("list").into_iter().map(|s| s.session_id.0).collect();
        assert_eq!(ids, vec!["session_555555555555", "session_444444444444"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn empty_payload_row_is_corrupt_not_missing() {
        let pool = setup_pool().await;
        let store = SqlContextStore::new(pool.clone());
        sqlx::query(
            "INSERT INTO conversation_context (session_id, customer_id, stage, payload, digest, updated_at)
             VALUES ('session_666666666666', NULL, 'initiation', '', '', '2026-02-23T12:00:00.000000Z')",
        )
        .execute(&pool)
        .await
        .expect("insert empty row");

        let result = store.get(&SessionId::from("session_666666666666")).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        store.ping().await.expect("ping");
        pool.close().await;
    }
}
