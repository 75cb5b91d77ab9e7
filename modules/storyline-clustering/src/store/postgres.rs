// Postgres-backed TopicStore.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info, warn};
use uuid::Uuid;

use storyline_common::{
    Bucket, Ctm, EntityCountries, Headline, LockState, RawSignals, SignalSet,
};

use super::{
    CommitOutcome, MoveOutcome, PartitionLock, PendingTopic, TopicCommit, TopicStore, TopicWrite,
};
use crate::error::{ClusterError, Result};
use crate::topic::{CoOccurrence, Topic};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct CtmRow {
    id: Uuid,
    centroid_id: String,
    track: String,
    month: NaiveDate,
    home_iso_codes: Vec<String>,
    is_frozen: bool,
    last_clustered_at: Option<DateTime<Utc>>,
}

impl From<CtmRow> for Ctm {
    fn from(row: CtmRow) -> Self {
        Ctm {
            id: row.id,
            centroid_id: row.centroid_id,
            track: row.track,
            month: row.month,
            home_iso_codes: row.home_iso_codes,
            is_frozen: row.is_frozen,
            last_clustered_at: row.last_clustered_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HeadlineRow {
    id: Uuid,
    pubdate: DateTime<Utc>,
    title: Option<String>,
    signals: Json<Option<RawSignals>>,
    entity_countries: Json<EntityCountries>,
}

#[derive(Debug, sqlx::FromRow)]
struct TopicRow {
    id: Uuid,
    ctm_id: Uuid,
    bucket: String,
    is_catchall: bool,
    lock_state: String,
    anchor: Json<SignalSet>,
    co_occurrence: Json<CoOccurrence>,
    member_count: i32,
    first_active: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl TryFrom<TopicRow> for Topic {
    type Error = ClusterError;

    fn try_from(row: TopicRow) -> Result<Self> {
        let bucket: Bucket = row
            .bucket
            .parse()
            .map_err(|e| ClusterError::Decode(format!("topic {}: {e}", row.id)))?;
        let lock_state: LockState = row
            .lock_state
            .parse()
            .map_err(|e| ClusterError::Decode(format!("topic {}: {e}", row.id)))?;
        let member_count = u32::try_from(row.member_count).map_err(|_| {
            ClusterError::Decode(format!(
                "topic {}: negative member_count {}",
                row.id, row.member_count
            ))
        })?;

        Ok(Topic {
            id: row.id,
            ctm_id: row.ctm_id,
            bucket,
            is_catchall: row.is_catchall,
            lock_state,
            anchor: row.anchor.0,
            co_occurrence: row.co_occurrence.0,
            member_count,
            first_active: row.first_active,
            last_active: row.last_active,
        })
    }
}

const TOPIC_COLUMNS: &str = "id, ctm_id, bucket, is_catchall, lock_state, anchor, co_occurrence, \
                             member_count, first_active, last_active";

fn member_count_param(topic: &Topic) -> Result<i32> {
    i32::try_from(topic.member_count).map_err(|_| {
        ClusterError::Decode(format!(
            "topic {}: member_count {} out of range",
            topic.id, topic.member_count
        ))
    })
}

/// Advisory lock key for a CTM. Both halves of the id are folded in so
/// distinct CTMs rarely share a key.
pub(crate) fn partition_lock_key(ctm_id: Uuid) -> i64 {
    let raw = ctm_id.as_u128();
    ((raw >> 64) as u64 ^ raw as u64) as i64
}

// ---------------------------------------------------------------------------
// Partition lock
// ---------------------------------------------------------------------------

/// Session-level advisory lock held on its own pooled connection.
struct PgPartitionLock {
    ctm_id: Uuid,
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl PartitionLock for PgPartitionLock {
    fn ctm_id(&self) -> Uuid {
        self.ctm_id
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await?;
            if !released {
                warn!(ctm_id = %self.ctm_id, "Partition lock was not held at release");
            }
        }
        Ok(())
    }
}

impl Drop for PgPartitionLock {
    fn drop(&mut self) {
        // Unreleased: close the session instead of returning it to the pool
        // still holding the lock.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgTopicStore {
    pool: PgPool,
}

impl PgTopicStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert_topic(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        topic: &Topic,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO topics
                (id, ctm_id, bucket, is_catchall, lock_state, anchor, co_occurrence,
                 member_count, first_active, last_active, needs_summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE)
            "#,
        )
        .bind(topic.id)
        .bind(topic.ctm_id)
        .bind(topic.bucket.to_string())
        .bind(topic.is_catchall)
        .bind(topic.lock_state.as_str())
        .bind(Json(&topic.anchor))
        .bind(Json(&topic.co_occurrence))
        .bind(member_count_param(topic)?)
        .bind(topic.first_active)
        .bind(topic.last_active)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_topic(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        topic: &Topic,
    ) -> Result<()> {
        // The stored lock_state guards the anchor: once locked, neither the
        // anchor nor the state can be written again.
        let updated = sqlx::query(
            r#"
            UPDATE topics SET
                anchor        = CASE WHEN lock_state = 'forming' THEN $3 ELSE anchor END,
                lock_state    = CASE WHEN lock_state = 'forming' THEN $4 ELSE lock_state END,
                co_occurrence = $5,
                member_count  = $6,
                first_active  = $7,
                last_active   = $8,
                needs_summary = TRUE,
                updated_at    = now()
            WHERE id = $1 AND ctm_id = $2
            "#,
        )
        .bind(topic.id)
        .bind(topic.ctm_id)
        .bind(Json(&topic.anchor))
        .bind(topic.lock_state.as_str())
        .bind(Json(&topic.co_occurrence))
        .bind(member_count_param(topic)?)
        .bind(topic.first_active)
        .bind(topic.last_active)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ClusterError::TopicNotInCtm {
                topic_id: topic.id,
                ctm_id: topic.ctm_id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TopicStore for PgTopicStore {
    async fn load_ctm(&self, ctm_id: Uuid) -> Result<Option<Ctm>> {
        let row = sqlx::query_as::<_, CtmRow>(
            r#"
            SELECT id, centroid_id, track, month, home_iso_codes, is_frozen, last_clustered_at
            FROM ctms
            WHERE id = $1
            "#,
        )
        .bind(ctm_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Ctm::from))
    }

    async fn try_lock_partition(&self, ctm_id: Uuid) -> Result<Option<Box<dyn PartitionLock>>> {
        let key = partition_lock_key(ctm_id);
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            debug!(%ctm_id, key, "Partition lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(Box::new(PgPartitionLock {
            ctm_id,
            key,
            conn: Some(conn),
        })))
    }

    async fn unlinked_headlines(&self, ctm: &Ctm) -> Result<Vec<Headline>> {
        let rows = sqlx::query_as::<_, HeadlineRow>(
            r#"
            SELECT h.id, h.pubdate, h.title, h.signals, h.entity_countries
            FROM ctm_headlines ch
            JOIN headlines h ON h.id = ch.headline_id
            WHERE ch.ctm_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM topic_members m
                  WHERE m.ctm_id = ch.ctm_id AND m.headline_id = ch.headline_id
              )
            ORDER BY h.pubdate ASC, h.id ASC
            "#,
        )
        .bind(ctm.id)
        .fetch_all(&self.pool)
        .await?;

        let home: std::collections::BTreeSet<String> =
            ctm.home_iso_codes.iter().cloned().collect();
        Ok(rows
            .into_iter()
            .map(|row| Headline {
                id: row.id,
                ctm_id: ctm.id,
                pubdate: row.pubdate,
                track: ctm.track.clone(),
                title: row.title,
                home_iso_codes: home.clone(),
                signals: row.signals.0.unwrap_or_default(),
                entity_countries: row.entity_countries.0 .0,
            })
            .collect())
    }

    async fn load_topics(&self, ctm_id: Uuid) -> Result<Vec<Topic>> {
        let rows = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics WHERE ctm_id = $1 ORDER BY seq ASC"
        ))
        .bind(ctm_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Topic::try_from).collect()
    }

    async fn commit(&self, commit: &TopicCommit) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        match commit.write {
            TopicWrite::Insert => Self::insert_topic(&mut tx, &commit.topic).await?,
            TopicWrite::Update => Self::update_topic(&mut tx, &commit.topic).await?,
        }

        let linked = sqlx::query(
            r#"
            INSERT INTO topic_members (ctm_id, headline_id, topic_id, score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ctm_id, headline_id) DO NOTHING
            "#,
        )
        .bind(commit.ctm_id)
        .bind(commit.headline_id)
        .bind(commit.topic.id)
        .bind(commit.score)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if linked == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::AlreadyLinked);
        }

        tx.commit().await?;
        Ok(CommitOutcome::Linked)
    }

    async fn mark_clustered(&self, ctm_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE ctms SET last_clustered_at = $2 WHERE id = $1")
            .bind(ctm_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_partitions(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT c.id
            FROM ctms c
            WHERE NOT c.is_frozen
              AND EXISTS (
                  SELECT 1 FROM ctm_headlines ch
                  WHERE ch.ctm_id = c.id
                    AND NOT EXISTS (
                        SELECT 1 FROM topic_members m
                        WHERE m.ctm_id = ch.ctm_id AND m.headline_id = ch.headline_id
                    )
              )
            ORDER BY c.last_clustered_at ASC NULLS FIRST, c.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn move_membership(
        &self,
        ctm_id: Uuid,
        headline_id: Uuid,
        to_topic: Uuid,
    ) -> Result<MoveOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serialize with clustering passes, which write member counts from
        // their own snapshots.
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(partition_lock_key(ctm_id))
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(ClusterError::LockConflict(ctm_id));
        }

        let target_ctm: Option<Uuid> =
            sqlx::query_scalar("SELECT ctm_id FROM topics WHERE id = $1")
                .bind(to_topic)
                .fetch_optional(&mut *tx)
                .await?;
        if target_ctm != Some(ctm_id) {
            return Err(ClusterError::TopicNotInCtm {
                topic_id: to_topic,
                ctm_id,
            });
        }

        let current: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT topic_id FROM topic_members
            WHERE ctm_id = $1 AND headline_id = $2
            FOR UPDATE
            "#,
        )
        .bind(ctm_id)
        .bind(headline_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(from_topic) = current else {
            return Err(ClusterError::NotLinked {
                headline_id,
                ctm_id,
            });
        };
        if from_topic == to_topic {
            tx.rollback().await?;
            return Ok(MoveOutcome::AlreadyThere);
        }

        sqlx::query(
            r#"
            UPDATE topic_members
            SET topic_id = $3, score = NULL, joined_at = now()
            WHERE ctm_id = $1 AND headline_id = $2
            "#,
        )
        .bind(ctm_id)
        .bind(headline_id)
        .bind(to_topic)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE topics
            SET member_count = member_count + CASE WHEN id = $2 THEN 1 ELSE -1 END,
                needs_summary = TRUE,
                updated_at = now()
            WHERE id IN ($1, $2)
            "#,
        )
        .bind(from_topic)
        .bind(to_topic)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(%ctm_id, %headline_id, %from_topic, %to_topic, "Moved membership");
        Ok(MoveOutcome::Moved { from_topic })
    }

    async fn pending_summaries(&self, ctm_id: Uuid) -> Result<Vec<PendingTopic>> {
        let rows = sqlx::query_as::<_, TopicRow>(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics \
             WHERE ctm_id = $1 AND needs_summary ORDER BY seq ASC"
        ))
        .bind(ctm_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Topic::try_from(row).map(|topic| PendingTopic::from(&topic)))
            .collect()
    }

    async fn mark_summarized(&self, topic_id: Uuid) -> Result<bool> {
        let updated = sqlx::query("UPDATE topics SET needs_summary = FALSE WHERE id = $1")
            .bind(topic_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_and_distinguishes_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(partition_lock_key(a), partition_lock_key(a));
        assert_ne!(partition_lock_key(a), partition_lock_key(b));
    }

    #[test]
    fn null_jsonb_headline_columns_decode_empty() {
        let signals: Json<Option<RawSignals>> = Json(serde_json::from_str("null").unwrap());
        assert_eq!(signals.0.unwrap_or_default(), RawSignals::default());

        let countries: EntityCountries =
            serde_json::from_str(r#"{"paris": null, "beijing": "CN"}"#).unwrap();
        assert_eq!(countries.0.len(), 1);
    }

    #[test]
    fn bad_lock_state_fails_to_decode() {
        let row = TopicRow {
            id: Uuid::new_v4(),
            ctm_id: Uuid::new_v4(),
            bucket: "domestic".into(),
            is_catchall: false,
            lock_state: "melted".into(),
            anchor: Json(SignalSet::new()),
            co_occurrence: Json(CoOccurrence::default()),
            member_count: 1,
            first_active: Utc::now(),
            last_active: Utc::now(),
        };
        assert!(matches!(Topic::try_from(row), Err(ClusterError::Decode(_))));
    }
}
