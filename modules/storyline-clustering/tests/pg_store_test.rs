//! PgTopicStore against a real Postgres.
//!
//! Requirements:
//!   - Docker (for Postgres via testcontainers)

use std::sync::Arc;

use sqlx::types::Json;
use uuid::Uuid;

use storyline_clustering::testing::{headline_at, orgs, test_config, us_ctm};
use storyline_clustering::testutil::postgres_container;
use storyline_clustering::{
    ClusterError, ClusterPass, MoveOutcome, PartitionLock, PgTopicStore, RunMode, TopicStore,
};
use storyline_common::{Ctm, Headline, LockState, RawSignals, SignalType};

async fn insert_ctm(store: &PgTopicStore, ctm: &Ctm) {
    sqlx::query(
        "INSERT INTO ctms (id, centroid_id, track, month, home_iso_codes) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(ctm.id)
    .bind(&ctm.centroid_id)
    .bind(&ctm.track)
    .bind(ctm.month)
    .bind(&ctm.home_iso_codes)
    .execute(store.pool())
    .await
    .unwrap();
}

async fn insert_headline(store: &PgTopicStore, h: &Headline) {
    sqlx::query(
        "INSERT INTO headlines (id, pubdate, title, signals, entity_countries) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(h.id)
    .bind(h.pubdate)
    .bind(&h.title)
    .bind(Json(&h.signals))
    .bind(Json(&h.entity_countries))
    .execute(store.pool())
    .await
    .unwrap();

    sqlx::query("INSERT INTO ctm_headlines (ctm_id, headline_id) VALUES ($1, $2)")
        .bind(h.ctm_id)
        .bind(h.id)
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn pass_persists_topics_and_is_idempotent() {
    let (_container, store) = postgres_container().await;
    let ctm = us_ctm();
    insert_ctm(&store, &ctm).await;

    // Second distinct "fed" spelling checks normalization survives the JSONB round trip.
    for i in 0..7 {
        let token = if i % 2 == 0 { "Fed" } else { "  fed " };
        insert_headline(&store, &headline_at(&ctm, i, orgs(&[token]))).await;
    }
    let oil = headline_at(
        &ctm,
        20,
        RawSignals::default().with(SignalType::Commodities, &["oil"]),
    );
    insert_headline(&store, &oil).await;

    let store = Arc::new(store);
    let pass = ClusterPass::new(Arc::clone(&store), Arc::new(test_config()));

    assert_eq!(store.due_partitions().await.unwrap(), vec![ctm.id]);
    let stats = pass.run(ctm.id, RunMode::Write).await.unwrap();
    assert_eq!(stats.headlines_linked, 8);
    assert_eq!(stats.topics_created, 2);
    assert!(store.due_partitions().await.unwrap().is_empty());

    let topics = store.load_topics(ctm.id).await.unwrap();
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0].member_count, 7);
    assert_eq!(topics[0].lock_state, LockState::Locked);
    assert_eq!(topics[0].anchor.len(), 1);
    assert!(topics[0].anchor.contains(SignalType::Orgs, "fed"));

    let again = pass.run(ctm.id, RunMode::Write).await.unwrap();
    assert_eq!(again.headlines_loaded, 0);
    assert_eq!(store.load_topics(ctm.id).await.unwrap(), topics);

    let ctm_row = store.load_ctm(ctm.id).await.unwrap().unwrap();
    assert!(ctm_row.last_clustered_at.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn partition_lock_excludes_second_writer() {
    let (_container, store) = postgres_container().await;
    let ctm = us_ctm();
    insert_ctm(&store, &ctm).await;
    insert_headline(&store, &headline_at(&ctm, 0, orgs(&["fed"]))).await;

    let held = store.try_lock_partition(ctm.id).await.unwrap().unwrap();
    assert!(store.try_lock_partition(ctm.id).await.unwrap().is_none());

    let store = Arc::new(store);
    let pass = ClusterPass::new(Arc::clone(&store), Arc::new(test_config()));
    let err = pass.run(ctm.id, RunMode::Write).await.unwrap_err();
    assert!(matches!(err, ClusterError::LockConflict(_)));

    held.release().await.unwrap();
    let stats = pass.run(ctm.id, RunMode::Write).await.unwrap();
    assert_eq!(stats.headlines_linked, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn move_and_summary_markers_round_trip() {
    let (_container, store) = postgres_container().await;
    let ctm = us_ctm();
    insert_ctm(&store, &ctm).await;
    let fed = headline_at(&ctm, 0, orgs(&["fed"]));
    let oil = headline_at(
        &ctm,
        1,
        RawSignals::default().with(SignalType::Commodities, &["oil"]),
    );
    insert_headline(&store, &fed).await;
    insert_headline(&store, &oil).await;

    let store = Arc::new(store);
    ClusterPass::new(Arc::clone(&store), Arc::new(test_config()))
        .run(ctm.id, RunMode::Write)
        .await
        .unwrap();

    let pending = store.pending_summaries(ctm.id).await.unwrap();
    assert_eq!(pending.len(), 2);
    for p in &pending {
        assert!(store.mark_summarized(p.topic_id).await.unwrap());
    }
    assert!(store.pending_summaries(ctm.id).await.unwrap().is_empty());
    assert!(!store.mark_summarized(Uuid::new_v4()).await.unwrap());

    let to = pending[1].topic_id;
    let outcome = store.move_membership(ctm.id, fed.id, to).await.unwrap();
    assert_eq!(
        outcome,
        MoveOutcome::Moved {
            from_topic: pending[0].topic_id
        }
    );
    assert_eq!(
        store.move_membership(ctm.id, fed.id, to).await.unwrap(),
        MoveOutcome::AlreadyThere
    );

    let topics = store.load_topics(ctm.id).await.unwrap();
    assert_eq!(topics[0].member_count, 0);
    assert_eq!(topics[1].member_count, 2);
    assert_eq!(store.pending_summaries(ctm.id).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn null_jsonb_signals_do_not_block_the_partition() {
    let (_container, store) = postgres_container().await;
    let ctm = us_ctm();
    insert_ctm(&store, &ctm).await;
    insert_headline(&store, &headline_at(&ctm, 0, orgs(&["fed"]))).await;

    let odd = Uuid::new_v4();
    sqlx::query(
        r#"INSERT INTO headlines (id, pubdate, signals, entity_countries)
           VALUES ($1, now(), '{"persons": null, "orgs": ["fed"]}', 'null')"#,
    )
    .bind(odd)
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query("INSERT INTO ctm_headlines (ctm_id, headline_id) VALUES ($1, $2)")
        .bind(ctm.id)
        .bind(odd)
        .execute(store.pool())
        .await
        .unwrap();

    let store = Arc::new(store);
    let stats = ClusterPass::new(Arc::clone(&store), Arc::new(test_config()))
        .run(ctm.id, RunMode::Write)
        .await
        .unwrap();
    assert_eq!(stats.headlines_linked, 2);
    assert_eq!(stats.topics_created, 1);
}
