//! End-to-end source pipeline runs against a mock upstream

mod helpers;

use helpers::*;
use kgdb_common::db::{RunStatus, StagingStatus};
use kgdb_common::Error;
use kgdb_ingest::db::{evidence, genes, progress, staging};
use kgdb_ingest::pipeline::count_source::payload_count;
use kgdb_ingest::review::Approval;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LIT: &str = "/lit";
const PANELS: &str = "/panels";
const VALIDITY: &str = "/validity";

fn authority() -> Arc<StaticAuthority> {
    Arc::new(StaticAuthority::new(&[
        ("PKD1", "HGNC:9008", &["PBP"]),
        ("PKD2", "HGNC:9009", &[]),
        ("UMOD", "HGNC:12559", &["THP"]),
    ]))
}

fn literature_pages() -> Vec<Value> {
    vec![
        json!({
            "results": [
                {"gene": "PKD1", "pmid": "1", "date": "2020-01-01"},
                {"gene": "PKD1", "pmid": "2"},
                {"gene": "PKD2", "pmid": "3"},
                {"gene": "NOVEL1", "pmid": "4"}
            ],
            "total_pages": 2
        }),
        json!({
            "results": [
                {"gene": "PKD1", "pmid": "5"},
                {"gene": "UMOD", "pmid": "6"},
                {"pmid": "7"}
            ],
            "total_pages": 2
        }),
    ]
}

async fn literature_setup() -> (tempfile::TempDir, sqlx::SqlitePool, MockUpstream, Arc<kgdb_ingest::services::IngestServices>) {
    let (dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(LIT, literature_pages());
    let config = test_config(vec![("lit", count_source(upstream.url(LIT)))]);
    let services = test_services(&pool, config, authority());
    (dir, pool, upstream, services)
}

#[tokio::test]
async fn test_full_run_resolves_stages_and_merges() {
    let (_dir, pool, upstream, services) = literature_setup().await;

    let stats = services
        .run_source("lit", false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.pages, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.persisted.added, 3);
    assert_eq!(stats.persisted.updated, 1);
    assert_eq!(stats.persisted.staged, 1);
    assert_eq!(upstream.hits(LIT, 1), 1);
    assert_eq!(upstream.hits(LIT, 2), 1);

    assert_eq!(genes::count(&pool).await.unwrap(), 3);
    assert_eq!(evidence::count(&pool).await.unwrap(), 3);

    let pkd1 = genes::list_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.symbol == "PKD1")
        .unwrap();
    let records = evidence::list_for_gene(&pool, pkd1.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, json!({"keys": ["1", "2", "5"]}));
    assert_eq!(records[0].lineage.len(), 2);

    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.items_failed, 1);
    assert!(state.completed_at.is_some());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let (_dir, pool, _upstream, services) = literature_setup().await;
    let cancel = CancellationToken::new();

    services.run_source("lit", false, &cancel).await.unwrap();
    let first: Vec<_> = evidence::scan_chunk(&pool, None, 100).await.unwrap();

    let stats = services.run_source("lit", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.added, 0);
    assert_eq!(stats.persisted.updated, 0);
    assert_eq!(stats.persisted.unchanged, 4);

    let second: Vec<_> = evidence::scan_chunk(&pool, None, 100).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(genes::count(&pool).await.unwrap(), 3);
    assert_eq!(staging::count_by_text(&pool, "NOVEL1").await.unwrap(), 1);

    let entry = services
        .review()
        .list_pending(None, 10, 0)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(entry.mention_count, 1);
}

#[tokio::test]
async fn test_failed_run_resumes_from_failed_page() {
    let (_dir, pool, upstream, services) = literature_setup().await;
    let cancel = CancellationToken::new();
    upstream.fail_next(LIT, 2, &[500, 500, 500]);

    let err = services.run_source("lit", false, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Upstream { rate_limited: false, .. }));

    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_page, 2);
    assert!(state.last_error.unwrap().contains("500"));
    // Page 1 was committed before the failure
    assert_eq!(evidence::count(&pool).await.unwrap(), 2);

    let stats = services.run_source("lit", true, &cancel).await.unwrap();
    assert_eq!(stats.pages, 1);
    assert_eq!(upstream.hits(LIT, 1), 1);
    assert_eq!(upstream.hits(LIT, 2), 4);
    assert_eq!(evidence::count(&pool).await.unwrap(), 3);

    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_resume_after_partially_persisted_page() {
    let (_dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(
        LIT,
        vec![json!({
            "results": [
                {"gene": "PKD1", "pmid": "1"},
                {"gene": "PKD2", "pmid": "2"},
                {"gene": "UMOD", "pmid": "3"},
                {"gene": "ZZZ1", "pmid": "4"}
            ],
            "total_pages": 1
        })],
    );
    let config = test_config(vec![("lit", count_source(upstream.url(LIT)))]);
    let authority = authority();
    // The second batch of the page hits an authority outage
    authority.fail_once("ZZZ1");
    let services = test_services(&pool, config, authority.clone());
    let cancel = CancellationToken::new();

    let err = services.run_source("lit", false, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Upstream { .. }));

    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_page, 1);
    assert_eq!(state.items_processed, 2);
    assert_eq!(state.items_added, 2);
    assert_eq!(evidence::count(&pool).await.unwrap(), 2);

    let stats = services.run_source("lit", true, &cancel).await.unwrap();
    assert_eq!(stats.pages, 1);
    assert_eq!(stats.persisted.processed, 2);
    assert_eq!(stats.persisted.added, 1);
    assert_eq!(stats.persisted.staged, 1);
    assert_eq!(upstream.hits(LIT, 1), 2);

    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.items_processed, 4);
    assert_eq!(state.items_added, 3);
    assert_eq!(state.items_updated, 0);
    assert_eq!(evidence::count(&pool).await.unwrap(), 3);
    assert_eq!(staging::count_by_text(&pool, "ZZZ1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_keyless_counts_sum_across_pages() {
    let (_dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(
        LIT,
        vec![
            json!({
                "results": [{"gene": "PKD1"}, {"gene": "PKD1"}],
                "total_pages": 2
            }),
            json!({
                "results": [{"gene": "PKD1"}, {"gene": "PKD1"}, {"gene": "PKD1"}],
                "total_pages": 2
            }),
        ],
    );
    let mut source = count_source(upstream.url(LIT));
    source.extraction.count_key_pointer = None;
    let config = test_config(vec![("lit", source)]);
    let services = test_services(&pool, config, authority());
    let cancel = CancellationToken::new();

    let stats = services.run_source("lit", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.added, 1);
    assert_eq!(stats.persisted.updated, 1);

    let pkd1 = genes::list_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.symbol == "PKD1")
        .unwrap();
    let records = evidence::list_for_gene(&pool, pkd1.id).await.unwrap();
    assert_eq!(records[0].payload, json!({"pages": {"1": 2, "2": 3}}));
    assert_eq!(payload_count(&records[0].payload), Some(5.0));

    // Replaying the same pages changes nothing
    let stats = services.run_source("lit", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.unchanged, 2);
    let records = evidence::list_for_gene(&pool, pkd1.id).await.unwrap();
    assert_eq!(payload_count(&records[0].payload), Some(5.0));
}

#[tokio::test]
async fn test_exhausted_rate_limit_is_reported_as_rate_limited() {
    let (_dir, pool, upstream, services) = literature_setup().await;
    upstream.fail_next(LIT, 1, &[429, 429, 429]);

    let err = services
        .run_source("lit", false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(upstream.hits(LIT, 1), 3);
    assert_eq!(
        progress::load(&pool, "lit").await.unwrap().unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_cancelled_run_is_paused_and_resumable() {
    let (_dir, pool, upstream, services) = literature_setup().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = services.run_source("lit", false, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(
        progress::load(&pool, "lit").await.unwrap().unwrap().status,
        RunStatus::Paused
    );
    assert_eq!(upstream.total_hits(LIT), 0);

    let stats = services
        .run_source("lit", true, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.pages, 2);
}

#[tokio::test]
async fn test_transient_failures_are_retried_inside_a_page() {
    let (_dir, _pool, upstream, services) = literature_setup().await;
    upstream.fail_next(LIT, 1, &[503, 502]);

    let stats = services
        .run_source("lit", false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.pages, 2);
    assert_eq!(upstream.hits(LIT, 1), 3);
}

#[tokio::test]
async fn test_malformed_page_fails_the_run() {
    let (_dir, pool, upstream, services) = literature_setup().await;
    upstream.set_pages(LIT, vec![json!({"results": {"not": "a list"}})]);

    let err = services
        .run_source("lit", false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expected an array"));
    let state = progress::load(&pool, "lit").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(upstream.hits(LIT, 1), 1);
}

#[tokio::test]
async fn test_unknown_mention_from_two_sources_shares_one_review_item() {
    let (_dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(LIT, literature_pages());
    upstream.set_pages(
        PANELS,
        vec![json!({
            "results": [
                {"gene": "novel1", "pmid": "panel-9"},
                {"gene": "PKD2", "pmid": "panel-9"}
            ],
            "total_pages": 1
        })],
    );
    let config = test_config(vec![
        ("lit", count_source(upstream.url(LIT))),
        ("panels", count_source(upstream.url(PANELS))),
    ]);
    let services = test_services(&pool, config, authority());
    let cancel = CancellationToken::new();

    services.run_source("lit", false, &cancel).await.unwrap();
    services.run_source("panels", false, &cancel).await.unwrap();

    let review = services.review();
    let pending = review.list_pending(None, 10, 0).await.unwrap();
    assert_eq!(pending.len(), 1);
    let entry = &pending[0];
    assert_eq!(entry.cleaned_text, "NOVEL1");
    assert_eq!(entry.mention_count, 2);
    assert_eq!(entry.source_mentions.len(), 2);
    assert!(entry.priority_score > 2.0);
    assert_eq!(review.list_pending(Some("panels"), 10, 0).await.unwrap().len(), 1);

    let gene = review
        .approve(
            entry.id,
            Approval {
                symbol: "NOVEL1".to_string(),
                hgnc_id: "HGNC:99999".to_string(),
                aliases: Vec::new(),
                reviewer: "curator".to_string(),
                notes: Some("confirmed in literature".to_string()),
            },
        )
        .await
        .unwrap();

    // Once approved the mention resolves without staging
    let stats = services.run_source("panels", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.staged, 0);
    assert_eq!(stats.persisted.added, 1);
    let records = evidence::list_for_gene(&pool, gene.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_name, "panels");

    let approved = review.get_staging(entry.id).await.unwrap();
    assert_eq!(approved.status, StagingStatus::Approved);
}

#[tokio::test]
async fn test_rejected_mention_is_not_staged_again() {
    let (_dir, _pool, _upstream, services) = literature_setup().await;
    let cancel = CancellationToken::new();

    services.run_source("lit", false, &cancel).await.unwrap();
    let review = services.review();
    let entry = review.list_pending(None, 10, 0).await.unwrap().remove(0);
    review
        .reject(entry.id, "curator", Some("not a gene".to_string()))
        .await
        .unwrap();

    let stats = services.run_source("lit", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.staged, 0);
    assert_eq!(stats.persisted.rejected, 1);
    assert!(review.list_pending(None, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_classification_reports_merge_across_runs() {
    let (_dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(
        VALIDITY,
        vec![json!({
            "results": [
                {"symbol": "PKD1", "hgnc_id": "HGNC:9008", "classification": "Definitive", "disease": "ADPKD"},
                {"symbol": "PKD1", "hgnc_id": "HGNC:9008", "classification": "Limited", "disease": "Liver cysts"},
                {"symbol": "umod", "hgnc_id": "HGNC:12559", "classification": "Moderate", "disease": "ADTKD"}
            ]
        })],
    );
    let config = test_config(vec![("validity", classification_source(upstream.url(VALIDITY)))]);
    let authority = authority();
    let services = test_services(&pool, config, authority.clone());
    let cancel = CancellationToken::new();

    let stats = services.run_source("validity", false, &cancel).await.unwrap();
    assert_eq!(stats.pages, 1);
    assert_eq!(stats.persisted.added, 2);

    upstream.set_pages(
        VALIDITY,
        vec![json!({
            "results": [
                {"symbol": "PKD1", "hgnc_id": "HGNC:9008", "classification": "Strong", "disease": "CKD"}
            ]
        })],
    );
    let calls_before = authority.calls();
    let stats = services.run_source("validity", false, &cancel).await.unwrap();
    assert_eq!(stats.persisted.updated, 1);
    // The identifier supplied by the source matched the stored gene
    assert_eq!(authority.calls(), calls_before);

    let pkd1 = genes::list_all(&pool)
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.hgnc_id == "HGNC:9008")
        .unwrap();
    let record = evidence::list_for_gene(&pool, pkd1.id).await.unwrap().remove(0);
    assert_eq!(
        record.payload["classifications"],
        json!(["Definitive", "Limited", "Strong"])
    );
    assert_eq!(
        record.payload["diseases"],
        json!(["ADPKD", "CKD", "Liver cysts"])
    );
    assert_eq!(record.source_score, Some(1.0));
    assert_eq!(record.lineage.len(), 2);
}

#[tokio::test]
async fn test_unknown_source_is_not_found() {
    let (_dir, _pool, _upstream, services) = literature_setup().await;
    assert!(matches!(
        services
            .run_source("missing", false, &CancellationToken::new())
            .await,
        Err(Error::NotFound(_))
    ));
}
