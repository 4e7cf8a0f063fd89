use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use libris_sync::LibraryContext;
use libris_sync::application::preferences::PreferenceStore;
use libris_sync::application::session::Session;
use libris_sync::cache::CacheConfig;
use libris_sync::infra::gateway::GatewayError;
use libris_sync::infra::gateway::memory::{GatewayOp, MemoryGateway};
use libris_sync::infra::telemetry;
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let session = Arc::new(Session::with_token("metrics"));
    let gateway = Arc::new(MemoryGateway::demo().with_session(session.clone()));
    let context = LibraryContext::new(
        gateway.clone(),
        session,
        CacheConfig {
            capacity: NonZeroUsize::MIN,
            retry_count: 0,
            retry_delay: Duration::ZERO,
            ..CacheConfig::default()
        },
        PreferenceStore::in_memory(),
    );
    let queries = context.queries();

    // miss, hit, then a second key pushes the first out
    queries.book(1).await.expect("first read");
    queries.book(1).await.expect("cached read");
    queries.book(2).await.expect("second key");
    context.cache().clear();

    gateway.fail_next(GatewayOp::GetBook, GatewayError::server(500));
    queries.book(3).await.expect_err("injected failure");

    queries.favorite_ids().await.expect("favorite set");
    gateway.fail_next(GatewayOp::AddFavorite, GatewayError::server(500));
    context
        .mutations()
        .add_favorite(4)
        .await
        .expect_err("injected failure");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "libris_query_cache_hit_total",
        "libris_query_cache_miss_total",
        "libris_query_cache_evict_total",
        "libris_query_fetch_error_total",
        "libris_query_fetch_ms",
        "libris_mutation_rollback_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
