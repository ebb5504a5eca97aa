use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        execute_payout, health_check, indexer_status, list_payouts, preview_payout,
        reconcile_payout, record_donation, run_indexer, set_allocation, upsert_organization,
        AppState,
    },
    middleware::{rate_limit_middleware, require_api_key, RateLimitLayer},
};

/// Upper bound for a single request; an indexer catch-up or a payout round
/// with slow rails can legitimately take minutes
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub fn create_app(state: AppState, rate_limit_per_minute: u32) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Triggers and writes
    let protected = Router::new()
        .route("/indexer/run", post(run_indexer))
        .route("/payouts/:event_id/execute", post(execute_payout))
        .route("/payouts/:event_id/reconcile", post(reconcile_payout))
        .route("/allocations", post(set_allocation))
        .route("/donations", post(record_donation))
        .route("/organizations", post(upsert_organization))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    // Reads
    let public = Router::new()
        .route("/indexer/status", get(indexer_status))
        .route("/payouts/:event_id", get(list_payouts))
        .route("/payouts/:event_id/quote", get(preview_payout));

    let api = Router::new()
        .merge(protected)
        .merge(public)
        .layer(middleware::from_fn_with_state(
            RateLimitLayer::per_minute(rate_limit_per_minute),
            rate_limit_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
                .layer(CompressionLayer::new())
                .layer(CorsLayer::very_permissive()),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockLedgerClient;
    use crate::indexer::{ChainIndexer, IndexerConfig};
    use crate::offramp::testing::ScriptedOfframp;
    use crate::payout::PayoutEngine;
    use crate::store::InMemorySettlementStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(api_key: Option<&str>) -> Router {
        let store = Arc::new(InMemorySettlementStore::new());
        let offramp = Arc::new(ScriptedOfframp::new());
        let state = AppState {
            store: store.clone(),
            indexer: Arc::new(ChainIndexer::new(
                store.clone(),
                Arc::new(MockLedgerClient::new(10)),
                IndexerConfig::default(),
            )),
            payout_engine: Arc::new(PayoutEngine::new(
                store,
                offramp.clone(),
                Duration::from_secs(5),
            )),
            offramp,
            api_key: api_key.map(Arc::from),
        };
        create_app(state, 1000)
    }

    fn post_json(uri: &str, key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_requires_api_key() {
        let app = app(Some("s3cret"));

        let denied = app
            .clone()
            .oneshot(post_json("/api/v1/indexer/run", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(post_json("/api/v1/indexer/run", Some("s3cret"), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_donation_then_payout_over_http() {
        let app = app(None);

        let donation = serde_json::json!({
            "eventId": 1,
            "orgId": 7,
            "donorAddress": "0xD0",
            "amountWei": "1000",
            "txHash": "0xABC"
        });
        let created = app
            .clone()
            .oneshot(post_json("/api/v1/donations", None, donation.clone()))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let replay = app
            .clone()
            .oneshot(post_json("/api/v1/donations", None, donation))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::OK);

        let paid = app
            .clone()
            .oneshot(post_json("/api/v1/payouts/1/execute", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(paid.status(), StatusCode::OK);

        let again = app
            .oneshot(post_json("/api/v1/payouts/1/execute", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_payout_is_not_found() {
        let response = app(Some("s3cret"))
            .oneshot(post_json(
                "/api/v1/payouts/1/reconcile",
                Some("s3cret"),
                serde_json::json!({
                    "payoutId": 99,
                    "outcome": "failed",
                    "reason": "bank returned funds"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_allocation_is_unprocessable() {
        let app = app(None);
        let response = app
            .oneshot(post_json(
                "/api/v1/allocations",
                None,
                serde_json::json!({
                    "eventId": 1,
                    "orgIds": [1, 2],
                    "splitsBps": [5000, 4000],
                    "approvedBy": "ops"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app(Some("s3cret"))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
