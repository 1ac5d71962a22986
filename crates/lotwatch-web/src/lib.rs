//! Read-only JSON reporting API over the listing store.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lotwatch_core::{Listing, PriceHistoryEntry};
use lotwatch_storage::ListingStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-web";

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 500;
const DEFAULT_MIN_GROUP: i64 = 3;

#[derive(Clone)]
pub struct AppState {
    pub store: ListingStore,
}

impl AppState {
    pub fn new(store: ListingStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize, Default)]
struct MakeModelQuery {
    min_count: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListingDetail {
    pub listing: Listing,
    pub price_history: Vec<PriceHistoryEntry>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/listings/best-value", get(best_value_handler))
        .route("/listings/price-drops", get(price_drops_handler))
        .route("/listings/{id}", get(listing_detail_handler))
        .route("/stats", get(stats_handler))
        .route("/stats/make-model", get(make_model_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: ListingStore, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "reporting api listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn best_value_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.best_value(query.limit()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn price_drops_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.price_drops(query.limit()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_json(StatusCode::BAD_REQUEST, "listing id must be a uuid");
    };
    let listing = match state.store.get_listing(id).await {
        Ok(Some(listing)) => listing,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, "listing not found"),
        Err(err) => return server_error(err.into()),
    };
    match state.store.price_history(id).await {
        Ok(price_history) => Json(ListingDetail {
            listing,
            price_history,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn make_model_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MakeModelQuery>,
) -> Response {
    let min_count = query.min_count.unwrap_or(DEFAULT_MIN_GROUP).max(1);
    match state.store.make_model_stats(min_count).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.recent_runs(query.limit()).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %format!("{err:#}"), "report query failed");
    error_json(StatusCode::INTERNAL_SERVER_ERROR, &format!("server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{Duration, TimeZone, Utc};
    use http_body_util::BodyExt;
    use lotwatch_core::{global_listing_id, RawCandidate};
    use lotwatch_sync::{
        IdentityResolver, Normalizer, NormalizerConfig, ResolverConfig, UpsertEngine,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    async fn seeded_store() -> ListingStore {
        let store = ListingStore::in_memory().await.unwrap();
        let normalizer = Normalizer::builtin(NormalizerConfig::default()).unwrap();
        let engine = UpsertEngine::new(store.clone(), IdentityResolver::new(ResolverConfig::default()));
        let t0 = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).single().unwrap();

        let observations = [
            ("c-1", "2018 Ford F-150 XLT", "$24,500", "98,400", t0),
            ("c-1", "2018 Ford F-150 XLT", "$22,900", "98,400", t0 + Duration::days(1)),
            ("c-2", "2017 Toyota Tacoma SR5", "$26,000", "61,000", t0),
        ];
        for (id, title, price, mileage, at) in observations {
            let mut raw = RawCandidate::new("classifieds", id, title);
            raw.price = Some(price.into());
            raw.mileage = Some(mileage.into());
            raw.location = Some("Warren".into());
            let candidate = normalizer.normalize(&raw, at).unwrap();
            engine.upsert(&candidate, at).await.unwrap();
        }
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(AppState::new(ListingStore::in_memory().await.unwrap()));
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn best_value_orders_by_price_per_mile() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get_json(app, "/listings/best-value?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["model"], "F-150");
        assert_eq!(rows[0]["price"], 22_900);
    }

    #[tokio::test]
    async fn price_drops_report_savings() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get_json(app, "/listings/price-drops").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["previous_price"], 24_500);
        assert_eq!(rows[0]["current_price"], 22_900);
        assert_eq!(rows[0]["savings"], 1_600);
    }

    #[tokio::test]
    async fn listing_detail_includes_history() {
        let app = app(AppState::new(seeded_store().await));
        let id = global_listing_id("classifieds", "c-1");
        let (status, body) = get_json(app.clone(), &format!("/listings/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["listing"]["times_seen"], 2);
        assert_eq!(body["price_history"].as_array().unwrap().len(), 2);

        let (status, _) = get_json(app.clone(), &format!("/listings/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(app, "/listings/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_and_make_model_groups() {
        let store = seeded_store().await;
        let (status, stats) = get_json(app(AppState::new(store.clone())), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_listings"], 2);
        assert_eq!(stats["active_by_source"]["classifieds"], 2);

        let (_, groups) = get_json(app(AppState::new(store.clone())), "/stats/make-model").await;
        assert!(groups.as_array().unwrap().is_empty());
        let (_, groups) =
            get_json(app(AppState::new(store)), "/stats/make-model?min_count=1").await;
        assert_eq!(groups.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn runs_endpoint_is_empty_before_any_cycle() {
        let app = app(AppState::new(ListingStore::in_memory().await.unwrap()));
        let (status, body) = get_json(app, "/runs?limit=0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }
}
