use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

use purchase_common::purchase::Purchase;
use purchase_common::store::PurchaseStore;

use super::app::{AppState, ErrorResponse};

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    after_id: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ListResponse {
    pub purchases: Vec<Purchase>,
    /// Set when more purchases exist; pass it back as `after_id` to get the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after_id: Option<i64>,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn bad_request(error: impl ToString) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// One page of purchases in id order, starting after `after_id`.
pub async fn get<S: PurchaseStore>(
    State(state): State<AppState<S>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListResponse>, HandlerError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;

    let after_id = params.after_id.unwrap_or(0);
    if after_id < 0 {
        return Err(bad_request("after_id must not be negative"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(bad_request(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    // One extra row tells whether another page exists.
    let mut purchases = state
        .retry_policy
        .run(&state.cancel, || state.store.list_after_id(after_id, limit + 1))
        .await
        .map_err(|e| {
            error!("failed to list purchases: {}", e);
            let status = if e.is_cancelled() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })?;

    let next_after_id = if purchases.len() as i64 > limit {
        purchases.truncate(limit as usize);
        purchases.last().map(|purchase| purchase.id)
    } else {
        None
    };

    Ok(Json(ListResponse {
        purchases,
        next_after_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt; // for `collect`
    use purchase_common::memory::MemoryPurchaseStore;
    use purchase_common::purchase::{ItemType, Platform, PurchaseInput};
    use purchase_common::retry::RetryPolicy;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::{app, AppState};

    async fn seeded_app(count: usize) -> Router {
        let store = MemoryPurchaseStore::new();
        for i in 1..=count {
            store
                .upsert(&PurchaseInput {
                    transaction_id: format!("TXN-{}", i),
                    player_id: "player_001".to_owned(),
                    player_username: "GamerAlice".to_owned(),
                    game_title: "Cyberpunk 2077".to_owned(),
                    item_type: ItemType::Dlc,
                    genre: "RPG".to_owned(),
                    platform: Platform::Epic,
                    amount_cents: 100 * i as i64,
                    currency: "USD".to_owned(),
                    player_level: 15,
                    created_at: Utc.with_ymd_and_hms(2025, 8, 15, 10, 0, 0).unwrap(),
                })
                .await
                .expect("failed to seed purchase");
        }

        app(
            AppState::new(store, RetryPolicy::default(), CancellationToken::new()),
            None,
            1024,
        )
    }

    async fn list(app: Router, query: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/purchases{}", query))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn ids(body: &serde_json::Value) -> Vec<i64> {
        body["purchases"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn list_page_after_id() {
        let app = seeded_app(25).await;

        let (status, body) = list(app, "?after_id=10&limit=5").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ids(&body), vec![11, 12, 13, 14, 15]);
        assert_eq!(body["next_after_id"], 15);
    }

    #[tokio::test]
    async fn list_defaults() {
        let app = seeded_app(25).await;

        let (status, body) = list(app, "").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ids(&body), (1..=20).collect::<Vec<i64>>());
        assert_eq!(body["next_after_id"], 20);
    }

    #[tokio::test]
    async fn list_last_page_omits_next_after_id() {
        let app = seeded_app(25).await;

        let (status, body) = list(app, "?after_id=20&limit=5").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(ids(&body), vec![21, 22, 23, 24, 25]);
        assert!(body.get("next_after_id").is_none());
    }

    #[tokio::test]
    async fn list_empty_store() {
        let app = seeded_app(0).await;

        let (status, body) = list(app, "").await;

        assert_eq!(status, StatusCode::OK);
        assert!(ids(&body).is_empty());
        assert!(body.get("next_after_id").is_none());
    }

    #[tokio::test]
    async fn list_rejects_bad_params() {
        for query in [
            "?limit=0",
            "?limit=101",
            "?after_id=-1",
            "?limit=ten",
        ] {
            let app = seeded_app(1).await;

            let (status, body) = list(app, query).await;

            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
            assert!(body["error"].is_string(), "{}", query);
        }
    }

    #[tokio::test]
    async fn list_serializes_enums_as_wire_values() {
        let app = seeded_app(1).await;

        let (_, body) = list(app, "").await;

        assert_eq!(body["purchases"][0]["item_type"], "dlc");
        assert_eq!(body["purchases"][0]["platform"], "epic");
        assert_eq!(body["purchases"][0]["processed"], false);
    }
}
