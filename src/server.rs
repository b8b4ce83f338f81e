//! HTTP surface over an [`Aggregator`] (feature `server`).
//!
//! Routes for a resource named `posts`:
//!
//! | method & path                      | response                                          |
//! |------------------------------------|---------------------------------------------------|
//! | `GET /api/posts`                   | every entity                                      |
//! | `GET /api/posts/{id}`              | the entity, 404 if missing                        |
//! | `GET /api/posts/{id}/details`      | composite result (`?view=merged` flattens it)     |
//! | `POST /api/posts`                  | 201 with the create outcome, 422 on invalid draft |
//! | `DELETE /api/posts/{id}`           | 204, 404 if missing                               |
//! | `GET /admin/breakers`              | breaker record per dependency                     |
//! | `POST /admin/breakers/{name}/reset`| 204, 404 for an unknown dependency                |
//! | `POST /admin/outbox/redeliver`     | outcomes of redelivered side effects              |
//!
//! A details request answers 200 whenever the primary entity exists, however many
//! dependencies fell back. 5xx is reserved for failures of the primary store.

use crate::aggregator::{Aggregator, SideEffect};
use crate::error::AggregateError;
use crate::outcome::{Assembler, CallOutcome, JsonMerge};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A primary entity type served over HTTP.
pub trait Resource: Clone + Serialize + Send + Sync + 'static {
    /// Request body accepted by `POST`.
    type Draft: DeserializeOwned + Send + 'static;

    /// Path segment under `/api`.
    const NAME: &'static str;

    /// Every problem with the draft; empty means valid.
    fn validate(draft: &Self::Draft) -> Vec<String>;

    /// Build the entity stored under `key`.
    fn materialize(key: u64, draft: Self::Draft) -> Self;

    /// Downstream create to run once the entity is stored.
    fn side_effect(_draft: &Self::Draft) -> Option<SideEffect<Self, Value>> {
        None
    }
}

type Shared<R> = Arc<Aggregator<R, Value>>;

/// Router serving `R` and the admin endpoints.
pub fn router<R: Resource>(aggregator: Shared<R>) -> Router {
    let collection = format!("/api/{}", R::NAME);
    let item = format!("{collection}/{{id}}");
    let details = format!("{item}/details");

    Router::new()
        .route(&collection, get(list::<R>).post(create::<R>))
        .route(&item, get(fetch::<R>).delete(remove::<R>))
        .route(&details, get(details_of::<R>))
        .route("/admin/breakers", get(breakers::<R>))
        .route("/admin/breakers/{name}/reset", post(reset_breaker::<R>))
        .route("/admin/outbox/redeliver", post(redeliver::<R>))
        .with_state(aggregator)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct InvalidBody {
    errors: Vec<String>,
}

#[derive(Serialize)]
struct Redelivery {
    redelivered: Vec<CallOutcome<Value>>,
    pending: usize,
}

/// Error body: `{"error": "..."}`, or `{"errors": [...]}` for invalid drafts.
#[derive(Debug)]
pub enum ApiError {
    Aggregate(AggregateError),
    Invalid(Vec<String>),
}

impl From<AggregateError> for ApiError {
    fn from(e: AggregateError) -> Self {
        Self::Aggregate(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Invalid(errors) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(InvalidBody { errors })).into_response()
            }
            ApiError::Aggregate(e) => {
                let status = match &e {
                    AggregateError::PrimaryNotFound { .. } => StatusCode::NOT_FOUND,
                    AggregateError::UnknownDependency { .. } => StatusCode::NOT_FOUND,
                    AggregateError::OperationUnsupported { .. } => StatusCode::BAD_REQUEST,
                    AggregateError::Store(_) => {
                        tracing::error!(error = %e, "primary store failure");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, Json(ErrorBody { error: e.to_string() })).into_response()
            }
        }
    }
}

async fn list<R: Resource>(State(agg): State<Shared<R>>) -> Result<Json<Vec<R>>, ApiError> {
    Ok(Json(agg.list()?.into_iter().map(|(_, entity)| entity).collect()))
}

async fn fetch<R: Resource>(
    State(agg): State<Shared<R>>,
    Path(id): Path<u64>,
) -> Result<Json<R>, ApiError> {
    Ok(Json(agg.get(id)?))
}

#[derive(Debug, Deserialize)]
struct DetailsQuery {
    view: Option<String>,
}

async fn details_of<R: Resource>(
    State(agg): State<Shared<R>>,
    Path(id): Path<u64>,
    Query(query): Query<DetailsQuery>,
) -> Result<Json<Value>, ApiError> {
    let composite = agg.aggregate_all(id).await?;
    let body = match query.view.as_deref() {
        Some("merged") => JsonMerge.assemble(composite),
        _ => serde_json::to_value(&composite).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "composite did not serialize");
            Value::Null
        }),
    };
    Ok(Json(body))
}

async fn create<R: Resource>(
    State(agg): State<Shared<R>>,
    Json(draft): Json<R::Draft>,
) -> Result<impl IntoResponse, ApiError> {
    let errors = R::validate(&draft);
    if !errors.is_empty() {
        return Err(ApiError::Invalid(errors));
    }
    let side_effect = R::side_effect(&draft);
    let outcome = agg.create(move |key| R::materialize(key, draft), side_effect).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn remove<R: Resource>(
    State(agg): State<Shared<R>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    agg.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn breakers<R: Resource>(State(agg): State<Shared<R>>) -> impl IntoResponse {
    Json(agg.breakers())
}

async fn reset_breaker<R: Resource>(
    State(agg): State<Shared<R>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    agg.reset_breaker(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn redeliver<R: Resource>(State(agg): State<Shared<R>>) -> Result<impl IntoResponse, ApiError> {
    let redelivered = agg.redeliver_pending().await?;
    Ok(Json(Redelivery { redelivered, pending: agg.pending() }))
}
