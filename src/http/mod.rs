//! HTTP surface of the key-value store.
//!
//! `GET /db/:key?type=string|int64` reads a key, `POST /db/:key` writes
//! one, `GET /health` answers liveness probes. Values travel as JSON;
//! numbers are stored as int64 (truncating), strings as strings.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::error::Error;
use crate::store::KvStore;

pub fn router(store: Arc<KvStore>) -> Router {
    Router::new()
        .route("/db/:key", get(get_key).post(post_key))
        .route("/health", get(|| async { "OK" }))
        .with_state(store)
}

#[derive(Deserialize)]
struct GetParams {
    #[serde(rename = "type")]
    data_type: Option<String>,
}

async fn get_key(
    State(store): State<Arc<KvStore>>,
    Path(key): Path<String>,
    Query(params): Query<GetParams>,
) -> Response {
    enum Wanted {
        Str,
        Int64,
    }
    let wanted = match params.data_type.as_deref() {
        None | Some("string") => Wanted::Str,
        Some("int64") => Wanted::Int64,
        Some(other) => {
            let body = json!({ "error": format!("Invalid type parameter: {other}") });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
    };

    let result = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::task::spawn_blocking(move || match wanted {
            Wanted::Str => store.get(&key).map(serde_json::Value::from),
            Wanted::Int64 => store.get_int64(&key).map(serde_json::Value::from),
        })
        .await
    };

    match result {
        Ok(Ok(value)) => {
            let body = json!({ "key": key, "value": value });
            (StatusCode::OK, axum::Json(body)).into_response()
        }
        Ok(Err(err)) => store_error_response(&key, err),
        Err(_) => internal_error(),
    }
}

#[derive(Deserialize)]
struct PostBody {
    value: serde_json::Value,
}

async fn post_key(
    State(store): State<Arc<KvStore>>,
    Path(key): Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let parsed: PostBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            let body = json!({ "error": format!("malformed request body: {err}") });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
    };

    let stored = match &parsed.value {
        serde_json::Value::String(s) => serde_json::Value::from(s.clone()),
        serde_json::Value::Number(n) => serde_json::Value::from(truncate_to_i64(n)),
        _ => {
            let body = json!({ "error": "unsupported value type" });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }
    };

    let result = {
        let store = Arc::clone(&store);
        let key = key.clone();
        let stored = stored.clone();
        tokio::task::spawn_blocking(move || match stored {
            serde_json::Value::String(s) => store.put(&key, &s),
            serde_json::Value::Number(n) => {
                store.put_int64(&key, n.as_i64().expect("built from i64"))
            }
            _ => unreachable!("only strings and numbers are stored"),
        })
        .await
    };

    match result {
        Ok(Ok(())) => {
            let body = json!({ "key": key, "value": stored });
            (StatusCode::CREATED, axum::Json(body)).into_response()
        }
        Ok(Err(err)) => store_error_response(&key, err),
        Err(_) => internal_error(),
    }
}

/// A JSON number becomes an int64, truncating any fractional part.
fn truncate_to_i64(n: &serde_json::Number) -> i64 {
    if let Some(v) = n.as_i64() {
        v
    } else if let Some(v) = n.as_u64() {
        v as i64
    } else {
        n.as_f64().unwrap_or(0.0) as i64
    }
}

fn store_error_response(key: &str, err: Error) -> Response {
    match err {
        Error::NotFound => {
            let body = json!({ "key": key, "error": "not found" });
            (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
        }
        Error::WrongType => {
            let body = json!({ "error": "incorrect value type" });
            (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
        }
        err => {
            let body = json!({ "error": err.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
        }
    }
}

fn internal_error() -> Response {
    let body = json!({ "error": "internal error" });
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
}
