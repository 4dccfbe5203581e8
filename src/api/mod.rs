//! HTTP API for model introspection
//!
//! Five routes, each accepting GET and POST alike. A request body, when
//! present, is a JSON array of token ids handed to the inference gateway.
//!
//! ## Endpoints
//!
//! - `/hyper.json` - Hyperparameter set (body ignored)
//! - `/results.json` - Whole inference result as JSON
//! - `/attn_weights.npy` - Attention weights `[B, L, H, T, T]` as NPY
//! - `/attn_logits_npy.npy` - Attention logits `[B, L, H, T, T]` as NPY
//! - `/results_spread.npy` - Model-provided spread derivation as NPY
//!
//! Every failure is answered with status 500 and the error text as the body,
//! after being logged through `tracing` and appended to the failure log.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mirador::api::{create_router, AppState};
//!
//! let state = AppState::new(hyper, Arc::new(gateway), failure_log);
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

use std::{panic::AssertUnwindSafe, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::Value as Json;
use tokio::task::JoinError;
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    attention::{derive_view, AttentionField},
    encode::{encode_array, encode_structured, EncodedResponse},
    error::{MiradorError, Result},
    failure_log::{
        install_panic_hook, panic_message, take_panic_trace, FailureLog, PanicResponder,
    },
    gateway::{Inference, InferenceResult},
    hyperparams::Hyperparameters,
    value::AnyTensor,
};

#[cfg(test)]
pub(crate) mod test_helpers;

/// Hyperparameter route
pub const HYPER_ROUTE: &str = "/hyper.json";
/// Inference result route
pub const RESULTS_ROUTE: &str = "/results.json";
/// Attention weights view route
pub const ATTN_WEIGHTS_ROUTE: &str = "/attn_weights.npy";
/// Attention logits view route
pub const ATTN_LOGITS_ROUTE: &str = "/attn_logits_npy.npy";
/// Spread derivation route
pub const SPREAD_ROUTE: &str = "/results_spread.npy";

/// Every route the router serves
pub const ROUTES: [&str; 5] = [
    HYPER_ROUTE,
    RESULTS_ROUTE,
    ATTN_WEIGHTS_ROUTE,
    ATTN_LOGITS_ROUTE,
    SPREAD_ROUTE,
];

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Served verbatim at `/hyper.json`
    hyper: Arc<Hyperparameters>,
    /// Forward pass bound to its parameters and seed
    inference: Arc<dyn Inference>,
    /// Dedicated failure record file
    failure_log: Arc<FailureLog>,
}

impl AppState {
    /// Create application state
    ///
    /// # Arguments
    ///
    /// * `hyper` - Hyperparameter set
    /// * `inference` - Gateway every inference route runs through
    /// * `failure_log` - Log receiving a record for every 500
    #[must_use]
    pub fn new(
        hyper: Hyperparameters,
        inference: Arc<dyn Inference>,
        failure_log: Arc<FailureLog>,
    ) -> Self {
        Self {
            hyper: Arc::new(hyper),
            inference,
            failure_log,
        }
    }

    /// Hyperparameter set
    #[must_use]
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Failure log
    #[must_use]
    pub fn failure_log(&self) -> &Arc<FailureLog> {
        &self.failure_log
    }

    /// Log a failed request twice and wrap it for the response
    fn fail(&self, route: &'static str, failure: Failure) -> ApiError {
        let Failure { error, trace } = failure;
        tracing::error!(route, kind = error.kind(), error = %error, "request failed");
        self.failure_log.record_with_trace(&error, trace);
        ApiError(error)
    }
}

/// Failed request, with the panic-site backtrace when a forward pass panicked
#[derive(Debug)]
struct Failure {
    error: MiradorError,
    trace: Option<String>,
}

impl From<MiradorError> for Failure {
    fn from(error: MiradorError) -> Self {
        Self { error, trace: None }
    }
}

type Handled<T> = std::result::Result<T, Failure>;

/// Request failure answered with status 500 and the error text
#[derive(Debug)]
pub struct ApiError(pub MiradorError);

impl From<MiradorError> for ApiError {
    fn from(error: MiradorError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.0.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for EncodedResponse {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_static(self.content_type());
        let mut response = Response::new(Body::from(self.into_bytes()));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
        response
    }
}

/// Create the introspection router
///
/// Handler panics are caught, recorded in the failure log and answered
/// with a 500.
pub fn create_router(state: AppState) -> Router {
    install_panic_hook();
    let panic_responder = PanicResponder::new(Arc::clone(&state.failure_log));

    Router::new()
        .route(HYPER_ROUTE, get(hyper_handler).post(hyper_handler))
        .route(RESULTS_ROUTE, get(results_handler).post(results_handler))
        .route(
            ATTN_WEIGHTS_ROUTE,
            get(attn_weights_handler).post(attn_weights_handler),
        )
        .route(
            ATTN_LOGITS_ROUTE,
            get(attn_logits_handler).post(attn_logits_handler),
        )
        .route(SPREAD_ROUTE, get(spread_handler).post(spread_handler))
        .layer(CatchPanicLayer::custom(panic_responder))
        .with_state(state)
}

/// `/hyper.json`
async fn hyper_handler(
    State(state): State<AppState>,
) -> std::result::Result<EncodedResponse, ApiError> {
    encode_structured(state.hyper.as_value()).map_err(|e| state.fail(HYPER_ROUTE, e.into()))
}

/// `/results.json`
async fn results_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<EncodedResponse, ApiError> {
    results(&state, &body)
        .await
        .map_err(|e| state.fail(RESULTS_ROUTE, e))
}

/// `/attn_weights.npy`
async fn attn_weights_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<EncodedResponse, ApiError> {
    attention_view(&state, &body, AttentionField::Weights)
        .await
        .map_err(|e| state.fail(ATTN_WEIGHTS_ROUTE, e))
}

/// `/attn_logits_npy.npy`
async fn attn_logits_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<EncodedResponse, ApiError> {
    attention_view(&state, &body, AttentionField::Logits)
        .await
        .map_err(|e| state.fail(ATTN_LOGITS_ROUTE, e))
}

/// `/results_spread.npy`
async fn spread_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<EncodedResponse, ApiError> {
    spread(&state, &body)
        .await
        .map_err(|e| state.fail(SPREAD_ROUTE, e))
}

async fn results(state: &AppState, body: &[u8]) -> Handled<EncodedResponse> {
    let result = infer(state, parse_body(body)?).await?;
    tracing::debug!(route = RESULTS_ROUTE, "encoding inference result");
    Ok(encode_structured(&result.into_value())?)
}

async fn attention_view(
    state: &AppState,
    body: &[u8],
    field: AttentionField,
) -> Handled<EncodedResponse> {
    let result = infer(state, parse_body(body)?).await?;
    let view = derive_view(&result, field)?;
    tracing::debug!(%field, shape = ?view.shape(), "derived attention view");
    Ok(encode_array(&view)?)
}

async fn spread(state: &AppState, body: &[u8]) -> Handled<EncodedResponse> {
    let inputs = parse_body(body)?;
    let inference = Arc::clone(&state.inference);
    let spread: AnyTensor = blocking(move || inference.spread(&inputs)).await?;
    tracing::debug!(shape = ?spread.shape(), "derived spread");
    Ok(encode_array(&spread)?)
}

async fn infer(state: &AppState, inputs: Json) -> Handled<InferenceResult> {
    let inference = Arc::clone(&state.inference);
    blocking(move || inference.run(&inputs)).await
}

/// Run `task` off the async workers; a panic keeps its message and the
/// backtrace of the panic site
async fn blocking<T, F>(task: F) -> Handled<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| Failure {
            error: MiradorError::Inference(panic_message(&*payload)),
            trace: take_panic_trace(),
        })
    })
    .await;

    match joined {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(failure)) => Err(failure),
        Err(e) => Err(join_failure(e).into()),
    }
}

/// Request body as JSON; an empty body is `null`
fn parse_body(body: &[u8]) -> Result<Json> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Json::Null);
    }
    Ok(serde_json::from_slice(body)?)
}

fn join_failure(error: JoinError) -> MiradorError {
    if error.is_panic() {
        MiradorError::Inference(panic_message(&*error.into_panic()))
    } else {
        MiradorError::Inference("inference task was cancelled".to_string())
    }
}

#[cfg(test)]
mod tests;
