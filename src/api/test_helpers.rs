//! Shared fixtures for router tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use tempfile::TempDir;
use tower::util::ServiceExt;

use crate::{
    api::{create_router, AppState},
    error::{MiradorError, Result},
    failure_log::FailureLog,
    gateway::{ForwardPass, InferenceGateway, InferenceResult, LAYER_ACTIVATIONS},
    hyperparams::Hyperparameters,
    tensor::Tensor,
    value::{AnyTensor, Map, Value},
};

/// Value of layer `l`'s `[0, h, i, j]` attention entry
pub(crate) fn coded(l: usize, h: usize, i: usize, j: usize) -> f32 {
    (l * 1000 + h * 100 + i * 10 + j) as f32
}

/// One synthetic layer, `[1, heads, time, time]`, optionally missing a field
pub(crate) fn layer(l: usize, heads: usize, time: usize, weights: bool, logits: bool) -> Value {
    let mut data = Vec::new();
    for h in 0..heads {
        for i in 0..time {
            for j in 0..time {
                data.push(coded(l, h, i, j));
            }
        }
    }
    let tensor = Tensor::from_vec(vec![1, heads, time, time], data).unwrap();

    let mut map = Map::new();
    if weights {
        map.insert("attn_weights".to_string(), tensor.clone().into());
    }
    if logits {
        map.insert("attn_logits".to_string(), tensor.map(|v| -v).into());
    }
    Value::Map(map)
}

/// Forward pass returning a fixed result and an optional spread
pub(crate) struct Scripted {
    pub(crate) result: InferenceResult,
    pub(crate) spread: Option<AnyTensor>,
}

impl Scripted {
    pub(crate) fn with_layers(layers: Vec<Value>) -> Self {
        let mut result = InferenceResult::default();
        result.insert(LAYER_ACTIVATIONS, Value::List(layers));
        Self {
            result,
            spread: None,
        }
    }
}

impl ForwardPass for Scripted {
    type Params = ();

    fn apply(&self, _: &(), _: u64, _: &Tensor<i32>) -> Result<InferenceResult> {
        Ok(self.result.clone())
    }

    fn spread(&self, _: &(), _: u64, _: &Tensor<i32>) -> Result<AnyTensor> {
        self.spread.clone().ok_or(MiradorError::SpreadUnavailable)
    }
}

/// Router over `forward`, with its failure log in a temp dir
pub(crate) fn router_with<F: ForwardPass<Params = ()>>(
    hyper: Hyperparameters,
    forward: F,
) -> (Router, Arc<FailureLog>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(FailureLog::open(dir.path().join("failures.log")).unwrap());
    let gateway = InferenceGateway::new(forward, (), 42);
    let state = AppState::new(hyper, Arc::new(gateway), Arc::clone(&log));
    (create_router(state), log, dir)
}

/// Send one request and collect status, headers and body
pub(crate) async fn call(
    app: Router,
    method: &str,
    uri: &str,
    body: &str,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes.to_vec())
}

/// Failure log contents
pub(crate) fn log_text(log: &FailureLog) -> String {
    std::fs::read_to_string(log.path()).unwrap()
}
