//! Happy paths of every endpoint

use axum::http::StatusCode;
use serde_json::json;

use crate::{
    api::{test_helpers::*, *},
    encode::{JSON_CONTENT_TYPE, NPY_CONTENT_TYPE},
    hyperparams::Hyperparameters,
    model::AttentionOnlyTransformer,
    npy,
    tensor::Tensor,
    value::AnyTensor,
};

fn nested_hyper() -> (serde_json::Value, Hyperparameters) {
    let json = json!({
        "num_layers": 2,
        "learning_rate": 0.00001,
        "name": "toy",
        "schedule": [1, 2.5, "warmup"],
        "optimizer": {"beta": [0.9, 0.999], "eps": 1e-8},
    });
    (json.clone(), Hyperparameters::from_json(json).unwrap())
}

#[tokio::test]
async fn test_hyper_roundtrip_get_and_post() {
    let (expected, hyper) = nested_hyper();
    let (app, _log, _dir) = router_with(hyper, Scripted::with_layers(vec![]));

    for method in ["GET", "POST"] {
        let (status, headers, body) = call(app.clone(), method, HYPER_ROUTE, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], JSON_CONTENT_TYPE);
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, expected, "{method}");
    }
}

#[tokio::test]
async fn test_hyper_ignores_body() {
    let (expected, hyper) = nested_hyper();
    let (app, _log, _dir) = router_with(hyper, Scripted::with_layers(vec![]));

    let (status, _, body) = call(app, "POST", HYPER_ROUTE, "not json at all").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), expected);
}

#[tokio::test]
async fn test_results_json_normalizes_tensors() {
    let (app, _log, _dir) = router_with(
        Hyperparameters::demo(),
        Scripted::with_layers(vec![layer(0, 1, 2, true, true)]),
    );

    let (status, headers, body) = call(app, "POST", RESULTS_ROUTE, "[[1, 2]]").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], JSON_CONTENT_TYPE);

    let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let weights = &decoded["all_layer_activations"][0]["attn_weights"];
    assert_eq!(weights, &json!([[[[0.0, 1.0], [10.0, 11.0]]]]));
}

#[tokio::test]
async fn test_attention_views_are_batch_major() {
    let layers = (0..2).map(|l| layer(l, 2, 3, true, true)).collect();
    let (app, _log, _dir) = router_with(Hyperparameters::demo(), Scripted::with_layers(layers));

    let (status, headers, body) = call(app.clone(), "GET", ATTN_WEIGHTS_ROUTE, "[1, 2, 3]").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], NPY_CONTENT_TYPE);

    let AnyTensor::F32(view) = npy::from_bytes(&body).unwrap() else {
        panic!("expected f32 view");
    };
    assert_eq!(view.shape(), &[1, 2, 2, 3, 3]);
    for l in 0..2 {
        for h in 0..2 {
            for i in 0..3 {
                for j in 0..3 {
                    assert_eq!(view.get(&[0, l, h, i, j]), Some(coded(l, h, i, j)));
                }
            }
        }
    }

    let (status, _, body) = call(app, "POST", ATTN_LOGITS_ROUTE, "[1, 2, 3]").await;
    assert_eq!(status, StatusCode::OK);
    let AnyTensor::F32(logits) = npy::from_bytes(&body).unwrap() else {
        panic!("expected f32 view");
    };
    assert_eq!(logits.get(&[0, 1, 1, 2, 0]), Some(-coded(1, 1, 2, 0)));
}

#[tokio::test]
async fn test_spread_from_collaborator() {
    let spread: AnyTensor = Tensor::from_vec(vec![3], vec![0.5f64, 1.5, 2.5]).unwrap().into();
    let mut forward = Scripted::with_layers(vec![]);
    forward.spread = Some(spread.clone());
    let (app, _log, _dir) = router_with(Hyperparameters::demo(), forward);

    let (status, headers, body) = call(app, "POST", SPREAD_ROUTE, "[4, 5]").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], NPY_CONTENT_TYPE);
    assert_eq!(npy::from_bytes(&body).unwrap(), spread);
}

#[tokio::test]
async fn test_demo_model_end_to_end() {
    let hyper = Hyperparameters::demo();
    let (model, params) = AttentionOnlyTransformer::from_hyperparameters(&hyper, 0).unwrap();
    let num_layers = hyper.usize("num_layers").unwrap();
    let num_heads = hyper.usize("num_heads").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let log = std::sync::Arc::new(
        crate::failure_log::FailureLog::open(dir.path().join("f.log")).unwrap(),
    );
    let gateway = crate::gateway::InferenceGateway::new(model, params, 42);
    let app = create_router(AppState::new(hyper, std::sync::Arc::new(gateway), log));

    let (status, _, body) = call(app.clone(), "POST", ATTN_WEIGHTS_ROUTE, "[[3, 1, 4, 1]]").await;
    assert_eq!(status, StatusCode::OK);
    let view = npy::from_bytes(&body).unwrap();
    assert_eq!(view.shape(), &[1, num_layers, num_heads, 4, 4]);

    let (status, _, first) = call(app.clone(), "POST", RESULTS_ROUTE, "[[3, 1, 4, 1]]").await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, second) = call(app, "POST", RESULTS_ROUTE, "[[3, 1, 4, 1]]").await;
    assert_eq!(first, second);
}

#[test]
fn test_routes_listed() {
    assert_eq!(ROUTES.len(), 5);
    assert!(ROUTES.iter().all(|r| r.starts_with('/')));
}
