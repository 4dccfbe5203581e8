//! # Mirador
//!
//! Local HTTP introspection bridge for a running sequence model.
//!
//! Mirador (Spanish: "lookout") sits next to an already initialized model and
//! lets a browser visualization look inside it: hyperparameters, whole
//! forward-pass results, and per-layer attention weights and logits.
//!
//! ## Features
//!
//! - **Two encodings**: JSON for metadata and small results, NPY streams for
//!   large tensors
//! - **Backend agnostic**: numbers from the crate's own [`Tensor`] and from
//!   `ndarray` normalize identically
//! - **Batch-major views**: per-layer `[B, H, T, T]` attention is stacked and
//!   reordered to `[B, L, H, T, T]`
//! - **Double failure logging**: `tracing` plus an append-only failure log
//!
//! ## Example
//!
//! ```rust
//! use mirador::attention::{derive_view, AttentionField};
//! use mirador::gateway::InferenceGateway;
//! use mirador::hyperparams::Hyperparameters;
//! use mirador::model::AttentionOnlyTransformer;
//!
//! let hyper = Hyperparameters::demo();
//! let (model, params) = AttentionOnlyTransformer::from_hyperparameters(&hyper, 0).unwrap();
//! let gateway = InferenceGateway::new(model, params, 42);
//!
//! let result = gateway.run(&serde_json::json!([[1, 2, 3]])).unwrap();
//! let view = derive_view(&result, AttentionField::Weights).unwrap();
//! assert_eq!(view.shape()[0], 1);
//! assert_eq!(view.shape()[3..], [3, 3]);
//! ```
//!
//! ## Serving
//!
//! ```rust,ignore
//! use mirador::{config::ServerConfig, server::IntrospectionServer};
//!
//! let config = ServerConfig::default();
//! let server = IntrospectionServer::with_model(&config, hyper, model, params, 42)?;
//! let mut handle = server.start()?;
//! println!("listening on {}", handle.port());
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 in positional encodings
#![allow(clippy::cast_possible_truncation)] // f64 -> f32 dropout rate
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::many_single_char_names)] // b, h, i, j, k index loops
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod attention;
pub mod config;
pub mod encode;
pub mod error;
pub mod failure_log;
pub mod gateway;
pub mod hyperparams;
pub mod model;
pub mod normalize;
pub mod npy;
pub mod observability;
pub mod server;
pub mod tensor;
pub mod value;

// Re-exports for convenience
pub use error::{MiradorError, Result};
pub use tensor::Tensor;
pub use value::Value;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
