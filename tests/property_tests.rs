//! Property-based tests for the tensor, NPY and normalization layers
//!
//! - permutation moves every element to its permuted coordinate
//! - NPY streams reproduce shape, dtype and values exactly
//! - normalization nests arrays row-major and agrees across backends

use mirador::{
    attention::{derive_view, AttentionField},
    gateway::{InferenceResult, LAYER_ACTIVATIONS},
    normalize::normalize,
    npy,
    value::{AnyTensor, Map},
    Tensor, Value,
};
use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;

/// Shape with up to 4 axes of extent 0..=4
fn shape_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0usize..=4, 0..=4)
}

/// Row-major multi-index of flat position `flat`
fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        index[axis] = flat % shape[axis];
        flat /= shape[axis];
    }
    index
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_permute_moves_elements(
        (shape, axes) in prop::collection::vec(1usize..=4, 1..=5)
            .prop_flat_map(|shape| {
                let n = shape.len();
                (Just(shape), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
            })
    ) {
        let size: usize = shape.iter().product();
        let data: Vec<i64> = (0..size as i64).collect();
        let t = Tensor::from_vec(shape.clone(), data).unwrap();
        let p = t.permute(&axes).unwrap();

        for flat in 0..size {
            let src = unravel(flat, &shape);
            let dst: Vec<usize> = axes.iter().map(|&a| src[a]).collect();
            prop_assert_eq!(p.get(&dst), t.get(&src));
        }
    }

    #[test]
    fn prop_npy_roundtrip_f32(
        (shape, data) in shape_strategy().prop_flat_map(|shape| {
            let size: usize = shape.iter().product();
            (Just(shape), prop::collection::vec(-1e6f32..1e6, size))
        })
    ) {
        let t: AnyTensor = Tensor::from_vec(shape, data).unwrap().into();
        let bytes = npy::to_bytes(&t).unwrap();
        prop_assert_eq!(bytes.len() - t.to_le_bytes().len(), npy::read_header(&bytes).unwrap().1);
        prop_assert_eq!(npy::from_bytes(&bytes).unwrap(), t);
    }

    #[test]
    fn prop_npy_roundtrip_i64(
        (shape, data) in shape_strategy().prop_flat_map(|shape| {
            let size: usize = shape.iter().product();
            (Just(shape), prop::collection::vec(any::<i64>(), size))
        })
    ) {
        let t: AnyTensor = Tensor::from_vec(shape, data).unwrap().into();
        prop_assert_eq!(npy::from_bytes(&npy::to_bytes(&t).unwrap()).unwrap(), t);
    }

    #[test]
    fn prop_npy_data_aligned(
        shape in shape_strategy()
    ) {
        let size: usize = shape.iter().product();
        let t: AnyTensor = Tensor::from_vec(shape, vec![0u8; size]).unwrap().into();
        let (_, offset) = npy::read_header(&npy::to_bytes(&t).unwrap()).unwrap();
        prop_assert_eq!(offset % npy::ALIGNMENT, 0);
    }

    #[test]
    fn prop_normalize_backends_agree(
        (shape, data) in prop::collection::vec(1usize..=3, 1..=3).prop_flat_map(|shape| {
            let size: usize = shape.iter().product();
            (Just(shape), prop::collection::vec(-1000i32..1000, size))
        })
    ) {
        let ours = Value::from(Tensor::from_vec(shape.clone(), data.clone()).unwrap());
        let theirs = Value::from(ArrayD::from_shape_vec(IxDyn(&shape), data.clone()).unwrap());
        let a = normalize(&ours).unwrap();
        prop_assert_eq!(&a, &normalize(&theirs).unwrap());

        // Descending the first index on every axis reaches data[0]
        let mut cursor = &a;
        for _ in &shape {
            cursor = &cursor[0];
        }
        prop_assert_eq!(cursor.as_i64(), Some(i64::from(data[0])));
    }

    #[test]
    fn prop_scalars_pass_through(i in any::<i64>(), f in -1e12f64..1e12) {
        prop_assert_eq!(normalize(&Value::Int(i)).unwrap(), serde_json::json!(i));
        prop_assert_eq!(normalize(&Value::Float(f)).unwrap(), serde_json::json!(f));
    }

    #[test]
    fn prop_attention_view_shape(
        layers in 1usize..=4,
        batch in 1usize..=3,
        heads in 1usize..=3,
        time in 1usize..=4
    ) {
        let per_layer: Vec<Value> = (0..layers)
            .map(|l| {
                let size = batch * heads * time * time;
                let data: Vec<f32> = (0..size).map(|i| (l * size + i) as f32).collect();
                let mut m = Map::new();
                m.insert(
                    "attn_weights".to_string(),
                    Tensor::from_vec(vec![batch, heads, time, time], data).unwrap().into(),
                );
                Value::Map(m)
            })
            .collect();
        let mut result = InferenceResult::default();
        result.insert(LAYER_ACTIVATIONS, Value::List(per_layer));

        let view = derive_view(&result, AttentionField::Weights).unwrap();
        prop_assert_eq!(view.shape(), &[batch, layers, heads, time, time][..]);
    }
}
