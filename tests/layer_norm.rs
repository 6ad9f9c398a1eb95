use approx::assert_abs_diff_eq;
use ndarray::{array, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusty_norm::nn::{load_weights, save_weights, BaseConfig};
use rusty_norm::{Error, LayerNorm, LayerNormConfig, Module, Tensor};

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|_| rng.gen_range(-5.0f32..5.0)).collect();
    Tensor::new(data, shape.to_vec()).unwrap()
}

/// Asserts every last-axis lane has mean ~0 and variance ~var/(var+eps) ~1.
fn assert_standardized(input: &ArrayD<f32>, output: &ArrayD<f32>, eps: f32) {
    let last = Axis(output.ndim() - 1);
    for (x, y) in input.lanes(last).into_iter().zip(output.lanes(last)) {
        let n = x.len() as f32;
        let x_mean = x.sum() / n;
        let x_var = x.mapv(|v| (v - x_mean) * (v - x_mean)).sum() / n;

        let y_mean = y.sum() / n;
        let y_var = y.mapv(|v| (v - y_mean) * (v - y_mean)).sum() / n;
        assert_abs_diff_eq!(y_mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(y_var, x_var / (x_var + eps), epsilon = 1e-3);
        assert_abs_diff_eq!(y_var, 1.0, epsilon = 1e-2);
    }
}

#[test]
fn standardizes_every_sample_for_any_rank() {
    let mut rng = StdRng::seed_from_u64(7);
    for shape in [vec![16], vec![3, 16], vec![2, 5, 16], vec![2, 3, 4, 16]] {
        let mut ln = LayerNorm::new(LayerNormConfig::default()).unwrap();
        let x = random_tensor(&mut rng, &shape);
        let y = ln.call(&x).unwrap();

        assert_eq!(y.shape(), shape);
        assert_eq!(ln.compute_output_shape(&shape).unwrap(), shape);
        assert_standardized(&x.data(), &y.data(), ln.eps());
    }
}

#[test]
fn normalizes_per_sample_not_across_batch() {
    let mut ln = LayerNorm::new(LayerNormConfig::default()).unwrap();
    // The second sample is the first scaled and shifted; their normalized
    // outputs must agree, which would not hold for batch statistics.
    let x = Tensor::from_data(array![[1.0, 2.0, 4.0], [12.0, 14.0, 18.0]].into_dyn());
    let y = ln.call(&x).unwrap();
    let data = y.data();
    for j in 0..3 {
        assert_abs_diff_eq!(data[[0, j]], data[[1, j]], epsilon = 1e-3);
    }
}

#[test]
fn applies_learned_scale_and_shift() {
    let mut ln = LayerNorm::with_features(4, LayerNormConfig::default()).unwrap();
    let alpha = array![1.0f32, 2.0, 3.0, 4.0].into_dyn();
    let beta = array![-1.0f32, 0.0, 1.0, 2.0].into_dyn();
    ln.set_weights(vec![alpha.clone(), beta.clone()]).unwrap();

    let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 8.0], vec![2, 4]).unwrap();
    let reference = LayerNorm::with_features(4, LayerNormConfig::default()).unwrap();
    let standardized = reference.forward(&x).unwrap();
    let y = ln.forward(&x).unwrap();

    let expected = &*standardized.data() * &alpha + &beta;
    for (got, want) in y.data().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-5);
    }
}

#[test]
fn gradients_reach_parameters_and_input() {
    let ln = LayerNorm::with_features(3, LayerNormConfig::default()).unwrap();
    let x = Tensor::new(vec![1.0, 2.0, 6.0, -3.0, 0.5, 4.0], vec![2, 3]).unwrap();
    let y = ln.forward(&x).unwrap();
    let normalized = y.data().clone();
    y.sum().backward();

    // d(sum y)/d beta counts the samples each feature appears in.
    let beta_grad = ln.beta().unwrap().grad().unwrap();
    assert_eq!(*beta_grad.data(), array![2.0f32, 2.0, 2.0].into_dyn());

    // d(sum y)/d alpha is the per-feature sum of the normalized values.
    let alpha_grad = ln.alpha().unwrap().grad().unwrap();
    let expected = normalized.sum_axis(Axis(0));
    for (got, want) in alpha_grad.data().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*got, *want, epsilon = 1e-5);
    }

    // With unit scale every sample's outputs sum to zero regardless of x.
    let x_grad = x.grad().unwrap();
    assert_eq!(x_grad.shape(), vec![2, 3]);
    for g in x_grad.data().iter() {
        assert_abs_diff_eq!(*g, 0.0, epsilon = 1e-4);
    }

    ln.zero_grad();
    assert!(ln.alpha().unwrap().grad().is_none());
    assert!(ln.beta().unwrap().grad().is_none());
}

#[test]
fn built_size_is_fixed() {
    let mut ln = LayerNorm::new(LayerNormConfig::default()).unwrap();
    ln.call(&Tensor::zeros(&[3, 8])).unwrap();
    // A new batch size is fine, a new feature size is not.
    assert!(ln.call(&Tensor::zeros(&[5, 8])).is_ok());
    assert!(matches!(
        ln.call(&Tensor::zeros(&[3, 4])),
        Err(Error::ShapeMismatch {
            expected: 8,
            actual: 4
        })
    ));
}

#[test]
fn non_finite_input_propagates() {
    let ln = LayerNorm::with_features(3, LayerNormConfig::default()).unwrap();
    let x = Tensor::new(vec![1.0, f32::NAN, 3.0, 1.0, 2.0, 3.0], vec![2, 3]).unwrap();
    let y = ln.forward(&x).unwrap();
    let data = y.data();
    assert!(data.index_axis(Axis(0), 0).iter().all(|v| v.is_nan()));
    assert!(data.index_axis(Axis(0), 1).iter().all(|v| v.is_finite()));
}

#[test]
fn config_round_trip_preserves_eps() {
    let original = LayerNorm::with_features(
        6,
        LayerNormConfig {
            base: BaseConfig::named("decoder_norm"),
            eps: 1e-6,
        },
    )
    .unwrap();
    let config = original.config().unwrap();
    assert!(config.contains_key("eps"));

    // Round trip through the textual form as a saved model would.
    let text = serde_json::to_string(&config).unwrap();
    let parsed: rusty_norm::nn::ConfigMap = serde_json::from_str(&text).unwrap();
    let mut rebuilt = LayerNorm::from_config(&parsed).unwrap();

    assert_eq!(rebuilt.eps(), original.eps());
    assert_eq!(rebuilt.name(), original.name());
    assert!(!rebuilt.is_built());
    rebuilt.build(&[6]).unwrap();
    assert_eq!(rebuilt.features(), original.features());
}

#[test]
fn auto_names_are_unique() {
    let a = LayerNorm::new(LayerNormConfig::default()).unwrap();
    let b = LayerNorm::new(LayerNormConfig::default()).unwrap();
    assert_ne!(a.name(), b.name());
    assert!(a.name().starts_with("layer_norm"));
    assert!(b.name().starts_with("layer_norm"));
}

#[test]
fn weights_survive_save_and_load() {
    let mut trained = LayerNorm::with_features(4, LayerNormConfig::default()).unwrap();
    trained
        .set_weights(vec![
            array![0.5f32, 1.5, 2.5, 3.5].into_dyn(),
            array![0.1f32, -0.1, 0.2, -0.2].into_dyn(),
        ])
        .unwrap();

    let mut buf = Vec::new();
    save_weights(&trained, &mut buf).unwrap();

    let mut restored = LayerNorm::from_config(&trained.config().unwrap()).unwrap();
    assert!(matches!(
        load_weights(&mut restored, buf.as_slice()),
        Err(Error::NotBuilt(_))
    ));
    restored.build(&[2, 4]).unwrap();
    load_weights(&mut restored, buf.as_slice()).unwrap();
    assert_eq!(restored.weights(), trained.weights());

    let x = Tensor::from_data(ArrayD::from_shape_fn(IxDyn(&[2, 4]), |ix| {
        (ix[0] * 4 + ix[1]) as f32
    }));
    let a = trained.forward(&x).unwrap();
    let b = restored.forward(&x).unwrap();
    assert_eq!(*a.data(), *b.data());

    let mut wrong_size = LayerNorm::with_features(3, LayerNormConfig::default()).unwrap();
    assert!(matches!(
        load_weights(&mut wrong_size, buf.as_slice()),
        Err(Error::WeightShape { index: 0, .. })
    ));
}

#[test]
fn truncated_weights_fail_to_load() {
    let ln = LayerNorm::with_features(4, LayerNormConfig::default()).unwrap();
    let mut buf = Vec::new();
    save_weights(&ln, &mut buf).unwrap();
    buf.truncate(buf.len() / 2);

    let mut target = LayerNorm::with_features(4, LayerNormConfig::default()).unwrap();
    assert!(matches!(
        load_weights(&mut target, buf.as_slice()),
        Err(Error::Serialization(_))
    ));
}
