//! Bias cost versus error cost on a linear calibration problem.
//!
//! feature = theta + N(0, sigma^2). An error-trained linear network shrinks
//! towards the mean of theta (regression dilution) and is biased at the edges;
//! a bias-trained one learns the unbiased inverse.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use calibnet::{
    Activation, BiasSummary, CostFunction, MaskedArray, NetworkBuilder, TrainConfig, TrainingCase,
    TrainingSet,
};

const SIGMA: f64 = 0.3;

fn noisy_set(n_cases: usize, n_rea: usize, seed: u64) -> TrainingSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, SIGMA).unwrap();
    let cases = (0..n_cases)
        .map(|_| {
            let theta: f64 = rng.gen_range(0.0..1.0);
            let values: Vec<f64> = (0..n_rea).map(|_| theta + noise.sample(&mut rng)).collect();
            TrainingCase::new(theta, MaskedArray::from_flat(n_rea, 1, values).unwrap()).unwrap()
        })
        .collect();
    TrainingSet::new(cases).unwrap()
}

fn train(cost: CostFunction, set: &TrainingSet) -> calibnet::Network {
    let mut net = NetworkBuilder::new(1)
        .unwrap()
        .add_layer(1, Activation::Identity)
        .unwrap()
        .build_with_seed(3)
        .unwrap();
    let report = net
        .fit(
            set,
            TrainConfig {
                cost,
                max_iterations: 200,
                ..TrainConfig::default()
            },
        )
        .unwrap();
    assert!(report.final_cost.is_finite());
    net
}

#[test]
fn msb_training_has_lower_bias_than_mse_training() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let train_set = noisy_set(40, 100, 1);
    let test_set = noisy_set(30, 200, 2);

    let mse_net = train(CostFunction::Mse, &train_set);
    let msb_net = train(CostFunction::Msb, &train_set);

    let mse = BiasSummary::evaluate(&mse_net, &test_set).unwrap();
    let msb = BiasSummary::evaluate(&msb_net, &test_set).unwrap();

    assert_eq!(mse.n_cases, 30);
    assert!(
        msb.rms_bias < 0.5 * mse.rms_bias,
        "msb rms bias {} vs mse rms bias {}",
        msb.rms_bias,
        mse.rms_bias
    );
    // The price: single predictions are noisier.
    assert!(mse.rms_error < msb.rms_error);
}

#[test]
fn msb_learns_close_to_the_unbiased_inverse() {
    let train_set = noisy_set(40, 200, 5);
    let net = train(CostFunction::Msb, &train_set);
    let layer = net.layer(0).unwrap();
    assert!((layer.weights()[0] - 1.0).abs() < 0.1, "slope {}", layer.weights()[0]);
    assert!(layer.biases()[0].abs() < 0.1, "offset {}", layer.biases()[0]);
}
