use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use calibnet::{
    Activation, Aggregation, Algorithm, Committee, CommitteeConfig, CostFunction, InitStrategy,
    MaskedArray, MemberConfig, Minibatch, NetworkBuilder, TrainConfig, TrainingCase, TrainingSet,
};

fn noisy_set(seed: u64) -> TrainingSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let cases = (0..12)
        .map(|_| {
            let theta: f64 = rng.gen_range(0.0..1.0);
            let rows: Vec<Vec<f64>> =
                (0..8).map(|_| vec![theta + rng.gen_range(-0.2..0.2)]).collect();
            TrainingCase::from_rows(theta, &rows).unwrap()
        })
        .collect();
    TrainingSet::new(cases).unwrap()
}

fn member(max_iterations: usize) -> MemberConfig {
    let arch = NetworkBuilder::new(1)
        .unwrap()
        .add_layer(3, Activation::Tanh)
        .unwrap()
        .add_layer(1, Activation::Identity)
        .unwrap()
        .into_architecture()
        .unwrap();
    MemberConfig::new(
        arch,
        TrainConfig {
            max_iterations,
            ..TrainConfig::default()
        },
    )
}

fn inputs() -> MaskedArray {
    MaskedArray::from_rows(&[vec![0.1], vec![0.5], vec![0.9]]).unwrap()
}

#[test]
fn identical_members_agree_with_any_single_member() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut cfg = CommitteeConfig::uniform(3, member(25));
    for m in &mut cfg.members {
        m.seed = 42;
    }
    let res = Committee::new(cfg).unwrap().train(&noisy_set(1)).unwrap();
    assert_eq!(res.len(), 3);

    let pred = res.predict(&inputs(), Aggregation::Mean).unwrap();
    let single = res.members[1].network.forward_batch(&inputs()).unwrap();
    for r in 0..3 {
        let (committee, alone) = (pred.values.get(r, 0).unwrap(), single.get(r, 0).unwrap());
        assert_abs_diff_eq!(committee, alone, epsilon = 1e-12);
        assert_abs_diff_eq!(pred.spread.get(r, 0).unwrap(), 0.0, epsilon = 1e-12);
    }
    let costs: Vec<f64> = res.members.iter().map(|m| m.final_cost).collect();
    assert!(costs.iter().all(|&c| c == costs[0]));
}

#[test]
fn bootstrap_members_have_nonzero_spread() {
    let mut cfg = CommitteeConfig::uniform(4, member(25));
    for m in &mut cfg.members {
        m.bootstrap = true;
        m.init = InitStrategy::IdentityWithNoise {
            wscale: 0.1,
            bscale: 0.1,
        };
    }
    let res = Committee::new(cfg).unwrap().train(&noisy_set(2)).unwrap();
    assert!(res.is_complete());

    let pred = res.predict(&inputs(), Aggregation::Median).unwrap();
    assert_eq!(pred.n_members, 4);
    assert!((0..3).any(|r| pred.spread.get(r, 0).unwrap() > 0.0));
}

#[test]
fn failures_are_isolated_and_reported() {
    let mut cfg = CommitteeConfig::uniform(4, member(10));
    cfg.members[2].train.cost = CostFunction::Msbw {
        norm: calibnet::WeightNorm::Global,
    };
    let res = Committee::new(cfg).unwrap().train(&noisy_set(3)).unwrap();
    assert_eq!(res.members.iter().map(|m| m.index).collect::<Vec<_>>(), vec![0, 1, 3]);
    assert_eq!(res.failures.len(), 1);
    assert_eq!(res.failures[0].index, 2);
    assert!(res.summary().contains("FAILED"));
    // Partial committees still predict.
    assert_eq!(res.predict(&inputs(), Aggregation::Mean).unwrap().n_members, 3);
}

#[test]
fn slow_members_time_out_without_losing_fast_ones() {
    let mut cfg = CommitteeConfig::uniform(2, member(5));
    // Member 1 would run for a very long time.
    cfg.members[1].train = TrainConfig {
        algorithm: Algorithm::NelderMead,
        max_iterations: 50,
        minibatch: Minibatch::Random {
            size: 4,
            loops: usize::MAX,
        },
        ..TrainConfig::default()
    };
    cfg.max_workers = Some(2);
    cfg.timeout = Some(Duration::from_millis(500));

    let res = Committee::new(cfg).unwrap().train(&noisy_set(4)).unwrap();
    assert_eq!(res.members.len(), 1);
    assert_eq!(res.members[0].index, 0);
    assert_eq!(res.failures.len(), 1);
    assert!(res.failures[0].reason.contains("timed out"));
}

#[test]
fn cancelling_mid_run_keeps_finished_members() {
    let mut cfg = CommitteeConfig::uniform(3, member(5));
    // Members 1 and 2 never finish on their own.
    for m in &mut cfg.members[1..] {
        m.train = TrainConfig {
            algorithm: Algorithm::NelderMead,
            max_iterations: 50,
            minibatch: Minibatch::Random {
                size: 4,
                loops: usize::MAX,
            },
            ..TrainConfig::default()
        };
    }
    cfg.max_workers = Some(3);

    let committee = Committee::new(cfg).unwrap();
    let stop = committee.stop_handle();
    let canceller = thread::spawn(move || {
        // Member 0 needs a few milliseconds.
        thread::sleep(Duration::from_secs(1));
        stop.store(true, Ordering::Relaxed);
    });
    let res = committee.train(&noisy_set(5)).unwrap();
    canceller.join().unwrap();

    assert_eq!(res.members.len(), 1);
    assert_eq!(res.members[0].index, 0);
    assert!(res.members[0].final_cost.is_finite());
    assert!(res.members[0].report.is_some());
    assert_eq!(res.failures.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 2]);
    assert!(res.failures.iter().all(|f| f.reason == "cancelled while running"));
    // The survivor still predicts.
    assert_eq!(res.predict(&inputs(), Aggregation::Mean).unwrap().n_members, 1);
}

#[test]
fn shape_mismatch_fails_before_any_worker_starts() {
    let committee = Committee::new(CommitteeConfig::uniform(2, member(5))).unwrap();
    let case = TrainingCase::from_rows(0.0, &[vec![1.0, 2.0]]).unwrap();
    let wide = TrainingSet::new(vec![case]).unwrap();
    assert!(committee.train(&wide).is_err());
}
