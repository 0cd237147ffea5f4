//! PGD attack tests

use super::{AffineOracle, CountingOracle, Fault, FaultyOracle};
use crate::{budget_tolerance, linf_distance, GradientOracle, LinfPgdAttack, PgdConfig};
use aegis_core::{AegisError, LossFunc, ValueRange};
use ndarray::{arr1, arr2, Array1, Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Two classes over one scalar feature: z0 = x, z1 = -x.
fn scalar_oracle() -> AffineOracle {
    AffineOracle::new(arr2(&[[1.0], [-1.0]]), arr1(&[0.0, 0.0]), &[1])
}

fn config(epsilon: f32, num_steps: usize, step_size: f32, random_start: bool) -> PgdConfig {
    PgdConfig {
        epsilon,
        num_steps,
        step_size,
        random_start,
        loss_func: LossFunc::Xent,
        value_range: ValueRange::unit(),
    }
}

fn uniform_batch(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.random_range(0.0..=1.0))
}

/// Ten samples on a 28x28 "image" that sit just on the correct side of a
/// linear decision boundary: z0 - z1 = 2 * sum(x - 0.5).
fn fragile_batch() -> (AffineOracle, ArrayD<f32>, Vec<usize>) {
    let features = 28 * 28;
    let mut weights = Array2::<f32>::zeros((2, features));
    weights.row_mut(0).fill(1.0);
    weights.row_mut(1).fill(-1.0);
    let half = 0.5 * features as f32;
    let oracle = AffineOracle::new(weights, arr1(&[-half, half]), &[1, 28, 28]);

    let labels: Vec<usize> = (0..10).map(|i| i % 2).collect();
    let mut inputs = ArrayD::<f32>::zeros(IxDyn(&[10, 1, 28, 28]));
    for (i, &label) in labels.iter().enumerate() {
        let offset = if label == 0 { 0.005 } else { -0.005 };
        inputs
            .index_axis_mut(ndarray::Axis(0), i)
            .fill(0.5 + offset);
    }
    (oracle, inputs, labels)
}

// ============== Configuration ==============

#[test]
fn test_pgd_config_presets() {
    let mnist = PgdConfig::madry_mnist();
    assert!((mnist.epsilon - 0.3).abs() < 1e-6);
    assert_eq!(mnist.num_steps, 40);
    assert!((mnist.step_size - 0.01).abs() < 1e-6);
    assert!(mnist.random_start);
    assert_eq!(mnist.value_range, ValueRange::unit());

    let cifar = PgdConfig::madry_cifar();
    assert_eq!(cifar.epsilon, 8.0);
    assert_eq!(cifar.num_steps, 7);
    assert_eq!(cifar.step_size, 2.0);
    assert_eq!(cifar.value_range, ValueRange::pixel());

    let fgsm = PgdConfig::fgsm(0.1);
    assert_eq!(fgsm.num_steps, 1);
    assert_eq!(fgsm.step_size, fgsm.epsilon);
    assert!(!fgsm.random_start);

    assert_eq!(PgdConfig::default(), mnist);
}

#[test]
fn test_pgd_rejects_negative_epsilon() {
    let err = LinfPgdAttack::new(config(-0.1, 10, 0.01, false)).unwrap_err();
    assert!(matches!(err, AegisError::InvalidConfig(ref msg) if msg.contains("epsilon")));
}

#[test]
fn test_pgd_rejects_non_positive_step_size() {
    for step_size in [0.0, -0.5, f32::NAN] {
        let err = LinfPgdAttack::new(config(0.1, 10, step_size, false)).unwrap_err();
        assert!(matches!(err, AegisError::InvalidConfig(ref msg) if msg.contains("step_size")));
    }
}

#[test]
fn test_pgd_rejects_non_finite_epsilon() {
    assert!(LinfPgdAttack::new(config(f32::INFINITY, 1, 0.1, false)).is_err());
    assert!(LinfPgdAttack::new(config(f32::NAN, 1, 0.1, false)).is_err());
}

#[test]
fn test_pgd_rejects_inverted_value_range() {
    let mut cfg = config(0.1, 1, 0.1, false);
    cfg.value_range = ValueRange {
        lower: 1.0,
        upper: 0.0,
    };
    assert!(matches!(
        LinfPgdAttack::new(cfg),
        Err(AegisError::InvalidConfig(_))
    ));
}

#[test]
fn test_pgd_zero_epsilon_is_valid() {
    let attack = LinfPgdAttack::new(config(0.0, 5, 0.1, true)).unwrap();
    let inputs = arr2(&[[0.3_f32], [0.7]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(7);
    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &[0, 1], &mut rng)
        .unwrap();
    assert_eq!(adv, inputs);
}

#[test]
fn test_pgd_config_json_roundtrip_defaults_range() {
    let cfg: PgdConfig = serde_json::from_str(
        r#"{"epsilon": 0.1, "num_steps": 3, "step_size": 0.05,
            "random_start": false, "loss_func": "cw"}"#,
    )
    .unwrap();
    assert_eq!(cfg.loss_func, LossFunc::Cw);
    assert_eq!(cfg.value_range, ValueRange::unit());

    let negative_steps = serde_json::from_str::<PgdConfig>(
        r#"{"epsilon": 0.1, "num_steps": -1, "step_size": 0.05,
            "random_start": false, "loss_func": "xent"}"#,
    );
    assert!(negative_steps.is_err());

    let unknown_loss = serde_json::from_str::<PgdConfig>(
        r#"{"epsilon": 0.1, "num_steps": 1, "step_size": 0.05,
            "random_start": false, "loss_func": "hinge"}"#,
    );
    assert!(unknown_loss.is_err());
}

// ============== Closed-form scenarios ==============

#[test]
fn test_pgd_single_step_matches_closed_form() {
    // For label 0 the xent gradient w.r.t. x is -2 * p1 < 0, so the step is -0.3.
    // For label 1 it is 2 * p0 > 0, so the step is +0.3.
    let attack = LinfPgdAttack::new(config(0.3, 1, 0.3, false)).unwrap();
    let inputs = arr2(&[[0.5_f32], [0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &[0, 1], &mut rng)
        .unwrap();

    let expected_down = (0.5_f32 - 0.3).clamp(0.0, 1.0);
    let expected_up = (0.5_f32 + 0.3).clamp(0.0, 1.0);
    assert!((adv[[0, 0]] - expected_down).abs() < 1e-6);
    assert!((adv[[1, 0]] - expected_up).abs() < 1e-6);
}

#[test]
fn test_pgd_step_is_clipped_to_value_range() {
    // Starting at 0.9 a +0.3 step would leave [0, 1].
    let attack = LinfPgdAttack::new(config(0.3, 1, 0.3, false)).unwrap();
    let inputs = arr2(&[[0.9_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &[1], &mut rng)
        .unwrap();
    assert_eq!(adv[[0, 0]], 1.0);
}

#[test]
fn test_pgd_perturbation_is_clipped_to_epsilon() {
    // Many large steps in one direction still stop at the ε boundary.
    let attack = LinfPgdAttack::new(config(0.1, 20, 0.05, false)).unwrap();
    let inputs = arr2(&[[0.5_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let result = attack
        .attack(&scalar_oracle(), &inputs, &[0], &mut rng)
        .unwrap();
    assert!((result.adversarial[[0, 0]] - 0.4).abs() < 1e-6);
    assert!((result.max_perturbation - 0.1).abs() < 1e-6);
    assert_eq!(result.gradient_evaluations, 20);
}

#[test]
fn test_pgd_does_not_mutate_inputs() {
    let attack = LinfPgdAttack::new(config(0.2, 3, 0.1, true)).unwrap();
    let inputs = arr2(&[[0.5_f32], [0.25]]).into_dyn();
    let snapshot = inputs.clone();
    let mut rng = StdRng::seed_from_u64(3);
    let _ = attack
        .perturb(&scalar_oracle(), &inputs, &[0, 1], &mut rng)
        .unwrap();
    assert_eq!(inputs, snapshot);
}

#[test]
fn test_pgd_zero_gradient_leaves_coordinate_in_place() {
    // Feature 1 has zero weight in both classes, so its gradient is exactly 0.
    let oracle = AffineOracle::new(arr2(&[[1.0, 0.0], [-1.0, 0.0]]), arr1(&[0.0, 0.0]), &[2]);
    let attack = LinfPgdAttack::new(config(0.2, 4, 0.05, false)).unwrap();
    let inputs = arr2(&[[0.5_f32, 0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack.perturb(&oracle, &inputs, &[0], &mut rng).unwrap();
    assert!((adv[[0, 0]] - 0.3).abs() < 1e-6);
    assert_eq!(adv[[0, 1]], 0.5);
}

#[test]
fn test_pgd_cw_saturated_margin_stops_moving() {
    // The wrong class already wins by far more than κ, so the CW gradient is zero.
    let oracle = AffineOracle::new(arr2(&[[1.0], [1.0]]), arr1(&[0.0, 100.0]), &[1]);
    let mut cfg = config(0.3, 10, 0.1, false);
    cfg.loss_func = LossFunc::Cw;
    let attack = LinfPgdAttack::new(cfg).unwrap();
    let inputs = arr2(&[[0.5_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack.perturb(&oracle, &inputs, &[0], &mut rng).unwrap();
    assert_eq!(adv, inputs);
}

#[test]
fn test_pgd_cw_moves_against_true_class() {
    let mut cfg = config(0.2, 2, 0.1, false);
    cfg.loss_func = LossFunc::Cw;
    let attack = LinfPgdAttack::new(cfg).unwrap();
    let inputs = arr2(&[[0.5_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &[0], &mut rng)
        .unwrap();
    assert!((adv[[0, 0]] - 0.3).abs() < 1e-6);
}

// ============== Zero steps and determinism ==============

#[test]
fn test_pgd_zero_steps_without_random_start_is_identity() {
    let attack = LinfPgdAttack::new(config(0.3, 0, 0.1, false)).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let inputs = uniform_batch(&[4, 1], &mut rng);
    let oracle = CountingOracle::new(scalar_oracle());

    let adv = attack
        .perturb(&oracle, &inputs, &[0, 1, 0, 1], &mut rng)
        .unwrap();
    assert_eq!(adv, inputs);
    assert_eq!(oracle.gradient_calls.get(), 0);
}

#[test]
fn test_pgd_zero_steps_with_random_start_stays_in_ball() {
    let cfg = config(0.3, 0, 0.1, true);
    let tol = budget_tolerance(&cfg.value_range);
    let attack = LinfPgdAttack::new(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(12);
    let inputs = uniform_batch(&[16, 1], &mut rng);
    let labels = vec![0; 16];

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut rng)
        .unwrap();
    assert_ne!(adv, inputs);
    assert!(linf_distance(&adv, &inputs) <= 0.3 + tol);
    assert!(adv.iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_pgd_random_start_with_huge_epsilon() {
    let cfg = config(3.0e38, 2, 0.1, true);
    let attack = LinfPgdAttack::new(cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let inputs = uniform_batch(&[8, 1], &mut rng);
    let labels = vec![1; 8];

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut rng)
        .unwrap();
    assert_eq!(adv.shape(), inputs.shape());
    assert!(adv.iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn test_pgd_deterministic_without_random_start() {
    let attack = LinfPgdAttack::new(config(0.1, 10, 0.02, false)).unwrap();
    let mut data_rng = StdRng::seed_from_u64(5);
    let inputs = uniform_batch(&[8, 1], &mut data_rng);
    let labels = vec![0, 1, 1, 0, 1, 0, 0, 1];

    let a = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut StdRng::seed_from_u64(1))
        .unwrap();
    let b = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut StdRng::seed_from_u64(2))
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_pgd_reproducible_with_same_seed() {
    let attack = LinfPgdAttack::new(config(0.1, 5, 0.02, true)).unwrap();
    let mut data_rng = StdRng::seed_from_u64(5);
    let inputs = uniform_batch(&[8, 1], &mut data_rng);
    let labels = vec![1; 8];

    let a = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut StdRng::seed_from_u64(99))
        .unwrap();
    let b = attack
        .perturb(&scalar_oracle(), &inputs, &labels, &mut StdRng::seed_from_u64(99))
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_pgd_issues_exactly_num_steps_queries() {
    let attack = LinfPgdAttack::new(config(0.1, 7, 0.02, true)).unwrap();
    let oracle = CountingOracle::new(scalar_oracle());
    let inputs = arr2(&[[0.5_f32], [0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let result = attack.attack(&oracle, &inputs, &[0, 1], &mut rng).unwrap();
    assert_eq!(oracle.gradient_calls.get(), 7);
    assert_eq!(result.gradient_evaluations, 7);
}

// ============== Attack strength ==============

#[test]
fn test_pgd_breaks_fragile_samples() {
    let (oracle, inputs, labels) = fragile_batch();
    assert_eq!(oracle.accuracy(&inputs, &labels).unwrap(), 1.0);

    let attack = LinfPgdAttack::new(PgdConfig {
        epsilon: 8.0 / 255.0,
        num_steps: 40,
        step_size: 2.0 / 255.0,
        random_start: true,
        loss_func: LossFunc::Xent,
        value_range: ValueRange::unit(),
    })
    .unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let adv = attack.perturb(&oracle, &inputs, &labels, &mut rng).unwrap();

    let adv_accuracy = oracle.accuracy(&adv, &labels).unwrap();
    assert!(
        adv_accuracy < 0.1,
        "adversarial accuracy {adv_accuracy} should drop below 10%"
    );
    assert!(linf_distance(&adv, &inputs) <= 8.0 / 255.0 + 1e-5);
}

#[test]
fn test_pgd_larger_budget_reaches_higher_loss() {
    let mut rng = StdRng::seed_from_u64(2024);
    let features = 16;
    let weights = Array2::from_shape_fn((2, features), |_| rng.random_range(-1.0..1.0));
    let oracle = AffineOracle::new(weights, Array1::zeros(2), &[features]);
    let inputs = uniform_batch(&[32, features], &mut rng);
    let labels: Vec<usize> = (0..32).map(|i| i % 2).collect();

    let mean_loss_for = |epsilon: f32| {
        let attack = LinfPgdAttack::new(config(epsilon, 10, epsilon / 4.0, false)).unwrap();
        let adv = attack
            .perturb(&oracle, &inputs, &labels, &mut StdRng::seed_from_u64(0))
            .unwrap();
        oracle.mean_loss(&adv, &labels, LossFunc::Xent).unwrap()
    };

    let clean = oracle.mean_loss(&inputs, &labels, LossFunc::Xent).unwrap();
    let small = mean_loss_for(0.05);
    let large = mean_loss_for(0.1);
    assert!(small > clean, "attack should increase loss: {small} vs {clean}");
    assert!(large >= small, "larger budget did worse: {large} < {small}");
}

#[test]
fn test_pgd_pixel_range() {
    // Small weights keep the softmax away from saturation at pixel scale.
    let oracle = AffineOracle::new(
        arr2(&[[0.01, 0.01], [-0.01, -0.01]]),
        arr1(&[0.0, 0.0]),
        &[2],
    );
    let attack = LinfPgdAttack::new(PgdConfig::madry_cifar()).unwrap();
    let inputs = arr2(&[[3.0_f32, 250.0], [128.0, 0.0]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(8);

    let adv = attack.perturb(&oracle, &inputs, &[1, 0], &mut rng).unwrap();
    let tol = budget_tolerance(&ValueRange::pixel());
    assert!(linf_distance(&adv, &inputs) <= 8.0 + tol);
    assert!(adv.iter().all(|&v| (0.0..=255.0).contains(&v)));
    // Label 1 pushes toward class 0, i.e. up; label 0 pushes down.
    assert_eq!(adv[[0, 1]], 255.0);
    assert_eq!(adv[[1, 1]], 0.0);
}

#[test]
fn test_pgd_perturb_batch_keeps_labels() {
    let attack = LinfPgdAttack::new(config(0.1, 2, 0.05, false)).unwrap();
    let batch =
        aegis_core::Batch::new(arr2(&[[0.5_f32], [0.5]]).into_dyn(), vec![1, 0]).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack
        .perturb_batch(&scalar_oracle(), &batch, &mut rng)
        .unwrap();
    assert_eq!(adv.labels, batch.labels);
    assert_eq!(adv.inputs.shape(), batch.inputs.shape());
    assert!((adv.inputs[[0, 0]] - 0.6).abs() < 1e-6);
    assert!((adv.inputs[[1, 0]] - 0.4).abs() < 1e-6);
}

// ============== Error handling ==============

#[test]
fn test_pgd_label_count_mismatch() {
    let attack = LinfPgdAttack::new(config(0.1, 1, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32], [0.5], [0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(&scalar_oracle(), &inputs, &[0, 1], &mut rng)
        .unwrap_err();
    assert!(matches!(err, AegisError::ShapeMismatch { .. }));
}

#[test]
fn test_pgd_sample_shape_mismatch() {
    let attack = LinfPgdAttack::new(config(0.1, 1, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32, 0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(&scalar_oracle(), &inputs, &[0], &mut rng)
        .unwrap_err();
    match err {
        AegisError::ShapeMismatch { expected, got } => {
            assert_eq!(expected, vec![1, 1]);
            assert_eq!(got, vec![1, 2]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_pgd_label_out_of_class_range() {
    let attack = LinfPgdAttack::new(config(0.1, 1, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(&scalar_oracle(), &inputs, &[2], &mut rng)
        .unwrap_err();
    assert!(matches!(err, AegisError::InvalidInput(ref msg) if msg.contains("label 2")));
}

#[test]
fn test_pgd_input_outside_value_range() {
    let attack = LinfPgdAttack::new(config(0.1, 1, 0.1, false)).unwrap();
    let inputs = arr2(&[[1.5_f32]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);
    let oracle = CountingOracle::new(scalar_oracle());

    let err = attack.perturb(&oracle, &inputs, &[0], &mut rng).unwrap_err();
    assert!(matches!(err, AegisError::InvalidInput(_)));
    // Validation happens before any oracle query.
    assert_eq!(oracle.gradient_calls.get(), 0);
}

#[test]
fn test_pgd_oracle_error_propagates_unchanged() {
    let attack = LinfPgdAttack::new(config(0.1, 3, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32, 0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(&FaultyOracle { fault: Fault::Error }, &inputs, &[0], &mut rng)
        .unwrap_err();
    match err {
        AegisError::OracleFailure(msg) => {
            assert_eq!(msg, "numeric overflow in gradient computation")
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_pgd_non_finite_gradient_is_oracle_failure() {
    let attack = LinfPgdAttack::new(config(0.1, 3, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32, 0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(
            &FaultyOracle {
                fault: Fault::NanGradient,
            },
            &inputs,
            &[0],
            &mut rng,
        )
        .unwrap_err();
    assert!(matches!(err, AegisError::OracleFailure(ref msg) if msg.contains("non-finite")));
}

#[test]
fn test_pgd_wrong_gradient_shape_is_oracle_failure() {
    let attack = LinfPgdAttack::new(config(0.1, 3, 0.1, false)).unwrap();
    let inputs = arr2(&[[0.5_f32, 0.5]]).into_dyn();
    let mut rng = StdRng::seed_from_u64(0);

    let err = attack
        .perturb(
            &FaultyOracle {
                fault: Fault::WrongShape,
            },
            &inputs,
            &[0],
            &mut rng,
        )
        .unwrap_err();
    assert!(matches!(err, AegisError::OracleFailure(ref msg) if msg.contains("shape")));
}

#[test]
fn test_pgd_empty_batch() {
    let attack = LinfPgdAttack::new(config(0.1, 2, 0.1, true)).unwrap();
    let inputs = ArrayD::<f32>::zeros(IxDyn(&[0, 1]));
    let mut rng = StdRng::seed_from_u64(0);

    let adv = attack
        .perturb(&scalar_oracle(), &inputs, &[], &mut rng)
        .unwrap();
    assert_eq!(adv.shape(), &[0, 1]);
}
