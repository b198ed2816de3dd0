mod common;

use felsen::{flags, EngineError, Operation};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

const PATTERNS: usize = 3;

fn random_tip_rows(tip_count: usize, seed: u64) -> Vec<Vec<u32>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..tip_count)
        .map(|_| (0..PATTERNS).map(|_| rng.gen_range(0..4u32)).collect())
        .collect()
}

/// Ladder tree over `tip_count` tips with every edge `t`, peeled with or
/// without per-node rescaling, reduced at the last internal buffer.
fn caterpillar_log_likelihood(
    tip_count: usize,
    edge_length: f64,
    scaled: bool,
    seed: u64,
) -> Result<f64, EngineError> {
    let internals = tip_count - 1;
    let mut engine = common::dna_engine(tip_count, internals, PATTERNS, 1, 1, internals + 2);
    for (i, row) in random_tip_rows(tip_count, seed).iter().enumerate() {
        engine.set_tip_states(i, row).unwrap();
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[edge_length])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine.set_pattern_weights(&[1.0, 2.0, 1.5]).unwrap();

    let cumulative = internals;
    let ops = common::caterpillar_ops(tip_count, scaled);
    engine
        .update_partials(&ops, if scaled { Some(cumulative) } else { None })
        .unwrap();
    let root = tip_count + internals - 1;
    let scale_arg = if scaled { Some(cumulative) } else { None };
    engine.calculate_root_log_likelihoods(&[root], &[0], &[0], &[scale_arg])
}

#[test]
fn rescaled_evaluation_matches_plain_evaluation() {
    let plain = caterpillar_log_likelihood(30, 0.5, false, 11).unwrap();
    let scaled = caterpillar_log_likelihood(30, 0.5, true, 11).unwrap();
    approx_eq(scaled, plain, 1e-9);
}

#[test]
fn long_branches_underflow_without_rescaling_but_not_with_it() {
    let err = caterpillar_log_likelihood(600, 10.0, false, 23).unwrap_err();
    assert_eq!(err, EngineError::FloatingPointError);
    assert_eq!(err.code(), -8);

    let scaled = caterpillar_log_likelihood(600, 10.0, true, 23).unwrap();
    assert!(scaled.is_finite());
    assert!(scaled < 0.0);
}

#[test]
fn auto_scaling_matches_explicit_rescaling() {
    let tip_count = 600usize;
    let internals = tip_count - 1;
    let mut engine = common::dna_engine_with_flags(
        tip_count,
        internals,
        PATTERNS,
        1,
        1,
        0,
        flags::SCALING_AUTO,
    );
    for (i, row) in random_tip_rows(tip_count, 23).iter().enumerate() {
        // Indicator partials make every combine a partials-partials step, the
        // shape the deferred auto-rescale watches.
        let mut flat = Vec::with_capacity(PATTERNS * 4);
        for &state in row {
            flat.extend_from_slice(&common::indicator(state as usize));
        }
        engine.set_tip_partials(i, &flat).unwrap();
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[10.0])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine.set_pattern_weights(&[1.0, 2.0, 1.5]).unwrap();

    engine
        .update_partials(&common::caterpillar_ops(tip_count, false), None)
        .unwrap();
    let root = tip_count + internals - 1;
    let auto = engine
        .calculate_root_log_likelihoods(&[root], &[0], &[0], &[None])
        .unwrap();

    let explicit = caterpillar_log_likelihood(tip_count, 10.0, true, 23).unwrap();
    approx_eq(auto, explicit, 1e-6);
}

#[test]
fn auto_scaling_accepts_compact_tips_and_rejects_scale_slots() {
    let tip_count = 600usize;
    let internals = tip_count - 1;
    let mut engine = common::dna_engine_with_flags(
        tip_count,
        internals,
        PATTERNS,
        1,
        1,
        1,
        flags::SCALING_AUTO,
    );
    for (i, row) in random_tip_rows(tip_count, 23).iter().enumerate() {
        if i == 1 {
            // A compact leaf routes its combine through the states kernel.
            engine.set_tip_states(i, row).unwrap();
        } else {
            let mut flat = Vec::with_capacity(PATTERNS * 4);
            for &state in row {
                flat.extend_from_slice(&common::indicator(state as usize));
            }
            engine.set_tip_partials(i, &flat).unwrap();
        }
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[10.0])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine.set_pattern_weights(&[1.0, 2.0, 1.5]).unwrap();

    // Naming either scale slot is refused outright under auto-scaling.
    let mut ops = common::caterpillar_ops(tip_count, false);
    ops[0].write_scale = Some(0);
    let err = engine.update_partials(&ops, None).unwrap_err();
    assert!(matches!(err, EngineError::NoImplementation { .. }));
    assert_eq!(err.code(), -7);
    ops[0].write_scale = None;
    ops[0].read_scale = Some(0);
    let err = engine.update_partials(&ops, None).unwrap_err();
    assert!(matches!(err, EngineError::NoImplementation { .. }));

    engine
        .update_partials(&common::caterpillar_ops(tip_count, false), None)
        .unwrap();
    let root = tip_count + internals - 1;
    let auto = engine
        .calculate_root_log_likelihoods(&[root], &[0], &[0], &[None])
        .unwrap();
    assert!(auto.is_finite());

    let explicit = caterpillar_log_likelihood(tip_count, 10.0, true, 23).unwrap();
    approx_eq(auto, explicit, 1e-6);
}

#[test]
fn netted_scale_accumulation_leaves_likelihood_unchanged() {
    let tip_count = 30usize;
    let internals = tip_count - 1;
    let mut engine = common::dna_engine(tip_count, internals, PATTERNS, 1, 1, internals + 2);
    for (i, row) in random_tip_rows(tip_count, 5).iter().enumerate() {
        engine.set_tip_states(i, row).unwrap();
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[0.7])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine.set_pattern_weights(&[1.0, 2.0, 1.5]).unwrap();

    let cumulative = internals;
    let spare = internals + 1;
    engine
        .update_partials(&common::caterpillar_ops(tip_count, true), Some(cumulative))
        .unwrap();
    let root = tip_count + internals - 1;
    let baseline = engine
        .calculate_root_log_likelihoods(&[root], &[0], &[0], &[Some(cumulative)])
        .unwrap();

    // Accumulating and then removing the same factors must cancel.
    let per_op: Vec<usize> = (0..internals).collect();
    engine.accumulate_scale_factors(&per_op, cumulative).unwrap();
    engine.remove_scale_factors(&per_op, cumulative).unwrap();
    let after_net_zero = engine
        .calculate_root_log_likelihoods(&[root], &[0], &[0], &[Some(cumulative)])
        .unwrap();
    approx_eq(after_net_zero, baseline, 1e-10);

    // Rebuilding the cumulative from the per-op buffers reproduces it.
    engine.reset_scale_factors(spare).unwrap();
    engine.accumulate_scale_factors(&per_op, spare).unwrap();
    let rebuilt = engine
        .calculate_root_log_likelihoods(&[root], &[0], &[0], &[Some(spare)])
        .unwrap();
    approx_eq(rebuilt, baseline, 1e-10);
}

#[test]
fn scale_factor_copy_reset_and_readback() {
    let tip_count = 4usize;
    let internals = tip_count - 1;
    let mut engine = common::dna_engine(tip_count, internals, PATTERNS, 1, 1, internals + 2);
    for (i, row) in random_tip_rows(tip_count, 9).iter().enumerate() {
        engine.set_tip_states(i, row).unwrap();
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[0.4])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine
        .update_partials(&common::caterpillar_ops(tip_count, true), None)
        .unwrap();

    let spare = internals + 1;
    engine.copy_scale_factors(spare, 0).unwrap();
    let mut original = [0.0f64; PATTERNS];
    let mut copied = [0.0f64; PATTERNS];
    engine.get_scale_factors(0, &mut original).unwrap();
    engine.get_scale_factors(spare, &mut copied).unwrap();
    assert_eq!(original, copied);
    // Rescaling a freshly combined node records a real log factor somewhere.
    assert!(original.iter().any(|&s| s != 0.0));

    engine.reset_scale_factors(spare).unwrap();
    engine.get_scale_factors(spare, &mut copied).unwrap();
    assert_eq!(copied, [0.0; PATTERNS]);
}

#[test]
fn zero_likelihood_surfaces_floating_point_error() {
    let mut engine = common::dna_engine(2, 1, 1, 1, 1, 0);
    engine.set_tip_partials(0, &[0.0; 4]).unwrap();
    engine.set_tip_states(1, &[2]).unwrap();
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0], None, None, &[0.1])
        .unwrap();
    engine.set_category_weights(0, &[1.0]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine
        .update_partials(
            &[Operation {
                destination: 2,
                write_scale: None,
                read_scale: None,
                child1: 0,
                matrix1: 0,
                child2: 1,
                matrix2: 0,
            }],
            None,
        )
        .unwrap();
    let err = engine
        .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
        .unwrap_err();
    assert_eq!(err, EngineError::FloatingPointError);
    assert_eq!(
        engine.get_log_likelihood().unwrap_err(),
        EngineError::FloatingPointError
    );
}
