mod common;

use felsen::{LikelihoodEngine, Operation, PartitionOperation};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const PATTERNS: usize = 10_000;
const ROOT: usize = 6;

fn quartet_engine(patterns: usize) -> LikelihoodEngine {
    let mut engine = common::dna_engine(4, 3, patterns, 2, 6, 4);
    let mut rng = SmallRng::seed_from_u64(77);
    for tip in 0..4 {
        let states: Vec<u32> = (0..patterns).map(|_| rng.gen_range(0..4u32)).collect();
        engine.set_tip_states(tip, &states).unwrap();
    }
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine.set_category_rates(&[0.5, 1.5]).unwrap();
    engine
        .update_transition_matrices(
            0,
            &[0, 1, 2, 3, 4, 5],
            None,
            None,
            &[0.1, 0.3, 0.2, 0.25, 0.15, 0.05],
        )
        .unwrap();
    engine.set_category_weights(0, &[0.7, 0.3]).unwrap();
    engine.set_state_frequencies(0, &[0.25; 4]).unwrap();
    engine
}

fn quartet_ops(scaled: bool) -> [Operation; 3] {
    let op = |destination, child1, matrix1, child2, matrix2, scale| Operation {
        destination,
        write_scale: scale,
        read_scale: None,
        child1,
        matrix1,
        child2,
        matrix2,
    };
    [
        op(4, 0, 0, 1, 1, scaled.then_some(0)),
        op(5, 2, 2, 3, 3, scaled.then_some(1)),
        op(ROOT, 4, 4, 5, 5, scaled.then_some(2)),
    ]
}

fn evaluate(engine: &mut LikelihoodEngine, scaled: bool) -> f64 {
    let cumulative = scaled.then_some(3);
    if let Some(c) = cumulative {
        engine.reset_scale_factors(c).unwrap();
    }
    engine.update_partials(&quartet_ops(scaled), cumulative).unwrap();
    engine
        .calculate_root_log_likelihoods(&[ROOT], &[0], &[0], &[cumulative])
        .unwrap()
}

#[test]
fn threaded_evaluation_is_deterministic_and_matches_serial() {
    let mut serial = quartet_engine(PATTERNS);
    let reference = evaluate(&mut serial, false);

    let mut threaded = quartet_engine(PATTERNS);
    threaded.set_cpu_thread_count(8);
    for _ in 0..10 {
        let sum = evaluate(&mut threaded, false);
        assert_eq!(sum.to_bits(), reference.to_bits());
    }
}

#[test]
fn threaded_rescaling_is_deterministic_and_matches_serial() {
    let mut serial = quartet_engine(PATTERNS);
    let reference = evaluate(&mut serial, true);

    let mut threaded = quartet_engine(PATTERNS);
    threaded.set_cpu_thread_count(4);
    for _ in 0..5 {
        let sum = evaluate(&mut threaded, true);
        assert_eq!(sum.to_bits(), reference.to_bits());
    }
}

#[test]
fn partition_dispatch_with_workers_matches_serial_dispatch() {
    let partition_count = 4usize;
    let assignments: Vec<usize> = (0..PATTERNS)
        .map(|p| p / (PATTERNS / partition_count))
        .collect();

    let run = |threads: usize| {
        let mut engine = quartet_engine(PATTERNS);
        if threads > 1 {
            engine.set_cpu_thread_count(threads);
        }
        engine
            .set_pattern_partitions(partition_count, &assignments)
            .unwrap();
        let mut ops = Vec::new();
        for partition in 0..partition_count {
            for operation in quartet_ops(false) {
                ops.push(PartitionOperation {
                    operation,
                    partition,
                    cumulative_scale: None,
                });
            }
        }
        engine.update_partials_by_partition(&ops).unwrap();
        engine.wait_for_partials(&[4, 5, ROOT]).unwrap();

        let mut by_partition = vec![0.0f64; partition_count];
        let total = engine
            .calculate_root_log_likelihoods_by_partition(
                &[ROOT; 4],
                &[0; 4],
                &[0; 4],
                &[None; 4],
                &[0, 1, 2, 3],
                &mut by_partition,
            )
            .unwrap();
        (total, by_partition)
    };

    let (serial_total, serial_by) = run(1);
    let (threaded_total, threaded_by) = run(8);
    assert_eq!(serial_total.to_bits(), threaded_total.to_bits());
    for (a, b) in serial_by.iter().zip(threaded_by.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn small_problems_stay_serial_but_agree() {
    let patterns = 100usize;
    let mut serial = quartet_engine(patterns);
    let reference = evaluate(&mut serial, false);

    // Below the minimum pattern count the pool is bypassed entirely.
    let mut threaded = quartet_engine(patterns);
    threaded.set_cpu_thread_count(8);
    let sum = evaluate(&mut threaded, false);
    assert_eq!(sum.to_bits(), reference.to_bits());
}
