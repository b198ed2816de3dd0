mod common;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

#[test]
fn derived_matrix_matches_analytic_jc69() {
    let mut engine = common::dna_engine(2, 1, 1, 1, 1, 0);
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine.set_category_rates(&[1.0]).unwrap();

    let t = 0.3;
    engine
        .update_transition_matrices(0, &[0], None, None, &[t])
        .unwrap();
    let mut out = [0.0f64; 16];
    engine.get_transition_matrix(0, &mut out).unwrap();
    for a in 0..4 {
        for b in 0..4 {
            approx_eq(out[a * 4 + b], common::jc69_probability(t, a, b), 1e-12);
        }
    }
}

#[test]
fn derivative_matrices_match_analytic_jc69() {
    let mut engine = common::dna_engine(2, 1, 1, 1, 3, 0);
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine.set_category_rates(&[1.0]).unwrap();

    let t = 0.25;
    engine
        .update_transition_matrices(0, &[0], Some(&[1]), Some(&[2]), &[t])
        .unwrap();

    // P_aa = 1/4 + 3/4 e, P_ab = 1/4 (1 - e) with e = exp(-4t/3), so the
    // derivatives are -e / e/3 and (4/3)e / -(4/9)e respectively.
    let e = (-4.0 * t / 3.0).exp();
    let mut first = [0.0f64; 16];
    let mut second = [0.0f64; 16];
    engine.get_transition_matrix(1, &mut first).unwrap();
    engine.get_transition_matrix(2, &mut second).unwrap();
    for a in 0..4 {
        for b in 0..4 {
            let (d1, d2) = if a == b {
                (-e, 4.0 / 3.0 * e)
            } else {
                (e / 3.0, -4.0 / 9.0 * e)
            };
            approx_eq(first[a * 4 + b], d1, 1e-12);
            approx_eq(second[a * 4 + b], d2, 1e-12);
        }
    }
}

#[test]
fn category_rates_scale_the_edge_length() {
    let mut engine = common::dna_engine(2, 1, 1, 2, 1, 0);
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    let rates = [0.5, 2.0];
    engine.set_category_rates(&rates).unwrap();

    let t = 0.4;
    engine
        .update_transition_matrices(0, &[0], None, None, &[t])
        .unwrap();
    let mut out = [0.0f64; 32];
    engine.get_transition_matrix(0, &mut out).unwrap();
    for (c, &rate) in rates.iter().enumerate() {
        for a in 0..4 {
            for b in 0..4 {
                approx_eq(
                    out[c * 16 + a * 4 + b],
                    common::jc69_probability(t * rate, a, b),
                    1e-12,
                );
            }
        }
    }
}

#[test]
fn convolution_composes_edge_lengths() {
    let mut engine = common::dna_engine(2, 1, 1, 1, 4, 0);
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine
        .update_transition_matrices(0, &[0, 1, 3], None, None, &[0.1, 0.25, 0.35])
        .unwrap();
    engine
        .convolve_transition_matrices(&[0], &[1], &[2])
        .unwrap();

    let mut convolved = [0.0f64; 16];
    let mut direct = [0.0f64; 16];
    engine.get_transition_matrix(2, &mut convolved).unwrap();
    engine.get_transition_matrix(3, &mut direct).unwrap();
    for i in 0..16 {
        approx_eq(convolved[i], direct[i], 1e-12);
    }
}

#[test]
fn multiple_models_batch_matches_individual_derivations() {
    let mut engine = common::dna_engine(2, 1, 1, 2, 4, 0);
    let (v, vinv, values) = common::jc69_eigen();
    engine.set_eigen_decomposition(0, &v, &vinv, &values).unwrap();
    engine.set_eigen_decomposition(1, &v, &vinv, &values).unwrap();
    engine.set_category_rates_with_index(0, &[1.0, 2.0]).unwrap();
    engine.set_category_rates_with_index(1, &[0.5, 1.5]).unwrap();

    let lengths = [0.2, 0.45];
    engine
        .update_transition_matrices_with_multiple_models(
            &[0, 1],
            &[0, 1],
            &[0, 1],
            None,
            None,
            &lengths,
        )
        .unwrap();

    let mut batch = [0.0f64; 32];
    engine.get_transition_matrix(1, &mut batch).unwrap();
    for (c, rate) in [0.5, 1.5].iter().enumerate() {
        for a in 0..4 {
            for b in 0..4 {
                approx_eq(
                    batch[c * 16 + a * 4 + b],
                    common::jc69_probability(lengths[1] * rate, a, b),
                    1e-12,
                );
            }
        }
    }
}

#[test]
fn direct_matrix_upload_round_trips() {
    let mut engine = common::dna_engine(2, 1, 1, 2, 2, 0);
    let uploaded: Vec<f64> = (0..64).map(|i| i as f64 / 7.0).collect();
    engine
        .set_transition_matrices(&[0, 1], &uploaded, &[1.0, 42.0])
        .unwrap();
    let mut out = [0.0f64; 32];
    engine.get_transition_matrix(1, &mut out).unwrap();
    for i in 0..32 {
        assert_eq!(out[i].to_bits(), uploaded[32 + i].to_bits());
    }
}
