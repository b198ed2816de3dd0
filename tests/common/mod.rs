#![allow(dead_code)]

use felsen::{InstanceConfig, LikelihoodEngine, Operation};
use ndarray::{Array1, Array2};

/// Jukes-Cantor eigen-system: the rate matrix `Q = (4/3)(J/4 - I)` has the
/// Hadamard basis as eigenvectors with eigenvalues `(0, -4/3, -4/3, -4/3)`.
pub fn jc69_eigen() -> (Array2<f64>, Array2<f64>, Array1<f64>) {
    let h = [
        [1.0, 1.0, 1.0, 1.0],
        [1.0, 1.0, -1.0, -1.0],
        [1.0, -1.0, 1.0, -1.0],
        [1.0, -1.0, -1.0, 1.0],
    ];
    let vectors = Array2::from_shape_fn((4, 4), |(a, k)| h[a][k]);
    let inverse = Array2::from_shape_fn((4, 4), |(k, b)| h[k][b] / 4.0);
    let values = Array1::from(vec![0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0]);
    (vectors, inverse, values)
}

/// Analytic JC69 transition probability.
pub fn jc69_probability(t: f64, a: usize, b: usize) -> f64 {
    let e = (-4.0 * t / 3.0).exp();
    if a == b {
        0.25 + 0.75 * e
    } else {
        0.25 * (1.0 - e)
    }
}

/// A DNA instance with compact-capable tips and the given internal buffer
/// and matrix/scale pools.
pub fn dna_engine(
    tip_count: usize,
    internal_count: usize,
    pattern_count: usize,
    category_count: usize,
    matrix_count: usize,
    scale_buffer_count: usize,
) -> LikelihoodEngine {
    dna_engine_with_flags(
        tip_count,
        internal_count,
        pattern_count,
        category_count,
        matrix_count,
        scale_buffer_count,
        0,
    )
}

pub fn dna_engine_with_flags(
    tip_count: usize,
    internal_count: usize,
    pattern_count: usize,
    category_count: usize,
    matrix_count: usize,
    scale_buffer_count: usize,
    flags: u64,
) -> LikelihoodEngine {
    LikelihoodEngine::new(InstanceConfig {
        tip_count,
        partials_buffer_count: internal_count,
        compact_buffer_count: tip_count,
        state_count: 4,
        pattern_count,
        eigen_buffer_count: 2,
        matrix_buffer_count: matrix_count,
        category_count,
        scale_buffer_count,
        flags,
    })
    .expect("engine creation failed")
}

/// Ladder-tree peeling: op `i` combines the running internal with tip
/// `i + 1`, every edge sharing matrix 0. With `scaled`, op `i` records its
/// rescale into scale buffer `i`.
pub fn caterpillar_ops(tip_count: usize, scaled: bool) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(tip_count - 1);
    let mut prev = 0usize;
    for i in 0..tip_count - 1 {
        let dest = tip_count + i;
        ops.push(Operation {
            destination: dest,
            write_scale: if scaled { Some(i) } else { None },
            read_scale: None,
            child1: prev,
            matrix1: 0,
            child2: i + 1,
            matrix2: 0,
        });
        prev = dest;
    }
    ops
}

/// Indicator tip partials for a compact state.
pub fn indicator(state: usize) -> [f64; 4] {
    let mut out = [0.0; 4];
    out[state] = 1.0;
    out
}
