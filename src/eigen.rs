use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::buffers::Dims;
use crate::error::{EngineError, Result};

/// A real eigen-decomposition of a substitution rate matrix:
/// `Q = V · diag(λ) · V⁻¹`.
#[derive(Clone, Debug)]
pub(crate) struct EigenSystem {
    pub vectors: Array2<f64>,
    pub inverse: Array2<f64>,
    pub values: Array1<f64>,
}

impl EigenSystem {
    pub fn new(
        states: usize,
        vectors: &Array2<f64>,
        inverse: &Array2<f64>,
        values: &Array1<f64>,
    ) -> Result<Self> {
        let square = [states, states];
        if vectors.shape() != square || inverse.shape() != square || values.len() != states {
            return Err(EngineError::OutOfRange {
                what: "eigen-decomposition dimension",
                index: values.len(),
                limit: states,
            });
        }
        Ok(Self {
            vectors: vectors.clone(),
            inverse: inverse.clone(),
            values: values.clone(),
        })
    }
}

/// Which matrix a derivation call produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DerivOrder {
    Probabilities,
    First,
    Second,
}

impl DerivOrder {
    /// Value written into the padding column: 1.0 keeps ambiguous states
    /// neutral in probability matrices, 0.0 keeps them inert in derivatives.
    fn pad(self) -> f64 {
        match self {
            DerivOrder::Probabilities => 1.0,
            DerivOrder::First | DerivOrder::Second => 0.0,
        }
    }
}

/// Compute `V · diag(f(λ, r_c) · exp(λ t r_c)) · V⁻¹` for every category,
/// laid out as `C` padded `S × S_T` blocks.
pub(crate) fn derive_matrix(
    eigen: &EigenSystem,
    rates: &[f64],
    edge_length: f64,
    order: DerivOrder,
    dims: &Dims,
) -> Vec<f64> {
    let s = dims.states;
    let st = dims.padded_states;
    let pad = order.pad();
    let mut out = vec![0.0f64; dims.matrix_len()];
    let mut diag = vec![0.0f64; s];
    let mut row = vec![0.0f64; s];
    for (c, &rate) in rates.iter().enumerate().take(dims.categories) {
        for k in 0..s {
            let lr = eigen.values[k] * rate;
            let e = (lr * edge_length).exp();
            diag[k] = match order {
                DerivOrder::Probabilities => e,
                DerivOrder::First => lr * e,
                DerivOrder::Second => lr * lr * e,
            };
        }
        let block = &mut out[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        for a in 0..s {
            for k in 0..s {
                row[k] = eigen.vectors[(a, k)] * diag[k];
            }
            let dest = &mut block[a * st..a * st + st];
            for b in 0..s {
                let mut sum = 0.0;
                for k in 0..s {
                    sum += row[k] * eigen.inverse[(k, b)];
                }
                dest[b] = sum;
            }
            dest[s] = pad;
        }
    }
    out
}

/// One entry of a batched matrix-derivation request.
pub(crate) struct MatrixRequest<'a> {
    pub eigen: &'a EigenSystem,
    pub rates: &'a [f64],
    pub edge_length: f64,
    pub prob_index: usize,
    pub first_deriv_index: Option<usize>,
    pub second_deriv_index: Option<usize>,
}

/// Derive all requested matrices, in parallel across the batch when it is
/// large enough to pay for the fan-out. Results are returned (index, data)
/// so the caller can commit them to its buffers in order.
pub(crate) fn derive_batch(requests: &[MatrixRequest<'_>], dims: &Dims) -> Vec<(usize, Vec<f64>)> {
    let derive_one = |req: &MatrixRequest<'_>| {
        let mut produced = Vec::with_capacity(3);
        produced.push((
            req.prob_index,
            derive_matrix(
                req.eigen,
                req.rates,
                req.edge_length,
                DerivOrder::Probabilities,
                dims,
            ),
        ));
        if let Some(ix) = req.first_deriv_index {
            produced.push((
                ix,
                derive_matrix(req.eigen, req.rates, req.edge_length, DerivOrder::First, dims),
            ));
        }
        if let Some(ix) = req.second_deriv_index {
            produced.push((
                ix,
                derive_matrix(req.eigen, req.rates, req.edge_length, DerivOrder::Second, dims),
            ));
        }
        produced
    };
    if requests.len() > 1 {
        requests
            .par_iter()
            .map(derive_one)
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    } else {
        requests.iter().flat_map(derive_one).collect()
    }
}

/// Per-category matrix product `result = first · second` over the unpadded
/// `S × S` blocks; the padding column is restored to 1.0 so convolved
/// matrices keep the ambiguity sentinel intact.
pub(crate) fn convolve(first: &[f64], second: &[f64], dims: &Dims) -> Vec<f64> {
    let s = dims.states;
    let st = dims.padded_states;
    let ms = dims.matrix_stride();
    let mut out = vec![0.0f64; dims.matrix_len()];
    for c in 0..dims.categories {
        let f = &first[c * ms..(c + 1) * ms];
        let g = &second[c * ms..(c + 1) * ms];
        let block = &mut out[c * ms..(c + 1) * ms];
        for a in 0..s {
            for b in 0..s {
                let mut sum = 0.0;
                for k in 0..s {
                    sum += f[a * st + k] * g[k * st + b];
                }
                block[a * st + b] = sum;
            }
            block[a * st + s] = 1.0;
        }
    }
    out
}
