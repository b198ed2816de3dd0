//! Root and edge reduction kernels.
//!
//! Reductions integrate a partials buffer over rate categories and states,
//! take logs with any accumulated scale added back, and aggregate across
//! patterns by weight. They always run on the caller thread and iterate
//! patterns in slot order, so threaded and serial peeling produce bitwise
//! identical sums.

use crate::buffers::Dims;
use crate::error::{EngineError, Result};

const LN_2: f64 = std::f64::consts::LN_2;

/// Accumulated sums of one reduction over a pattern range.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ReductionSums {
    pub log_likelihood: f64,
    pub first_derivative: f64,
    pub second_derivative: f64,
}

/// Root log-likelihood over `[start, end)` pattern slots.
///
/// Writes per-site logs into `site_out` (indexed by slot) and returns the
/// weighted sum. `scale` holds per-pattern cumulative log-scales, all zeros
/// when scaling is off.
#[allow(clippy::too_many_arguments)]
pub(crate) fn root_log_likelihood(
    partials: &[f64],
    weights: &[f64],
    freqs: &[f64],
    scale: &[f64],
    pattern_weights: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
    integration_tmp: &mut [f64],
    site_out: &mut [f64],
) -> Result<f64> {
    let s = dims.states;
    let ps = dims.partials_stride();
    for (c, &w) in weights.iter().enumerate().take(dims.categories) {
        let cat = &partials[c * ps..];
        if c == 0 {
            for p in start..end {
                for a in 0..s {
                    integration_tmp[p * s + a] = w * cat[p * s + a];
                }
            }
        } else {
            for p in start..end {
                for a in 0..s {
                    integration_tmp[p * s + a] += w * cat[p * s + a];
                }
            }
        }
    }

    let mut sum = 0.0;
    let mut fp_ok = true;
    for p in start..end {
        let mut lik = 0.0;
        for (a, &f) in freqs.iter().enumerate().take(s) {
            lik += f * integration_tmp[p * s + a];
        }
        let site = lik.ln() + scale[p];
        fp_ok &= lik > 0.0 && site.is_finite();
        site_out[p] = site;
        sum += pattern_weights[p] * site;
    }
    if fp_ok {
        Ok(sum)
    } else {
        Err(EngineError::FloatingPointError)
    }
}

/// One root entry of a multi-root (model-averaged) reduction.
pub(crate) struct RootEntry<'a> {
    pub partials: &'a [f64],
    pub weights: &'a [f64],
    pub freqs: &'a [f64],
    pub scale: &'a [f64],
}

/// Weighted mixture over several root buffers: per pattern the entry
/// likelihoods are rebased onto the largest cumulative scale before summing,
/// so entries scaled at different depths combine without overflow.
pub(crate) fn root_log_likelihoods_multi(
    entries: &[RootEntry<'_>],
    pattern_weights: &[f64],
    dims: &Dims,
    site_out: &mut [f64],
) -> Result<f64> {
    let s = dims.states;
    let ps = dims.partials_stride();
    let mut sum = 0.0;
    let mut fp_ok = true;
    for p in 0..dims.patterns {
        let mut max_scale = f64::NEG_INFINITY;
        for entry in entries {
            if entry.scale[p] > max_scale {
                max_scale = entry.scale[p];
            }
        }
        let mut mixture = 0.0;
        for entry in entries {
            let mut lik = 0.0;
            for (c, &w) in entry.weights.iter().enumerate().take(dims.categories) {
                let cat = &entry.partials[c * ps + p * s..c * ps + (p + 1) * s];
                let mut inner = 0.0;
                for (a, &f) in entry.freqs.iter().enumerate().take(s) {
                    inner += f * cat[a];
                }
                lik += w * inner;
            }
            mixture += lik * (entry.scale[p] - max_scale).exp();
        }
        let site = mixture.ln() + max_scale;
        fp_ok &= mixture > 0.0 && site.is_finite();
        site_out[p] = site;
        sum += pattern_weights[p] * site;
    }
    if fp_ok {
        Ok(sum)
    } else {
        Err(EngineError::FloatingPointError)
    }
}

/// Root log-likelihood under auto-scaling: per-pattern-category exponents of
/// every activated buffer are summed, rebased on the per-pattern maximum,
/// and folded back in as `2^e` factors inside the category mixture.
pub(crate) fn root_log_likelihood_auto(
    partials: &[f64],
    weights: &[f64],
    freqs: &[f64],
    exponents: &[&[i16]],
    pattern_weights: &[f64],
    dims: &Dims,
    site_out: &mut [f64],
) -> Result<f64> {
    let s = dims.states;
    let ps = dims.partials_stride();
    let pp = dims.padded_patterns;
    let mut inner = vec![0.0f64; dims.categories];
    let mut exp_total = vec![0i32; dims.categories];
    let mut sum = 0.0;
    let mut fp_ok = true;
    for p in 0..dims.patterns {
        let mut max_exp = i32::MIN;
        for c in 0..dims.categories {
            let mut e = 0i32;
            for buf in exponents {
                e += buf[c * pp + p] as i32;
            }
            exp_total[c] = e;
            if e > max_exp {
                max_exp = e;
            }
            let cat = &partials[c * ps + p * s..c * ps + (p + 1) * s];
            let mut lik = 0.0;
            for (a, &f) in freqs.iter().enumerate().take(s) {
                lik += f * cat[a];
            }
            inner[c] = lik;
        }
        let mut mixture = 0.0;
        for c in 0..dims.categories {
            mixture += weights[c] * inner[c] * 2.0f64.powi(exp_total[c] - max_exp);
        }
        let site = mixture.ln() + max_exp as f64 * LN_2;
        fp_ok &= mixture > 0.0 && site.is_finite();
        site_out[p] = site;
        sum += pattern_weights[p] * site;
    }
    if fp_ok {
        Ok(sum)
    } else {
        Err(EngineError::FloatingPointError)
    }
}

/// The child side of an edge reduction: a partials buffer, or a compact tip
/// whose states index matrix columns directly.
pub(crate) enum EdgeChild<'a> {
    Partials(&'a [f64]),
    States(&'a [u32]),
}

/// Edge log-likelihood (and optional first/second derivatives with respect
/// to the edge length) across `(parent, child)` over `[start, end)` slots.
///
/// Derivative matrices replace the transition matrix in the inner transform
/// only; their pad column is zero, so ambiguous tip states contribute zero
/// slope, matching the derivative of a constant.
#[allow(clippy::too_many_arguments)]
pub(crate) fn edge_log_likelihood(
    parent: &[f64],
    child: &EdgeChild<'_>,
    matrix: &[f64],
    first_deriv: Option<&[f64]>,
    second_deriv: Option<&[f64]>,
    weights: &[f64],
    freqs: &[f64],
    scale: &[f64],
    pattern_weights: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
    integration_tmp: &mut [f64],
    first_deriv_tmp: &mut [f64],
    second_deriv_tmp: &mut [f64],
    site_log_likelihoods: &mut [f64],
    site_first_derivs: &mut [f64],
    site_second_derivs: &mut [f64],
) -> Result<ReductionSums> {
    let s = dims.states;
    let ps = dims.partials_stride();
    for p in start..end {
        integration_tmp[p * s..(p + 1) * s].fill(0.0);
        if first_deriv.is_some() {
            first_deriv_tmp[p * s..(p + 1) * s].fill(0.0);
        }
        if second_deriv.is_some() {
            second_deriv_tmp[p * s..(p + 1) * s].fill(0.0);
        }
    }

    for (c, &w) in weights.iter().enumerate().take(dims.categories) {
        let par = &parent[c * ps..];
        accumulate_edge_category(
            par,
            child,
            &matrix[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()],
            w,
            dims,
            c,
            start,
            end,
            integration_tmp,
        );
        if let Some(d1) = first_deriv {
            accumulate_edge_category(
                par,
                child,
                &d1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()],
                w,
                dims,
                c,
                start,
                end,
                first_deriv_tmp,
            );
        }
        if let Some(d2) = second_deriv {
            accumulate_edge_category(
                par,
                child,
                &d2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()],
                w,
                dims,
                c,
                start,
                end,
                second_deriv_tmp,
            );
        }
    }

    let mut sums = ReductionSums::default();
    let mut fp_ok = true;
    for p in start..end {
        let mut lik = 0.0;
        for (a, &f) in freqs.iter().enumerate().take(s) {
            lik += f * integration_tmp[p * s + a];
        }
        let site = lik.ln() + scale[p];
        fp_ok &= lik > 0.0 && site.is_finite();
        site_log_likelihoods[p] = site;
        sums.log_likelihood += pattern_weights[p] * site;

        if first_deriv.is_some() {
            let mut d1 = 0.0;
            for (a, &f) in freqs.iter().enumerate().take(s) {
                d1 += f * first_deriv_tmp[p * s + a];
            }
            let site_d1 = d1 / lik;
            site_first_derivs[p] = site_d1;
            sums.first_derivative += pattern_weights[p] * site_d1;
            if second_deriv.is_some() {
                let mut d2 = 0.0;
                for (a, &f) in freqs.iter().enumerate().take(s) {
                    d2 += f * second_deriv_tmp[p * s + a];
                }
                let site_d2 = d2 / lik - site_d1 * site_d1;
                site_second_derivs[p] = site_d2;
                sums.second_derivative += pattern_weights[p] * site_d2;
            }
        }
    }
    if fp_ok {
        Ok(sums)
    } else {
        Err(EngineError::FloatingPointError)
    }
}

/// Accumulate `w · Q_parent[c,p,a] · (M Q_child)[c,p,a]` for one category
/// into a per-pattern-state accumulator.
#[allow(clippy::too_many_arguments)]
fn accumulate_edge_category(
    parent_cat: &[f64],
    child: &EdgeChild<'_>,
    matrix_cat: &[f64],
    weight: f64,
    dims: &Dims,
    category: usize,
    start: usize,
    end: usize,
    acc: &mut [f64],
) {
    let s = dims.states;
    let st = dims.padded_states;
    match child {
        EdgeChild::Partials(q) => {
            let q_cat = &q[category * dims.partials_stride()..];
            for p in start..end {
                let qp = &q_cat[p * s..(p + 1) * s];
                let par = &parent_cat[p * s..(p + 1) * s];
                for a in 0..s {
                    let row = &matrix_cat[a * st..a * st + s];
                    let mut inner = 0.0;
                    for b in 0..s {
                        inner += row[b] * qp[b];
                    }
                    acc[p * s + a] += weight * par[a] * inner;
                }
            }
        }
        EdgeChild::States(states) => {
            for p in start..end {
                let sp = states[p] as usize;
                let par = &parent_cat[p * s..(p + 1) * s];
                for a in 0..s {
                    acc[p * s + a] += weight * par[a] * matrix_cat[a * st + sp];
                }
            }
        }
    }
}
