//! Felsenstein combine kernels.
//!
//! Each kernel merges two child likelihood vectors through their transition
//! matrices into a destination partials buffer over a pattern range. Layouts
//! are flat: partials `[c][p][a]` with stride `P' * S` per category, matrices
//! `[c][a][b]` with padded rows of length `S_T = S + 1` whose final column
//! carries the ambiguity pad, so a tip state of `S` selects a neutral column.

use crate::buffers::Dims;

/// Both children are compact tips.
pub(crate) fn combine_states_states(
    dest: &mut [f64],
    states1: &[u32],
    matrices1: &[f64],
    states2: &[u32],
    matrices2: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let s1 = states1[p] as usize;
            let s2 = states2[p] as usize;
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                *v = m1[a * st + s1] * m2[a * st + s2];
            }
        }
    }
}

/// Compact tip × partials buffer.
pub(crate) fn combine_states_partials(
    dest: &mut [f64],
    states1: &[u32],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let s1 = states1[p] as usize;
            let q2 = &partials2[p_off + p * s..p_off + (p + 1) * s];
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                let row2 = &m2[a * st..a * st + s];
                let mut sum2 = 0.0;
                for b in 0..s {
                    sum2 += row2[b] * q2[b];
                }
                *v = m1[a * st + s1] * sum2;
            }
        }
    }
}

/// Partials × partials, the general internal-node case.
pub(crate) fn combine_partials_partials(
    dest: &mut [f64],
    partials1: &[f64],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let q1 = &partials1[p_off + p * s..p_off + (p + 1) * s];
            let q2 = &partials2[p_off + p * s..p_off + (p + 1) * s];
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                let row1 = &m1[a * st..a * st + s];
                let row2 = &m2[a * st..a * st + s];
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for b in 0..s {
                    sum1 += row1[b] * q1[b];
                    sum2 += row2[b] * q2[b];
                }
                *v = sum1 * sum2;
            }
        }
    }
}

/// Undo a previously recorded per-pattern log-scale while combining: each
/// destination entry is divided by `exp(scale[p])`.
pub(crate) fn combine_states_states_fixed(
    dest: &mut [f64],
    states1: &[u32],
    matrices1: &[f64],
    states2: &[u32],
    matrices2: &[f64],
    scale: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let s1 = states1[p] as usize;
            let s2 = states2[p] as usize;
            let inv = (-scale[p]).exp();
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                *v = m1[a * st + s1] * m2[a * st + s2] * inv;
            }
        }
    }
}

pub(crate) fn combine_states_partials_fixed(
    dest: &mut [f64],
    states1: &[u32],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    scale: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let s1 = states1[p] as usize;
            let inv = (-scale[p]).exp();
            let q2 = &partials2[p_off + p * s..p_off + (p + 1) * s];
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                let row2 = &m2[a * st..a * st + s];
                let mut sum2 = 0.0;
                for b in 0..s {
                    sum2 += row2[b] * q2[b];
                }
                *v = m1[a * st + s1] * sum2 * inv;
            }
        }
    }
}

pub(crate) fn combine_partials_partials_fixed(
    dest: &mut [f64],
    partials1: &[f64],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    scale: &[f64],
    dims: &Dims,
    start: usize,
    end: usize,
) {
    let s = dims.states;
    let st = dims.padded_states;
    for c in 0..dims.categories {
        let m1 = &matrices1[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let m2 = &matrices2[c * dims.matrix_stride()..(c + 1) * dims.matrix_stride()];
        let p_off = c * dims.partials_stride();
        for p in start..end {
            let inv = (-scale[p]).exp();
            let q1 = &partials1[p_off + p * s..p_off + (p + 1) * s];
            let q2 = &partials2[p_off + p * s..p_off + (p + 1) * s];
            let d = &mut dest[p_off + p * s..p_off + (p + 1) * s];
            for (a, v) in d.iter_mut().enumerate() {
                let row1 = &m1[a * st..a * st + s];
                let row2 = &m2[a * st..a * st + s];
                let mut sum1 = 0.0;
                let mut sum2 = 0.0;
                for b in 0..s {
                    sum1 += row1[b] * q1[b];
                    sum2 += row2[b] * q2[b];
                }
                *v = sum1 * sum2 * inv;
            }
        }
    }
}

/// Divide each pattern of the freshly written destination by its maximum,
/// recording `ln(max)` into `scale_out` (and adding it to `cumulative` when
/// given). An all-zero pattern records a log-scale of 0 and is left as is.
///
/// Returns true when any pattern maximum was non-finite, so the caller can
/// arm the sticky floating-point error.
pub(crate) fn rescale_partials(
    dest: &mut [f64],
    scale_out: &mut [f64],
    mut cumulative: Option<&mut [f64]>,
    dims: &Dims,
    start: usize,
    end: usize,
) -> bool {
    let s = dims.states;
    let ps = dims.partials_stride();
    let mut nonfinite = false;
    for p in start..end {
        let mut max = 0.0f64;
        for c in 0..dims.categories {
            let block = &dest[c * ps + p * s..c * ps + (p + 1) * s];
            for &v in block {
                if v > max {
                    max = v;
                }
            }
        }
        if !max.is_finite() {
            nonfinite = true;
        }
        if max > 0.0 {
            let inv = 1.0 / max;
            for c in 0..dims.categories {
                let block = &mut dest[c * ps + p * s..c * ps + (p + 1) * s];
                for v in block {
                    *v *= inv;
                }
            }
            let log_scale = max.ln();
            scale_out[p] = log_scale;
            if let Some(cum) = cumulative.as_deref_mut() {
                cum[p] += log_scale;
            }
        } else {
            scale_out[p] = 0.0;
        }
    }
    nonfinite
}

/// Binary exponent of a positive real, `frexp` convention: for finite
/// nonzero `x`, `x = m · 2^e` with `m ∈ [0.5, 1)`. Zero and non-finite
/// values report 0 so they never trigger auto-scaling on their own.
#[inline]
pub(crate) fn exponent_of(x: f64) -> i32 {
    if x == 0.0 || !x.is_finite() {
        return 0;
    }
    let biased = ((x.to_bits() >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // Subnormal, off the fast path.
        x.abs().log2().floor() as i32 + 1
    } else {
        biased - 1022
    }
}

/// Partials × partials with underflow surveillance: after the combine, bump
/// `activate` if any pattern-category maximum drifts past the exponent
/// threshold. The actual rescale is deferred to [`auto_rescale_partials`].
pub(crate) fn combine_partials_partials_auto(
    dest: &mut [f64],
    partials1: &[f64],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    dims: &Dims,
    threshold: i32,
    activate: &mut u32,
) {
    combine_partials_partials(
        dest, partials1, matrices1, partials2, matrices2, dims, 0, dims.padded_patterns,
    );
    let s = dims.states;
    let ps = dims.partials_stride();
    for c in 0..dims.categories {
        for p in 0..dims.padded_patterns {
            let block = &dest[c * ps + p * s..c * ps + (p + 1) * s];
            let mut max = 0.0f64;
            for &v in block {
                if v > max {
                    max = v;
                }
            }
            if exponent_of(max).abs() > threshold {
                *activate += 1;
                return;
            }
        }
    }
}

/// Rescale an auto-scaled buffer: every pattern-category block is divided by
/// `2^e` where `e` is the binary exponent of its maximum, and `e` is stored
/// in the buffer's signed exponent vector.
pub(crate) fn auto_rescale_partials(dest: &mut [f64], exponents: &mut [i16], dims: &Dims) {
    let s = dims.states;
    let ps = dims.partials_stride();
    for c in 0..dims.categories {
        for p in 0..dims.padded_patterns {
            let block = &mut dest[c * ps + p * s..c * ps + (p + 1) * s];
            let mut max = 0.0f64;
            for &v in block.iter() {
                if v > max {
                    max = v;
                }
            }
            let e = exponent_of(max);
            if e != 0 {
                let factor = 2.0f64.powi(-e);
                for v in block {
                    *v *= factor;
                }
            }
            exponents[c * dims.padded_patterns + p] = e as i16;
        }
    }
}
