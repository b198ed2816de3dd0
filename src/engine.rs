//! The likelihood-engine instance: buffer ownership, uploads, operation
//! dispatch, and reductions.

use ndarray::{Array1, Array2};

use crate::buffers::{AlignedVec, BufferPool, Dims};
use crate::eigen::{self, EigenSystem, MatrixRequest};
use crate::error::{check_index, EngineError, Result};
use crate::kernels;
use crate::likelihood::{self, EdgeChild, RootEntry};
use crate::partition::PatternLayout;
use crate::pool::{self, JobTicket, WorkerPool};
use crate::scale;

/// Instance creation flags.
pub mod flags {
    /// Use the deferred auto-scaling pathway (signed exponent buffers per
    /// partials buffer) instead of caller-directed rescaling.
    pub const SCALING_AUTO: u64 = 1 << 0;
}

/// Absolute binary exponent beyond which auto-scaling activates for a
/// partials buffer.
const SCALING_EXPONENT_THRESHOLD: i32 = 200;

/// Dimensions and options fixed at instance creation.
#[derive(Clone, Copy, Debug)]
pub struct InstanceConfig {
    /// Number of tips `T`; buffers `[0, T)` hold tip data.
    pub tip_count: usize,
    /// Number of partials-backed buffers (internal nodes plus ambiguous
    /// tips). Total buffer count is `partials_buffer_count +
    /// compact_buffer_count`.
    pub partials_buffer_count: usize,
    /// Number of tips expected to carry compact state sequences.
    pub compact_buffer_count: usize,
    /// State count `S`.
    pub state_count: usize,
    /// Pattern count `P`.
    pub pattern_count: usize,
    /// Eigen-decomposition slot count `E`.
    pub eigen_buffer_count: usize,
    /// Transition-matrix buffer count `M`.
    pub matrix_buffer_count: usize,
    /// Rate-category count `C`.
    pub category_count: usize,
    /// Scale buffer count `K`.
    pub scale_buffer_count: usize,
    /// Bitwise OR of [`flags`] values.
    pub flags: u64,
}

/// One peeling step: combine `child1` and `child2` through their transition
/// matrices into `destination`.
///
/// `write_scale` rescales the destination afterwards, recording per-pattern
/// log factors into that scale buffer; `read_scale` instead divides the
/// result by previously recorded factors.
#[derive(Clone, Copy, Debug)]
pub struct Operation {
    pub destination: usize,
    pub write_scale: Option<usize>,
    pub read_scale: Option<usize>,
    pub child1: usize,
    pub matrix1: usize,
    pub child2: usize,
    pub matrix2: usize,
}

/// A peeling step restricted to one partition's pattern range.
#[derive(Clone, Copy, Debug)]
pub struct PartitionOperation {
    pub operation: Operation,
    pub partition: usize,
    /// Cumulative scale buffer receiving this destination's rescale factors.
    pub cumulative_scale: Option<usize>,
}

// Raw-pointer carriers for kernel inputs handed to worker jobs. The pointers
// target instance-owned allocations that are created once and never moved;
// jobs run over disjoint pattern ranges, and every entry point that touches
// buffers waits for outstanding jobs first.
#[derive(Clone, Copy)]
struct ConstPtr(*const f64);
unsafe impl Send for ConstPtr {}

#[derive(Clone, Copy)]
struct MutPtr(*mut f64);
unsafe impl Send for MutPtr {}

#[derive(Clone, Copy)]
struct StatesPtr(*const u32);
unsafe impl Send for StatesPtr {}

#[derive(Clone, Copy)]
enum ChildSrc {
    States(StatesPtr),
    Partials(ConstPtr),
}

/// An operation with every index resolved to kernel inputs.
#[derive(Clone, Copy)]
struct ResolvedOp {
    dest: MutPtr,
    child1: ChildSrc,
    matrix1: ConstPtr,
    child2: ChildSrc,
    matrix2: ConstPtr,
    read_scale: Option<ConstPtr>,
    write_scale: Option<MutPtr>,
    cumulative: Option<MutPtr>,
}

/// Execute one resolved operation over `[start, end)` pattern slots.
///
/// # Safety
/// All pointers must target live instance buffers of the lengths implied by
/// `dims`, the destination must be distinct from both children, and no other
/// thread may touch the destination's `[start, end)` slots (or the same
/// range of the write-scale/cumulative buffers) concurrently.
unsafe fn run_resolved(op: ResolvedOp, dims: Dims, start: usize, end: usize) -> Result<()> {
    let dest = std::slice::from_raw_parts_mut(op.dest.0, dims.partials_len());
    let m1 = std::slice::from_raw_parts(op.matrix1.0, dims.matrix_len());
    let m2 = std::slice::from_raw_parts(op.matrix2.0, dims.matrix_len());
    let read_scale = op
        .read_scale
        .map(|p| std::slice::from_raw_parts(p.0, dims.padded_patterns));

    match (op.child1, op.child2) {
        (ChildSrc::States(s1), ChildSrc::States(s2)) => {
            let s1 = std::slice::from_raw_parts(s1.0, dims.padded_patterns);
            let s2 = std::slice::from_raw_parts(s2.0, dims.padded_patterns);
            match read_scale {
                Some(sc) => kernels::combine_states_states_fixed(
                    dest, s1, m1, s2, m2, sc, &dims, start, end,
                ),
                None => kernels::combine_states_states(dest, s1, m1, s2, m2, &dims, start, end),
            }
        }
        (ChildSrc::States(s1), ChildSrc::Partials(q2)) => {
            let s1 = std::slice::from_raw_parts(s1.0, dims.padded_patterns);
            let q2 = std::slice::from_raw_parts(q2.0, dims.partials_len());
            match read_scale {
                Some(sc) => kernels::combine_states_partials_fixed(
                    dest, s1, m1, q2, m2, sc, &dims, start, end,
                ),
                None => kernels::combine_states_partials(dest, s1, m1, q2, m2, &dims, start, end),
            }
        }
        (ChildSrc::Partials(q1), ChildSrc::States(s2)) => {
            let s2 = std::slice::from_raw_parts(s2.0, dims.padded_patterns);
            let q1 = std::slice::from_raw_parts(q1.0, dims.partials_len());
            match read_scale {
                Some(sc) => kernels::combine_states_partials_fixed(
                    dest, s2, m2, q1, m1, sc, &dims, start, end,
                ),
                None => kernels::combine_states_partials(dest, s2, m2, q1, m1, &dims, start, end),
            }
        }
        (ChildSrc::Partials(q1), ChildSrc::Partials(q2)) => {
            let q1 = std::slice::from_raw_parts(q1.0, dims.partials_len());
            let q2 = std::slice::from_raw_parts(q2.0, dims.partials_len());
            match read_scale {
                Some(sc) => kernels::combine_partials_partials_fixed(
                    dest, q1, m1, q2, m2, sc, &dims, start, end,
                ),
                None => kernels::combine_partials_partials(dest, q1, m1, q2, m2, &dims, start, end),
            }
        }
    }

    if let Some(ws) = op.write_scale {
        let ws = std::slice::from_raw_parts_mut(ws.0, dims.padded_patterns);
        let cum = op
            .cumulative
            .map(|p| std::slice::from_raw_parts_mut(p.0, dims.padded_patterns));
        if kernels::rescale_partials(dest, ws, cum, &dims, start, end) {
            return Err(EngineError::FloatingPointError);
        }
    }
    Ok(())
}

/// Sums cached by the most recent reduction.
struct CachedResults {
    log_likelihood: f64,
    first_derivative: Option<f64>,
    second_derivative: Option<f64>,
}

/// A CPU-resident phylogenetic likelihood evaluation instance.
///
/// All storage is allocated at creation; evaluation never allocates. One
/// caller thread drives the instance; worker threads only execute peeling
/// jobs handed to them by [`update_partials`](Self::update_partials) and
/// [`update_partials_by_partition`](Self::update_partials_by_partition).
pub struct LikelihoodEngine {
    dims: Dims,
    tip_count: usize,
    buffer_count: usize,
    auto_scaling: bool,
    bufs: BufferPool,
    layout: PatternLayout,
    eigens: Vec<Option<EigenSystem>>,
    category_rates: Vec<Vec<f64>>,
    category_weights: Vec<Option<Vec<f64>>>,
    state_frequencies: Vec<Option<Vec<f64>>>,
    workers: Option<WorkerPool>,
    /// Total shares available to a dispatch (workers + the caller thread).
    thread_count: usize,
    min_pattern_count: usize,
    outstanding: Vec<(Vec<usize>, JobTicket)>,
    sticky_error: Option<EngineError>,
    cached: Option<CachedResults>,
    last_error: Option<EngineError>,
}

impl LikelihoodEngine {
    pub fn new(config: InstanceConfig) -> Result<Self> {
        if config.state_count < 1 || config.pattern_count < 1 || config.category_count < 1 {
            return Err(EngineError::OutOfRange {
                what: "instance dimension",
                index: 0,
                limit: 1,
            });
        }
        let buffer_count = config.partials_buffer_count + config.compact_buffer_count;
        if config.tip_count > buffer_count || config.compact_buffer_count > config.tip_count {
            return Err(EngineError::OutOfRange {
                what: "tip count",
                index: config.tip_count,
                limit: buffer_count,
            });
        }
        let auto_scaling = config.flags & flags::SCALING_AUTO != 0;
        let dims = Dims::new(
            config.state_count,
            config.pattern_count,
            config.category_count,
        );
        let bufs = BufferPool::new(
            &dims,
            config.tip_count,
            buffer_count,
            config.matrix_buffer_count,
            config.scale_buffer_count,
            auto_scaling,
        )?;
        log::debug!(
            "created instance: {} states, {} patterns ({} padded), {} categories, \
             {} buffers ({} tips), {} matrices, {} scale buffers, auto-scaling {}",
            dims.states,
            dims.patterns,
            dims.padded_patterns,
            dims.categories,
            buffer_count,
            config.tip_count,
            config.matrix_buffer_count,
            config.scale_buffer_count,
            auto_scaling,
        );
        Ok(Self {
            dims,
            tip_count: config.tip_count,
            buffer_count,
            auto_scaling,
            bufs,
            layout: PatternLayout::identity(config.pattern_count),
            eigens: vec![None; config.eigen_buffer_count],
            category_rates: vec![vec![1.0; config.category_count]; config.eigen_buffer_count.max(1)],
            category_weights: vec![None; config.eigen_buffer_count.max(1)],
            state_frequencies: vec![None; config.eigen_buffer_count.max(1)],
            workers: None,
            thread_count: 1,
            min_pattern_count: usize::MAX,
            outstanding: Vec::new(),
            sticky_error: None,
            cached: None,
            last_error: None,
        })
    }

    /// Number of partitions currently defined.
    pub fn partition_count(&self) -> usize {
        self.layout.partition_count()
    }

    /// Whether defining partitions has permuted the internal pattern order.
    /// Caller-facing indices are unaffected either way.
    pub fn patterns_reordered(&self) -> bool {
        self.layout.reordered()
    }

    /// Configure the worker pool. `0` resolves to the machine's available
    /// parallelism; `1` disables threading. Safe to call between dispatches.
    pub fn set_cpu_thread_count(&mut self, thread_count: usize) {
        self.wait_all_internal();
        let hw = std::thread::available_parallelism().map_or(1, |n| n.get());
        let resolved = if thread_count == 0 { hw } else { thread_count };
        self.thread_count = resolved;
        self.min_pattern_count = pool::min_pattern_count(hw);
        self.workers = if resolved > 1 {
            Some(WorkerPool::new(resolved - 1))
        } else {
            None
        };
        log::debug!(
            "thread count set to {resolved} (hw {hw}, min pattern count {})",
            self.min_pattern_count
        );
    }

    // ---- uploads ---------------------------------------------------------

    /// Upload a compact state sequence for a tip. Values greater than `S`
    /// clamp to `S`, the total-ambiguity sentinel.
    pub fn set_tip_states(&mut self, tip_index: usize, states: &[u32]) -> Result<()> {
        self.wait_all_internal();
        check_index("tip", tip_index, self.tip_count)?;
        self.check_input_len("tip states", states.len(), self.dims.patterns)?;
        let s = self.dims.states as u32;
        let mut stored = vec![0u32; self.dims.padded_patterns];
        for slot in 0..self.dims.patterns {
            let v = states[self.layout.original_of(slot)];
            stored[slot] = v.min(s);
        }
        for slot in self.dims.patterns..self.dims.padded_patterns {
            stored[slot] = stored[0];
        }
        self.bufs.tip_states[tip_index] = Some(stored);
        self.bufs.partials[tip_index] = None;
        Ok(())
    }

    /// Upload per-state tip likelihoods (`S * P`, pattern-major) for an
    /// ambiguous tip; the same values are replicated across categories.
    pub fn set_tip_partials(&mut self, tip_index: usize, partials: &[f64]) -> Result<()> {
        self.wait_all_internal();
        check_index("tip", tip_index, self.tip_count)?;
        self.check_input_len(
            "tip partials",
            partials.len(),
            self.dims.patterns * self.dims.states,
        )?;
        let buf = self.fill_partials_buffer(partials)?;
        self.bufs.partials[tip_index] = Some(buf);
        self.bufs.tip_states[tip_index] = None;
        Ok(())
    }

    /// Upload partials (`S * P`, pattern-major) into any buffer, replicated
    /// across categories.
    pub fn set_partials(&mut self, buffer_index: usize, partials: &[f64]) -> Result<()> {
        self.wait_all_internal();
        check_index("partials buffer", buffer_index, self.buffer_count)?;
        self.check_input_len(
            "partials",
            partials.len(),
            self.dims.patterns * self.dims.states,
        )?;
        let buf = self.fill_partials_buffer(partials)?;
        self.bufs.partials[buffer_index] = Some(buf);
        if buffer_index < self.tip_count {
            self.bufs.tip_states[buffer_index] = None;
        }
        Ok(())
    }

    /// Read back category 0 of a partials buffer in the caller's original
    /// pattern order. With a scale index, recorded log-scales are multiplied
    /// back in so the values are unscaled conditionals.
    pub fn get_partials(
        &mut self,
        buffer_index: usize,
        scale_index: Option<usize>,
        out: &mut [f64],
    ) -> Result<()> {
        self.wait_all_internal();
        check_index("partials buffer", buffer_index, self.buffer_count)?;
        if let Some(k) = scale_index {
            check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
        }
        self.check_input_len(
            "partials output",
            out.len(),
            self.dims.patterns * self.dims.states,
        )?;
        let s = self.dims.states;
        let src = self.bufs.partials[buffer_index]
            .as_ref()
            .ok_or(EngineError::OutOfRange {
                what: "partials-backed buffer",
                index: buffer_index,
                limit: self.buffer_count,
            })?;
        for slot in 0..self.dims.patterns {
            let orig = self.layout.original_of(slot);
            let factor = match scale_index {
                Some(k) => self.bufs.scale_buffers[k][slot].exp(),
                None => 1.0,
            };
            for a in 0..s {
                out[orig * s + a] = src[slot * s + a] * factor;
            }
        }
        Ok(())
    }

    pub fn set_eigen_decomposition(
        &mut self,
        eigen_index: usize,
        vectors: &Array2<f64>,
        inverse_vectors: &Array2<f64>,
        values: &Array1<f64>,
    ) -> Result<()> {
        check_index("eigen-decomposition", eigen_index, self.eigens.len())?;
        self.eigens[eigen_index] = Some(EigenSystem::new(
            self.dims.states,
            vectors,
            inverse_vectors,
            values,
        )?);
        Ok(())
    }

    pub fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()> {
        check_index("state frequencies", index, self.state_frequencies.len())?;
        self.check_input_len("state frequencies", frequencies.len(), self.dims.states)?;
        self.state_frequencies[index] = Some(frequencies.to_vec());
        Ok(())
    }

    pub fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        check_index("category weights", index, self.category_weights.len())?;
        self.check_input_len("category weights", weights.len(), self.dims.categories)?;
        self.category_weights[index] = Some(weights.to_vec());
        Ok(())
    }

    /// Upload rates for category-rate index 0.
    pub fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        self.set_category_rates_with_index(0, rates)
    }

    pub fn set_category_rates_with_index(&mut self, index: usize, rates: &[f64]) -> Result<()> {
        check_index("category rates", index, self.category_rates.len())?;
        self.check_input_len("category rates", rates.len(), self.dims.categories)?;
        self.category_rates[index] = rates.to_vec();
        Ok(())
    }

    /// Upload pattern weights in original pattern order.
    pub fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.wait_all_internal();
        self.check_input_len("pattern weights", weights.len(), self.dims.patterns)?;
        for slot in 0..self.dims.patterns {
            self.bufs.pattern_weights[slot] = weights[self.layout.original_of(slot)];
        }
        // Padding patterns replicate data but never carry weight.
        for slot in self.dims.patterns..self.dims.padded_patterns {
            self.bufs.pattern_weights[slot] = 0.0;
        }
        Ok(())
    }

    /// Assign each pattern (original order) to a partition and regroup
    /// storage so partitions occupy contiguous pattern ranges.
    pub fn set_pattern_partitions(
        &mut self,
        partition_count: usize,
        assignments: &[usize],
    ) -> Result<()> {
        self.wait_all_internal();
        let plan = self.layout.set_partitions(partition_count, assignments)?;
        if plan.changed {
            log::debug!("patterns reordered into {partition_count} contiguous partitions");
            let gather = &plan.gather;
            let dims = self.dims;
            let patterns = dims.patterns;

            let mut weights = vec![0.0f64; patterns];
            weights.copy_from_slice(&self.bufs.pattern_weights[..patterns]);
            for slot in 0..patterns {
                self.bufs.pattern_weights[slot] = weights[gather[slot]];
            }

            for states in self.bufs.tip_states.iter_mut().flatten() {
                let old: Vec<u32> = states[..patterns].to_vec();
                for slot in 0..patterns {
                    states[slot] = old[gather[slot]];
                }
                for slot in patterns..dims.padded_patterns {
                    states[slot] = states[0];
                }
            }

            let s = dims.states;
            let ps = dims.partials_stride();
            let mut row = vec![0.0f64; patterns * s];
            for buf in self.bufs.partials.iter_mut().flatten() {
                for c in 0..dims.categories {
                    let cat = &mut buf[c * ps..c * ps + ps];
                    row[..patterns * s].copy_from_slice(&cat[..patterns * s]);
                    for slot in 0..patterns {
                        let from = gather[slot];
                        cat[slot * s..(slot + 1) * s]
                            .copy_from_slice(&row[from * s..(from + 1) * s]);
                    }
                    for slot in patterns..dims.padded_patterns {
                        let (head, tail) = cat.split_at_mut(slot * s);
                        tail[..s].copy_from_slice(&head[..s]);
                    }
                }
            }
        }
        Ok(())
    }

    // ---- transition matrices ---------------------------------------------

    /// Derive transition (and optional derivative) matrices for a batch of
    /// edge lengths from one eigen-decomposition, using category-rate
    /// index 0.
    pub fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let count = probability_indices.len();
        let eigens = vec![eigen_index; count];
        let rates = vec![0usize; count];
        self.update_transition_matrices_with_multiple_models(
            &eigens,
            &rates,
            probability_indices,
            first_derivative_indices,
            second_derivative_indices,
            edge_lengths,
        )
    }

    /// Batched matrix derivation with per-entry eigen-decomposition and
    /// category-rate indices.
    pub fn update_transition_matrices_with_multiple_models(
        &mut self,
        eigen_indices: &[usize],
        category_rate_indices: &[usize],
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let count = probability_indices.len();
        if count == 0 {
            return Ok(());
        }
        if eigen_indices.len() != count
            || category_rate_indices.len() != count
            || edge_lengths.len() != count
            || first_derivative_indices.is_some_and(|d| d.len() != count)
            || second_derivative_indices.is_some_and(|d| d.len() != count)
        {
            return Err(EngineError::OutOfRange {
                what: "matrix batch length",
                index: count,
                limit: count,
            });
        }
        let matrix_count = self.bufs.matrices.len();
        let mut requests = Vec::with_capacity(count);
        for i in 0..count {
            check_index("eigen-decomposition", eigen_indices[i], self.eigens.len())?;
            check_index("category rates", category_rate_indices[i], self.category_rates.len())?;
            check_index("transition matrix", probability_indices[i], matrix_count)?;
            let first = match first_derivative_indices {
                Some(d) => {
                    check_index("transition matrix", d[i], matrix_count)?;
                    Some(d[i])
                }
                None => None,
            };
            let second = match second_derivative_indices {
                Some(d) => {
                    check_index("transition matrix", d[i], matrix_count)?;
                    Some(d[i])
                }
                None => None,
            };
            let eigen = self.eigens[eigen_indices[i]]
                .as_ref()
                .ok_or(EngineError::OutOfRange {
                    what: "uninitialized eigen-decomposition",
                    index: eigen_indices[i],
                    limit: self.eigens.len(),
                })?;
            requests.push(MatrixRequest {
                eigen,
                rates: &self.category_rates[category_rate_indices[i]],
                edge_length: edge_lengths[i],
                prob_index: probability_indices[i],
                first_deriv_index: first,
                second_deriv_index: second,
            });
        }
        let derived = eigen::derive_batch(&requests, &self.dims);
        drop(requests);
        for (index, data) in derived {
            self.bufs.matrices[index].copy_from_slice(&data);
        }
        Ok(())
    }

    /// Per-category matrix products `result = first · second` (epoch
    /// models). Entries execute in order, so a result may feed a later entry.
    pub fn convolve_transition_matrices(
        &mut self,
        first_indices: &[usize],
        second_indices: &[usize],
        result_indices: &[usize],
    ) -> Result<()> {
        let count = result_indices.len();
        if first_indices.len() != count || second_indices.len() != count {
            return Err(EngineError::OutOfRange {
                what: "convolution batch length",
                index: count,
                limit: count,
            });
        }
        let matrix_count = self.bufs.matrices.len();
        for i in 0..count {
            check_index("transition matrix", first_indices[i], matrix_count)?;
            check_index("transition matrix", second_indices[i], matrix_count)?;
            check_index("transition matrix", result_indices[i], matrix_count)?;
            let product = eigen::convolve(
                &self.bufs.matrices[first_indices[i]],
                &self.bufs.matrices[second_indices[i]],
                &self.dims,
            );
            self.bufs.matrices[result_indices[i]].copy_from_slice(&product);
        }
        Ok(())
    }

    /// Upload a transition matrix directly (`C * S * S`, unpadded); the pad
    /// column is filled with `padded_value`.
    pub fn set_transition_matrix(
        &mut self,
        matrix_index: usize,
        matrix: &[f64],
        padded_value: f64,
    ) -> Result<()> {
        check_index("transition matrix", matrix_index, self.bufs.matrices.len())?;
        let s = self.dims.states;
        let st = self.dims.padded_states;
        self.check_input_len("transition matrix", matrix.len(), self.dims.categories * s * s)?;
        let dest = &mut self.bufs.matrices[matrix_index];
        for c in 0..self.dims.categories {
            for a in 0..s {
                let src = &matrix[c * s * s + a * s..c * s * s + (a + 1) * s];
                let row = &mut dest[c * self.dims.matrix_stride() + a * st..];
                row[..s].copy_from_slice(src);
                row[s] = padded_value;
            }
        }
        Ok(())
    }

    /// Batch form of [`set_transition_matrix`](Self::set_transition_matrix).
    pub fn set_transition_matrices(
        &mut self,
        matrix_indices: &[usize],
        matrices: &[f64],
        padded_values: &[f64],
    ) -> Result<()> {
        let count = matrix_indices.len();
        let one = self.dims.categories * self.dims.states * self.dims.states;
        if matrices.len() != count * one || padded_values.len() != count {
            return Err(EngineError::OutOfRange {
                what: "matrix batch length",
                index: matrices.len(),
                limit: count * one,
            });
        }
        for (i, &index) in matrix_indices.iter().enumerate() {
            self.set_transition_matrix(index, &matrices[i * one..(i + 1) * one], padded_values[i])?;
        }
        Ok(())
    }

    /// Read back a transition matrix without its pad column.
    pub fn get_transition_matrix(&self, matrix_index: usize, out: &mut [f64]) -> Result<()> {
        check_index("transition matrix", matrix_index, self.bufs.matrices.len())?;
        let s = self.dims.states;
        let st = self.dims.padded_states;
        self.check_input_len(
            "transition matrix output",
            out.len(),
            self.dims.categories * s * s,
        )?;
        let src = &self.bufs.matrices[matrix_index];
        for c in 0..self.dims.categories {
            for a in 0..s {
                let row = &src[c * self.dims.matrix_stride() + a * st..];
                out[c * s * s + a * s..c * s * s + (a + 1) * s].copy_from_slice(&row[..s]);
            }
        }
        Ok(())
    }

    // ---- peeling ---------------------------------------------------------

    /// Execute a topologically ordered batch of peeling operations over the
    /// full pattern range, optionally accumulating every rescale into one
    /// cumulative scale buffer. Returns after all work completes.
    ///
    /// Under auto-scaling the exponent pathway owns all underflow handling:
    /// operations must leave `write_scale` and `read_scale` unset, or the
    /// batch is rejected with `NoImplementation`.
    pub fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale_index: Option<usize>,
    ) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        self.wait_all_internal();
        if let Some(k) = cumulative_scale_index {
            check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
        }
        for op in operations {
            self.validate_operation(op)?;
        }
        if self.auto_scaling {
            for op in operations {
                if op.write_scale.is_some() || op.read_scale.is_some() {
                    return Err(EngineError::NoImplementation {
                        what: "caller-directed rescaling combined with auto-scaling",
                    });
                }
            }
            for op in operations {
                self.execute_auto_op(op)?;
            }
            return Ok(());
        }

        let dims = self.dims;
        let shares = pool::plan_shares(
            self.thread_count,
            dims.padded_patterns,
            self.min_pattern_count,
        );
        let resolved: Vec<ResolvedOp> = operations
            .iter()
            .map(|op| self.resolve_op(op, cumulative_scale_index))
            .collect::<Result<_>>()?;

        if shares <= 1 || self.workers.is_none() {
            for op in &resolved {
                // SAFETY: buffers are instance-owned and stable; children are
                // validated distinct from the destination; no jobs in flight.
                if let Err(e) = unsafe { run_resolved(*op, dims, 0, dims.padded_patterns) } {
                    self.sticky_error.get_or_insert(e);
                }
            }
            return Ok(());
        }

        let workers = self.workers.as_ref().expect("checked above");
        let chunk = dims.padded_patterns.div_ceil(shares);
        let mut tickets = Vec::with_capacity(shares - 1);
        for t in 0..shares - 1 {
            let start = t * chunk;
            let end = ((t + 1) * chunk).min(dims.padded_patterns);
            let ops = resolved.clone();
            tickets.push(workers.submit(
                t % workers.worker_count(),
                Box::new(move || {
                    for op in &ops {
                        // SAFETY: each share owns a disjoint pattern range of
                        // every destination, and ops run in submitted order
                        // within the share.
                        unsafe { run_resolved(*op, dims, start, end)? };
                    }
                    Ok(())
                }),
            ));
        }
        let start = (shares - 1) * chunk;
        let end = dims.padded_patterns;
        for op in &resolved {
            // SAFETY: the caller's share is disjoint from every worker share.
            if let Err(e) = unsafe { run_resolved(*op, dims, start, end.max(start)) } {
                self.sticky_error.get_or_insert(e);
            }
        }
        for ticket in tickets {
            if let Err(e) = ticket.wait() {
                self.sticky_error.get_or_insert(e);
            }
        }
        Ok(())
    }

    /// Dispatch partition-tagged operations across the worker pool. Unlike
    /// [`update_partials`](Self::update_partials) this does not block;
    /// callers that recycle buffers synchronize with
    /// [`wait_for_partials`](Self::wait_for_partials) or [`block`](Self::block).
    pub fn update_partials_by_partition(&mut self, operations: &[PartitionOperation]) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        if self.auto_scaling {
            return Err(EngineError::NoImplementation {
                what: "auto-scaling combined with partition-restricted peeling",
            });
        }
        self.wait_all_internal();
        for op in operations {
            self.validate_operation(&op.operation)?;
            self.layout.range(op.partition)?;
            if let Some(k) = op.cumulative_scale {
                check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
            }
        }

        let dims = self.dims;
        // Group by partition, preserving submission order within each group.
        let mut groups: Vec<(usize, Vec<ResolvedOp>, Vec<usize>)> = Vec::new();
        for op in operations {
            let resolved = self.resolve_op(&op.operation, op.cumulative_scale)?;
            match groups.iter_mut().find(|(p, _, _)| *p == op.partition) {
                Some((_, ops, dests)) => {
                    ops.push(resolved);
                    dests.push(op.operation.destination);
                }
                None => groups.push((
                    op.partition,
                    vec![resolved],
                    vec![op.operation.destination],
                )),
            }
        }

        match &self.workers {
            None => {
                for (partition, ops, _) in &groups {
                    let (start, end) = self.layout.range(*partition)?;
                    for op in ops {
                        // SAFETY: serial execution, validated indices.
                        if let Err(e) = unsafe { run_resolved(*op, dims, start, end) } {
                            self.sticky_error.get_or_insert(e);
                        }
                    }
                }
            }
            Some(workers) => {
                for (i, (partition, ops, dests)) in groups.into_iter().enumerate() {
                    let (start, end) = self.layout.range(partition)?;
                    let ticket = workers.submit(
                        i % workers.worker_count(),
                        Box::new(move || {
                            for op in &ops {
                                // SAFETY: partitions own disjoint pattern
                                // ranges, so concurrent groups never touch the
                                // same destination slots.
                                unsafe { run_resolved(*op, dims, start, end)? };
                            }
                            Ok(())
                        }),
                    );
                    self.outstanding.push((dests, ticket));
                }
            }
        }
        Ok(())
    }

    /// Wait for all in-flight jobs that write any of the listed destination
    /// buffers. Surfaces the first job failure.
    pub fn wait_for_partials(&mut self, destination_indices: &[usize]) -> Result<()> {
        let mut first_error = None;
        let mut remaining = Vec::with_capacity(self.outstanding.len());
        for (dests, ticket) in self.outstanding.drain(..) {
            if dests.iter().any(|d| destination_indices.contains(d)) {
                if let Err(e) = ticket.wait() {
                    first_error.get_or_insert(e);
                }
            } else {
                remaining.push((dests, ticket));
            }
        }
        self.outstanding = remaining;
        if let Some(e) = first_error {
            self.sticky_error.get_or_insert(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Wait for every outstanding job. Surfaces the first job failure.
    pub fn block(&mut self) -> Result<()> {
        let mut first_error = None;
        for (_, ticket) in self.outstanding.drain(..) {
            if let Err(e) = ticket.wait() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            self.sticky_error.get_or_insert(e.clone());
            return Err(e);
        }
        Ok(())
    }

    // ---- scale bookkeeping -----------------------------------------------

    pub fn accumulate_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
    ) -> Result<()> {
        self.scale_op(scale_indices, cumulative_index, None, scale::accumulate)
    }

    pub fn accumulate_scale_factors_by_partition(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.scale_op(
            scale_indices,
            cumulative_index,
            Some(partition),
            scale::accumulate,
        )
    }

    pub fn remove_scale_factors(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
    ) -> Result<()> {
        self.scale_op(scale_indices, cumulative_index, None, scale::remove)
    }

    pub fn remove_scale_factors_by_partition(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.scale_op(
            scale_indices,
            cumulative_index,
            Some(partition),
            scale::remove,
        )
    }

    pub fn reset_scale_factors(&mut self, cumulative_index: usize) -> Result<()> {
        self.wait_all_internal();
        check_index("scale buffer", cumulative_index, self.bufs.scale_buffers.len())?;
        scale::reset(
            &mut self.bufs.scale_buffers[cumulative_index],
            0,
            self.dims.padded_patterns,
        );
        Ok(())
    }

    pub fn reset_scale_factors_by_partition(
        &mut self,
        cumulative_index: usize,
        partition: usize,
    ) -> Result<()> {
        self.wait_all_internal();
        check_index("scale buffer", cumulative_index, self.bufs.scale_buffers.len())?;
        let (start, end) = self.layout.range(partition)?;
        scale::reset(&mut self.bufs.scale_buffers[cumulative_index], start, end);
        Ok(())
    }

    pub fn copy_scale_factors(&mut self, dest_index: usize, source_index: usize) -> Result<()> {
        self.wait_all_internal();
        check_index("scale buffer", dest_index, self.bufs.scale_buffers.len())?;
        check_index("scale buffer", source_index, self.bufs.scale_buffers.len())?;
        if dest_index == source_index {
            return Ok(());
        }
        let padded_patterns = self.dims.padded_patterns;
        let (dest, src) = self.scale_pair(dest_index, source_index);
        scale::copy(dest, src, 0, padded_patterns);
        Ok(())
    }

    /// Read per-pattern log-scale factors in original pattern order.
    pub fn get_scale_factors(&mut self, source_index: usize, out: &mut [f64]) -> Result<()> {
        self.wait_all_internal();
        check_index("scale buffer", source_index, self.bufs.scale_buffers.len())?;
        self.check_input_len("scale factors output", out.len(), self.dims.patterns)?;
        for slot in 0..self.dims.patterns {
            out[self.layout.original_of(slot)] = self.bufs.scale_buffers[source_index][slot];
        }
        Ok(())
    }

    // ---- reductions ------------------------------------------------------

    /// Root log-likelihood. One entry evaluates a single root buffer; several
    /// entries form a model-averaged mixture across roots. Returns the
    /// pattern-weighted sum and caches it with the site vector.
    pub fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weights_indices: &[usize],
        state_frequencies_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64> {
        let count = buffer_indices.len();
        if count == 0 {
            return Ok(0.0);
        }
        self.begin_reduction()?;
        if category_weights_indices.len() != count
            || state_frequencies_indices.len() != count
            || cumulative_scale_indices.len() != count
        {
            return Err(EngineError::OutOfRange {
                what: "root reduction batch length",
                index: count,
                limit: count,
            });
        }
        for i in 0..count {
            self.validate_reduction_entry(
                buffer_indices[i],
                category_weights_indices[i],
                state_frequencies_indices[i],
                cumulative_scale_indices[i],
            )?;
        }
        if self.auto_scaling && count > 1 {
            return Err(EngineError::NoImplementation {
                what: "auto-scaling combined with multi-root reductions",
            });
        }

        let dims = self.dims;
        let result = if self.auto_scaling && count == 1 {
            let active: Vec<&[i16]> = self
                .bufs
                .auto_active
                .iter()
                .enumerate()
                .filter(|&(_, &n)| n > 0)
                .map(|(b, _)| self.bufs.auto_exponents[b].as_slice())
                .collect();
            likelihood::root_log_likelihood_auto(
                self.bufs.partials[buffer_indices[0]].as_ref().expect("validated"),
                self.category_weights[category_weights_indices[0]]
                    .as_ref()
                    .expect("validated"),
                self.state_frequencies[state_frequencies_indices[0]]
                    .as_ref()
                    .expect("validated"),
                &active,
                &self.bufs.pattern_weights,
                &dims,
                &mut self.bufs.out_log_likelihoods_tmp,
            )
        } else if count == 1 {
            let scale = match cumulative_scale_indices[0] {
                Some(k) => &self.bufs.scale_buffers[k],
                None => &self.bufs.zeros,
            };
            likelihood::root_log_likelihood(
                self.bufs.partials[buffer_indices[0]].as_ref().expect("validated"),
                self.category_weights[category_weights_indices[0]]
                    .as_ref()
                    .expect("validated"),
                self.state_frequencies[state_frequencies_indices[0]]
                    .as_ref()
                    .expect("validated"),
                scale,
                &self.bufs.pattern_weights,
                &dims,
                0,
                dims.patterns,
                &mut self.bufs.integration_tmp,
                &mut self.bufs.out_log_likelihoods_tmp,
            )
        } else {
            let entries: Vec<RootEntry<'_>> = (0..count)
                .map(|i| RootEntry {
                    partials: self.bufs.partials[buffer_indices[i]]
                        .as_ref()
                        .expect("validated"),
                    weights: self.category_weights[category_weights_indices[i]]
                        .as_ref()
                        .expect("validated"),
                    freqs: self.state_frequencies[state_frequencies_indices[i]]
                        .as_ref()
                        .expect("validated"),
                    scale: match cumulative_scale_indices[i] {
                        Some(k) => &self.bufs.scale_buffers[k],
                        None => &self.bufs.zeros,
                    },
                })
                .collect();
            likelihood::root_log_likelihoods_multi(
                &entries,
                &self.bufs.pattern_weights,
                &dims,
                &mut self.bufs.out_log_likelihoods_tmp,
            )
        };
        self.finish_reduction(result.map(|sum| (sum, None, None)))
    }

    /// Root log-likelihood restricted to the listed partitions, one entry
    /// per partition. Per-partition sums are written to
    /// `out_sum_by_partition`; the return value is their total.
    pub fn calculate_root_log_likelihoods_by_partition(
        &mut self,
        buffer_indices: &[usize],
        category_weights_indices: &[usize],
        state_frequencies_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
        partition_indices: &[usize],
        out_sum_by_partition: &mut [f64],
    ) -> Result<f64> {
        let count = partition_indices.len();
        if count == 0 {
            return Ok(0.0);
        }
        self.begin_reduction()?;
        if self.auto_scaling {
            return Err(EngineError::NoImplementation {
                what: "auto-scaling combined with partitioned reductions",
            });
        }
        if buffer_indices.len() != count
            || category_weights_indices.len() != count
            || state_frequencies_indices.len() != count
            || cumulative_scale_indices.len() != count
            || out_sum_by_partition.len() != count
        {
            return Err(EngineError::OutOfRange {
                what: "partitioned reduction batch length",
                index: count,
                limit: count,
            });
        }
        let dims = self.dims;
        let mut total = 0.0;
        let mut result = Ok(());
        for i in 0..count {
            self.validate_reduction_entry(
                buffer_indices[i],
                category_weights_indices[i],
                state_frequencies_indices[i],
                cumulative_scale_indices[i],
            )?;
            let (start, end) = self.layout.range(partition_indices[i])?;
            let scale = match cumulative_scale_indices[i] {
                Some(k) => &self.bufs.scale_buffers[k],
                None => &self.bufs.zeros,
            };
            match likelihood::root_log_likelihood(
                self.bufs.partials[buffer_indices[i]].as_ref().expect("validated"),
                self.category_weights[category_weights_indices[i]]
                    .as_ref()
                    .expect("validated"),
                self.state_frequencies[state_frequencies_indices[i]]
                    .as_ref()
                    .expect("validated"),
                scale,
                &self.bufs.pattern_weights,
                &dims,
                start,
                end,
                &mut self.bufs.integration_tmp,
                &mut self.bufs.out_log_likelihoods_tmp,
            ) {
                Ok(sum) => {
                    out_sum_by_partition[i] = sum;
                    total += sum;
                }
                Err(e) => {
                    out_sum_by_partition[i] = f64::NAN;
                    result = Err(e);
                }
            }
        }
        self.finish_reduction(result.map(|()| (total, None, None)))
    }

    /// Log-likelihood (and optional derivatives with respect to the edge
    /// length) across a single edge `(parent, child)`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods(
        &mut self,
        parent_index: usize,
        child_index: usize,
        probability_index: usize,
        first_derivative_index: Option<usize>,
        second_derivative_index: Option<usize>,
        category_weights_index: usize,
        state_frequencies_index: usize,
        cumulative_scale_index: Option<usize>,
    ) -> Result<(f64, Option<f64>, Option<f64>)> {
        self.begin_reduction()?;
        let dims = self.dims;
        let sums = self.edge_reduction_range(
            parent_index,
            child_index,
            probability_index,
            first_derivative_index,
            second_derivative_index,
            category_weights_index,
            state_frequencies_index,
            cumulative_scale_index,
            0,
            dims.patterns,
        );
        let with_first = first_derivative_index.is_some();
        let with_second = second_derivative_index.is_some();
        let result = sums.map(|s| {
            (
                s.log_likelihood,
                with_first.then_some(s.first_derivative),
                with_second.then_some(s.second_derivative),
            )
        });
        self.finish_reduction(result)
            .map(|sum| (sum, self.cached_first(), self.cached_second()))
    }

    /// Edge log-likelihood restricted to the listed partitions, one entry
    /// per partition, with per-partition and total sums.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_edge_log_likelihoods_by_partition(
        &mut self,
        parent_indices: &[usize],
        child_indices: &[usize],
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        category_weights_indices: &[usize],
        state_frequencies_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
        partition_indices: &[usize],
        out_sum_by_partition: &mut [f64],
        mut out_first_by_partition: Option<&mut [f64]>,
        mut out_second_by_partition: Option<&mut [f64]>,
    ) -> Result<(f64, Option<f64>, Option<f64>)> {
        let count = partition_indices.len();
        if count == 0 {
            return Ok((0.0, None, None));
        }
        self.begin_reduction()?;
        if self.auto_scaling {
            return Err(EngineError::NoImplementation {
                what: "auto-scaling combined with partitioned reductions",
            });
        }
        if parent_indices.len() != count
            || child_indices.len() != count
            || probability_indices.len() != count
            || category_weights_indices.len() != count
            || state_frequencies_indices.len() != count
            || cumulative_scale_indices.len() != count
            || out_sum_by_partition.len() != count
            || first_derivative_indices.is_some_and(|d| d.len() != count)
            || second_derivative_indices.is_some_and(|d| d.len() != count)
        {
            return Err(EngineError::OutOfRange {
                what: "partitioned reduction batch length",
                index: count,
                limit: count,
            });
        }
        let with_first = first_derivative_indices.is_some();
        let with_second = second_derivative_indices.is_some();
        let mut totals = (0.0f64, 0.0f64, 0.0f64);
        let mut result = Ok(());
        for i in 0..count {
            let (start, end) = self.layout.range(partition_indices[i])?;
            match self.edge_reduction_range(
                parent_indices[i],
                child_indices[i],
                probability_indices[i],
                first_derivative_indices.map(|d| d[i]),
                second_derivative_indices.map(|d| d[i]),
                category_weights_indices[i],
                state_frequencies_indices[i],
                cumulative_scale_indices[i],
                start,
                end,
            ) {
                Ok(sums) => {
                    out_sum_by_partition[i] = sums.log_likelihood;
                    totals.0 += sums.log_likelihood;
                    if let Some(out) = out_first_by_partition.as_deref_mut() {
                        out[i] = sums.first_derivative;
                    }
                    totals.1 += sums.first_derivative;
                    if let Some(out) = out_second_by_partition.as_deref_mut() {
                        out[i] = sums.second_derivative;
                    }
                    totals.2 += sums.second_derivative;
                }
                Err(e) => {
                    out_sum_by_partition[i] = f64::NAN;
                    result = Err(e);
                }
            }
        }
        let result = result.map(|()| {
            (
                totals.0,
                with_first.then_some(totals.1),
                with_second.then_some(totals.2),
            )
        });
        self.finish_reduction(result)
            .map(|sum| (sum, self.cached_first(), self.cached_second()))
    }

    // ---- cached results --------------------------------------------------

    /// The summed log-likelihood of the most recent successful reduction.
    pub fn get_log_likelihood(&self) -> Result<f64> {
        match &self.cached {
            Some(c) => Ok(c.log_likelihood),
            None => Err(self.last_error.clone().unwrap_or(EngineError::UnidentifiedException)),
        }
    }

    /// The summed derivatives of the most recent successful edge reduction.
    pub fn get_derivatives(&self) -> Result<(f64, f64)> {
        match &self.cached {
            Some(CachedResults {
                first_derivative: Some(d1),
                second_derivative,
                ..
            }) => Ok((*d1, second_derivative.unwrap_or(0.0))),
            Some(_) => Err(EngineError::NoImplementation {
                what: "derivatives were not computed by the last reduction",
            }),
            None => Err(self.last_error.clone().unwrap_or(EngineError::UnidentifiedException)),
        }
    }

    /// Per-site log-likelihoods of the most recent successful reduction, in
    /// original pattern order.
    pub fn get_site_log_likelihoods(&self, out: &mut [f64]) -> Result<()> {
        if self.cached.is_none() {
            return Err(self.last_error.clone().unwrap_or(EngineError::UnidentifiedException));
        }
        self.check_input_len("site log-likelihood output", out.len(), self.dims.patterns)?;
        for slot in 0..self.dims.patterns {
            out[self.layout.original_of(slot)] = self.bufs.out_log_likelihoods_tmp[slot];
        }
        Ok(())
    }

    /// Per-site derivatives of the most recent successful edge reduction, in
    /// original pattern order.
    pub fn get_site_derivatives(&self, out_first: &mut [f64], out_second: &mut [f64]) -> Result<()> {
        match &self.cached {
            Some(CachedResults {
                first_derivative: Some(_),
                ..
            }) => {}
            Some(_) => {
                return Err(EngineError::NoImplementation {
                    what: "derivatives were not computed by the last reduction",
                })
            }
            None => {
                return Err(self.last_error.clone().unwrap_or(EngineError::UnidentifiedException))
            }
        }
        self.check_input_len("site derivative output", out_first.len(), self.dims.patterns)?;
        self.check_input_len("site derivative output", out_second.len(), self.dims.patterns)?;
        for slot in 0..self.dims.patterns {
            let orig = self.layout.original_of(slot);
            out_first[orig] = self.bufs.out_first_derivatives_tmp[slot];
            out_second[orig] = self.bufs.out_second_derivatives_tmp[slot];
        }
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    fn check_input_len(
        &self,
        what: &'static str,
        got: usize,
        expected: usize,
    ) -> Result<()> {
        if got == expected {
            Ok(())
        } else {
            Err(EngineError::OutOfRange {
                what,
                index: got,
                limit: expected,
            })
        }
    }

    /// Build a partials buffer from `S * P` caller-order values, replicated
    /// across categories, permuted into slot order, padding replicating
    /// slot 0.
    fn fill_partials_buffer(&self, values: &[f64]) -> Result<AlignedVec> {
        let dims = &self.dims;
        let s = dims.states;
        let mut buf = AlignedVec::new(dims.partials_len())?;
        for c in 0..dims.categories {
            let cat = &mut buf[c * dims.partials_stride()..(c + 1) * dims.partials_stride()];
            for slot in 0..dims.patterns {
                let orig = self.layout.original_of(slot);
                cat[slot * s..(slot + 1) * s].copy_from_slice(&values[orig * s..(orig + 1) * s]);
            }
            for slot in dims.patterns..dims.padded_patterns {
                let (head, tail) = cat.split_at_mut(slot * s);
                tail[..s].copy_from_slice(&head[..s]);
            }
        }
        Ok(buf)
    }

    /// Wait for outstanding jobs before touching buffers, keeping any
    /// failure for the next reduction instead of surfacing it here.
    fn wait_all_internal(&mut self) {
        for (_, ticket) in self.outstanding.drain(..) {
            if let Err(e) = ticket.wait() {
                self.sticky_error.get_or_insert(e);
            }
        }
    }

    fn begin_reduction(&mut self) -> Result<()> {
        self.wait_all_internal();
        if let Some(e) = self.sticky_error.take() {
            log::warn!("surfacing deferred evaluation error: {e}");
            self.cached = None;
            self.last_error = Some(e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn finish_reduction(
        &mut self,
        result: Result<(f64, Option<f64>, Option<f64>)>,
    ) -> Result<f64> {
        match result {
            Ok((sum, first, second)) => {
                self.cached = Some(CachedResults {
                    log_likelihood: sum,
                    first_derivative: first,
                    second_derivative: second,
                });
                self.last_error = None;
                Ok(sum)
            }
            Err(e) => {
                log::warn!("reduction failed: {e}");
                self.cached = None;
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn cached_first(&self) -> Option<f64> {
        self.cached.as_ref().and_then(|c| c.first_derivative)
    }

    fn cached_second(&self) -> Option<f64> {
        self.cached.as_ref().and_then(|c| c.second_derivative)
    }

    fn validate_operation(&self, op: &Operation) -> Result<()> {
        if op.destination < self.tip_count || op.destination >= self.buffer_count {
            return Err(EngineError::OutOfRange {
                what: "destination partials",
                index: op.destination,
                limit: self.buffer_count,
            });
        }
        for child in [op.child1, op.child2] {
            check_index("child buffer", child, self.buffer_count)?;
            if child == op.destination {
                return Err(EngineError::OutOfRange {
                    what: "child aliasing its destination",
                    index: child,
                    limit: self.buffer_count,
                });
            }
        }
        check_index("transition matrix", op.matrix1, self.bufs.matrices.len())?;
        check_index("transition matrix", op.matrix2, self.bufs.matrices.len())?;
        for k in [op.write_scale, op.read_scale].into_iter().flatten() {
            check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
        }
        Ok(())
    }

    fn validate_reduction_entry(
        &self,
        buffer: usize,
        weights: usize,
        freqs: usize,
        scale: Option<usize>,
    ) -> Result<()> {
        check_index("partials buffer", buffer, self.buffer_count)?;
        if self.bufs.partials[buffer].is_none() {
            return Err(EngineError::OutOfRange {
                what: "partials-backed buffer",
                index: buffer,
                limit: self.buffer_count,
            });
        }
        check_index("category weights", weights, self.category_weights.len())?;
        if self.category_weights[weights].is_none() {
            return Err(EngineError::OutOfRange {
                what: "uninitialized category weights",
                index: weights,
                limit: self.category_weights.len(),
            });
        }
        check_index("state frequencies", freqs, self.state_frequencies.len())?;
        if self.state_frequencies[freqs].is_none() {
            return Err(EngineError::OutOfRange {
                what: "uninitialized state frequencies",
                index: freqs,
                limit: self.state_frequencies.len(),
            });
        }
        if let Some(k) = scale {
            check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
        }
        Ok(())
    }

    /// Resolve a child buffer to its kernel input form.
    fn resolve_child(&self, index: usize) -> Result<ChildSrc> {
        if index < self.tip_count {
            if let Some(states) = &self.bufs.tip_states[index] {
                return Ok(ChildSrc::States(StatesPtr(states.as_ptr())));
            }
        }
        match &self.bufs.partials[index] {
            Some(buf) => Ok(ChildSrc::Partials(ConstPtr(buf.as_ptr()))),
            None => Err(EngineError::OutOfRange {
                what: "unset child buffer",
                index,
                limit: self.buffer_count,
            }),
        }
    }

    fn resolve_op(&mut self, op: &Operation, cumulative: Option<usize>) -> Result<ResolvedOp> {
        let child1 = self.resolve_child(op.child1)?;
        let child2 = self.resolve_child(op.child2)?;
        let matrix1 = ConstPtr(self.bufs.matrices[op.matrix1].as_ptr());
        let matrix2 = ConstPtr(self.bufs.matrices[op.matrix2].as_ptr());
        let read_scale = op
            .read_scale
            .map(|k| ConstPtr(self.bufs.scale_buffers[k].as_ptr()));
        let write_scale = op
            .write_scale
            .map(|k| MutPtr(self.bufs.scale_buffers[k].as_mut_ptr()));
        // The cumulative accumulator only applies when this op rescales.
        let cumulative = match (op.write_scale, cumulative) {
            (Some(_), Some(k)) => Some(MutPtr(self.bufs.scale_buffers[k].as_mut_ptr())),
            _ => None,
        };
        let dest = MutPtr(
            self.bufs.partials[op.destination]
                .as_mut()
                .expect("destinations are internal buffers, allocated at creation")
                .as_mut_ptr(),
        );
        Ok(ResolvedOp {
            dest,
            child1,
            matrix1,
            child2,
            matrix2,
            read_scale,
            write_scale,
            cumulative,
        })
    }

    /// One auto-scaling peeling step, always serial. Partials × partials
    /// runs the surveillance kernel and, once the buffer's activation is
    /// armed, the deferred exponent rescale; other shapes run plain and
    /// clear the buffer's exponents. Operations carrying scale slots were
    /// already rejected at validation.
    fn execute_auto_op(&mut self, op: &Operation) -> Result<()> {
        let dims = self.dims;
        let dest_index = op.destination;
        let resolved = self.resolve_op(op, None)?;
        let both_partials = matches!(
            (resolved.child1, resolved.child2),
            (ChildSrc::Partials(_), ChildSrc::Partials(_))
        );
        if both_partials {
            // SAFETY: serial path, validated indices, destination distinct
            // from children.
            unsafe {
                let dest = std::slice::from_raw_parts_mut(resolved.dest.0, dims.partials_len());
                let q1 = match resolved.child1 {
                    ChildSrc::Partials(p) => std::slice::from_raw_parts(p.0, dims.partials_len()),
                    ChildSrc::States(_) => unreachable!(),
                };
                let q2 = match resolved.child2 {
                    ChildSrc::Partials(p) => std::slice::from_raw_parts(p.0, dims.partials_len()),
                    ChildSrc::States(_) => unreachable!(),
                };
                let m1 = std::slice::from_raw_parts(resolved.matrix1.0, dims.matrix_len());
                let m2 = std::slice::from_raw_parts(resolved.matrix2.0, dims.matrix_len());
                kernels::combine_partials_partials_auto(
                    dest,
                    q1,
                    m1,
                    q2,
                    m2,
                    &dims,
                    SCALING_EXPONENT_THRESHOLD,
                    &mut self.bufs.auto_active[dest_index],
                );
            }
        } else {
            // SAFETY: serial path, validated indices.
            if let Err(e) = unsafe { run_resolved(resolved, dims, 0, dims.padded_patterns) } {
                self.sticky_error.get_or_insert(e);
            }
        }
        if self.bufs.auto_active[dest_index] > 0 {
            let dest = self.bufs.partials[dest_index]
                .as_mut()
                .expect("destination validated");
            kernels::auto_rescale_partials(
                dest,
                &mut self.bufs.auto_exponents[dest_index],
                &dims,
            );
        } else {
            self.bufs.auto_exponents[dest_index].fill(0);
        }
        Ok(())
    }

    /// Shared body of the edge reductions over one pattern-slot range.
    #[allow(clippy::too_many_arguments)]
    fn edge_reduction_range(
        &mut self,
        parent_index: usize,
        child_index: usize,
        probability_index: usize,
        first_derivative_index: Option<usize>,
        second_derivative_index: Option<usize>,
        category_weights_index: usize,
        state_frequencies_index: usize,
        cumulative_scale_index: Option<usize>,
        start: usize,
        end: usize,
    ) -> Result<likelihood::ReductionSums> {
        if self.auto_scaling {
            return Err(EngineError::NoImplementation {
                what: "auto-scaling combined with edge reductions",
            });
        }
        if second_derivative_index.is_some() && first_derivative_index.is_none() {
            return Err(EngineError::NoImplementation {
                what: "second derivatives without first derivatives",
            });
        }
        self.validate_reduction_entry(
            parent_index,
            category_weights_index,
            state_frequencies_index,
            cumulative_scale_index,
        )?;
        check_index("child buffer", child_index, self.buffer_count)?;
        check_index("transition matrix", probability_index, self.bufs.matrices.len())?;
        for ix in [first_derivative_index, second_derivative_index]
            .into_iter()
            .flatten()
        {
            check_index("transition matrix", ix, self.bufs.matrices.len())?;
        }

        let dims = self.dims;
        let child = if child_index < self.tip_count
            && self.bufs.tip_states[child_index].is_some()
        {
            EdgeChild::States(
                self.bufs.tip_states[child_index]
                    .as_ref()
                    .expect("checked above"),
            )
        } else {
            EdgeChild::Partials(self.bufs.partials[child_index].as_ref().ok_or(
                EngineError::OutOfRange {
                    what: "unset child buffer",
                    index: child_index,
                    limit: self.buffer_count,
                },
            )?)
        };
        let scale = match cumulative_scale_index {
            Some(k) => &self.bufs.scale_buffers[k],
            None => &self.bufs.zeros,
        };
        likelihood::edge_log_likelihood(
            self.bufs.partials[parent_index].as_ref().expect("validated"),
            &child,
            &self.bufs.matrices[probability_index],
            first_derivative_index.map(|ix| &self.bufs.matrices[ix][..]),
            second_derivative_index.map(|ix| &self.bufs.matrices[ix][..]),
            self.category_weights[category_weights_index]
                .as_ref()
                .expect("validated"),
            self.state_frequencies[state_frequencies_index]
                .as_ref()
                .expect("validated"),
            scale,
            &self.bufs.pattern_weights,
            &dims,
            start,
            end,
            &mut self.bufs.integration_tmp,
            &mut self.bufs.first_deriv_tmp,
            &mut self.bufs.second_deriv_tmp,
            &mut self.bufs.out_log_likelihoods_tmp,
            &mut self.bufs.out_first_derivatives_tmp,
            &mut self.bufs.out_second_derivatives_tmp,
        )
    }

    /// Disjoint mutable/shared borrows of two scale buffers.
    fn scale_pair(&mut self, dest: usize, source: usize) -> (&mut [f64], &[f64]) {
        debug_assert_ne!(dest, source);
        if dest < source {
            let (lo, hi) = self.bufs.scale_buffers.split_at_mut(source);
            (&mut lo[dest], &hi[0])
        } else {
            let (lo, hi) = self.bufs.scale_buffers.split_at_mut(dest);
            (&mut hi[0], &lo[source])
        }
    }

    fn scale_op(
        &mut self,
        scale_indices: &[usize],
        cumulative_index: usize,
        partition: Option<usize>,
        apply: fn(&mut [f64], &[f64], usize, usize),
    ) -> Result<()> {
        self.wait_all_internal();
        check_index("scale buffer", cumulative_index, self.bufs.scale_buffers.len())?;
        let (start, end) = match partition {
            Some(p) => self.layout.range(p)?,
            None => (0, self.dims.padded_patterns),
        };
        for &k in scale_indices {
            check_index("scale buffer", k, self.bufs.scale_buffers.len())?;
            if k == cumulative_index {
                return Err(EngineError::OutOfRange {
                    what: "scale buffer aliasing its cumulative target",
                    index: k,
                    limit: self.bufs.scale_buffers.len(),
                });
            }
        }
        for &k in scale_indices {
            let (cum, src) = self.scale_pair(cumulative_index, k);
            apply(cum, src, start, end);
        }
        Ok(())
    }
}

impl Drop for LikelihoodEngine {
    fn drop(&mut self) {
        // Outstanding jobs hold pointers into our buffers; let them finish
        // before the allocations go away. Pool teardown joins the workers.
        self.wait_all_internal();
    }
}
