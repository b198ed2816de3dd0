use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{EngineError, Result};

/// Alignment for partials and transition-matrix storage. One cache line,
/// which satisfies every vector width the kernels may be compiled for.
const BUFFER_ALIGN: usize = 64;

/// Heap-owned, zero-initialized `f64` storage with guaranteed alignment.
///
/// Allocated once at instance creation and never resized, so raw pointers
/// into the data stay valid for the instance lifetime.
pub(crate) struct AlignedVec {
    ptr: NonNull<f64>,
    len: usize,
}

// The storage is plain memory; access discipline is enforced by the owner.
unsafe impl Send for AlignedVec {}
unsafe impl Sync for AlignedVec {}

impl AlignedVec {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }
        let layout = Layout::from_size_align(len * std::mem::size_of::<f64>(), BUFFER_ALIGN)
            .map_err(|_| EngineError::OutOfMemory)?;
        // SAFETY: layout has non-zero size and valid alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut f64).ok_or(EngineError::OutOfMemory)?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const f64 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut f64 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedVec {
    type Target = [f64];

    #[inline]
    fn deref(&self) -> &[f64] {
        // SAFETY: ptr/len describe a live allocation owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedVec {
    #[inline]
    fn deref_mut(&mut self) -> &mut [f64] {
        // SAFETY: as above, and &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedVec {
    fn drop(&mut self) {
        if self.len != 0 {
            let layout =
                Layout::from_size_align(self.len * std::mem::size_of::<f64>(), BUFFER_ALIGN)
                    .expect("layout was validated at allocation");
            // SAFETY: allocated with this exact layout in new().
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

/// Instance dimensions shared by every kernel.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Dims {
    /// State count `S`.
    pub states: usize,
    /// Transition-matrix row length `S_T = S + 1`; the extra column holds the
    /// pad value addressed by the ambiguity sentinel state.
    pub padded_states: usize,
    /// Real pattern count `P`.
    pub patterns: usize,
    /// `P` rounded up to the pattern padding modulus.
    pub padded_patterns: usize,
    /// Rate category count `C`.
    pub categories: usize,
}

impl Dims {
    pub fn new(states: usize, patterns: usize, categories: usize) -> Self {
        let padded_patterns = patterns + (patterns & 1);
        Self {
            states,
            padded_states: states + 1,
            patterns,
            padded_patterns,
            categories,
        }
    }

    /// Length of one partials buffer: `C * P' * S`.
    #[inline]
    pub fn partials_len(&self) -> usize {
        self.categories * self.padded_patterns * self.states
    }

    /// Length of one transition-matrix buffer: `C * S * S_T`.
    #[inline]
    pub fn matrix_len(&self) -> usize {
        self.categories * self.states * self.padded_states
    }

    /// Offset between consecutive categories within a matrix buffer.
    #[inline]
    pub fn matrix_stride(&self) -> usize {
        self.states * self.padded_states
    }

    /// Offset between consecutive categories within a partials buffer.
    #[inline]
    pub fn partials_stride(&self) -> usize {
        self.padded_patterns * self.states
    }
}

/// All storage owned by one engine instance.
///
/// Everything is allocated here, up front; nothing on the evaluation path
/// allocates. Tip storage is filled in by the upload calls (a compact tip
/// never owns partials, an ambiguous tip never owns a state array).
pub(crate) struct BufferPool {
    /// Conditional likelihood buffers, `None` for tips not yet uploaded and
    /// for compact tips.
    pub partials: Vec<Option<AlignedVec>>,
    /// Compact state sequences for tips, values in `[0, S]`.
    pub tip_states: Vec<Option<Vec<u32>>>,
    /// Transition probability / derivative matrix buffers.
    pub matrices: Vec<AlignedVec>,
    /// Per-pattern log-scale buffers.
    pub scale_buffers: Vec<AlignedVec>,
    /// Signed per-pattern-category exponents, one vector per partials buffer;
    /// empty unless auto-scaling is enabled.
    pub auto_exponents: Vec<Vec<i16>>,
    /// Per-buffer count of auto-scale activations.
    pub auto_active: Vec<u32>,
    /// Pattern weights, padded entries zero.
    pub pattern_weights: AlignedVec,

    // Reduction scratch, caller-thread only.
    pub integration_tmp: AlignedVec,
    pub first_deriv_tmp: AlignedVec,
    pub second_deriv_tmp: AlignedVec,
    pub out_log_likelihoods_tmp: AlignedVec,
    pub out_first_derivatives_tmp: AlignedVec,
    pub out_second_derivatives_tmp: AlignedVec,
    /// All-zero per-pattern vector, stands in for "no cumulative scale".
    pub zeros: AlignedVec,
}

impl BufferPool {
    pub fn new(
        dims: &Dims,
        tip_count: usize,
        buffer_count: usize,
        matrix_count: usize,
        scale_buffer_count: usize,
        auto_scaling: bool,
    ) -> Result<Self> {
        let mut partials = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            if i < tip_count {
                partials.push(None);
            } else {
                partials.push(Some(AlignedVec::new(dims.partials_len())?));
            }
        }
        let mut matrices = Vec::with_capacity(matrix_count);
        for _ in 0..matrix_count {
            matrices.push(AlignedVec::new(dims.matrix_len())?);
        }
        let mut scale_buffers = Vec::with_capacity(scale_buffer_count);
        for _ in 0..scale_buffer_count {
            scale_buffers.push(AlignedVec::new(dims.padded_patterns)?);
        }
        let (auto_exponents, auto_active) = if auto_scaling {
            (
                vec![vec![0i16; dims.categories * dims.padded_patterns]; buffer_count],
                vec![0u32; buffer_count],
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let site_len = dims.padded_patterns * dims.states;
        let mut pattern_weights = AlignedVec::new(dims.padded_patterns)?;
        // Unit weights until the caller uploads real ones; padding stays zero.
        for w in pattern_weights.iter_mut().take(dims.patterns) {
            *w = 1.0;
        }
        Ok(Self {
            partials,
            tip_states: vec![None; tip_count],
            matrices,
            scale_buffers,
            auto_exponents,
            auto_active,
            pattern_weights,
            integration_tmp: AlignedVec::new(site_len)?,
            first_deriv_tmp: AlignedVec::new(site_len)?,
            second_deriv_tmp: AlignedVec::new(site_len)?,
            out_log_likelihoods_tmp: AlignedVec::new(dims.padded_patterns)?,
            out_first_derivatives_tmp: AlignedVec::new(dims.padded_patterns)?,
            out_second_derivatives_tmp: AlignedVec::new(dims.padded_patterns)?,
            zeros: AlignedVec::new(dims.padded_patterns)?,
        })
    }
}
