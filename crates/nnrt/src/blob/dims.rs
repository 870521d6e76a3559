//! Helpers over dimension vectors.

use smallvec::SmallVec;

/// Ordered tensor dimensions, outermost first.
pub type DimsVector = SmallVec<[usize; 6]>;

pub fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Number of elements described by `dims`. A rank-0 shape holds one element.
pub fn count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Number of elements spanned by `dims[start..end]`, clamped to the rank.
pub fn count_range(dims: &[usize], start: usize, end: usize) -> usize {
    let end = end.min(dims.len());
    if start >= end {
        return 1;
    }
    dims[start..end].iter().product()
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if resolved < 0 || resolved >= rank_i {
        None
    } else {
        Some(resolved as usize)
    }
}

/// Numpy-style broadcast of two shapes, aligned from the innermost axis.
pub fn broadcast(lhs: &[usize], rhs: &[usize]) -> Option<DimsVector> {
    let rank = lhs.len().max(rhs.len());
    let mut out = DimsVector::with_capacity(rank);
    for i in 0..rank {
        let l = dim_from_end(lhs, rank, i);
        let r = dim_from_end(rhs, rank, i);
        let d = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
        out.push(d);
    }
    Some(out)
}

fn dim_from_end(dims: &[usize], rank: usize, index: usize) -> usize {
    let pad = rank - dims.len();
    if index < pad {
        1
    } else {
        dims[index - pad]
    }
}

/// Row-major strides of `dims`.
pub fn strides(dims: &[usize]) -> DimsVector {
    let mut strides: DimsVector = smallvec::smallvec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

/// Strides of `dims` when read through a broadcast to a shape of rank
/// `out_rank`; broadcast axes get stride zero.
pub fn broadcast_strides(dims: &[usize], out_dims: &[usize]) -> DimsVector {
    let own = strides(dims);
    let pad = out_dims.len() - dims.len();
    let mut out: DimsVector = smallvec::smallvec![0; out_dims.len()];
    for (i, slot) in out.iter_mut().enumerate().skip(pad) {
        let d = dims[i - pad];
        *slot = if d == 1 && out_dims[i] != 1 { 0 } else { own[i - pad] };
    }
    out
}
