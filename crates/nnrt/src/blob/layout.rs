//! Host-side layout converters.
//!
//! The packed `Nc4hw4` layout stores channels in blocks of four:
//! element `(n, c, s)` lives at `((n * C4 + c / 4) * S + s) * 4 + c % 4`
//! where `C4 = ceil(C / 4)` and `S` is the product of the spatial dims.
//! When `C` is not a multiple of four the last block carries padding lanes.
//! Padding lanes are never read or written by anything in this module, and
//! packed kernels must iterate with [`PackedGeometry::lanes`] so they do the
//! same. A padding lane therefore keeps whatever value the allocation held,
//! and no computation ever observes it.

use super::dims::round_up;
use super::format::DataFormat;

pub const PACK: usize = 4;

/// Converter between two layouts for a given logical shape.
pub type LayoutConverter<T> = fn(&[T], &mut [T], &[usize]);

/// Batch/channel/spatial split of a shape used by the packed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedGeometry {
    pub batch: usize,
    pub channel: usize,
    pub spatial: usize,
}

impl PackedGeometry {
    /// Rank-1 shapes are treated as a single batch of `dims[0]` channels.
    pub fn from_dims(dims: &[usize]) -> Self {
        match dims.len() {
            0 => PackedGeometry {
                batch: 1,
                channel: 1,
                spatial: 1,
            },
            1 => PackedGeometry {
                batch: 1,
                channel: dims[0],
                spatial: 1,
            },
            _ => PackedGeometry {
                batch: dims[0],
                channel: dims[1],
                spatial: dims[2..].iter().product(),
            },
        }
    }

    pub fn channel_blocks(&self) -> usize {
        self.channel.div_ceil(PACK)
    }

    /// Element count of the packed buffer, padding lanes included.
    pub fn packed_len(&self) -> usize {
        self.batch * round_up(self.channel, PACK) * self.spatial
    }

    pub fn logical_len(&self) -> usize {
        self.batch * self.channel * self.spatial
    }

    /// Number of valid lanes in channel block `block`.
    pub fn lanes(&self, block: usize) -> usize {
        (self.channel - block * PACK).min(PACK)
    }

    pub fn packed_offset(&self, n: usize, c: usize, s: usize) -> usize {
        ((n * self.channel_blocks() + c / PACK) * self.spatial + s) * PACK + c % PACK
    }

    pub fn nchw_offset(&self, n: usize, c: usize, s: usize) -> usize {
        (n * self.channel + c) * self.spatial + s
    }
}

pub fn packed_len(dims: &[usize]) -> usize {
    PackedGeometry::from_dims(dims).packed_len()
}

/// Visits every valid `(packed_offset, n, c, s)` of the packed layout.
pub fn for_each_packed_lane(dims: &[usize], mut f: impl FnMut(usize, usize, usize, usize)) {
    let g = PackedGeometry::from_dims(dims);
    for n in 0..g.batch {
        for block in 0..g.channel_blocks() {
            let lanes = g.lanes(block);
            for s in 0..g.spatial {
                let base = ((n * g.channel_blocks() + block) * g.spatial + s) * PACK;
                for lane in 0..lanes {
                    f(base + lane, n, block * PACK + lane, s);
                }
            }
        }
    }
}

pub fn nchw_to_nc4hw4<T: Copy>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let g = PackedGeometry::from_dims(dims);
    for_each_packed_lane(dims, |packed, n, c, s| {
        dst[packed] = src[g.nchw_offset(n, c, s)];
    });
}

pub fn nc4hw4_to_nchw<T: Copy>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let g = PackedGeometry::from_dims(dims);
    for_each_packed_lane(dims, |packed, n, c, s| {
        dst[g.nchw_offset(n, c, s)] = src[packed];
    });
}

pub fn nchw_to_nhwc<T: Copy>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let g = PackedGeometry::from_dims(dims);
    for n in 0..g.batch {
        for c in 0..g.channel {
            for s in 0..g.spatial {
                dst[(n * g.spatial + s) * g.channel + c] = src[g.nchw_offset(n, c, s)];
            }
        }
    }
}

pub fn nhwc_to_nchw<T: Copy>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let g = PackedGeometry::from_dims(dims);
    for n in 0..g.batch {
        for c in 0..g.channel {
            for s in 0..g.spatial {
                dst[g.nchw_offset(n, c, s)] = src[(n * g.spatial + s) * g.channel + c];
            }
        }
    }
}

fn identity<T: Copy>(src: &[T], dst: &mut [T], _dims: &[usize]) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
}

/// Looks up the host converter for `(src, dst)`. `Opaque` has no host
/// converter; `None` maps to `UnsupportedFormat` at the call site.
pub fn converter<T: Copy>(src: DataFormat, dst: DataFormat) -> Option<LayoutConverter<T>> {
    use DataFormat::*;
    match (src, dst) {
        (Opaque, _) | (_, Opaque) => None,
        (a, b) if a == b => Some(identity::<T>),
        (Nchw, Nc4hw4) => Some(nchw_to_nc4hw4::<T>),
        (Nc4hw4, Nchw) => Some(nc4hw4_to_nchw::<T>),
        (Nchw, Nhwc) => Some(nchw_to_nhwc::<T>),
        (Nhwc, Nchw) => Some(nhwc_to_nchw::<T>),
        _ => None,
    }
}
