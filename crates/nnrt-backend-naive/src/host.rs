//! Blob access for host kernels.
//!
//! Kernels read inputs and write outputs through these helpers. Reads and
//! writes go through logical NCHW order whatever the blob's storage format,
//! and packed padding lanes are left untouched.

use nnrt::blob::dims;
use nnrt::blob::layout;
use nnrt::layer::cast::{read_as_f32, read_as_i32, write_from_f32, write_from_i32};
use nnrt::{Blob, DataFormat, DimsVector, Result, Status};

use crate::memory::host_memory;

/// Storage bytes of `blob`.
///
/// # Safety
///
/// No mutable slice overlapping the blob's storage may be alive.
pub unsafe fn blob_bytes(blob: &Blob) -> Result<&[u8]> {
    let handle = blob.handle();
    host_memory(handle.memory.as_ref())?.bytes(handle.offset, blob.desc().byte_size())
}

/// Mutable storage bytes of `blob`.
///
/// # Safety
///
/// No other slice overlapping the blob's storage may be alive.
#[allow(clippy::mut_from_ref)]
pub unsafe fn blob_bytes_mut(blob: &Blob) -> Result<&mut [u8]> {
    let handle = blob.handle();
    host_memory(handle.memory.as_ref())?.bytes_mut(handle.offset, blob.desc().byte_size())
}

/// Rewrites `src` (laid out as `src_format`) into `dst` (as `dst_format`).
pub fn convert_bytes(
    src_format: DataFormat,
    dst_format: DataFormat,
    src: &[u8],
    dst: &mut [u8],
    dims: &[usize],
    element_size: usize,
) -> Result<()> {
    match element_size {
        1 => convert_elements::<[u8; 1]>(src_format, dst_format, src, dst, dims),
        2 => convert_elements::<[u8; 2]>(src_format, dst_format, src, dst, dims),
        4 => convert_elements::<[u8; 4]>(src_format, dst_format, src, dst, dims),
        8 => convert_elements::<[u8; 8]>(src_format, dst_format, src, dst, dims),
        other => Err(Status::unsupported_format(format!(
            "no host converter for {other}-byte elements"
        ))),
    }
}

fn convert_elements<T: bytemuck::Pod>(
    src_format: DataFormat,
    dst_format: DataFormat,
    src: &[u8],
    dst: &mut [u8],
    dims: &[usize],
) -> Result<()> {
    let convert = layout::converter::<T>(src_format, dst_format).ok_or_else(|| {
        Status::unsupported_format(format!("no host converter from {src_format} to {dst_format}"))
    })?;
    let src: &[T] = bytemuck::try_cast_slice(src)
        .map_err(|err| Status::kernel(format!("layout conversion source: {err}")))?;
    let dst: &mut [T] = bytemuck::try_cast_slice_mut(dst)
        .map_err(|err| Status::kernel(format!("layout conversion target: {err}")))?;
    convert(src, dst, dims);
    Ok(())
}

/// Logical bytes of `blob` in NCHW order.
pub fn read_bytes(blob: &Blob) -> Result<Vec<u8>> {
    // SAFETY: a layer's inputs and outputs never share a live byte range,
    // and kernels only write outputs.
    let storage = unsafe { blob_bytes(blob)? };
    let element_size = blob.data_type().size_in_bytes();
    match blob.data_format() {
        DataFormat::Nchw => Ok(storage.to_vec()),
        format => {
            let mut logical = vec![0u8; blob.desc().count() * element_size];
            convert_bytes(format, DataFormat::Nchw, storage, &mut logical, blob.dims(), element_size)?;
            Ok(logical)
        }
    }
}

/// Stores logical NCHW `bytes` into `blob`.
pub fn write_bytes(blob: &Blob, bytes: &[u8]) -> Result<()> {
    let element_size = blob.data_type().size_in_bytes();
    let expected = blob.desc().count() * element_size;
    if bytes.len() != expected {
        return Err(Status::kernel(format!(
            "blob '{}' takes {expected} bytes, kernel produced {}",
            blob.name(),
            bytes.len()
        )));
    }
    // SAFETY: see `read_bytes`.
    let storage = unsafe { blob_bytes_mut(blob)? };
    match blob.data_format() {
        DataFormat::Nchw => {
            storage.copy_from_slice(bytes);
            Ok(())
        }
        format => convert_bytes(DataFormat::Nchw, format, bytes, storage, blob.dims(), element_size),
    }
}

pub fn read_f32(blob: &Blob) -> Result<Vec<f32>> {
    read_as_f32(&read_bytes(blob)?, blob.data_type())
}

pub fn read_i32(blob: &Blob) -> Result<Vec<i32>> {
    read_as_i32(&read_bytes(blob)?, blob.data_type())
}

/// Narrows `values` to the blob's element type and stores them.
pub fn write_f32(blob: &Blob, values: &[f32]) -> Result<()> {
    let mut bytes = vec![0u8; values.len() * blob.data_type().size_in_bytes()];
    write_from_f32(values, blob.data_type(), &mut bytes)?;
    write_bytes(blob, &bytes)
}

pub fn write_i32(blob: &Blob, values: &[i32]) -> Result<()> {
    let mut bytes = vec![0u8; values.len() * blob.data_type().size_in_bytes()];
    write_from_i32(values, blob.data_type(), &mut bytes)?;
    write_bytes(blob, &bytes)
}

/// Direct `f32` view of a packed or plain blob, padding lanes included.
///
/// # Safety
///
/// Same contract as [`blob_bytes`].
pub unsafe fn storage_f32(blob: &Blob) -> Result<&[f32]> {
    bytemuck::try_cast_slice(blob_bytes(blob)?)
        .map_err(|err| Status::kernel(format!("blob '{}' is not f32 storage: {err}", blob.name())))
}

/// # Safety
///
/// Same contract as [`blob_bytes_mut`].
#[allow(clippy::mut_from_ref)]
pub unsafe fn storage_f32_mut(blob: &Blob) -> Result<&mut [f32]> {
    let name = blob.name().to_string();
    bytemuck::try_cast_slice_mut(blob_bytes_mut(blob)?)
        .map_err(|err| Status::kernel(format!("blob '{name}' is not f32 storage: {err}")))
}

/// Input operand of a kernel: values plus the dims they are laid out in.
#[derive(Debug, Clone)]
pub struct Operand<T> {
    pub dims: DimsVector,
    pub values: Vec<T>,
}

impl<T> Operand<T> {
    pub fn new(dims: &[usize], values: Vec<T>) -> Result<Self> {
        if dims::count(dims) != values.len() {
            return Err(Status::kernel(format!(
                "operand dims {dims:?} describe {} values, got {}",
                dims::count(dims),
                values.len()
            )));
        }
        Ok(Operand {
            dims: DimsVector::from_slice(dims),
            values,
        })
    }
}
