use std::sync::Arc;

use nnrt::blob::dims::{count_range, normalize_axis, round_up, strides};
use nnrt::blob::layout::{converter, nc4hw4_to_nchw, nchw_to_nc4hw4, packed_len, PackedGeometry};
use nnrt::{Blob, BlobDesc, BlobHandle, DataFormat, DataType, DeviceHandle, DeviceType, ErrorKind};
use nnrt_backend_naive::{HostDevice, HostMemory};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn desc(dims: &[usize], data_type: DataType, format: DataFormat) -> BlobDesc {
    BlobDesc::new("t", DeviceType::Naive, data_type, format, dims)
}

#[test]
fn byte_size_counts_padding_lanes_of_packed_layout() {
    assert_eq!(desc(&[2, 3, 4, 5], DataType::Float32, DataFormat::Nchw).byte_size(), 480);
    assert_eq!(desc(&[2, 3, 4, 5], DataType::Float16, DataFormat::Nhwc).byte_size(), 240);
    let packed = desc(&[2, 5, 3, 3], DataType::Float32, DataFormat::Nc4hw4);
    assert_eq!(packed.count(), 90);
    assert_eq!(packed.storage_count(), 2 * 8 * 9);
    assert_eq!(packed.byte_size(), 2 * 8 * 9 * 4);
}

#[test]
fn rank_zero_holds_one_element() {
    let scalar = desc(&[], DataType::Int32, DataFormat::Nchw);
    assert_eq!(scalar.count(), 1);
    assert_eq!(scalar.byte_size(), 4);
}

#[test]
fn axis_and_dim_helpers() {
    assert_eq!(normalize_axis(-1, 4), Some(3));
    assert_eq!(normalize_axis(3, 4), Some(3));
    assert_eq!(normalize_axis(4, 4), None);
    assert_eq!(normalize_axis(-5, 4), None);
    assert_eq!(count_range(&[2, 3, 4, 5], 1, 3), 12);
    assert_eq!(count_range(&[2, 3], 2, 9), 1);
    assert_eq!(strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
    assert_eq!(round_up(65, 64), 128);
    assert_eq!(round_up(64, 64), 64);
}

#[test]
fn packed_conversion_round_trips_and_skips_padding() {
    let dims = [2, 6, 1, 3];
    let src: Vec<u32> = (0..36).collect();
    let mut packed = vec![u32::MAX; packed_len(&dims)];
    nchw_to_nc4hw4(&src, &mut packed, &dims);

    let g = PackedGeometry::from_dims(&dims);
    assert_eq!(g.channel_blocks(), 2);
    assert_eq!(g.lanes(1), 2);
    assert_eq!(packed[g.packed_offset(1, 5, 2)], src[g.nchw_offset(1, 5, 2)]);
    // Lanes 6 and 7 of the second block are padding.
    let padding = packed
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            let block_lane = i % 4;
            let block = (i / 4 / 3) % 2;
            block == 1 && block_lane >= 2
        })
        .all(|(_, v)| *v == u32::MAX);
    assert!(padding);

    let mut back = vec![0u32; 36];
    nc4hw4_to_nchw(&packed, &mut back, &dims);
    assert_eq!(back, src);
}

#[test]
fn random_shapes_round_trip_through_every_host_layout() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..32 {
        let dims = [
            rng.gen_range(1..=3),
            rng.gen_range(1..=9),
            rng.gen_range(1..=4),
            rng.gen_range(1..=4),
        ];
        let count: usize = dims.iter().product();
        let src: Vec<f32> = (0..count).map(|_| rng.gen_range(-1.0..1.0)).collect();
        for via in [DataFormat::Nhwc, DataFormat::Nc4hw4] {
            let there = converter::<f32>(DataFormat::Nchw, via).unwrap();
            let back = converter::<f32>(via, DataFormat::Nchw).unwrap();
            let mut staged = vec![f32::NAN; packed_len(&dims).max(count)];
            there(&src, &mut staged, &dims);
            let mut restored = vec![0.0f32; count];
            back(&staged, &mut restored, &dims);
            assert_eq!(restored, src, "{dims:?} via {via:?}");
        }
    }
}

#[test]
fn no_converter_for_opaque_or_packed_to_nhwc() {
    assert!(converter::<f32>(DataFormat::Opaque, DataFormat::Nchw).is_none());
    assert!(converter::<f32>(DataFormat::Nc4hw4, DataFormat::Nhwc).is_none());
    assert!(converter::<f32>(DataFormat::Nhwc, DataFormat::Nhwc).is_some());
}

fn naive_handle() -> DeviceHandle {
    DeviceHandle::open(Arc::new(HostDevice::naive()), 0).unwrap()
}

#[test]
fn owned_blob_grows_on_reshape() {
    let handle = naive_handle();
    let mut blob = Blob::allocate(desc(&[1, 2], DataType::Float32, DataFormat::Nchw), &handle).unwrap();
    assert!(blob.owns_storage());
    assert_eq!(blob.capacity(), 8);

    blob.reshape(&[2, 1]).unwrap();
    assert_eq!(blob.capacity(), 8);
    blob.reshape(&[4, 4]).unwrap();
    assert_eq!(blob.dims(), &[4, 4]);
    assert_eq!(blob.capacity(), 64);
}

#[test]
fn external_blob_cannot_grow() {
    let memory = Arc::new(HostMemory::allocate(DeviceType::Naive, 32).unwrap());
    let mut blob = Blob::new(
        desc(&[2, 2], DataType::Float32, DataFormat::Nchw),
        BlobHandle::new(memory.clone()),
    )
    .unwrap();
    assert!(!blob.owns_storage());
    blob.reshape(&[8]).unwrap();
    let err = blob.reshape(&[3, 3]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeError);
    assert_eq!(blob.dims(), &[8]);

    let err = Blob::new(
        desc(&[2], DataType::Float32, DataFormat::Nchw),
        BlobHandle::with_offset(memory, 28),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeError);
}

#[test]
fn typed_io_checks_element_size() {
    let handle = naive_handle();
    let blob = Blob::allocate(desc(&[3], DataType::Float32, DataFormat::Nchw), &handle).unwrap();
    handle.write_blob(&blob, &[1.0f32, 2.0, 3.0]).unwrap();
    assert_eq!(handle.read_blob::<f32>(&blob).unwrap(), [1.0, 2.0, 3.0]);

    let err = handle.read_blob::<u16>(&blob).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    let err = handle.write_blob(&blob, &[1.0f32, 2.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
}
