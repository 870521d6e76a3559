use half::f16;
use nnrt::layer::cast::{can_convert, read_as_f32, read_as_i32, write_from_f32, write_from_i32, PromotionRule, PromotionTable};
use nnrt::{DataType, ErrorKind};

static MIXED: PromotionTable = PromotionTable {
    name: "mixed",
    rules: &[
        PromotionRule::uniform(DataType::Float32, DataType::Float32, DataType::Float32),
        PromotionRule::exact(&[DataType::Float16, DataType::Int32], DataType::Float32, DataType::Float16),
    ],
};

#[test]
fn resolution_is_exact() {
    let rule = MIXED.resolve(&[DataType::Float32, DataType::Float32, DataType::Float32]).unwrap();
    assert_eq!(rule.output, DataType::Float32);
    let rule = MIXED.resolve(&[DataType::Float16, DataType::Int32]).unwrap();
    assert_eq!((rule.compute, rule.output), (DataType::Float32, DataType::Float16));

    for inputs in [
        &[DataType::Int32, DataType::Float16][..],
        &[DataType::Float16][..],
        &[][..],
    ] {
        let err = MIXED.resolve(inputs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination, "{inputs:?}");
    }
    assert!(MIXED.validate().is_ok());
}

#[test]
fn conversion_list_has_no_narrowing_integers() {
    assert!(can_convert(DataType::Int8, DataType::Int32));
    assert!(can_convert(DataType::Int32, DataType::Float32));
    assert!(!can_convert(DataType::Int32, DataType::Int8));
    assert!(!can_convert(DataType::Int64, DataType::Int32));
    assert!(!can_convert(DataType::Float32, DataType::Int32));
    for t in DataType::ALL {
        assert!(can_convert(t, t));
    }
}

#[test]
fn widening_reads() {
    let bytes: Vec<u8> = [-3i8, 0, 127].iter().map(|v| *v as u8).collect();
    assert_eq!(read_as_f32(&bytes, DataType::Int8).unwrap(), [-3.0, 0.0, 127.0]);
    assert_eq!(read_as_i32(&bytes, DataType::Int8).unwrap(), [-3, 0, 127]);
    assert_eq!(read_as_f32(&[200u8], DataType::UInt8).unwrap(), [200.0]);

    let halves: Vec<u8> = [0.5f32, -2.0]
        .iter()
        .flat_map(|v| f16::from_f32(*v).to_ne_bytes())
        .collect();
    assert_eq!(read_as_f32(&halves, DataType::Float16).unwrap(), [0.5, -2.0]);

    let err = read_as_f32(&[0u8; 8], DataType::Int64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
    let err = read_as_i32(&[0u8; 4], DataType::Float32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
}

#[test]
fn half_precision_writes_round_to_nearest() {
    let mut out = [0u8; 4];
    // 1 + 2^-11 is halfway between 1.0 and the next f16; ties go to even.
    write_from_f32(&[1.0 + 2f32.powi(-11), 1.0 + 3.0 * 2f32.powi(-11)], DataType::Float16, &mut out).unwrap();
    let first = f16::from_ne_bytes([out[0], out[1]]).to_f32();
    let second = f16::from_ne_bytes([out[2], out[3]]).to_f32();
    assert_eq!(first, 1.0);
    assert_eq!(second, 1.0 + 2.0 * 2f32.powi(-10));

    let err = write_from_f32(&[1.0], DataType::Int32, &mut [0u8; 4]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
}

#[test]
fn int32_writes_refuse_narrowing() {
    let mut out = [0u8; 8];
    write_from_i32(&[7, -1], DataType::Int32, &mut out).unwrap();
    assert_eq!(&out[..4], &7i32.to_ne_bytes());
    let err = write_from_i32(&[1], DataType::Int8, &mut [0u8; 1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
}

static HALF_GATHER: PromotionTable = PromotionTable {
    name: "half_gather",
    rules: &[PromotionRule::exact(&[DataType::Float16, DataType::Int32], DataType::Float16, DataType::Float16)
        .with_indices(&[1])],
};

static UNMARKED_HALF_GATHER: PromotionTable = PromotionTable {
    name: "unmarked_half_gather",
    rules: &[PromotionRule::exact(&[DataType::Float16, DataType::Int32], DataType::Float16, DataType::Float16)],
};

static FLOAT_INDICES: PromotionTable = PromotionTable {
    name: "float_indices",
    rules: &[PromotionRule::exact(&[DataType::Float32, DataType::Float32], DataType::Float32, DataType::Float32)
        .with_indices(&[1])],
};

#[test]
fn index_operands_skip_the_conversion_check() {
    assert!(HALF_GATHER.validate().is_ok());
    let rule = HALF_GATHER.resolve(&[DataType::Float16, DataType::Int32]).unwrap();
    assert!(rule.is_index_operand(1));
    assert!(!rule.is_index_operand(0));

    let err = UNMARKED_HALF_GATHER.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
    assert!(err.message().contains("int32 to float16"), "{}", err.message());
}

#[test]
fn index_operands_must_be_integers() {
    let err = FLOAT_INDICES.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
    assert!(err.message().contains("index operand 1"), "{}", err.message());
}
