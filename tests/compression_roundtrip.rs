//! Compression round-trip properties.
use breakwater::compression::{compress, decompress, Encoding};
use proptest::prelude::*;

proptest! {
    #[test]
    fn gzip_roundtrip_is_exact(data in proptest::collection::vec(any::<u8>(), 0..4096), level in 0u32..=9) {
        let packed = compress(&data, Encoding::Gzip, level).unwrap();
        prop_assert_eq!(decompress(&packed, Encoding::Gzip).unwrap(), data);
    }

    #[test]
    fn deflate_roundtrip_is_exact(data in proptest::collection::vec(any::<u8>(), 0..4096), level in 0u32..=9) {
        let packed = compress(&data, Encoding::Deflate, level).unwrap();
        prop_assert_eq!(decompress(&packed, Encoding::Deflate).unwrap(), data);
    }

    #[test]
    fn text_shrinks_when_repetitive(word in "[a-z]{4,12}", repeats in 64usize..256) {
        let text = word.repeat(repeats);
        let packed = compress(text.as_bytes(), Encoding::Gzip, 6).unwrap();
        prop_assert!(packed.len() < text.len());
    }
}
