//! Size-class padding for frame length obfuscation.
//!
//! Plaintext frames are padded up to a fixed size class before sealing, so
//! on-the-wire ciphertext lengths reveal only coarse buckets rather than
//! exact command and payload sizes. Classes must be identical on every
//! endpoint of an overlay.

/// Padding size classes in bytes, smallest first. The top class is sized so
/// a full file-transfer chunk fits without stepping to a power of two far
/// above it.
pub const SIZE_CLASSES: &[usize] = &[256, 1024, 4096, 11264];

/// Target length for a plaintext of `len` bytes.
///
/// Returns the smallest size class that fits, or `len` unchanged when the
/// plaintext already exceeds the largest class (oversized frames are framed
/// exactly; the explicit inner length keeps decoding unambiguous either way).
#[must_use]
pub fn padded_len(len: usize) -> usize {
    SIZE_CLASSES
        .iter()
        .find(|&&class| class >= len)
        .copied()
        .unwrap_or(len)
}

/// Extend `buf` with random bytes up to the target size class.
///
/// # Errors
///
/// Returns an error if the CSPRNG fails.
pub fn pad_to_class(buf: &mut Vec<u8>) -> Result<(), crate::CryptoError> {
    let target = padded_len(buf.len());
    let start = buf.len();
    if target > start {
        buf.resize(target, 0);
        getrandom::fill(&mut buf[start..]).map_err(|_| crate::CryptoError::RandomFailed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_len_rounds_up() {
        assert_eq!(padded_len(0), 256);
        assert_eq!(padded_len(100), 256);
        assert_eq!(padded_len(256), 256);
        assert_eq!(padded_len(257), 1024);
        assert_eq!(padded_len(4097), 11264);
    }

    #[test]
    fn test_oversized_passes_through() {
        assert_eq!(padded_len(20_000), 20_000);
    }

    #[test]
    fn test_pad_to_class_extends() {
        let mut buf = vec![0xAAu8; 100];
        pad_to_class(&mut buf).unwrap();
        assert_eq!(buf.len(), 256);
        assert_eq!(&buf[..100], &[0xAAu8; 100][..]);
    }

    #[test]
    fn test_padding_is_random() {
        let mut a = vec![0u8; 10];
        let mut b = vec![0u8; 10];
        pad_to_class(&mut a).unwrap();
        pad_to_class(&mut b).unwrap();
        assert_ne!(&a[10..], &b[10..]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_padded_len_never_shrinks(len in 0usize..65536) {
                prop_assert!(padded_len(len) >= len);
            }

            #[test]
            fn prop_padding_preserves_prefix(data in prop::collection::vec(any::<u8>(), 0..4096)) {
                let mut buf = data.clone();
                pad_to_class(&mut buf).unwrap();
                prop_assert_eq!(&buf[..data.len()], data.as_slice());
            }
        }
    }
}
