//! CRC32C checksum helpers
//!
//! The engine checksums everything with CRC32C: journal entries, the
//! entry chain, metadata records and (optionally) data sub-blocks.
//! Partial sub-blocks at the edges of a write are checksummed as if the
//! missing head/tail were zero-filled, so a later full-block verify of a
//! zero-padded block yields the same value.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// CRC32C over `data` continuing from `init`
#[inline]
#[must_use]
pub fn crc32c_nopad(init: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(init, data)
}

/// CRC32C over a zero-padded sub-block: `left_pad` zero bytes, then
/// `data`, then `right_pad` zero bytes, continuing from `init`.
#[must_use]
pub fn crc32c_pad(init: u32, data: &[u8], left_pad: usize, right_pad: usize) -> u32 {
    const ZEROS: [u8; 512] = [0u8; 512];
    let mut crc = init;
    let mut left = left_pad;
    while left > 0 {
        let n = left.min(ZEROS.len());
        crc = crc32c::crc32c_append(crc, &ZEROS[..n]);
        left -= n;
    }
    crc = crc32c::crc32c_append(crc, data);
    let mut right = right_pad;
    while right > 0 {
        let n = right.min(ZEROS.len());
        crc = crc32c::crc32c_append(crc, &ZEROS[..n]);
        right -= n;
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_equals_explicit_zero_fill() {
        let data = b"partial sub-block contents";
        let mut padded = vec![0u8; 100];
        padded.extend_from_slice(data);
        padded.extend(std::iter::repeat(0u8).take(1000));

        assert_eq!(crc32c_pad(0, data, 100, 1000), compute_crc32c(&padded));
    }

    #[test]
    fn test_nopad_matches_append() {
        let a = b"first";
        let b = b"second";
        let whole = compute_crc32c(b"firstsecond");
        assert_eq!(crc32c_nopad(crc32c_nopad(0, a), b), whole);
    }

    #[test]
    fn test_verify() {
        let data = b"hello, journal";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"hello, Journal", crc));
    }
}
