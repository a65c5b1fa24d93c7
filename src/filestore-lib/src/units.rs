use crate::{FsError, FsResult};

pub const BYTES_PER_MB: u64 = 1 << 20;

/// Largest capacity the control schema can store: 8 TiB.
pub const MAX_CAPACITY_BYTES: u64 = 8 << 40;

pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(BYTES_PER_MB)
}

pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / BYTES_PER_MB
}

/// Convert an externally supplied capacity to bytes, rejecting anything above
/// [`MAX_CAPACITY_BYTES`].
pub fn capacity_mb_to_bytes(size_mb: u64) -> FsResult<u64> {
    let bytes = size_mb
        .checked_mul(BYTES_PER_MB)
        .ok_or(FsError::CapacityTooLarge(u64::MAX))?;
    check_capacity(bytes)?;
    Ok(bytes)
}

pub fn check_capacity(bytes: u64) -> FsResult<()> {
    if bytes > MAX_CAPACITY_BYTES {
        warn!(
            "capacity {} bytes exceeds max {} bytes",
            bytes, MAX_CAPACITY_BYTES
        );
        return Err(FsError::CapacityTooLarge(bytes));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mb_conversion() {
        assert_eq!(mb_to_bytes(1), 1_048_576);
        assert_eq!(bytes_to_mb(1_048_576 * 3 + 17), 3);
        assert_eq!(bytes_to_mb(mb_to_bytes(1000)), 1000);
        assert_eq!(mb_to_bytes(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_capacity_limit() {
        // 8 TiB is exactly storable
        assert_eq!(capacity_mb_to_bytes(8 * 1024 * 1024).unwrap(), MAX_CAPACITY_BYTES);

        match capacity_mb_to_bytes(8 * 1024 * 1024 + 1) {
            Err(FsError::CapacityTooLarge(bytes)) => {
                assert_eq!(bytes, MAX_CAPACITY_BYTES + BYTES_PER_MB)
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(matches!(
            capacity_mb_to_bytes(u64::MAX),
            Err(FsError::CapacityTooLarge(_))
        ));
    }
}
