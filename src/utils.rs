//! Page and alignment arithmetic shared by the allocator and the
//! descriptor builder.

/// Allocation granularity of every pool, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Page size as a shift, for offset math on page indices.
pub const PAGE_SHIFT: u32 = 12;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

/// Convert a byte size to a page count, rounded up. Zero stays zero;
/// callers reject zero-sized requests before getting here.
#[must_use]
pub const fn bytes_to_pages(bytes: usize) -> u64 {
    align_up(bytes as u64, PAGE_SIZE as u64) >> PAGE_SHIFT
}

#[must_use]
pub const fn pages_to_bytes(pages: u64) -> usize {
    (pages << PAGE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE + 1), 2);
        assert_eq!(pages_to_bytes(3), 3 * PAGE_SIZE);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
    }
}
