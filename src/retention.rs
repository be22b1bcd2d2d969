use crate::segment::Segment;

/// Bytes held by all tracked segments.
pub fn disk_usage(segments: &[Segment]) -> u64 {
    segments.iter().map(|segment| segment.size).sum()
}

/// Number of leading segments to evict to free at least `excess` bytes.
///
/// Eviction is oldest first and stops at the write segment, so the result
/// may free less than asked for.
pub fn eviction_count(segments: &[Segment], write_segment: u64, excess: u64) -> usize {
    let mut freed = 0u64;
    let mut count = 0usize;
    for segment in segments {
        if freed >= excess || segment.id == write_segment {
            break;
        }
        freed = freed.saturating_add(segment.size);
        count += 1;
    }
    count
}
