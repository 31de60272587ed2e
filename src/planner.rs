use crate::state::Segment;

/// Splits the resource into contiguous byte-range segments, one per
/// connection. Falls back to a single whole-body segment when the server
/// does not honor range requests or the size is unknown; a connection
/// count of zero is treated as one.
///
/// A zero-length resource cannot be expressed with inclusive offsets and
/// short-circuits to the same single open-ended segment: there is nothing
/// to partition, and a plain request yields the empty body.
pub fn plan(total_size: Option<u64>, connections: usize, resumable: bool) -> Vec<Segment> {
    let total = match total_size {
        Some(total) if total > 0 && resumable => total,
        _ => {
            let end = total_size.and_then(|t| t.checked_sub(1));
            return vec![Segment::new(0, 0, end)];
        }
    };

    // Never plan more segments than there are bytes.
    let count = (connections.max(1) as u64).min(total);
    let part_size = total / count;

    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * part_size;
        // The last segment absorbs the remainder of the division.
        let end = if i == count - 1 {
            total - 1
        } else {
            (i + 1) * part_size - 1
        };
        segments.push(Segment::new(i as usize, start, Some(end)));
    }
    segments
}
