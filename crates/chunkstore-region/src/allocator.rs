//! Segment occupancy map for a region file.
//!
//! One flag per fixed-size segment of the file. The map is rebuilt from the
//! slot table every time a file is opened and is never persisted.

/// Tracks which segments of a region file are occupied.
#[derive(Debug, Clone, Default)]
pub struct SegmentAllocator {
    in_use: Vec<bool>,
}

impl SegmentAllocator {
    /// Create a map covering `len` free segments.
    pub fn new(len: usize) -> Self {
        Self {
            in_use: vec![false; len],
        }
    }

    /// Number of segments covered by the map.
    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    /// Whether `segment` is occupied. Segments past the end are free.
    pub fn is_used(&self, segment: usize) -> bool {
        self.in_use.get(segment).copied().unwrap_or(false)
    }

    /// Number of occupied segments.
    pub fn used_count(&self) -> usize {
        self.in_use.iter().filter(|&&used| used).count()
    }

    /// Grow the map so it covers at least `len` segments.
    pub fn grow(&mut self, len: usize) {
        if len > self.in_use.len() {
            self.in_use.resize(len, false);
        }
    }

    /// Mark `[start, start + count)` occupied.
    ///
    /// Returns `false` and leaves the map untouched if any segment in the
    /// range is already occupied.
    pub fn reserve(&mut self, start: usize, count: usize) -> bool {
        let end = start + count;
        if (start..end).any(|segment| self.is_used(segment)) {
            return false;
        }
        self.grow(end);
        self.in_use[start..end].fill(true);
        true
    }

    /// Mark `[start, start + count)` free.
    pub fn release(&mut self, start: usize, count: usize) {
        let end = (start + count).min(self.in_use.len());
        if start < end {
            self.in_use[start..end].fill(false);
        }
    }

    /// First-fit search for `count` contiguous free segments, scanning from
    /// segment 0.
    ///
    /// A free run touching the end of the map is accepted even if it is
    /// shorter than `count`; the caller grows the map (and the file) to fit.
    pub fn find_free_run(&self, count: usize) -> usize {
        let mut run_start = 0;
        let mut run_len = 0;

        for (segment, &used) in self.in_use.iter().enumerate() {
            if used {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = segment;
            }
            run_len += 1;
            if run_len == count {
                return run_start;
            }
        }

        if run_len > 0 {
            run_start
        } else {
            self.in_use.len()
        }
    }

    /// Find and reserve `count` contiguous segments, returning the first one.
    pub fn allocate(&mut self, count: usize) -> usize {
        let start = self.find_free_run(count);
        let reserved = self.reserve(start, count);
        debug_assert!(reserved, "first-fit run must be free");
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_map_is_free() {
        let map = SegmentAllocator::new(8);
        assert_eq!(map.len(), 8);
        assert_eq!(map.used_count(), 0);
        assert!(!map.is_used(3));
        assert!(!map.is_used(100)); // past the end
    }

    #[test]
    fn reserve_and_release() {
        let mut map = SegmentAllocator::new(8);
        assert!(map.reserve(2, 3));
        assert!(map.is_used(2));
        assert!(map.is_used(4));
        assert!(!map.is_used(5));
        assert_eq!(map.used_count(), 3);

        map.release(2, 3);
        assert_eq!(map.used_count(), 0);
    }

    #[test]
    fn reserve_conflict_leaves_map_unchanged() {
        let mut map = SegmentAllocator::new(8);
        assert!(map.reserve(4, 1));
        assert!(!map.reserve(2, 4));
        assert!(!map.is_used(2));
        assert!(!map.is_used(3));
        assert_eq!(map.used_count(), 1);
    }

    #[test]
    fn reserve_past_end_grows() {
        let mut map = SegmentAllocator::new(2);
        assert!(map.reserve(5, 2));
        assert_eq!(map.len(), 7);
        assert!(map.is_used(6));
    }

    #[test]
    fn first_fit_takes_earliest_hole() {
        let mut map = SegmentAllocator::new(10);
        map.reserve(0, 2);
        map.reserve(3, 2);
        map.reserve(6, 1);
        // holes: [2], [5], [7..10)
        assert_eq!(map.find_free_run(1), 2);
        assert_eq!(map.find_free_run(2), 7);
    }

    #[test]
    fn first_fit_extends_trailing_run() {
        let mut map = SegmentAllocator::new(6);
        map.reserve(0, 5);
        // only segment 5 is free, run continues past the end
        assert_eq!(map.find_free_run(3), 5);
        assert_eq!(map.allocate(3), 5);
        assert_eq!(map.len(), 8);
    }

    #[test]
    fn first_fit_on_full_map_appends() {
        let mut map = SegmentAllocator::new(4);
        map.reserve(0, 4);
        assert_eq!(map.find_free_run(2), 4);
    }

    #[test]
    fn allocate_reuses_released_run() {
        let mut map = SegmentAllocator::new(0);
        let a = map.allocate(3);
        let b = map.allocate(1);
        assert_eq!((a, b), (0, 3));
        map.release(a, 3);
        assert_eq!(map.allocate(2), 0);
        assert_eq!(map.allocate(1), 2);
        assert_eq!(map.allocate(1), 4);
    }
}
