use std::ops::Range;

/// Shape of a window, one extent per dimension
///
pub(crate) fn window_shape(window: &[Range<usize>]) -> Vec<usize> {
    window.iter().map(|range| range.len()).collect()
}

/// Row-major flat index of `index` in an array of `shape`
///
pub(crate) fn ravel(index: &[usize], shape: &[usize]) -> usize {
    index
        .iter()
        .zip(shape)
        .fold(0, |flat, (&i, &extent)| flat * extent + i)
}

/// Intersection of two ranges, `None` if they don't overlap
///
pub(crate) fn intersect(a: &Range<usize>, b: &Range<usize>) -> Option<Range<usize>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);

    (start < end).then_some(start..end)
}

/// Iterate over every index of a window in row-major order
///
pub(crate) struct WindowIter {
    window: Vec<Range<usize>>,
    next: Option<Vec<usize>>,
}

impl WindowIter {
    pub(crate) fn new(window: Vec<Range<usize>>) -> Self {
        let next = if window.iter().any(|range| range.is_empty()) {
            None
        } else {
            Some(window.iter().map(|range| range.start).collect())
        };

        Self { window, next }
    }
}

impl Iterator for WindowIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;

        let mut next = current.clone();
        for dim in (0..next.len()).rev() {
            next[dim] += 1;
            if next[dim] < self.window[dim].end {
                self.next = Some(next);
                break;
            }
            next[dim] = self.window[dim].start;
        }

        Some(current)
    }
}
