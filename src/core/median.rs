//! Rolling median of recently observed item sizes
//!
//! The fetch workers feed every item size they see into a shared window and
//! periodically consult the median to re-derive their batch-size hint. The
//! window is a heuristic input only; an off-by-one around the middle element
//! is acceptable.

use std::sync::Mutex;

/// Fixed-size ring of the last `k` observed item sizes.
pub struct MedianWindow {
    inner: Mutex<Window>,
}

struct Window {
    sizes: Vec<usize>,
    seen: u64,
}

impl MedianWindow {
    /// Create a window holding `capacity` samples. The median is unavailable
    /// until the ring has filled once.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Window {
                sizes: vec![0; capacity.max(1)],
                seen: 0,
            }),
        }
    }

    /// Record one observed item size, evicting the oldest sample once full.
    pub fn push(&self, size: usize) {
        let mut window = self.inner.lock().unwrap();
        let slot = (window.seen % window.sizes.len() as u64) as usize;
        window.sizes[slot] = size;
        window.seen += 1;
    }

    /// The middle element of a sorted copy of the ring, or `None` until the
    /// ring has filled once.
    pub fn median(&self) -> Option<usize> {
        let window = self.inner.lock().unwrap();
        if window.seen < window.sizes.len() as u64 {
            return None;
        }
        let mut sorted = window.sizes.clone();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }
}
