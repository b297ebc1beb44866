//! Lock-free bitmap tracking free page frames in a heap's backing region.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free bitmap over page frames: bit set = frame in use.
///
/// Frame acquisition scans 64-bit words and claims the first clear bit with
/// a CAS; release is a single atomic clear. Scattered (non-contiguous)
/// acquisition is the normal case — the system heap hands out whatever
/// frames are free, in index order.
pub struct FrameBitmap {
    words: Box<[AtomicU64]>,
    frames: usize,
}

impl FrameBitmap {
    /// Create a bitmap with all `frames` free.
    pub fn new(frames: usize) -> Self {
        let words: Vec<AtomicU64> = (0..frames.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
            frames,
        }
    }

    /// Claim one free frame, returning its index.
    pub fn acquire(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            loop {
                let current = word.load(Ordering::Relaxed);
                if current == u64::MAX {
                    break;
                }
                let bit = (!current).trailing_zeros() as usize;
                let frame = word_idx * 64 + bit;
                if frame >= self.frames {
                    return None;
                }
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(frame),
                    Err(_) => continue,
                }
            }
        }
        None
    }

    /// Claim `count` frames, not necessarily contiguous, in index order.
    /// On exhaustion every frame claimed so far is released and `None` is
    /// returned — acquisition is all-or-nothing.
    pub fn acquire_many(&self, count: usize) -> Option<Vec<usize>> {
        let mut claimed = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire() {
                Some(frame) => claimed.push(frame),
                None => {
                    for frame in claimed {
                        self.release(frame);
                    }
                    return None;
                }
            }
        }
        Some(claimed)
    }

    /// Release a previously claimed frame.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is out of bounds.
    pub fn release(&self, frame: usize) {
        assert!(frame < self.frames, "frame index out of bounds");
        self.words[frame / 64].fetch_and(!(1 << (frame % 64)), Ordering::Release);
    }

    /// Snapshot count of free frames.
    pub fn count_free(&self) -> usize {
        let used: usize = self
            .words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                let bits = word.load(Ordering::Relaxed);
                let valid = (self.frames - i * 64).min(64);
                if valid == 64 {
                    bits.count_ones() as usize
                } else {
                    (bits & ((1 << valid) - 1)).count_ones() as usize
                }
            })
            .sum();
        self.frames - used
    }

    /// Total number of frames tracked.
    pub fn capacity(&self) -> usize {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release_roundtrip() {
        let bitmap = FrameBitmap::new(10);
        assert_eq!(bitmap.count_free(), 10);

        let a = bitmap.acquire().unwrap();
        let b = bitmap.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(bitmap.count_free(), 8);

        bitmap.release(a);
        assert_eq!(bitmap.count_free(), 9);
        assert_eq!(bitmap.acquire(), Some(a));
    }

    #[test]
    fn test_acquire_many_all_or_nothing() {
        let bitmap = FrameBitmap::new(8);
        let first = bitmap.acquire_many(6).unwrap();
        assert_eq!(first.len(), 6);

        // Only 2 frames left; a request for 3 must leave the map untouched.
        assert!(bitmap.acquire_many(3).is_none());
        assert_eq!(bitmap.count_free(), 2);

        for frame in first {
            bitmap.release(frame);
        }
        assert_eq!(bitmap.count_free(), 8);
    }

    #[test]
    fn test_non_word_aligned_capacity() {
        let bitmap = FrameBitmap::new(70);
        for i in 0..70 {
            assert_eq!(bitmap.acquire(), Some(i));
        }
        assert!(bitmap.acquire().is_none());
        assert_eq!(bitmap.count_free(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        let bitmap = Arc::new(FrameBitmap::new(256));
        let mut workers = vec![];
        for _ in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            workers.push(thread::spawn(move || {
                let mut held = vec![];
                for _ in 0..100 {
                    if let Some(frame) = bitmap.acquire() {
                        held.push(frame);
                    }
                }
                held
            }));
        }
        let mut all: Vec<usize> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "a frame was handed out twice");
        assert!(total <= 256);
    }
}
