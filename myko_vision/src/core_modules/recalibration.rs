// THEORY:
// Camera and stage drift slowly between manual selections. Every `interval`
// processed frames the frame loop asks the scheduler whether a recalibration
// pass is due; the pass itself reruns fast detection with each active set's
// query and replaces the set's contours (see `Session::recalibrate`).
//
// The scheduler only decides *when*. It is lock-free so the per-frame check
// costs two atomic operations, and it admits at most one pass at a time: a
// pass that is still running when the next one comes due causes that tick to
// be skipped rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct RecalibrationScheduler {
    interval: u64,
    frames: AtomicU64,
    in_flight: AtomicBool,
}

impl RecalibrationScheduler {
    /// `interval == 0` disables recalibration.
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            frames: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Counts one processed frame; true on every `interval`-th frame.
    pub fn tick(&self) -> bool {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.interval > 0 && n % self.interval == 0
    }

    /// Claims the single in-flight slot. The slot is released when the guard drops.
    pub fn try_begin(&self) -> Option<RecalibrationGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecalibrationGuard { flag: &self.in_flight })
    }
}

pub struct RecalibrationGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RecalibrationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_every_interval() {
        let scheduler = RecalibrationScheduler::new(3);
        let due: Vec<bool> = (0..7).map(|_| scheduler.tick()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn zero_interval_never_fires() {
        let scheduler = RecalibrationScheduler::new(0);
        assert!((0..100).all(|_| !scheduler.tick()));
    }

    #[test]
    fn one_pass_at_a_time() {
        let scheduler = RecalibrationScheduler::new(1);
        let guard = scheduler.try_begin();
        assert!(guard.is_some());
        assert!(scheduler.try_begin().is_none());
        drop(guard);
        assert!(scheduler.try_begin().is_some());
    }
}
