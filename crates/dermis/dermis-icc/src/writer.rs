//! Write side of the buffer ring.
//!
//! The writer always holds the write lock of the slot it is filling. A swap
//! publishes that slot and moves the hold to another slot it could lock. When
//! readers pin every other slot the writer keeps filling the same one, which
//! degrades the layer to single-buffer behavior until a slot frees up.

use crate::predictor::SwapPredictor;
use crate::ring::LayerRing;
use dermis_rt::{WaitError, WriteHold, as_ns, now_ns};
use dermis_types::SensorResponse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// Time kept back at the end of a period for the writer to wrap up.
pub const SWAP_MARGIN: Duration = Duration::from_micros(200);

pub struct RingWriter {
    ring: Arc<LayerRing>,
    cur: usize,
    hold: Option<WriteHold>,
    swap_pending: bool,
    swap_skips: u64,
    predictor: SwapPredictor,
}

impl RingWriter {
    /// Take slot 0 for writing, waiting at most `timeout` for readers to
    /// leave it.
    pub fn new(ring: Arc<LayerRing>, timeout: Duration) -> Result<Self, WaitError> {
        let hold = match ring.lock(0) {
            Some(lock) => Some(lock.write_for(timeout)?),
            None => None,
        };
        let h = ring.header();
        h.being_written.store(0, Ordering::Release);
        h.next_predicted_swap.store(now_ns(), Ordering::Release);
        Ok(Self {
            ring,
            cur: 0,
            hold,
            swap_pending: false,
            swap_skips: 0,
            predictor: SwapPredictor::for_writer(),
        })
    }

    #[inline]
    pub fn ring(&self) -> &Arc<LayerRing> {
        &self.ring
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.cur
    }

    #[inline]
    pub fn swap_skips(&self) -> u64 {
        self.swap_skips
    }

    /// Whether the last swap attempt failed and is still owed.
    #[inline]
    pub fn swap_pending(&self) -> bool {
        self.swap_pending
    }

    /// The slot the writer holds.
    pub fn slot(&self) -> SlotWriter<'_> {
        SlotWriter {
            ring: &self.ring,
            slot: self.cur,
        }
    }

    /// Feed the measured fill duration to the predictor.
    pub fn record_fill(&mut self, fill: Duration) {
        self.predictor.update(as_ns(fill));
    }

    /// One last non-blocking swap attempt for a swap owed by the previous
    /// cycle. A failure counts as a skipped swap and the writer keeps its
    /// slot for another cycle.
    pub fn last_chance_swap(&mut self) {
        if !self.swap_pending {
            return;
        }
        if !self.try_swap() {
            self.swap_skips += 1;
        }
        self.ring.header().next_predicted_swap.store(
            now_ns() + self.predictor.estimate_ns(),
            Ordering::Release,
        );
    }

    /// Publish the filled slot and move to another one.
    ///
    /// Tries every other slot without blocking first. While more than
    /// [`SWAP_MARGIN`] is left before `deadline_ns`, waits a bounded time on
    /// the next slot in rotation and tries again. Returns whether a swap
    /// happened; otherwise the swap stays owed for [`last_chance_swap`].
    ///
    /// [`last_chance_swap`]: Self::last_chance_swap
    pub fn swap(&mut self, deadline_ns: u64, period: Duration) -> bool {
        let margin = as_ns(SWAP_MARGIN);
        let swapped = loop {
            if self.try_swap() {
                break true;
            }
            let left = deadline_ns.saturating_sub(now_ns());
            if left < margin {
                break false;
            }
            let wait = Duration::from_nanos((left - margin).min(margin));
            let next = (self.cur + 1) % self.ring.buffer_count();
            if let Some(lock) = self.ring.lock(next)
                && let Ok(hold) = lock.write_for(wait)
            {
                self.publish_and_move(next, Some(hold));
                break true;
            }
        };
        self.swap_pending = !swapped;
        self.ring
            .header()
            .next_predicted_swap
            .store(now_ns() + as_ns(period), Ordering::Release);
        swapped
    }

    fn try_swap(&mut self) -> bool {
        let b = self.ring.buffer_count();
        if b == 1 {
            self.publish_and_move(0, None);
            return true;
        }
        for i in 1..b {
            let other = (self.cur + i) % b;
            let Some(lock) = self.ring.lock(other) else {
                continue;
            };
            if let Ok(hold) = lock.try_write() {
                self.publish_and_move(other, Some(hold));
                return true;
            }
        }
        false
    }

    fn publish_and_move(&mut self, next: usize, hold: Option<WriteHold>) {
        let h = self.ring.header();
        h.last_written.store(self.cur as u32, Ordering::Release);
        h.write_time[self.cur].store(now_ns(), Ordering::Release);
        // Old hold released only after publishing, so a reader locking the
        // published slot always sees its timestamp.
        self.hold = hold;
        self.cur = next;
        h.being_written.store(next as u32, Ordering::Release);
        self.swap_pending = false;
    }
}

/// Mutable view of the slot the writer holds.
pub struct SlotWriter<'a> {
    ring: &'a LayerRing,
    slot: usize,
}

impl SlotWriter<'_> {
    #[inline]
    pub fn index(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.sensor_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn set(&self, sensor: usize, value: SensorResponse) {
        self.cells()[sensor].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, sensor: usize) -> SensorResponse {
        self.cells()[sensor].load(Ordering::Relaxed)
    }

    /// Copy `values` into the slot, truncating to whichever is shorter.
    pub fn write_all(&self, values: &[SensorResponse]) {
        for (cell, v) in self.cells().iter().zip(values) {
            cell.store(*v, Ordering::Relaxed);
        }
    }

    /// Copy the last published frame into this slot, for a fill that has no
    /// new data.
    ///
    /// Nothing is copied when this slot is the published one, or when the
    /// published frame is more than a period old: then the previous swap was
    /// skipped and this slot already holds the newer frame.
    pub fn copy_from_previous(&self) -> bool {
        let h = self.ring.header();
        let last = h.last_written();
        if last == self.slot || last >= self.ring.buffer_count() {
            return false;
        }
        let written = h.write_time(last);
        if written == 0 || now_ns().saturating_sub(written) > as_ns(self.ring.period()) {
            return false;
        }
        for (dst, src) in self.cells().iter().zip(self.ring.slot(last)) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        true
    }

    #[inline]
    fn cells(&self) -> &[AtomicU16] {
        self.ring.slot(self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProcessRegistry, ResourceRegistry};
    use crate::ring::RingConfig;
    use dermis_types::LayerId;

    fn ring(buffers: usize, rate: u32) -> Arc<LayerRing> {
        let reg: Arc<dyn ResourceRegistry> = ProcessRegistry::new();
        Arc::new(LayerRing::create(&reg, LayerId(0), RingConfig::new(buffers, 4, rate)).unwrap())
    }

    #[test]
    fn swap_rotates_and_publishes() {
        let r = ring(3, 100);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        w.slot().write_all(&[1, 2, 3, 4]);
        assert!(w.swap(now_ns(), r.period()));
        assert_eq!(r.header().last_written(), 0);
        assert_eq!(r.header().being_written(), 1);
        assert!(r.header().write_time(0) > 0);
        assert_eq!(r.snapshot(0), vec![1, 2, 3, 4]);

        assert!(w.swap(now_ns(), r.period()));
        assert_eq!(w.current_slot(), 2);
        assert!(w.swap(now_ns(), r.period()));
        assert_eq!(w.current_slot(), 0);
    }

    #[test]
    fn only_the_held_slot_is_write_locked() {
        let r = ring(3, 100);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        for _ in 0..5 {
            let held = w.current_slot();
            for slot in 0..3 {
                let lock = r.lock(slot).unwrap();
                assert_eq!(lock.try_read().is_err(), slot == held);
            }
            w.swap(now_ns(), r.period());
        }
    }

    #[test]
    fn blocked_swaps_are_counted_once_per_cycle() {
        let r = ring(3, 100);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        let pin1 = r.lock(1).unwrap().try_read().unwrap();
        let pin2 = r.lock(2).unwrap().try_read().unwrap();

        for k in 1..=4u64 {
            w.last_chance_swap();
            assert!(!w.swap(now_ns(), r.period()));
            assert_eq!(w.current_slot(), 0);
            assert_eq!(w.swap_skips(), k - 1);
        }
        w.last_chance_swap();
        assert_eq!(w.swap_skips(), 4);

        drop(pin1);
        w.last_chance_swap();
        assert_eq!(w.current_slot(), 1);
        assert_eq!(w.swap_skips(), 4);
        assert!(!w.swap_pending());
        drop(pin2);
    }

    #[test]
    fn bounded_wait_on_neighbour_succeeds_when_released() {
        let r = ring(2, 10);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        let pin = r.lock(1).unwrap().try_read().unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            drop(pin);
        });
        assert!(w.swap(now_ns() + 50_000_000, r.period()));
        assert_eq!(w.current_slot(), 1);
        releaser.join().unwrap();
    }

    #[test]
    fn single_buffer_publishes_in_place() {
        let r = ring(1, 100);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        w.slot().set(2, 9);
        assert!(w.swap(now_ns(), r.period()));
        assert_eq!(w.current_slot(), 0);
        assert_eq!(r.header().last_written(), 0);
        assert_eq!(r.snapshot(0)[2], 9);
    }

    #[test]
    fn copy_from_previous_respects_freshness() {
        let r = ring(3, 10);
        let mut w = RingWriter::new(Arc::clone(&r), Duration::from_millis(10)).unwrap();
        assert!(!w.slot().copy_from_previous());
        w.slot().write_all(&[5, 6, 7, 8]);
        w.swap(now_ns(), r.period());
        assert!(w.slot().copy_from_previous());
        assert_eq!(r.snapshot(1), vec![5, 6, 7, 8]);

        // Published frame older than one period: previous swap was skipped.
        r.header().write_time[0].store(now_ns() - 500_000_000, Ordering::Release);
        w.slot().write_all(&[0, 0, 0, 0]);
        assert!(!w.slot().copy_from_previous());
        assert_eq!(r.snapshot(1), vec![0, 0, 0, 0]);
    }
}
