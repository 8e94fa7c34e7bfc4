//! Read side of the buffer ring.
//!
//! A reader normally takes a shared lock on the last published slot without
//! blocking. Two cases make it wait (bounded) on the slot being written
//! instead: it has already consumed the latest frame, or the writer is
//! predicted to swap before the read could complete. Either way the reader
//! never goes back in time: a frame older than the last one it saw is not
//! delivered.

use crate::predictor::SwapPredictor;
use crate::ring::LayerRing;
use dermis_rt::{ReadHold, WaitError, now_ns};
use dermis_types::SensorResponse;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// A consistent frame of one layer, valid while the read lock is held.
pub struct FrameView<'a> {
    slot: usize,
    timestamp_ns: u64,
    responses: &'a [AtomicU16],
}

impl<'a> FrameView<'a> {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Monotonic ns at which the frame was published.
    #[inline]
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    #[inline]
    pub fn get(&self, sensor: usize) -> SensorResponse {
        self.responses[sensor].load(Ordering::Relaxed)
    }

    pub fn iter(&self) -> impl Iterator<Item = SensorResponse> + 'a {
        self.responses.iter().map(|r| r.load(Ordering::Relaxed))
    }

    pub fn to_vec(&self) -> Vec<SensorResponse> {
        self.iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A frame was delivered.
    Delivered,
    /// The only frame obtainable was older than the last delivered one.
    Stale,
    /// The caller asked to stop while the reader was waiting.
    Aborted,
}

pub struct RingReader {
    ring: Arc<LayerRing>,
    last_slot: Option<usize>,
    last_ts: u64,
    protection: SwapPredictor,
    prediction: bool,
}

impl RingReader {
    pub fn new(ring: Arc<LayerRing>) -> Self {
        Self {
            ring,
            last_slot: None,
            last_ts: 0,
            protection: SwapPredictor::for_reader(),
            prediction: true,
        }
    }

    #[inline]
    pub fn ring(&self) -> &Arc<LayerRing> {
        &self.ring
    }

    /// Timestamp of the last delivered frame; 0 before the first.
    #[inline]
    pub fn last_timestamp_ns(&self) -> u64 {
        self.last_ts
    }

    #[inline]
    pub fn protection_ns(&self) -> u64 {
        self.protection.estimate_ns()
    }

    /// Toggle waiting for an imminent swap instead of reading the
    /// current frame.
    pub fn set_swap_skip_prediction(&mut self, enabled: bool) {
        self.prediction = enabled;
    }

    pub fn swap_skip_prediction(&self) -> bool {
        self.prediction
    }

    /// Read one frame and hand it to `consume`.
    ///
    /// Waits on the slot being written are bounded by `wait`; after each
    /// timeout `abort` is consulted and, if it says so, the read gives up
    /// with [`ReadStatus::Aborted`]. `on_retry` runs each time a non-blocking
    /// lock misses because the writer just swapped. An invalidated slot lock
    /// is returned as an error.
    pub fn read<F>(
        &mut self,
        wait: Duration,
        mut abort: impl FnMut() -> bool,
        mut on_retry: impl FnMut(),
        consume: F,
    ) -> Result<ReadStatus, WaitError>
    where
        F: FnOnce(&FrameView<'_>),
    {
        if self.ring.is_single_buffer() {
            let ts = self.ring.header().write_time(0);
            return Ok(self.deliver(0, ts, None, consume));
        }

        let mut force_wait = false;
        loop {
            let h = self.ring.header();
            let buffer = h.last_written();
            let ts = h.write_time(buffer);
            let now = now_ns();
            let already_seen = ts == 0 || (self.last_slot == Some(buffer) && self.last_ts >= ts);
            let swap_imminent =
                self.prediction && now + self.protection.estimate_ns() > h.next_predicted_swap();

            if force_wait || already_seen || swap_imminent {
                let target = h.being_written();
                let Some(lock) = self.ring.lock(target) else {
                    return Err(WaitError::Invalid);
                };
                let hold = loop {
                    match lock.read_for(wait) {
                        Ok(hold) => break hold,
                        Err(WaitError::Timeout) | Err(WaitError::WouldBlock) => {
                            if abort() {
                                return Ok(ReadStatus::Aborted);
                            }
                        }
                        Err(WaitError::Invalid) => return Err(WaitError::Invalid),
                    }
                };
                let ts = self.ring.header().write_time(target);
                return Ok(self.deliver(target, ts, Some(hold), consume));
            }

            let Some(lock) = self.ring.lock(buffer) else {
                return Err(WaitError::Invalid);
            };
            match lock.try_read() {
                Ok(hold) => {
                    let ts = self.ring.header().write_time(buffer);
                    return Ok(self.deliver(buffer, ts, Some(hold), consume));
                }
                Err(WaitError::Invalid) => return Err(WaitError::Invalid),
                Err(_) => {
                    on_retry();
                    // Still the same slot: the writer has not published past it,
                    // so spinning on it is pointless.
                    force_wait = self.ring.header().last_written() == buffer;
                    if abort() {
                        return Ok(ReadStatus::Aborted);
                    }
                }
            }
        }
    }

    /// Hand the locked slot to `consume`. Only the time spent here feeds the
    /// protection estimate; waiting for the lock does not.
    fn deliver<F>(&mut self, slot: usize, ts: u64, hold: Option<ReadHold>, consume: F) -> ReadStatus
    where
        F: FnOnce(&FrameView<'_>),
    {
        let started = now_ns();
        if ts < self.last_ts {
            return ReadStatus::Stale;
        }
        let view = FrameView {
            slot,
            timestamp_ns: ts,
            responses: self.ring.slot(slot),
        };
        consume(&view);
        drop(hold);
        self.last_slot = Some(slot);
        self.last_ts = ts;
        self.protection.update_if_larger(now_ns().saturating_sub(started));
        ReadStatus::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProcessRegistry, ResourceRegistry};
    use crate::ring::RingConfig;
    use crate::writer::RingWriter;
    use dermis_types::LayerId;

    fn setup(buffers: usize) -> (Arc<LayerRing>, RingWriter) {
        let reg: Arc<dyn ResourceRegistry> = ProcessRegistry::new();
        let ring = Arc::new(
            LayerRing::create(&reg, LayerId(0), RingConfig::new(buffers, 3, 100)).unwrap(),
        );
        let w = RingWriter::new(Arc::clone(&ring), Duration::from_millis(10)).unwrap();
        (ring, w)
    }

    fn publish(w: &mut RingWriter, v: u16) {
        w.slot().write_all(&[v, v, v]);
        let period = w.ring().period();
        assert!(w.swap(now_ns() + dermis_rt::as_ns(period), period));
    }

    #[test]
    fn reads_last_published_frame() {
        let (ring, mut w) = setup(3);
        publish(&mut w, 7);
        let mut r = RingReader::new(ring);
        r.set_swap_skip_prediction(false);
        let mut got = Vec::new();
        let status = r
            .read(Duration::from_millis(50), || false, || {}, |f| got = f.to_vec())
            .unwrap();
        assert_eq!(status, ReadStatus::Delivered);
        assert_eq!(got, vec![7, 7, 7]);
        assert!(r.last_timestamp_ns() > 0);
    }

    #[test]
    fn waits_for_next_frame_after_consuming_latest() {
        let (ring, mut w) = setup(3);
        publish(&mut w, 1);
        let mut r = RingReader::new(Arc::clone(&ring));
        r.set_swap_skip_prediction(false);
        r.read(Duration::from_millis(50), || false, || {}, |_| {})
            .unwrap();
        let first = r.last_timestamp_ns();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            publish(&mut w, 2);
            w
        });
        let mut got = 0;
        let status = r
            .read(Duration::from_millis(5), || false, || {}, |f| got = f.get(0))
            .unwrap();
        assert_eq!(status, ReadStatus::Delivered);
        assert_eq!(got, 2);
        assert!(r.last_timestamp_ns() > first);
        drop(writer.join().unwrap());
    }

    #[test]
    fn abort_ends_a_bounded_wait() {
        let (ring, mut w) = setup(2);
        publish(&mut w, 1);
        let mut r = RingReader::new(ring);
        r.set_swap_skip_prediction(false);
        r.read(Duration::from_millis(5), || false, || {}, |_| {})
            .unwrap();
        let mut polls = 0;
        let status = r
            .read(
                Duration::from_millis(2),
                || {
                    polls += 1;
                    polls >= 3
                },
                || {},
                |_| panic!("nothing new was published"),
            )
            .unwrap();
        assert_eq!(status, ReadStatus::Aborted);
        assert_eq!(polls, 3);
        drop(w);
    }

    #[test]
    fn invalidated_lock_is_an_error() {
        let (ring, mut w) = setup(2);
        publish(&mut w, 1);
        let mut r = RingReader::new(Arc::clone(&ring));
        r.set_swap_skip_prediction(false);
        r.read(Duration::from_millis(5), || false, || {}, |_| {})
            .unwrap();
        ring.lock(w.current_slot()).unwrap().invalidate();
        let err = r
            .read(Duration::from_secs(5), || false, || {}, |_| {})
            .unwrap_err();
        assert_eq!(err, WaitError::Invalid);
    }

    #[test]
    fn single_buffer_reads_without_locks() {
        let (ring, mut w) = setup(1);
        publish(&mut w, 4);
        let mut r = RingReader::new(ring);
        let mut got = Vec::new();
        r.read(Duration::from_millis(1), || false, || {}, |f| got = f.to_vec())
            .unwrap();
        assert_eq!(got, vec![4, 4, 4]);
    }

    #[test]
    fn protection_grows_with_slow_consumers() {
        let (ring, mut w) = setup(3);
        publish(&mut w, 1);
        let mut r = RingReader::new(ring);
        r.set_swap_skip_prediction(false);
        let before = r.protection_ns();
        r.read(Duration::from_millis(5), || false, || {}, |_| {
            std::thread::sleep(Duration::from_millis(2))
        })
        .unwrap();
        assert!(r.protection_ns() > before);
    }

    #[test]
    fn waiting_for_the_writer_does_not_feed_protection() {
        let (ring, mut w) = setup(3);
        publish(&mut w, 1);
        let mut r = RingReader::new(Arc::clone(&ring));
        r.set_swap_skip_prediction(false);
        r.read(Duration::from_millis(50), || false, || {}, |_| {})
            .unwrap();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(8));
            publish(&mut w, 2);
            w
        });
        let mut got = 0;
        let status = r
            .read(Duration::from_millis(50), || false, || {}, |f| got = f.get(0))
            .unwrap();
        assert_eq!(status, ReadStatus::Delivered);
        assert_eq!(got, 2);
        assert!(
            r.protection_ns() < 500_000,
            "protection {}ns includes the wait",
            r.protection_ns()
        );
        drop(writer.join().unwrap());
    }
}
