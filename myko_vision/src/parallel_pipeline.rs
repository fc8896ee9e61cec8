// THEORY:
// The concurrency shell around the `Session`. Network I/O runs on the async
// runtime; every piece of pixel work is pushed onto a bounded pool of blocking
// workers so the event loop never stalls on image processing.
//
// Frame ingestion is latest-frame-only. A receive loop overwrites a single
// slot on every incoming frame; the processing loop waits for the slot to
// change, takes only the newest value (marking it seen before starting work),
// and renders it. Frames that arrive while a render is in progress are
// silently replaced, which bounds latency at the cost of completeness. When
// the receive side goes away the slot's sender is dropped, which wakes the
// processing loop one final time so it can drain the last frame and stop.
//
// Every Nth processed frame the processing loop fires a drift recalibration
// pass in the background; the scheduler admits only one at a time.

use crate::error::PoolError;
use crate::pipeline::Session;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, trace, warn};

/// Bounded pool of blocking workers for CPU-heavy jobs.
#[derive(Clone, Debug)]
pub struct CpuPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl CpuPool {
    /// `workers == 0` sizes the pool to the number of CPUs.
    pub fn new(workers: usize) -> Self {
        let size = if workers == 0 { num_cpus::get() } else { workers }.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` on a blocking worker once a permit is free.
    pub async fn run<F, R>(&self, job: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });
        Ok(handle.await?)
    }
}

type Slot = Option<Arc<str>>;

/// Write side of the latest-frame slot.
#[derive(Debug)]
pub struct FrameSender {
    tx: watch::Sender<Slot>,
}

/// Read side of the latest-frame slot.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: watch::Receiver<Slot>,
}

pub fn latest_frame_slot() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = watch::channel(None);
    (FrameSender { tx }, FrameReceiver { rx })
}

impl FrameSender {
    /// Overwrites the slot. False once the processing side is gone.
    pub fn publish(&self, frame: impl Into<Arc<str>>) -> bool {
        self.tx.send(Some(frame.into())).is_ok()
    }
}

impl FrameReceiver {
    /// Waits for a frame newer than the last one taken. `None` once the
    /// sender is gone and the final frame has been taken.
    pub async fn next_frame(&mut self) -> Option<Arc<str>> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }
}

/// Feeds every frame of `incoming` into the slot. Returns the number of
/// frames received; dropping `tx` on return signals the processing loop.
pub async fn receive_frames<S>(mut incoming: S, tx: FrameSender) -> u64
where
    S: Stream<Item = String> + Unpin,
{
    let mut received = 0u64;
    while let Some(frame) = incoming.next().await {
        received += 1;
        if !tx.publish(frame) {
            debug!("frame processor gone; stopping receive loop");
            break;
        }
    }
    trace!(received, "receive loop finished");
    received
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub processed: u64,
    /// Frames passed through because their render job failed.
    pub failed: u64,
}

/// The processing loop.
pub struct FrameProcessor {
    session: Arc<Session>,
}

impl FrameProcessor {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Renders the newest frame until the slot closes or `emit` fails.
    pub async fn run<F, Fut, E>(&self, mut frames: FrameReceiver, mut emit: F) -> ProcessorStats
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut stats = ProcessorStats::default();
        while let Some(frame) = frames.next_frame().await {
            let session = Arc::clone(&self.session);
            let payload = Arc::clone(&frame);
            let rendered = match self.session.pool().run(move || session.render_frame(&payload)).await {
                Ok(out) => out,
                Err(err) => {
                    warn!(%err, "render job failed; passing frame through");
                    stats.failed += 1;
                    frame.to_string()
                }
            };
            stats.processed += 1;

            if self.session.frame_processed() {
                self.spawn_recalibration();
            }

            if let Err(err) = emit(rendered).await {
                debug!(%err, "frame sink closed");
                break;
            }
        }
        debug!(processed = stats.processed, failed = stats.failed, "frame processor stopped");
        stats
    }

    fn spawn_recalibration(&self) {
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            match session.recalibrate_latest().await {
                Ok(Some(outcome)) => debug!(updated = outcome.updated, kept = outcome.kept, "recalibrated"),
                Ok(None) => trace!("recalibration skipped"),
                Err(err) => warn!(%err, "recalibration failed"),
            }
        });
    }
}

/// Wires a frame stream through the slot and the processing loop.
pub async fn run_stream<S, F, Fut, E>(session: Arc<Session>, incoming: S, emit: F) -> ProcessorStats
where
    S: Stream<Item = String> + Send + Unpin + 'static,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let (tx, rx) = latest_frame_slot();
    let receiver = tokio::spawn(receive_frames(incoming, tx));
    let stats = FrameProcessor::new(session).run(rx, emit).await;
    receiver.abort();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_runs_jobs_and_reports_panics() {
        let pool = CpuPool::new(2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.run(|| 21 * 2).await.unwrap(), 42);
        let err = pool.run(|| -> u32 { panic!("boom") }).await.unwrap_err();
        assert!(matches!(err, PoolError::Join(_)));
    }

    #[tokio::test]
    async fn slot_keeps_only_the_newest_frame() {
        let (tx, mut rx) = latest_frame_slot();
        assert!(tx.publish("a"));
        assert!(tx.publish("b"));
        assert_eq!(rx.next_frame().await.as_deref(), Some("b"));
        drop(tx);
        assert_eq!(rx.next_frame().await, None);
    }

    #[tokio::test]
    async fn final_frame_survives_disconnect() {
        let (tx, mut rx) = latest_frame_slot();
        tx.publish("last");
        drop(tx);
        assert_eq!(rx.next_frame().await.as_deref(), Some("last"));
        assert_eq!(rx.next_frame().await, None);
    }

    #[tokio::test]
    async fn receive_loop_stops_when_processor_is_gone() {
        let (tx, rx) = latest_frame_slot();
        drop(rx);
        let frames = futures::stream::iter(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(receive_frames(frames, tx).await, 1);
    }
}
