//! The sniffer: capture loop, per-flow framer plumbing, and lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureMode, FeedEvent, PacketFeed};
use crate::conf::SnifferConf;
use crate::error::{Result, SnifferError};
use crate::extractor::{run_flow_framer, ReassembledFrame};
use crate::reassembly::TcpReassembler;

/// Observable lifecycle of a sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Stopped = 0,
    Started = 1,
    Running = 2,
    Finished = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Started,
            2 => Status::Running,
            3 => Status::Finished,
            _ => Status::Stopped,
        }
    }
}

/// Why `start` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called and the capture loop observed it.
    Stopped,
    /// The capture source ran out of packets (end of an offline file).
    EndOfStream,
}

/// A passive observer over one capture source.
///
/// The sniffer owns the capture loop and the shared frame queue. Frames are
/// consumed through [`Sniffer::next_frame`], usually via a subscriber.
pub struct Sniffer {
    conf: SnifferConf,
    shared: Arc<Shared>,
    frames: Mutex<mpsc::Receiver<ReassembledFrame>>,
    job: std::sync::Mutex<Option<CaptureJob>>,
}

struct Shared {
    status: AtomicU8,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }
}

impl Sniffer {
    /// Open a capture source and prepare a sniffer over it with the default
    /// configuration.
    ///
    /// `source` is an interface name for the `pcap` and `afpacket` modes,
    /// or a capture file path for the `file` mode.
    pub fn new(mode: CaptureMode, source: &str) -> Result<Sniffer> {
        Sniffer::with_conf(mode, source, SnifferConf::default())
    }

    /// Open a capture source with an explicit configuration.
    pub fn with_conf(mode: CaptureMode, source: &str, conf: SnifferConf) -> Result<Sniffer> {
        let feed = capture::open(mode, source, &conf)?;
        info!(%mode, source, "capture handle opened");

        let (frame_tx, frame_rx) = mpsc::channel(conf.frame_queue_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            status: AtomicU8::new(Status::Stopped as u8),
            stop_tx,
        });

        Ok(Sniffer {
            job: std::sync::Mutex::new(Some(CaptureJob {
                feed,
                frame_tx,
                stop_rx,
                conf: conf.clone(),
                shared: Arc::clone(&shared),
            })),
            conf,
            shared,
            frames: Mutex::new(frame_rx),
        })
    }

    /// Run the capture loop until the source is exhausted or [`stop`] is
    /// observed. Blocks for the life of the capture.
    ///
    /// [`stop`]: Sniffer::stop
    pub async fn start(&self) -> Result<StopReason> {
        let job = self
            .job
            .lock()
            .map_err(|_| SnifferError::Internal("sniffer state poisoned".into()))?
            .take()
            .ok_or(SnifferError::AlreadyStarted)?;

        self.shared.set_status(Status::Started);
        let handle = Handle::current();
        let shared = Arc::clone(&self.shared);

        let reason = tokio::task::spawn_blocking(move || job.run(handle))
            .await
            .map_err(|e| SnifferError::Internal(format!("capture task failed: {e}")))?;

        shared.set_status(match reason {
            StopReason::EndOfStream => Status::Finished,
            StopReason::Stopped => Status::Stopped,
        });
        Ok(reason)
    }

    /// Signal the capture loop to stop at its next poll. Idempotent; safe
    /// to call from any task.
    pub fn stop(&self) {
        // send_replace updates the flag even after the capture loop has
        // dropped its receiver.
        self.shared.stop_tx.send_replace(true);
    }

    /// True while the capture loop is starting or running.
    pub fn active(&self) -> bool {
        matches!(self.status(), Status::Started | Status::Running)
    }

    /// True once `stop` has been signalled. Subscribers poll this at the
    /// end of each frame so a stopped sniffer releases them even while
    /// frames remain queued.
    pub(crate) fn stop_requested(&self) -> bool {
        *self.shared.stop_tx.borrow()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    pub fn conf(&self) -> &SnifferConf {
        &self.conf
    }

    /// Receive the next reassembled frame from the shared queue.
    ///
    /// Returns `None` once the capture has ended and the queue is drained.
    /// The queue has a single consumer: running two subscribers against one
    /// sniffer makes them race for frames.
    pub async fn next_frame(&self) -> Option<ReassembledFrame> {
        self.frames.lock().await.recv().await
    }
}

/// Everything the capture loop owns once started.
struct CaptureJob {
    feed: PacketFeed,
    frame_tx: mpsc::Sender<ReassembledFrame>,
    stop_rx: watch::Receiver<bool>,
    conf: SnifferConf,
    shared: Arc<Shared>,
}

impl CaptureJob {
    /// The capture loop: polls the source, feeds the reassembler, spawns a
    /// framer per new flow, and drives the age-based flush ticker. Runs on
    /// a blocking thread.
    fn run(mut self, handle: Handle) -> StopReason {
        let mut reassembler = TcpReassembler::new(&self.conf);
        let mut last_flush = Instant::now();
        self.shared.set_status(Status::Running);
        debug!("capture loop running");

        loop {
            if *self.stop_rx.borrow() {
                info!("stop observed, flushing reassembler");
                reassembler.flush_all();
                return StopReason::Stopped;
            }

            if last_flush.elapsed() >= self.conf.flush_interval {
                reassembler.flush_older_than(Instant::now() - self.conf.flush_interval);
                last_flush = Instant::now();
            }

            match self.feed.poll() {
                Ok(FeedEvent::Segment(segment)) => {
                    let frame_tx = &self.frame_tx;
                    let conf = &self.conf;
                    let handle = &handle;
                    reassembler.feed(segment, |flow| {
                        let (bytes_tx, bytes_rx) = mpsc::channel(conf.flow_channel_capacity);
                        handle.spawn(run_flow_framer(
                            *flow,
                            bytes_rx,
                            frame_tx.clone(),
                            conf.max_frame_length,
                            conf.read_buffer_size,
                        ));
                        bytes_tx
                    });
                }
                Ok(FeedEvent::Idle) => continue,
                Ok(FeedEvent::End) => {
                    info!("capture source exhausted, flushing reassembler");
                    reassembler.flush_all();
                    return StopReason::EndOfStream;
                }
                Err(e) => {
                    warn!(error = %e, "capture read failed, continuing");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Status, StopReason};

    #[test]
    fn status_round_trips_through_atomics() {
        for status in [
            Status::Stopped,
            Status::Started,
            Status::Running,
            Status::Finished,
        ] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
    }

    #[test]
    fn stop_reasons_are_distinguishable() {
        assert_ne!(StopReason::Stopped, StopReason::EndOfStream);
    }
}
