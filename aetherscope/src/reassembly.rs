//! Per-flow TCP stream reassembly.
//!
//! The reassembler turns out-of-order, possibly-lost TCP segments into an
//! ordered byte stream per flow, delivered over a bounded channel to that
//! flow's framer task. Buffering is bounded in pages per connection and in
//! total; on overflow the oldest gap is dropped and the frame extractor
//! downstream resynchronizes. Gaps cause silent byte loss scoped to the
//! affected flow only.
//!
//! The reassembler is owned by the capture task and needs no locking.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::capture::SegmentEvent;
use crate::conf::SnifferConf;
use crate::flow::FlowKey;

/// Reassembly accounting unit.
pub(crate) const PAGE_BYTES: usize = 1900;

fn page_count(len: usize) -> usize {
    len.div_ceil(PAGE_BYTES).max(1)
}

/// Lifecycle of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    New,
    Active,
    Stalled,
    Closed,
}

pub(crate) struct TcpReassembler {
    flows: HashMap<FlowKey, FlowBuffer>,
    max_pages_per_flow: usize,
    max_pages_total: usize,
    total_pages: usize,
}

impl TcpReassembler {
    pub(crate) fn new(conf: &SnifferConf) -> Self {
        TcpReassembler {
            flows: HashMap::new(),
            max_pages_per_flow: conf.max_buffered_pages_per_flow,
            max_pages_total: conf.max_buffered_pages_total,
            total_pages: 0,
        }
    }

    /// Feed one captured segment into its flow.
    ///
    /// `on_new_flow` is invoked exactly once per previously-unseen flow and
    /// must return the sending half of the flow's byte channel (typically
    /// after spawning the framer task that owns the receiving half).
    /// Feeding an exact duplicate of a segment is a no-op.
    pub(crate) fn feed<F>(&mut self, segment: SegmentEvent, on_new_flow: F)
    where
        F: FnOnce(&FlowKey) -> mpsc::Sender<Bytes>,
    {
        let flow = segment.flow;
        let closing = segment.fin || segment.rst;

        let buf = self.flows.entry(flow).or_insert_with(|| {
            trace!(%flow, "tracking new flow");
            FlowBuffer::new(&segment, on_new_flow(&flow))
        });

        if !segment.payload.is_empty() {
            // A SYN consumes one sequence number before any data.
            let seq = if segment.syn {
                segment.seq.wrapping_add(1)
            } else {
                segment.seq
            };

            // Signed distance from the next expected byte keeps wrapping
            // sequence numbers honest within a 2 GiB window.
            let rel = seq.wrapping_sub(buf.next_seq) as i32;
            let placed = if rel < 0 {
                let overlap = rel.unsigned_abs() as usize;
                if overlap < segment.payload.len() {
                    Some((buf.next_offset, segment.payload.slice(overlap..)))
                } else {
                    // Entirely behind the delivery point: retransmission.
                    None
                }
            } else {
                Some((buf.next_offset + rel as u64, segment.payload.clone()))
            };

            if let Some((offset, data)) = placed {
                self.total_pages += buf.insert(offset, data);
                self.total_pages -= buf.deliver();

                if buf.pages > self.max_pages_per_flow {
                    warn!(%flow, pages = buf.pages, "flow exceeded page budget, dropping oldest gap");
                    self.total_pages -= buf.skip_gap();
                }
            }
        }

        let closed = buf.state == FlowState::Closed;
        if closing || closed {
            if closing {
                debug!(%flow, "flow closed by peer");
            }
            if let Some(buf) = self.flows.remove(&flow) {
                self.total_pages -= buf.pages;
            }
        }

        if self.total_pages > self.max_pages_total {
            self.shed_total_overflow();
        }
    }

    /// Drop the oldest gap across all flows until the total page budget is
    /// respected again.
    fn shed_total_overflow(&mut self) {
        while self.total_pages > self.max_pages_total {
            let oldest = self
                .flows
                .iter()
                .filter(|(_, buf)| !buf.pending.is_empty())
                .min_by_key(|(_, buf)| buf.gap_since)
                .map(|(flow, _)| *flow);

            let Some(flow) = oldest else { break };
            warn!(%flow, "total page budget exceeded, dropping oldest gap");
            let Some(buf) = self.flows.get_mut(&flow) else { break };
            let released = buf.skip_gap();
            self.total_pages -= released;
            if released == 0 {
                break;
            }
        }
    }

    /// Skip gaps in flows that have been stalled since before `cutoff`.
    /// Flows stay alive; only the stalled bytes are released.
    pub(crate) fn flush_older_than(&mut self, cutoff: Instant) {
        let mut released = 0;
        for (flow, buf) in self.flows.iter_mut() {
            let Some(since) = buf.gap_since else { continue };
            if since < cutoff {
                buf.state = FlowState::Stalled;
                debug!(%flow, "skipping gap in stalled flow");
                released += buf.skip_gap();
            }
        }
        self.total_pages -= released;
        self.flows.retain(|_, buf| buf.state != FlowState::Closed);
    }

    /// Forcibly drain every partial buffer, regardless of gaps, and close
    /// all flows. Dropping the senders EOFs the framer tasks downstream.
    pub(crate) fn flush_all(&mut self) {
        for (flow, buf) in self.flows.iter_mut() {
            trace!(%flow, "flushing flow");
            buf.flush();
        }
        self.flows.clear();
        self.total_pages = 0;
    }

    #[cfg(test)]
    fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

struct FlowBuffer {
    state: FlowState,
    /// Sequence number of the next in-order byte.
    next_seq: u32,
    /// Stream position of `next_seq`; pending chunks are keyed by stream
    /// position so ordering survives sequence wraparound.
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    pages: usize,
    /// Set while a gap blocks delivery, cleared when it fills or is
    /// skipped.
    gap_since: Option<Instant>,
    tx: mpsc::Sender<Bytes>,
}

impl FlowBuffer {
    fn new(first: &SegmentEvent, tx: mpsc::Sender<Bytes>) -> Self {
        let next_seq = if first.syn {
            first.seq.wrapping_add(1)
        } else {
            first.seq
        };
        FlowBuffer {
            state: FlowState::New,
            next_seq,
            next_offset: 0,
            pending: BTreeMap::new(),
            pages: 0,
            gap_since: None,
            tx,
        }
    }

    /// Buffer a chunk at its stream position. Returns the pages added.
    fn insert(&mut self, offset: u64, data: Bytes) -> usize {
        use std::collections::btree_map::Entry;

        match self.pending.entry(offset) {
            Entry::Occupied(mut existing) => {
                if existing.get().len() >= data.len() {
                    // Exact duplicate, or a shorter retransmit.
                    return 0;
                }
                let added = page_count(data.len()) - page_count(existing.get().len());
                existing.insert(data);
                self.pages += added;
                added
            }
            Entry::Vacant(slot) => {
                let added = page_count(data.len());
                slot.insert(data);
                self.pages += added;
                added
            }
        }
    }

    /// Deliver buffered chunks that are contiguous with the stream head.
    /// Returns the pages released.
    fn deliver(&mut self) -> usize {
        let mut released = 0;

        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            if offset > self.next_offset {
                if self.gap_since.is_none() {
                    self.gap_since = Some(Instant::now());
                }
                break;
            }

            let chunk = entry.remove();
            let pages = page_count(chunk.len());
            self.pages -= pages;
            released += pages;

            // The front of the chunk may repeat already-delivered bytes.
            let skip = (self.next_offset - offset) as usize;
            if skip >= chunk.len() {
                continue;
            }
            let payload = chunk.slice(skip..);
            self.advance(payload.len());

            if self.tx.blocking_send(payload).is_err() {
                // Framer is gone; nothing left to deliver to.
                self.state = FlowState::Closed;
                released += self.pages;
                self.pages = 0;
                self.pending.clear();
                return released;
            }
            self.state = FlowState::Active;
        }

        if self.pending.is_empty() {
            self.gap_since = None;
        }
        released
    }

    /// Jump the stream head to the first buffered chunk, abandoning the
    /// bytes lost in the gap, then deliver. Returns the pages released.
    fn skip_gap(&mut self) -> usize {
        let Some((&first, _)) = self.pending.first_key_value() else {
            return 0;
        };
        if first > self.next_offset {
            let jump = first - self.next_offset;
            trace!(skipped = jump, "skipping reassembly gap");
            self.next_seq = self.next_seq.wrapping_add(jump as u32);
            self.next_offset = first;
        }
        self.gap_since = None;
        self.deliver()
    }

    /// Deliver everything left in order, gaps included, then close.
    fn flush(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            let chunk = entry.remove();

            if offset > self.next_offset {
                self.next_seq = self.next_seq.wrapping_add((offset - self.next_offset) as u32);
                self.next_offset = offset;
            }
            let skip = (self.next_offset - offset) as usize;
            if skip >= chunk.len() {
                continue;
            }
            let payload = chunk.slice(skip..);
            self.advance(payload.len());
            if self.tx.blocking_send(payload).is_err() {
                break;
            }
        }
        self.pending.clear();
        self.pages = 0;
        self.state = FlowState::Closed;
    }

    fn advance(&mut self, len: usize) {
        self.next_offset += len as u64;
        self.next_seq = self.next_seq.wrapping_add(len as u32);
    }
}
