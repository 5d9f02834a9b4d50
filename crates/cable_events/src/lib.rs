#![forbid(unsafe_code)]

//! Indexed collection of pop-only event streams, one per cell of a group.
//!
//! Events live in flat arrays partitioned per stream by
//! `span_begin`/`span_end`; `mark` designates the prefix scheduled for
//! delivery in the current sub-step. Streams only ever move forward: marked
//! events are consumed exactly once and then dropped.
//!
//! The stream is generic over the event payload, so the same machinery
//! carries synaptic deliveries and probe sample schedules.

use cable_core::{DeliverableEvent, SampleEvent, TargetHandle};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EventStreamError {
    #[error("event batch not sorted by (cell, time) at position {position}")]
    UnsortedBatch { position: usize },
    #[error("event cell index {cell} out of range for {n_streams} streams")]
    CellOutOfRange { cell: u32, n_streams: usize },
}

/// Contract for events a stream can carry: an owning stream index, a
/// delivery time and a payload handed to the consumer.
pub trait StreamEvent: Copy {
    type Data: Copy + std::fmt::Debug;

    fn cell(&self) -> u32;
    fn time(&self) -> f64;
    fn data(&self) -> Self::Data;
}

impl StreamEvent for DeliverableEvent {
    type Data = (TargetHandle, f64);

    fn cell(&self) -> u32 {
        self.cell
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn data(&self) -> Self::Data {
        (self.handle, self.weight)
    }
}

impl StreamEvent for SampleEvent {
    type Data = (cable_core::ProbeHandle, u32);

    fn cell(&self) -> u32 {
        self.cell
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn data(&self) -> Self::Data {
        (self.probe, self.offset)
    }
}

/// One marked event, ready for dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marked<D: Copy> {
    pub time: f64,
    pub data: D,
}

#[derive(Debug, Clone)]
pub struct MultiEventStream<E: StreamEvent> {
    n_streams: usize,
    ev_time: Vec<f64>,
    ev_data: Vec<E::Data>,
    span_begin: Vec<usize>,
    span_end: Vec<usize>,
    mark: Vec<usize>,
    n_nonempty: usize,
}

/// Streams of synaptic deliveries.
pub type DeliverableEventStream = MultiEventStream<DeliverableEvent>;
/// Streams of scheduled probe read-outs.
pub type SampleEventStream = MultiEventStream<SampleEvent>;

impl<E: StreamEvent> MultiEventStream<E> {
    pub fn new(n_streams: usize) -> Self {
        Self {
            n_streams,
            ev_time: Vec::new(),
            ev_data: Vec::new(),
            span_begin: vec![0; n_streams],
            span_end: vec![0; n_streams],
            mark: vec![0; n_streams],
            n_nonempty: 0,
        }
    }

    pub fn n_streams(&self) -> usize {
        self.n_streams
    }

    pub fn empty(&self) -> bool {
        self.n_nonempty == 0
    }

    pub fn clear(&mut self) {
        self.ev_time.clear();
        self.ev_data.clear();
        self.span_begin.iter_mut().for_each(|x| *x = 0);
        self.span_end.iter_mut().for_each(|x| *x = 0);
        self.mark.iter_mut().for_each(|x| *x = 0);
        self.n_nonempty = 0;
    }

    /// Populate from a batch sorted by (cell, time). Any previous content
    /// is discarded.
    pub fn init(&mut self, staged: &[E]) -> Result<(), EventStreamError> {
        for (position, pair) in staged.windows(2).enumerate() {
            let a = (pair[0].cell(), pair[0].time());
            let b = (pair[1].cell(), pair[1].time());
            if !(a <= b) {
                return Err(EventStreamError::UnsortedBatch {
                    position: position + 1,
                });
            }
        }
        if let Some(ev) = staged.iter().find(|ev| ev.cell() as usize >= self.n_streams) {
            return Err(EventStreamError::CellOutOfRange {
                cell: ev.cell(),
                n_streams: self.n_streams,
            });
        }

        self.ev_time.clear();
        self.ev_data.clear();
        self.ev_time.extend(staged.iter().map(|ev| ev.time()));
        self.ev_data.extend(staged.iter().map(|ev| ev.data()));

        // Partition the flat arrays by stream.
        let mut ev_i = 0usize;
        self.n_nonempty = 0;
        for stream in 0..self.n_streams {
            self.span_begin[stream] = ev_i;
            while ev_i < staged.len() && (staged[ev_i].cell() as usize) == stream {
                ev_i += 1;
            }
            self.span_end[stream] = ev_i;
            self.mark[stream] = self.span_begin[stream];
            if self.span_begin[stream] != self.span_end[stream] {
                self.n_nonempty += 1;
            }
        }
        Ok(())
    }

    /// Extend each stream's marked prefix to cover every event with
    /// time ≤ `t_until[stream]`.
    pub fn mark_until_after(&mut self, t_until: &[f64]) {
        debug_assert_eq!(t_until.len(), self.n_streams);
        for stream in 0..self.n_streams {
            let mut mark = self.mark[stream];
            while mark < self.span_end[stream] && self.ev_time[mark] <= t_until[stream] {
                mark += 1;
            }
            self.mark[stream] = mark;
        }
    }

    /// Marked events of one stream, in delivery order.
    pub fn marked_range(&self, stream: usize) -> impl Iterator<Item = Marked<E::Data>> + '_ {
        let begin = self.span_begin[stream];
        let end = self.mark[stream];
        (begin..end).map(move |i| Marked {
            time: self.ev_time[i],
            data: self.ev_data[i],
        })
    }

    /// Advance every stream past its marked prefix.
    pub fn drop_marked_events(&mut self) {
        for stream in 0..self.n_streams {
            if self.span_begin[stream] != self.span_end[stream]
                && self.mark[stream] == self.span_end[stream]
            {
                self.n_nonempty -= 1;
            }
            self.span_begin[stream] = self.mark[stream];
        }
    }

    /// Shorten `t_until[stream]` to the stream's next pending event time
    /// where that event falls earlier.
    pub fn event_time_if_before(&self, t_until: &mut [f64]) {
        debug_assert_eq!(t_until.len(), self.n_streams);
        for stream in 0..self.n_streams {
            let begin = self.span_begin[stream];
            if begin != self.span_end[stream] && self.ev_time[begin] < t_until[stream] {
                t_until[stream] = self.ev_time[begin];
            }
        }
    }

    /// Earliest pending event time on any stream.
    pub fn min_pending_time(&self) -> Option<f64> {
        let mut min: Option<f64> = None;
        for stream in 0..self.n_streams {
            let begin = self.span_begin[stream];
            if begin != self.span_end[stream] {
                let t = self.ev_time[begin];
                min = Some(match min {
                    Some(m) if m <= t => m,
                    _ => t,
                });
            }
        }
        min
    }
}
