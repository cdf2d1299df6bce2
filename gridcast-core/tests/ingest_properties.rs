//! Property tests for the client ingest buffer.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use gridcast_core::client::{
    AppendError, CommitOutcome, Completion, IngestBuffer, PlaybackSink,
};
use gridcast_core::config::IngestConfig;
use proptest::prelude::*;

/// Sink that defers every append and fails the ones it is told to.
#[derive(Default)]
struct ScriptedSink {
    appended: Vec<u64>,
    failures: VecDeque<bool>,
    updating: bool,
    overlapping_appends: u32,
}

impl PlaybackSink for ScriptedSink {
    fn append(&mut self, fragment: &Bytes) -> Result<Completion, AppendError> {
        if self.updating {
            self.overlapping_appends += 1;
        }
        if self.failures.pop_front().unwrap_or(false) {
            return Err(AppendError::Rejected("decode error".to_string()));
        }
        self.appended.push(sequence(fragment));
        self.updating = true;
        Ok(Completion::Pending)
    }

    fn is_updating(&self) -> bool {
        self.updating
    }

    fn buffered_range(&self) -> Option<(Duration, Duration)> {
        None
    }

    fn current_time(&self) -> Duration {
        Duration::ZERO
    }

    fn remove(&mut self, _start: Duration, _end: Duration) -> Result<Completion, AppendError> {
        Ok(Completion::Immediate)
    }
}

fn fragment(seq: u64) -> Bytes {
    Bytes::copy_from_slice(&seq.to_be_bytes())
}

fn sequence(fragment: &Bytes) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&fragment[..8]);
    u64::from_be_bytes(raw)
}

fn config(max_queue_len: usize, max_chunk_errors: u32) -> IngestConfig {
    IngestConfig {
        max_queue_len,
        max_chunk_errors,
        ..IngestConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    /// A fragment arrives; the flag says whether its first append attempt fails
    Arrive(bool),
    SinkReady,
    RetryTimer,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<bool>().prop_map(Op::Arrive),
        3 => Just(Op::SinkReady),
        1 => Just(Op::RetryTimer),
    ]
}

fn apply(buffer: &mut IngestBuffer<ScriptedSink>, op: &Op, next_seq: &mut u64) {
    match op {
        Op::Arrive(fail) => {
            buffer.sink_mut().failures.push_back(*fail);
            let seq = *next_seq;
            *next_seq += 1;
            buffer.on_fragment_arrived(fragment(seq));
        }
        Op::SinkReady => {
            if buffer.sink().updating {
                buffer.sink_mut().updating = false;
                buffer.on_sink_ready();
            }
        }
        Op::RetryTimer => {
            buffer.on_retry_timer();
        }
    }
}

proptest! {
    #[test]
    fn appends_preserve_arrival_order(
        ops in prop::collection::vec(op(), 1..200),
        max_queue_len in 1usize..20,
        max_chunk_errors in 1u32..5,
    ) {
        let mut buffer = IngestBuffer::new(ScriptedSink::default(), config(max_queue_len, max_chunk_errors));
        let mut next_seq = 0;
        for op in &ops {
            apply(&mut buffer, op, &mut next_seq);
        }

        let appended = &buffer.sink().appended;
        prop_assert!(appended.windows(2).all(|pair| pair[0] < pair[1]), "reordered: {:?}", appended);
        prop_assert!(appended.iter().all(|seq| *seq < next_seq));
    }

    #[test]
    fn sink_never_sees_overlapping_appends(
        ops in prop::collection::vec(op(), 1..200),
        max_queue_len in 1usize..20,
    ) {
        let mut buffer = IngestBuffer::new(ScriptedSink::default(), config(max_queue_len, 3));
        let mut next_seq = 0;
        for op in &ops {
            apply(&mut buffer, op, &mut next_seq);
            prop_assert_eq!(buffer.is_sink_busy(), buffer.sink().updating);
        }

        prop_assert_eq!(buffer.sink().overlapping_appends, 0);
    }

    #[test]
    fn burst_keeps_queue_bounded_and_newest(
        burst in 1usize..300,
        max_queue_len in 1usize..40,
    ) {
        let mut buffer = IngestBuffer::new(ScriptedSink::default(), config(max_queue_len, 3));

        // Seq 0 occupies the sink so the burst queues up behind it.
        buffer.on_fragment_arrived(fragment(0));
        prop_assert!(buffer.is_sink_busy());

        for seq in 1..=burst as u64 {
            buffer.on_fragment_arrived(fragment(seq));
            prop_assert!(buffer.queue_len() <= max_queue_len);
        }

        let kept = buffer.queue_len() as u64;
        while buffer.sink().updating {
            buffer.sink_mut().updating = false;
            buffer.on_sink_ready();
        }

        let drained: Vec<u64> = buffer.sink().appended[1..].to_vec();
        let newest: Vec<u64> = (burst as u64 - kept + 1..=burst as u64).collect();
        prop_assert_eq!(drained, newest);

        let stats = buffer.stats();
        prop_assert_eq!(stats.received, burst as u64 + 1);
        prop_assert_eq!(stats.appended + stats.dropped_overflow, burst as u64 + 1);
    }
}

#[test]
fn error_budget_flushes_queue_and_recovers() {
    let max_chunk_errors = 3;
    let mut buffer = IngestBuffer::new(ScriptedSink::default(), config(50, max_chunk_errors));
    buffer.sink_mut().failures = VecDeque::from(vec![true; max_chunk_errors as usize]);

    buffer.on_fragment_arrived(fragment(0));
    buffer.on_fragment_arrived(fragment(1));
    buffer.on_fragment_arrived(fragment(2));
    assert_eq!(buffer.consecutive_errors(), 1);
    assert_eq!(buffer.queue_len(), 3);

    assert!(matches!(
        buffer.on_retry_timer(),
        CommitOutcome::RetryScheduled(_)
    ));
    assert_eq!(buffer.consecutive_errors(), 2);

    assert_eq!(
        buffer.on_retry_timer(),
        CommitOutcome::Flushed { dropped: 3 }
    );
    assert_eq!(buffer.queue_len(), 0);
    assert_eq!(buffer.consecutive_errors(), 0);

    buffer.on_fragment_arrived(fragment(3));
    assert_eq!(buffer.sink().appended, [3]);
    assert_eq!(buffer.consecutive_errors(), 0);

    let stats = buffer.stats();
    assert_eq!(stats.append_errors, 3);
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.dropped_flush, 3);
}
