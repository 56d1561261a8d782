//! Per-run fan-out of the processed chunk sequence.
//!
//! One append-only log plus one cursor per subscriber. Every subscriber
//! reads every retained chunk exactly once, in publish order, at its own
//! pace; the producer never waits on a subscriber. Once the terminal chunk
//! has been published and every attached cursor has moved past it, the log
//! is released. A hard ceiling on buffered chunks is a backstop against a
//! producer that never terminates, not the normal release path.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::BoxStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{BufferPolicy, EvictionStrategy, ReleaseTrigger};
use crate::error::OutflowError;
use crate::types::{Chunk, RunId};

/// Subscriber-side chunk stream.
pub type ChunkStream = BoxStream<'static, Chunk>;

#[derive(Debug)]
struct ChunkLog {
    /// Absolute offset of `chunks[0]`.
    base: u64,
    chunks: VecDeque<Chunk>,
    cursors: HashMap<u64, u64>,
    next_subscriber: u64,
    terminal: bool,
    released: bool,
    /// Set while a `ModelOutput` handle is alive under `ReleaseTrigger::OutputDropped`.
    held: bool,
    evicted: u64,
    /// Abort won the race to end the run; only a terminal chunk may follow.
    aborting: bool,
    /// The producer committed to its own ending; abort is refused.
    finalizing: bool,
}

impl ChunkLog {
    fn end(&self) -> u64 {
        self.base + self.chunks.len() as u64
    }

    fn drained(&self) -> bool {
        let end = self.end();
        self.cursors.values().all(|cursor| *cursor >= end)
    }
}

enum Read {
    Chunk(Chunk),
    Pending,
    End,
}

#[derive(Debug)]
struct Shared {
    run_id: RunId,
    policy: BufferPolicy,
    log: Mutex<ChunkLog>,
    notify: Notify,
}

impl Shared {
    // The log is only ever appended to or truncated, so a poisoned lock
    // still guards a consistent value.
    fn lock(&self) -> MutexGuard<'_, ChunkLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_release(&self, log: &mut ChunkLog) {
        if log.released || !log.terminal || log.held || !log.drained() {
            return;
        }
        let released = log.chunks.len();
        log.base = log.end();
        log.chunks = VecDeque::new();
        log.released = true;
        debug!(run_id = %self.run_id, released, "run buffers released");
    }

    fn enforce_ceiling(&self, log: &mut ChunkLog) {
        let ceiling = self.policy.max_buffered_chunks.max(1);
        if log.chunks.len() <= ceiling {
            return;
        }
        let overflow = log.chunks.len() - ceiling;
        // Chunks every attached subscriber has already read.
        let consumed = log
            .cursors
            .values()
            .min()
            .map_or(0, |min| (min.saturating_sub(log.base) as usize).min(log.chunks.len()));
        let count = match self.policy.eviction {
            EvictionStrategy::ConsumedFirst => overflow.max(consumed),
            EvictionStrategy::OldestFirst => overflow,
        };
        let unread = count.saturating_sub(consumed);
        log.chunks.drain(..count);
        log.base += count as u64;
        let before = log.evicted;
        log.evicted += count as u64;

        // Warn on the first eviction and then once per ceiling's worth.
        let step = ceiling as u64;
        if before == 0 || before / step != log.evicted / step {
            warn!(
                run_id = %self.run_id,
                evicted_unread = unread,
                total_evicted = log.evicted,
                max_buffered_chunks = ceiling,
                "chunk buffer ceiling exceeded, evicting oldest chunks"
            );
        }
    }

    fn read(&self, id: u64) -> Read {
        let mut log = self.lock();
        let base = log.base;
        let end = log.end();
        let Some(cursor) = log.cursors.get_mut(&id) else {
            return Read::End;
        };
        if *cursor < base {
            warn!(
                run_id = %self.run_id,
                subscriber = id,
                skipped = base - *cursor,
                "subscriber lagged past evicted chunks"
            );
            *cursor = base;
        }
        if *cursor < end {
            let index = (*cursor - base) as usize;
            *cursor += 1;
            let chunk = log.chunks.get(index).cloned();
            self.maybe_release(&mut log);
            return chunk.map_or(Read::End, Read::Chunk);
        }
        if log.terminal || log.released {
            Read::End
        } else {
            Read::Pending
        }
    }

    fn detach(&self, id: u64) {
        let mut log = self.lock();
        if log.cursors.remove(&id).is_some() {
            self.maybe_release(&mut log);
        }
    }
}

/// Publisher side of a run's chunk log.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(run_id: RunId, policy: BufferPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                run_id,
                policy,
                log: Mutex::new(ChunkLog {
                    base: 0,
                    chunks: VecDeque::new(),
                    cursors: HashMap::new(),
                    next_subscriber: 0,
                    terminal: false,
                    released: false,
                    held: policy.release == ReleaseTrigger::OutputDropped,
                    evicted: 0,
                    aborting: false,
                    finalizing: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    /// Append a chunk. Fails once the terminal chunk has been published,
    /// and for non-terminal chunks once an abort has been accepted.
    pub fn publish(&self, chunk: Chunk) -> Result<(), OutflowError> {
        self.publish_with(chunk, |_| Ok(()))
    }

    /// Append a chunk after `record` accepts it, both under the log lock.
    /// Nothing is appended when `record` fails.
    pub(crate) fn publish_with<F>(&self, chunk: Chunk, record: F) -> Result<(), OutflowError>
    where
        F: FnOnce(&Chunk) -> Result<(), OutflowError>,
    {
        {
            let mut log = self.shared.lock();
            if log.terminal {
                return Err(OutflowError::InvalidState(format!(
                    "{} chunk published after the run's terminal chunk",
                    chunk.type_name()
                )));
            }
            if log.aborting && !chunk.is_terminal() {
                return Err(OutflowError::Aborted);
            }
            record(&chunk)?;
            log.terminal = chunk.is_terminal();
            log.chunks.push_back(chunk);
            self.shared.enforce_ceiling(&mut log);
            self.shared.maybe_release(&mut log);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Mark the log finished without a terminal chunk so subscribers end.
    /// No-op once terminal.
    pub fn close(&self) {
        {
            let mut log = self.shared.lock();
            if log.terminal {
                return;
            }
            log.terminal = true;
            self.shared.maybe_release(&mut log);
        }
        self.shared.notify.notify_waiters();
    }

    /// Claim the run's ending for an abort. `false` once the run is
    /// terminal, finalizing or already aborting.
    pub(crate) fn begin_abort(&self) -> bool {
        let mut log = self.shared.lock();
        if log.terminal || log.finalizing || log.aborting {
            return false;
        }
        log.aborting = true;
        true
    }

    /// Claim the run's ending for the producer. `false` when an abort got
    /// there first.
    pub(crate) fn begin_finalize(&self) -> bool {
        let mut log = self.shared.lock();
        if log.aborting {
            return false;
        }
        log.finalizing = true;
        true
    }

    /// Lift the `OutputDropped` hold.
    pub(crate) fn unhold(&self) {
        let mut log = self.shared.lock();
        log.held = false;
        self.shared.maybe_release(&mut log);
    }

    /// Attach a subscriber. It starts at the oldest retained chunk; after
    /// release it gets an empty stream.
    pub fn subscribe(&self) -> Subscription {
        let mut log = self.shared.lock();
        let id = log.next_subscriber;
        log.next_subscriber += 1;
        let start = log.base;
        log.cursors.insert(id, start);
        Subscription {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.lock().terminal
    }

    pub fn buffered_chunks(&self) -> usize {
        self.shared.lock().chunks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().cursors.len()
    }

    pub fn evicted_chunks(&self) -> u64 {
        self.shared.lock().evicted
    }

    pub fn is_released(&self) -> bool {
        self.shared.lock().released
    }
}

/// One subscriber's cursor into the log. Dropping it detaches the cursor.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<Shared>,
    id: u64,
}

impl Subscription {
    /// Next chunk, or `None` after the terminal chunk.
    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            match self.shared.read(self.id) {
                Read::Chunk(chunk) => return Some(chunk),
                Read::End => {
                    self.shared.detach(self.id);
                    return None;
                }
                Read::Pending => notified.await,
            }
        }
    }

    pub fn into_stream(mut self) -> ChunkStream {
        Box::pin(async_stream::stream! {
            while let Some(chunk) = self.next_chunk().await {
                yield chunk;
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkPayload, FinishReason, Usage};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn delta(run: RunId, n: usize) -> Chunk {
        Chunk::new(
            run,
            None,
            ChunkPayload::Raw {
                value: serde_json::json!(n),
            },
        )
    }

    fn finish(run: RunId) -> Chunk {
        Chunk::new(
            run,
            None,
            ChunkPayload::Finish {
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            },
        )
    }

    fn policy(max: usize) -> BufferPolicy {
        BufferPolicy {
            max_buffered_chunks: max,
            ..BufferPolicy::default()
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_same_sequence() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        let subs: Vec<_> = (0..3).map(|_| broadcaster.subscribe().into_stream()).collect();
        let readers: Vec<_> = subs
            .into_iter()
            .map(|s| tokio::spawn(s.collect::<Vec<_>>()))
            .collect();

        let mut expected = Vec::new();
        for n in 0..50 {
            let chunk = delta(run, n);
            expected.push(chunk.clone());
            broadcaster.publish(chunk).unwrap();
            if n % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        expected.push(finish(run));
        broadcaster.publish(finish(run)).unwrap();

        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }
        assert!(broadcaster.is_released());
        assert_eq!(broadcaster.buffered_chunks(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_while_running() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(delta(run, 1)).unwrap();
        let late = broadcaster.subscribe();
        broadcaster.publish(finish(run)).unwrap();
        let seen: Vec<_> = late.into_stream().collect().await;
        assert_eq!(seen.len(), 3);
        assert!(broadcaster.is_released());
    }

    #[tokio::test]
    async fn releases_immediately_without_subscribers() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(finish(run)).unwrap();
        assert!(broadcaster.is_released());
        let after: Vec<_> = broadcaster.subscribe().into_stream().collect().await;
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_holds_buffers_until_drained() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        let mut slow = broadcaster.subscribe();
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(finish(run)).unwrap();
        assert!(!broadcaster.is_released());
        assert_eq!(broadcaster.buffered_chunks(), 2);

        assert!(slow.next_chunk().await.is_some());
        assert!(slow.next_chunk().await.is_some());
        assert!(broadcaster.is_released());
        assert!(slow.next_chunk().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_a_subscriber_unblocks_release() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        let sub = broadcaster.subscribe();
        broadcaster.publish(finish(run)).unwrap();
        assert!(!broadcaster.is_released());
        drop(sub);
        assert!(broadcaster.is_released());
    }

    #[test]
    fn publish_after_terminal_is_rejected() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        broadcaster.publish(finish(run)).unwrap();
        assert!(matches!(
            broadcaster.publish(delta(run, 1)),
            Err(OutflowError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn ceiling_evicts_consumed_chunks_first() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, policy(2));
        let mut sub = broadcaster.subscribe();
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(delta(run, 1)).unwrap();
        assert!(sub.next_chunk().await.is_some());
        broadcaster.publish(delta(run, 2)).unwrap();
        assert_eq!(broadcaster.buffered_chunks(), 2);
        assert_eq!(broadcaster.evicted_chunks(), 1);
        assert_eq!(sub.next_chunk().await.unwrap(), delta(run, 1));
    }

    fn strategy(max: usize, eviction: EvictionStrategy) -> BufferPolicy {
        BufferPolicy {
            eviction,
            ..policy(max)
        }
    }

    #[tokio::test]
    async fn consumed_first_drops_everything_already_read() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, strategy(4, EvictionStrategy::ConsumedFirst));
        let mut sub = broadcaster.subscribe();
        for n in 0..4 {
            broadcaster.publish(delta(run, n)).unwrap();
        }
        for _ in 0..3 {
            sub.next_chunk().await.unwrap();
        }
        broadcaster.publish(delta(run, 4)).unwrap();
        assert_eq!(broadcaster.buffered_chunks(), 2);
        assert_eq!(broadcaster.evicted_chunks(), 3);

        let mut late = broadcaster.subscribe();
        assert_eq!(late.next_chunk().await.unwrap(), delta(run, 3));
        assert_eq!(sub.next_chunk().await.unwrap(), delta(run, 3));
    }

    #[tokio::test]
    async fn oldest_first_keeps_replay_history_up_to_the_ceiling() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, strategy(4, EvictionStrategy::OldestFirst));
        let mut sub = broadcaster.subscribe();
        for n in 0..4 {
            broadcaster.publish(delta(run, n)).unwrap();
        }
        for _ in 0..3 {
            sub.next_chunk().await.unwrap();
        }
        broadcaster.publish(delta(run, 4)).unwrap();
        assert_eq!(broadcaster.buffered_chunks(), 4);
        assert_eq!(broadcaster.evicted_chunks(), 1);

        let mut late = broadcaster.subscribe();
        assert_eq!(late.next_chunk().await.unwrap(), delta(run, 1));
        assert_eq!(sub.next_chunk().await.unwrap(), delta(run, 3));
    }

    #[test]
    fn accepted_abort_admits_only_the_terminal_chunk() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        broadcaster.publish(delta(run, 0)).unwrap();
        assert!(broadcaster.begin_abort());
        assert!(!broadcaster.begin_abort());
        assert!(!broadcaster.begin_finalize());

        let mut recorded = false;
        let late = broadcaster.publish_with(delta(run, 1), |_| {
            recorded = true;
            Ok(())
        });
        assert!(matches!(late, Err(OutflowError::Aborted)));
        assert!(!recorded);
        assert_eq!(broadcaster.buffered_chunks(), 1);

        let abort = Chunk::new(run, None, ChunkPayload::Abort { reason: None });
        broadcaster.publish(abort).unwrap();
        assert!(broadcaster.is_terminal());
    }

    #[test]
    fn finalizing_run_refuses_abort() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        assert!(broadcaster.begin_finalize());
        assert!(!broadcaster.begin_abort());
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(finish(run)).unwrap();
        assert!(!broadcaster.begin_abort());
    }

    #[test]
    fn failed_record_leaves_the_log_untouched() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        let result = broadcaster.publish_with(delta(run, 0), |_| {
            Err(OutflowError::InvalidState("rejected".into()))
        });
        assert!(matches!(result, Err(OutflowError::InvalidState(_))));
        assert_eq!(broadcaster.buffered_chunks(), 0);
    }

    #[tokio::test]
    async fn ceiling_skips_lagging_subscriber_forward() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, policy(2));
        let mut sub = broadcaster.subscribe();
        for n in 0..5 {
            broadcaster.publish(delta(run, n)).unwrap();
        }
        assert_eq!(broadcaster.evicted_chunks(), 3);
        assert_eq!(sub.next_chunk().await.unwrap(), delta(run, 3));
    }

    #[tokio::test]
    async fn close_ends_subscribers_without_terminal_chunk() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(run, BufferPolicy::default());
        let sub = broadcaster.subscribe();
        let reader = tokio::spawn(sub.into_stream().collect::<Vec<_>>());
        tokio::task::yield_now().await;
        broadcaster.close();
        assert!(reader.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_dropped_trigger_keeps_log_until_unhold() {
        let run = Uuid::new_v4();
        let broadcaster = Broadcaster::new(
            run,
            BufferPolicy {
                release: ReleaseTrigger::OutputDropped,
                ..BufferPolicy::default()
            },
        );
        broadcaster.publish(delta(run, 0)).unwrap();
        broadcaster.publish(finish(run)).unwrap();
        let replay: Vec<_> = broadcaster.subscribe().into_stream().collect().await;
        assert_eq!(replay.len(), 2);
        assert!(!broadcaster.is_released());
        broadcaster.unhold();
        assert!(broadcaster.is_released());
    }
}
