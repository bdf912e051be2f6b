// Rewind - EVM State Time Machine
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Pull-based timeline event stream.
//!
//! An [`EventStream`] walks blocks one at a time, asking its [`EventSource`] for the head
//! and for the events of the next block. When it catches up with the head it sleeps for
//! a fixed poll interval. There is no resumable cursor: a consumer that wants to resume
//! later re-issues `stream_events(last_block + 1, ..)` using [`EventStream::last_block`].
//! Dropping the stream is the cancellation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, Stream};
use rewind_common::{AdapterError, TimelineEvent};
use tracing::{debug, trace};

/// Default delay between head polls once the stream has caught up.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where an [`EventStream`] reads blocks from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Current head block.
    async fn head(&self) -> Result<u64, AdapterError>;

    /// Every event of block `number`: the block itself, its transactions, then its logs.
    async fn block_events(&self, number: u64) -> Result<Vec<TimelineEvent>, AdapterError>;
}

/// Lazy sequence of timeline events, one block per batch.
pub struct EventStream {
    source: Arc<dyn EventSource>,
    next_block: u64,
    end: Option<u64>,
    poll_interval: Duration,
    last_block: Option<u64>,
    exhausted: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("next_block", &self.next_block)
            .field("end", &self.end)
            .field("poll_interval", &self.poll_interval)
            .field("last_block", &self.last_block)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl EventStream {
    /// Stream over `start..=end`, or from `start` forever.
    pub fn new(source: Arc<dyn EventSource>, start: u64, end: Option<u64>) -> Self {
        Self {
            source,
            next_block: start,
            end,
            poll_interval: DEFAULT_POLL_INTERVAL,
            last_block: None,
            exhausted: end.is_some_and(|end| end < start),
        }
    }

    /// Sets the head poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Last block whose events were returned.
    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }

    /// Events of the next block, waiting for it if necessary.
    ///
    /// `Ok(None)` once the end block has been delivered. An error ends the stream.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<TimelineEvent>>, AdapterError> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let head = match self.source.head().await {
                Ok(head) => head,
                Err(e) => {
                    self.exhausted = true;
                    return Err(e);
                }
            };

            if self.next_block <= head {
                let number = self.next_block;
                let events = match self.source.block_events(number).await {
                    Ok(events) => events,
                    Err(e) => {
                        self.exhausted = true;
                        return Err(e);
                    }
                };
                trace!(block = number, events = events.len(), "stream batch");

                self.last_block = Some(number);
                self.next_block = number + 1;
                if self.end.is_some_and(|end| number >= end) {
                    self.exhausted = true;
                }
                return Ok(Some(events));
            }

            debug!(next = self.next_block, head, "stream caught up with head, polling");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Adapts the stream into a [`futures::Stream`] of per-block batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<TimelineEvent>, AdapterError>> {
        stream::unfold(self, |mut events| async move {
            match events.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), events)),
                Ok(None) => None,
                Err(e) => Some((Err(e), events)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use rewind_common::TimelineEventKind;

    /// Head grows by one on every poll.
    struct GrowingChain {
        head: Mutex<u64>,
    }

    #[async_trait]
    impl EventSource for GrowingChain {
        async fn head(&self) -> Result<u64, AdapterError> {
            let mut head = self.head.lock();
            *head += 1;
            Ok(*head - 1)
        }

        async fn block_events(&self, number: u64) -> Result<Vec<TimelineEvent>, AdapterError> {
            Ok(vec![TimelineEvent {
                block_number: number,
                kind: TimelineEventKind::Block { hash: B256::ZERO, timestamp: number, tx_count: 0 },
            }])
        }
    }

    fn source(head: u64) -> Arc<dyn EventSource> {
        Arc::new(GrowingChain { head: Mutex::new(head) })
    }

    #[tokio::test]
    async fn test_bounded_stream_ends() {
        let mut events = EventStream::new(source(10), 3, Some(5));
        let mut seen = Vec::new();
        while let Some(batch) = events.next_batch().await.unwrap() {
            seen.push(batch[0].block_number);
        }
        assert_eq!(seen, vec![3, 4, 5]);
        assert_eq!(events.last_block(), Some(5));
        assert!(events.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unbounded_stream_waits_for_new_blocks() {
        let events = EventStream::new(source(0), 2, None).with_poll_interval(Duration::from_millis(1));
        let batches: Vec<_> = events.into_stream().take(3).collect().await;
        let blocks: Vec<u64> = batches.into_iter().map(|b| b.unwrap()[0].block_number).collect();
        assert_eq!(blocks, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_empty_range() {
        let mut events = EventStream::new(source(10), 5, Some(4));
        assert!(events.next_batch().await.unwrap().is_none());
        assert_eq!(events.last_block(), None);
    }
}
