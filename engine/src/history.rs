//! Append-only event log and the rebase rules.
//!
//! Every event a document applies lands in its history, stamped with the
//! clock at commit time and the priority of the producing transaction. The
//! entry's clock is its log position: all events of one transaction share a
//! clock, and the clock of the next transaction is one higher.
//!
//! When a transaction arrives whose start clock lags the local clock, the
//! receiver has applied transactions the sender had not seen. [`rebase`]
//! rewrites the incoming events against that unseen segment: events that
//! lost a conflict become [`Event::Null`] tombstones, and the survivors are
//! treated as though they happened after the local history. Resolution
//! compares priorities, never arrival order, so every replica that sees the
//! same two conflicting transactions picks the same winner.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::{Clock, Priority};

/// Default bound on retained history entries.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// One applied event, stamped for later rebases.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Document clock at the moment the event's transaction committed.
    pub clock: Clock,
    /// Resolve priority of the producing transaction.
    pub priority: Priority,
    pub event: Event,
}

/// Bounded per-document log of applied events.
///
/// Trimming removes whole transactions from the front (entries sharing a
/// clock are never split), so a rebase segment can never see half a
/// transaction. Rebasing from before the retained window fails with
/// [`Error::HistoryTrimmed`]; a replica that far behind needs a snapshot.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
    /// First clock still covered by the log.
    retained_from: Clock,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            retained_from: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.limit {
            let Some(front_clock) = self.entries.front().map(|e| e.clock) else {
                break;
            };
            while self
                .entries
                .front()
                .is_some_and(|e| e.clock == front_clock)
            {
                self.entries.pop_front();
            }
            self.retained_from = front_clock + 1;
        }
    }

    /// Drop everything; the log now covers nothing before `clock`. Used when
    /// a snapshot replaces the whole document state.
    pub fn clear_to(&mut self, clock: Clock) {
        self.entries.clear();
        self.retained_from = clock;
    }

    /// All entries with `entry.clock >= start`: the history segment a
    /// transaction starting at `start` has not observed.
    pub fn segment(&self, start: Clock) -> Result<Vec<&HistoryEntry>> {
        if start < self.retained_from {
            return Err(Error::HistoryTrimmed {
                start_clock: start,
                retained_from: self.retained_from,
            });
        }
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.clock >= start)
            .collect())
    }
}

/// Rewrite incoming events against a local history segment they did not
/// observe. Events that lost become [`Event::Null`]; relative order and
/// count are preserved.
///
/// Rules, per incoming event:
///
/// 1. A history map-set, map-delete, or array-delete whose target is a
///    strict prefix of the incoming target nulls the event: an ancestor
///    container was replaced or removed, so the event has no context left.
/// 2. An incoming map-set or map-delete against a history map-set or
///    map-delete on the same target is a direct write-write conflict. The
///    incoming event survives only when its priority is strictly higher
///    than every conflicting entry's priority.
/// 3. Array pushes conflict only through rule 1: concurrent pushes target
///    distinct stable ids and never collide.
/// 4. An incoming array-delete also nulls against a history array-delete on
///    the same target: deleting an already-deleted element is a no-op, not
///    an error.
/// 5. Null events pass through unchanged.
pub fn rebase(events: &mut [Event], incoming_priority: Priority, segment: &[&HistoryEntry]) {
    for event in events.iter_mut() {
        let Some(target) = event.target_path() else {
            continue;
        };
        let lost = segment.iter().any(|entry| {
            let Some(local_target) = entry.event.target_path() else {
                return false;
            };
            let overwrites_ancestors = matches!(
                entry.event,
                Event::MapSet { .. } | Event::MapDelete { .. } | Event::ArrayDelete { .. }
            );
            if overwrites_ancestors && local_target.is_strict_prefix_of(&target) {
                return true;
            }
            match event {
                Event::MapSet { .. } | Event::MapDelete { .. } => {
                    matches!(
                        entry.event,
                        Event::MapSet { .. } | Event::MapDelete { .. }
                    ) && local_target == target
                        && incoming_priority <= entry.priority
                }
                Event::ArrayDelete { .. } => {
                    matches!(entry.event, Event::ArrayDelete { .. }) && local_target == target
                }
                Event::ArrayPush { .. } | Event::Null => false,
            }
        });
        if lost {
            *event = Event::Null;
        }
    }
}
