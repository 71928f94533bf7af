/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::NetworkCondition;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Offset from the start of the schedule.
    pub at: Duration,
    pub condition: NetworkCondition,
}

impl ScheduleEntry {
    pub fn new(at: Duration, condition: NetworkCondition) -> Self {
        Self { at, condition }
    }
}

/// Condition changes sorted by offset. Entries sharing an offset keep their declared order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSchedule {
    entries: Vec<ScheduleEntry>,
}

impl ConditionSchedule {
    pub fn new(entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
        let mut entries: Vec<ScheduleEntry> = entries.into_iter().collect();
        entries.sort_by_key(|entry| entry.at);
        Self { entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> ScheduleCursor<'_> {
        ScheduleCursor {
            entries: &self.entries,
            next: 0,
        }
    }
}

/// Walks a schedule forward only. Each entry is handed out exactly once.
#[derive(Debug)]
pub struct ScheduleCursor<'a> {
    entries: &'a [ScheduleEntry],
    next: usize,
}

impl<'a> ScheduleCursor<'a> {
    /// Entries whose offset is at or before `elapsed` that have not been handed out yet.
    pub fn due(&mut self, elapsed: Duration) -> &'a [ScheduleEntry] {
        let start = self.next;
        while self.next < self.entries.len() && self.entries[self.next].at <= elapsed {
            self.next += 1;
        }
        &self.entries[start..self.next]
    }

    pub fn next_at(&self) -> Option<Duration> {
        self.entries.get(self.next).map(|entry| entry.at)
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.next
    }
}

/// Plays `schedule` for `duration`, calling `apply` for every entry as its offset comes due.
/// Entries that are already overdue when the runner wakes are applied back to back in order.
/// Entries with an offset past `duration` are never applied. After the last entry the runner
/// idles until `duration` has elapsed. The first failing `apply` aborts the run.
///
/// Returns the number of entries applied.
pub async fn run_schedule_with<F, Fut>(
    schedule: &ConditionSchedule,
    duration: Duration,
    cancel: &CancellationToken,
    mut apply: F,
) -> anyhow::Result<usize>
where
    F: FnMut(&ScheduleEntry) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let start = Instant::now();
    let mut cursor = schedule.cursor();
    let mut applied = 0;

    loop {
        let elapsed = start.elapsed();
        for entry in cursor.due(elapsed.min(duration)) {
            debug!("Applying scheduled condition at {:?}: {:?}", entry.at, entry.condition);
            apply(entry).await?;
            applied += 1;
        }

        if start.elapsed() >= duration {
            break;
        }

        let wake_at = match cursor.next_at() {
            Some(at) if at <= duration => at,
            _ => duration,
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(anyhow::anyhow!(
                    "condition schedule cancelled after {applied} of {} entries",
                    schedule.len()
                ));
            }
            _ = tokio::time::sleep_until(start + wake_at) => {}
        }
    }

    Ok(applied)
}
