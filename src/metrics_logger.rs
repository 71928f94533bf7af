/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    metrics::{parser::OutputParser, QualityRecord},
    process_control::ProcessHandle,
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Shared record behind a lock that tolerates a panicked writer.
pub fn lock_record(record: &Mutex<QualityRecord>) -> MutexGuard<'_, QualityRecord> {
    record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StopHandle {
    token: CancellationToken,
    join_set: JoinSet<()>,
    shared_record: Arc<Mutex<QualityRecord>>,
}

impl StopHandle {
    fn new(
        token: CancellationToken,
        join_set: JoinSet<()>,
        shared_record: Arc<Mutex<QualityRecord>>,
    ) -> Self {
        Self {
            token,
            join_set,
            shared_record,
        }
    }

    pub fn record(&self) -> Arc<Mutex<QualityRecord>> {
        self.shared_record.clone()
    }

    /// Stops the monitors after one last drain and returns the record as it stands.
    pub async fn stop(mut self) -> QualityRecord {
        // cancel monitors
        self.token.cancel();
        while self.join_set.join_next().await.is_some() {}

        let record = lock_record(&self.shared_record).clone();
        record
    }
}

/// Feeds the output of every process in `handles` through `parser` into `record` until the
/// returned handle is stopped. Output is drained, so each line is parsed exactly once.
pub fn start_monitoring(
    handles: Vec<ProcessHandle>,
    parser: Arc<OutputParser>,
    record: Arc<Mutex<QualityRecord>>,
) -> StopHandle {
    let token = CancellationToken::new();
    let mut join_set = JoinSet::new();

    for handle in handles {
        let token = token.clone();
        let parser = parser.clone();
        let record = record.clone();

        join_set.spawn(async move {
            debug!("Monitoring output of {}", handle.name);
            loop {
                let cancelled = tokio::select! {
                    _ = token.cancelled() => true,
                    _ = tokio::time::sleep(DRAIN_INTERVAL) => false,
                };
                drain_into(&handle, &parser, &record);
                if cancelled {
                    break;
                }
            }
            debug!("Stopped monitoring {}", handle.name);
        });
    }

    StopHandle::new(token, join_set, record)
}

fn drain_into(handle: &ProcessHandle, parser: &OutputParser, record: &Mutex<QualityRecord>) {
    let lines: Vec<String> = handle
        .drain_stdout()
        .into_iter()
        .chain(handle.drain_stderr())
        .collect();
    if lines.is_empty() {
        return;
    }

    let mut record = lock_record(record);
    for line in &lines {
        record.ingest_line(parser, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn monitored_output_reaches_the_record() -> anyhow::Result<()> {
        use crate::process_control::{ProcessSpec, ProcessSupervisor};

        let supervisor = ProcessSupervisor::new();
        let handle = supervisor
            .start(
                ProcessSpec::new(
                    "detector",
                    "sh",
                    ["-c", "echo 'Frame 10: Detected 4 objects FPS: 12.5'; echo 'stream 1 active'; echo done; sleep 30"],
                )
                .ready_pattern("done"),
            )
            .await?;

        let record = Arc::new(Mutex::new(QualityRecord::new("monitor")));
        let monitor = start_monitoring(vec![handle], Arc::new(OutputParser::new()?), record.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(lock_record(&record).detection.detection_count, 4);

        let final_record = monitor.stop().await;
        supervisor.stop_all().await;

        assert_eq!(final_record.detection.fps, 12.5);
        assert_eq!(final_record.detection.frame_count, 10);
        assert_eq!(final_record.active_streams(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stopping_without_processes_returns_the_empty_record() {
        let record = Arc::new(Mutex::new(QualityRecord::new("idle")));
        let monitor = start_monitoring(vec![], Arc::new(OutputParser::new().unwrap()), record);
        let final_record = monitor.stop().await;
        assert_eq!(final_record.scenario, "idle");
        assert!(final_record.streams.is_empty());
    }
}
