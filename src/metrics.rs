/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod parser;
pub mod validation;

use crate::network::NetworkCondition;
use chrono::{DateTime, Utc};
use parser::{OutputParser, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stream id used when an output line reports stream status without naming a stream.
pub const DEFAULT_STREAM: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub frame_count: u64,
    pub detection_count: u64,
    pub fps: f64,
    pub avg_confidence: f64,
    pub processing_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub packet_loss: f64,
    pub latency_ms: f64,
    pub bandwidth_kbps: u32,
    pub connection_drops: u64,
    pub recovery_attempts: u64,
    /// Longest observed outage of any single stream.
    pub recovery_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamHealth {
    pub is_active: bool,
    pub frames_dropped: u64,
    pub error_count: u64,
    #[serde(skip)]
    went_down_at: Option<DateTime<Utc>>,
}

/// Accumulated view of what the pipeline under test reported. Raw observations are stored;
/// anything derived is computed when read.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRecord {
    pub timestamp: DateTime<Utc>,
    pub scenario: String,
    pub detection: DetectionMetrics,
    pub network: NetworkMetrics,
    pub streams: BTreeMap<String, StreamHealth>,
    pub tracking_continuity: Option<f64>,
    pub errors: u64,
    outages: u64,
}

impl QualityRecord {
    pub fn new(scenario: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            scenario: scenario.to_string(),
            detection: DetectionMetrics::default(),
            network: NetworkMetrics::default(),
            streams: BTreeMap::new(),
            tracking_continuity: None,
            errors: 0,
            outages: 0,
        }
    }

    /// Parses `line` and merges what it reports. Returns the number of signals applied.
    pub fn ingest_line(&mut self, parser: &OutputParser, line: &str) -> usize {
        self.ingest_line_at(parser, line, Utc::now())
    }

    pub fn ingest_line_at(&mut self, parser: &OutputParser, line: &str, at: DateTime<Utc>) -> usize {
        let signals = parser.parse_line(line);
        // a stream named on the line owns the errors and drops reported on it
        let stream_on_line = signals.iter().find_map(|signal| match signal {
            Signal::Stream { id, .. } => Some(id.clone().unwrap_or_else(|| DEFAULT_STREAM.to_string())),
            _ => None,
        });

        for signal in &signals {
            self.apply(signal, stream_on_line.as_deref(), at);
        }
        signals.len()
    }

    pub fn apply(&mut self, signal: &Signal, stream: Option<&str>, at: DateTime<Utc>) {
        self.timestamp = at;
        match signal {
            Signal::Fps(v) => self.detection.fps = *v,
            Signal::Frame(v) => self.detection.frame_count = *v,
            Signal::Detections(v) => self.detection.detection_count += v,
            Signal::Confidence(v) => self.detection.avg_confidence = *v,
            Signal::LatencyMs(v) => self.detection.processing_latency_ms = *v,
            Signal::RecoveryAttempt => self.network.recovery_attempts += 1,
            Signal::TrackingContinuity(v) => self.tracking_continuity = Some(*v),
            Signal::Stream { id, active } => {
                let id = id.as_deref().unwrap_or(DEFAULT_STREAM);
                self.set_stream_active(id, *active, at);
            }
            Signal::FramesDropped(v) => {
                self.stream_mut(stream.unwrap_or(DEFAULT_STREAM)).frames_dropped += v;
            }
            Signal::Error => {
                self.errors += 1;
                if let Some(id) = stream {
                    self.stream_mut(id).error_count += 1;
                }
            }
        }
    }

    fn stream_mut(&mut self, id: &str) -> &mut StreamHealth {
        self.streams.entry(id.to_string()).or_default()
    }

    fn all_streams_down(&self) -> bool {
        !self.streams.is_empty() && self.streams.values().all(|s| !s.is_active)
    }

    fn set_stream_active(&mut self, id: &str, active: bool, at: DateTime<Utc>) {
        let was_all_down = self.all_streams_down();
        let is_new = !self.streams.contains_key(id);
        let stream = self.stream_mut(id);
        let was_active = stream.is_active;
        stream.is_active = active;

        let mut recovered_after = None;
        if was_active && !active {
            stream.went_down_at = Some(at);
        } else if active && !was_active {
            if let Some(down) = stream.went_down_at.take() {
                recovered_after = Some((at - down).num_milliseconds().max(0) as f64);
            }
        }

        if was_active && !active {
            self.network.connection_drops += 1;
        }
        if let Some(ms) = recovered_after {
            self.network.recovery_time_ms = self.network.recovery_time_ms.max(ms);
        }
        if (was_active || is_new) && !was_all_down && self.all_streams_down() {
            self.outages += 1;
        }
    }

    /// Records the impairment currently applied, with profile values expanded.
    pub fn apply_condition(&mut self, condition: &NetworkCondition) {
        let resolved = condition.resolved();
        if let Some(loss) = resolved.packet_loss {
            self.network.packet_loss = loss;
        }
        if let Some(latency) = resolved.latency_ms {
            self.network.latency_ms = latency as f64;
        }
        if let Some(bandwidth) = resolved.bandwidth_kbps {
            self.network.bandwidth_kbps = bandwidth;
        }
    }

    /// Detections per frame, zero before any frame is seen.
    pub fn detection_rate(&self) -> f64 {
        if self.detection.frame_count == 0 {
            0.0
        } else {
            self.detection.detection_count as f64 / self.detection.frame_count as f64
        }
    }

    /// How many times every known stream was down at once.
    pub fn complete_failures(&self) -> u64 {
        self.outages
    }

    pub fn graceful_degradation(&self) -> bool {
        self.complete_failures() == 0
    }

    pub fn active_streams(&self) -> usize {
        self.streams.values().filter(|s| s.is_active).count()
    }

    pub fn healthy_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|s| s.is_active && s.error_count == 0)
            .count()
    }

    pub fn report(&self) -> QualityReport {
        QualityReport {
            timestamp: self.timestamp,
            scenario: self.scenario.clone(),
            detection: self.detection.clone(),
            detection_rate: self.detection_rate(),
            network: self.network.clone(),
            streams: self.streams.clone(),
            tracking_continuity: self.tracking_continuity,
            errors: self.errors,
            graceful_degradation: self.graceful_degradation(),
            complete_failures: self.complete_failures(),
        }
    }
}

/// Finalized, serializable snapshot of a [`QualityRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub timestamp: DateTime<Utc>,
    pub scenario: String,
    pub detection: DetectionMetrics,
    pub detection_rate: f64,
    pub network: NetworkMetrics,
    pub streams: BTreeMap<String, StreamHealth>,
    pub tracking_continuity: Option<f64>,
    pub errors: u64,
    pub graceful_degradation: bool,
    pub complete_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feed(record: &mut QualityRecord, lines: &[&str]) {
        let parser = OutputParser::new().unwrap();
        for line in lines {
            record.ingest_line(&parser, line);
        }
    }

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let mut record = QualityRecord::new("test");
        feed(
            &mut record,
            &[
                "Frame 10: Detected 2 objects FPS: 20.0",
                "Frame 20: Detected 3 objects FPS: 25.5 conf=0.8",
                "reconnecting...",
                "retrying connection",
            ],
        );

        assert_eq!(record.detection.detection_count, 5);
        assert_eq!(record.detection.frame_count, 20);
        assert_eq!(record.detection.fps, 25.5);
        assert_eq!(record.detection.avg_confidence, 0.8);
        assert_eq!(record.network.recovery_attempts, 2);
        assert_eq!(record.detection_rate(), 0.25);
    }

    #[test]
    fn unmatched_lines_leave_the_record_untouched() {
        let parser = OutputParser::new().unwrap();
        let mut record = QualityRecord::new("test");
        record.ingest_line(&parser, "FPS: 10");
        let before = record.clone();

        assert_eq!(record.ingest_line(&parser, "nothing to see here"), 0);
        assert_eq!(record, before);
    }

    #[test]
    fn derived_values_are_stable_across_reads() {
        let mut record = QualityRecord::new("test");
        feed(&mut record, &["stream 1 active", "stream 1 inactive"]);

        let first = record.report();
        let second = record.report();
        assert_eq!(first, second);
        assert_eq!(record.complete_failures(), 1);
        assert!(!record.graceful_degradation());
    }

    #[test]
    fn streams_are_created_on_first_mention() {
        let mut record = QualityRecord::new("test");
        feed(&mut record, &["stream connected", "Stream 2 is active", "stream [cam3] active"]);

        assert_eq!(
            record.streams.keys().collect::<Vec<_>>(),
            ["2", "cam3", DEFAULT_STREAM]
        );
        assert_eq!(record.active_streams(), 3);
        assert!(record.graceful_degradation());
    }

    #[test]
    fn outage_of_one_stream_is_graceful() {
        let mut record = QualityRecord::new("test");
        feed(
            &mut record,
            &["stream 1 active", "stream 2 active", "stream 1 disconnected", "stream 1 connected"],
        );

        assert_eq!(record.network.connection_drops, 1);
        assert_eq!(record.complete_failures(), 0);
        assert!(record.graceful_degradation());
    }

    #[test]
    fn recovery_time_is_the_longest_outage() {
        let parser = OutputParser::new().unwrap();
        let mut record = QualityRecord::new("test");
        let t0 = Utc::now();

        record.ingest_line_at(&parser, "stream 1 active", t0);
        record.ingest_line_at(&parser, "stream 1 inactive", t0 + Duration::seconds(1));
        record.ingest_line_at(&parser, "stream 1 active", t0 + Duration::seconds(4));
        record.ingest_line_at(&parser, "stream 1 inactive", t0 + Duration::seconds(5));
        record.ingest_line_at(&parser, "stream 1 active", t0 + Duration::seconds(6));

        assert_eq!(record.network.recovery_time_ms, 3000.0);
        assert_eq!(record.network.connection_drops, 2);
        assert_eq!(record.complete_failures(), 2);
    }

    #[test]
    fn errors_are_attributed_to_the_stream_on_the_same_line() {
        let mut record = QualityRecord::new("test");
        feed(
            &mut record,
            &["stream 1 active", "stream 1 active but decoder error", "generic failure: failed"],
        );

        assert_eq!(record.errors, 2);
        assert_eq!(record.streams["1"].error_count, 1);
        assert_eq!(record.healthy_streams(), 0);
    }

    #[test]
    fn conditions_fill_the_network_section() {
        let mut record = QualityRecord::new("test");
        record.apply_condition(&NetworkCondition::profile("poor"));

        assert_eq!(record.network.packet_loss, 10.0);
        assert_eq!(record.network.latency_ms, 500.0);
        assert_eq!(record.network.bandwidth_kbps, 50);
    }
}
