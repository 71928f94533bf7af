/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Pure pass/fail judgements over a [`QualityRecord`]. Nothing here mutates the record.

use super::QualityRecord;
use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub min_fps: f64,
    pub min_detections: u64,
    pub min_detection_rate: f64,
    pub max_latency_ms: f64,
    pub max_recovery_time_ms: f64,
    pub min_success_rate: f64,
    pub min_healthy_streams: usize,
    pub prevent_complete_failure: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_fps: 1.0,
            min_detections: 0,
            min_detection_rate: 0.0,
            max_latency_ms: 1000.0,
            max_recovery_time_ms: 30_000.0,
            min_success_rate: 0.8,
            min_healthy_streams: 1,
            prevent_complete_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub passed: bool,
    pub reason: String,
}

impl Validation {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

pub fn validate_detection_quality(record: &QualityRecord, t: &Thresholds) -> Validation {
    let d = &record.detection;
    if d.fps < t.min_fps {
        return Validation::fail(format!("FPS {} below minimum {}", d.fps, t.min_fps));
    }
    if d.detection_count < t.min_detections {
        return Validation::fail(format!(
            "Detection count {} below minimum {}",
            d.detection_count, t.min_detections
        ));
    }
    let rate = record.detection_rate();
    if rate < t.min_detection_rate {
        return Validation::fail(format!(
            "Detection rate {rate:.3} below minimum {}",
            t.min_detection_rate
        ));
    }
    if d.processing_latency_ms > t.max_latency_ms {
        return Validation::fail(format!(
            "Latency {}ms exceeds maximum {}ms",
            d.processing_latency_ms, t.max_latency_ms
        ));
    }
    Validation::pass("Detection quality validation passed")
}

pub fn validate_recovery(record: &QualityRecord, t: &Thresholds) -> Validation {
    if record.network.recovery_time_ms > t.max_recovery_time_ms {
        return Validation::fail(format!(
            "Recovery time {}ms exceeds maximum {}ms",
            record.network.recovery_time_ms, t.max_recovery_time_ms
        ));
    }

    let total = record.streams.len();
    if total > 0 {
        let success_rate = record.active_streams() as f64 / total as f64;
        if success_rate < t.min_success_rate {
            return Validation::fail(format!(
                "Success rate {success_rate:.2} below minimum {}",
                t.min_success_rate
            ));
        }
    }
    Validation::pass("Recovery validation passed")
}

pub fn validate_graceful_degradation(record: &QualityRecord, t: &Thresholds) -> Validation {
    let failures = record.complete_failures();
    if t.prevent_complete_failure && failures > 0 {
        return Validation::fail(format!("Complete failures detected: {failures}"));
    }
    Validation::pass("Graceful degradation validation passed")
}

pub fn validate_multi_stream(record: &QualityRecord, t: &Thresholds) -> Validation {
    let healthy = record.healthy_streams();
    if healthy < t.min_healthy_streams {
        return Validation::fail(format!(
            "Only {healthy} healthy streams, minimum {} required",
            t.min_healthy_streams
        ));
    }
    Validation::pass("Multi-stream validation passed")
}

/// Checks a `validate_metrics` step can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricCheck {
    MinFps,
    MinDetections,
    DetectionRate,
    MaxLatency,
    RecoveryAttempts,
    MaxRecoveryTime,
    TrackingContinuity,
    StreamActive,
    HealthyStreams,
    GracefulDegradation,
    DetectionQuality,
    Recovery,
    MultiStream,
}

impl FromStr for MetricCheck {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let check = match s {
            "min_fps" => MetricCheck::MinFps,
            "min_detections" => MetricCheck::MinDetections,
            "detection_rate" => MetricCheck::DetectionRate,
            "max_latency" => MetricCheck::MaxLatency,
            "recovery_attempts" => MetricCheck::RecoveryAttempts,
            "max_recovery_time" => MetricCheck::MaxRecoveryTime,
            "tracking_continuity" => MetricCheck::TrackingContinuity,
            "stream_active" => MetricCheck::StreamActive,
            "healthy_streams" => MetricCheck::HealthyStreams,
            "graceful_degradation" => MetricCheck::GracefulDegradation,
            "detection_quality" => MetricCheck::DetectionQuality,
            "recovery" => MetricCheck::Recovery,
            "multi_stream" => MetricCheck::MultiStream,
            other => {
                return Err(OrchestratorError::configuration(format!(
                    "unknown metrics check '{other}'"
                )))
            }
        };
        Ok(check)
    }
}

/// Bounds a value check is held to. `expected` asks for equality.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub expected: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    fn is_unset(&self) -> bool {
        self.expected.is_none() && self.min.is_none() && self.max.is_none()
    }

    fn or_min(self, min: f64) -> Self {
        if self.is_unset() {
            Self {
                min: Some(min),
                ..self
            }
        } else {
            self
        }
    }

    fn or_max(self, max: f64) -> Self {
        if self.is_unset() {
            Self {
                max: Some(max),
                ..self
            }
        } else {
            self
        }
    }

    fn judge(&self, label: &str, value: f64) -> Validation {
        if let Some(expected) = self.expected {
            if (value - expected).abs() > f64::EPSILON {
                return Validation::fail(format!("{label} is {value}, expected {expected}"));
            }
        }
        if let Some(min) = self.min {
            if value < min {
                return Validation::fail(format!("{label} {value} below minimum {min}"));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Validation::fail(format!("{label} {value} exceeds maximum {max}"));
            }
        }
        Validation::pass(format!("{label} is {value}"))
    }
}

/// Judges one named check. Value checks without explicit bounds fall back to `thresholds`.
pub fn evaluate(
    check: MetricCheck,
    bounds: Bounds,
    stream: Option<&str>,
    record: &QualityRecord,
    thresholds: &Thresholds,
) -> Validation {
    let t = thresholds;
    match check {
        MetricCheck::MinFps => bounds.or_min(t.min_fps).judge("FPS", record.detection.fps),
        MetricCheck::MinDetections => bounds
            .or_min(t.min_detections as f64)
            .judge("Detection count", record.detection.detection_count as f64),
        MetricCheck::DetectionRate => bounds
            .or_min(t.min_detection_rate)
            .judge("Detection rate", record.detection_rate()),
        MetricCheck::MaxLatency => bounds
            .or_max(t.max_latency_ms)
            .judge("Latency ms", record.detection.processing_latency_ms),
        MetricCheck::RecoveryAttempts => bounds
            .or_min(1.0)
            .judge("Recovery attempts", record.network.recovery_attempts as f64),
        MetricCheck::MaxRecoveryTime => bounds
            .or_max(t.max_recovery_time_ms)
            .judge("Recovery time ms", record.network.recovery_time_ms),
        MetricCheck::TrackingContinuity => match record.tracking_continuity {
            Some(value) => bounds.or_min(t.min_success_rate).judge("Tracking continuity", value),
            None => Validation::fail("No tracking continuity reported yet"),
        },
        MetricCheck::StreamActive => match stream {
            Some(id) => match record.streams.get(id) {
                Some(health) if health.is_active => Validation::pass(format!("Stream {id} is active")),
                Some(_) => Validation::fail(format!("Stream {id} is inactive")),
                None => Validation::fail(format!("Stream {id} has not been reported")),
            },
            None if record.active_streams() > 0 => {
                Validation::pass(format!("{} stream(s) active", record.active_streams()))
            }
            None => Validation::fail("No active stream"),
        },
        MetricCheck::HealthyStreams => bounds
            .or_min(t.min_healthy_streams as f64)
            .judge("Healthy streams", record.healthy_streams() as f64),
        MetricCheck::GracefulDegradation => validate_graceful_degradation(record, t),
        MetricCheck::DetectionQuality => validate_detection_quality(record, t),
        MetricCheck::Recovery => validate_recovery(record, t),
        MetricCheck::MultiStream => validate_multi_stream(record, t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::parser::OutputParser;

    fn record_from(lines: &[&str]) -> QualityRecord {
        let parser = OutputParser::new().unwrap();
        let mut record = QualityRecord::new("test");
        for line in lines {
            record.ingest_line(&parser, line);
        }
        record
    }

    #[test]
    fn detection_quality_reports_the_first_violation() {
        let t = Thresholds::default();
        let record = record_from(&["FPS: 0.5"]);
        let v = validate_detection_quality(&record, &t);
        assert!(!v.passed);
        assert!(v.reason.contains("FPS 0.5 below minimum 1"));

        let record = record_from(&["FPS: 25 inference latency: 1500 ms"]);
        let v = validate_detection_quality(&record, &t);
        assert!(!v.passed);
        assert!(v.reason.contains("Latency"));

        let record = record_from(&["FPS: 25 latency: 40 ms"]);
        assert!(validate_detection_quality(&record, &t).passed);
    }

    #[test]
    fn validators_do_not_mutate_the_record() {
        let record = record_from(&["stream 1 active", "stream 1 inactive", "FPS: 3"]);
        let before = record.clone();
        let t = Thresholds::default();

        validate_detection_quality(&record, &t);
        validate_recovery(&record, &t);
        validate_graceful_degradation(&record, &t);
        validate_multi_stream(&record, &t);
        assert_eq!(record, before);
    }

    #[test]
    fn recovery_checks_success_rate() {
        let t = Thresholds::default();
        let record = record_from(&["stream 1 active", "stream 2 active", "stream 2 inactive"]);
        let v = validate_recovery(&record, &t);
        assert!(!v.passed);
        assert!(v.reason.contains("0.50"));
    }

    #[test]
    fn complete_failure_breaks_graceful_degradation() {
        let t = Thresholds::default();
        let record = record_from(&["stream 1 active", "stream 1 inactive", "stream 1 active"]);
        assert!(!validate_graceful_degradation(&record, &t).passed);

        let lenient = Thresholds {
            prevent_complete_failure: false,
            ..t
        };
        assert!(validate_graceful_degradation(&record, &lenient).passed);
    }

    #[test]
    fn multi_stream_counts_error_free_active_streams() {
        let t = Thresholds {
            min_healthy_streams: 2,
            ..Default::default()
        };
        let record = record_from(&["stream 1 active", "stream 2 active", "stream 2 active, error in decoder"]);
        let v = validate_multi_stream(&record, &t);
        assert!(!v.passed);
        assert_eq!(v.reason, "Only 1 healthy streams, minimum 2 required");
    }

    #[test]
    fn unknown_check_names_are_configuration_errors() {
        let err = "vibes".parse::<MetricCheck>().unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OrchestratorError::Configuration(_))
        ));
        assert_eq!(
            "tracking_continuity".parse::<MetricCheck>().ok(),
            Some(MetricCheck::TrackingContinuity)
        );
    }

    #[test]
    fn tracking_continuity_needs_a_reported_value() {
        let t = Thresholds::default();
        let bounds = Bounds {
            min: Some(0.8),
            ..Default::default()
        };

        let record = record_from(&["FPS: 10"]);
        assert!(!evaluate(MetricCheck::TrackingContinuity, bounds, None, &record, &t).passed);

        let record = record_from(&["tracking continuity: 0.79"]);
        assert!(!evaluate(MetricCheck::TrackingContinuity, bounds, None, &record, &t).passed);

        let record = record_from(&["tracking continuity: 0.8"]);
        assert!(evaluate(MetricCheck::TrackingContinuity, bounds, None, &record, &t).passed);
    }

    #[test]
    fn expected_means_equality() {
        let t = Thresholds::default();
        let record = record_from(&["reconnecting", "reconnecting"]);
        let exactly = |n: f64| Bounds {
            expected: Some(n),
            ..Default::default()
        };

        assert!(evaluate(MetricCheck::RecoveryAttempts, exactly(2.0), None, &record, &t).passed);
        assert!(!evaluate(MetricCheck::RecoveryAttempts, exactly(3.0), None, &record, &t).passed);
        assert!(evaluate(MetricCheck::RecoveryAttempts, Bounds::default(), None, &record, &t).passed);
    }

    #[test]
    fn stream_active_by_name_or_any() {
        let t = Thresholds::default();
        let record = record_from(&["stream [cam1] active", "stream [cam2] disconnected"]);
        let b = Bounds::default();

        assert!(evaluate(MetricCheck::StreamActive, b, Some("cam1"), &record, &t).passed);
        assert!(!evaluate(MetricCheck::StreamActive, b, Some("cam2"), &record, &t).passed);
        assert!(!evaluate(MetricCheck::StreamActive, b, Some("cam9"), &record, &t).passed);
        assert!(evaluate(MetricCheck::StreamActive, b, None, &record, &t).passed);
    }
}
