use regex::Regex;

/// One typed observation extracted from a line of process output.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Fps(f64),
    Frame(u64),
    Detections(u64),
    Confidence(f64),
    LatencyMs(f64),
    RecoveryAttempt,
    /// `id` is `None` when the line doesn't name a stream.
    Stream { id: Option<String>, active: bool },
    FramesDropped(u64),
    TrackingContinuity(f64),
    Error,
}

/// A fixed set of independent matchers. Every matcher is tried on every line, so one line can
/// produce several signals. Lines that match nothing, or whose numbers don't parse, produce none.
#[derive(Debug, Clone)]
pub struct OutputParser {
    fps: Regex,
    frame: Regex,
    detections: Regex,
    confidence: Regex,
    latency: Regex,
    recovery: Regex,
    stream: Regex,
    dropped: Regex,
    tracking: Regex,
    error: Regex,
}

impl OutputParser {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            fps: Regex::new(r"FPS:\s*([\d.]+)")?,
            frame: Regex::new(r"Frame\s+(\d+)")?,
            detections: Regex::new(r"Detected\s+(\d+)\s+objects")?,
            confidence: Regex::new(r"conf(?:idence)?\s*[=:]\s*([\d.]+)")?,
            latency: Regex::new(r"(?i)latency[:=\s]+([\d.]+)\s*ms")?,
            recovery: Regex::new(r"(?i)recovery attempt|reconnecting|retrying")?,
            stream: Regex::new(
                r"(?i)\bstream(?:\s+(\d+|\[[^\]]+\]))?\s+(?:is\s+)?(active|inactive|connected|disconnected)\b",
            )?,
            dropped: Regex::new(r"(?i)dropped\s+(\d+)\s+frames?")?,
            tracking: Regex::new(r"tracking.*continuity[:=\s]+([\d.]+)")?,
            error: Regex::new(r"(?i)\b(error|failed|exception)\b")?,
        })
    }

    pub fn parse_line(&self, line: &str) -> Vec<Signal> {
        let line = line.trim();
        if line.is_empty() {
            return vec![];
        }

        let mut signals = vec![];
        if let Some(v) = capture(&self.fps, line) {
            signals.push(Signal::Fps(v));
        }
        if let Some(v) = capture(&self.frame, line) {
            signals.push(Signal::Frame(v));
        }
        if let Some(v) = capture(&self.detections, line) {
            signals.push(Signal::Detections(v));
        }
        if let Some(v) = capture(&self.confidence, line) {
            signals.push(Signal::Confidence(v));
        }
        if let Some(v) = capture(&self.latency, line) {
            signals.push(Signal::LatencyMs(v));
        }
        if self.recovery.is_match(line) {
            signals.push(Signal::RecoveryAttempt);
        }
        if let Some(caps) = self.stream.captures(line) {
            let id = caps
                .get(1)
                .map(|m| m.as_str().trim_matches(|c| c == '[' || c == ']').to_string());
            let active = caps
                .get(2)
                .map(|m| matches!(m.as_str().to_lowercase().as_str(), "active" | "connected"))
                .unwrap_or(false);
            signals.push(Signal::Stream { id, active });
        }
        if let Some(v) = capture(&self.dropped, line) {
            signals.push(Signal::FramesDropped(v));
        }
        if let Some(v) = capture(&self.tracking, line) {
            signals.push(Signal::TrackingContinuity(v));
        }
        if self.error.is_match(line) {
            signals.push(Signal::Error);
        }
        signals
    }
}

fn capture<T: std::str::FromStr>(regex: &Regex, line: &str) -> Option<T> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().trim_end_matches('.').parse().ok())
}
