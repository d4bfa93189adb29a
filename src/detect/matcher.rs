use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Matching reference for one stream: the historical samples of the
/// original occurrence plus the stream's declared value range. The range is
/// absent for non-numeric (boolean) streams, which are compared raw.
#[derive(Debug, Clone)]
pub struct BaselineTrack {
    pub live_id: String,
    pub baseline: Vec<f64>,
    pub min_max: Option<(f64, f64)>,
    pub precision: f64,
}

#[derive(Debug)]
struct StreamState {
    baseline: Vec<f64>,
    min_max: Option<(f64, f64)>,
    precision: f64,
    window: VecDeque<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Sliding-window matcher for one (definition, asset) pair. Windows are
/// fixed-capacity FIFO buffers keyed by live stream id; each capacity
/// equals the corresponding baseline length and may differ between streams
/// of the same matcher.
#[derive(Debug)]
pub struct PatternMatcher {
    streams: HashMap<String, StreamState>,
    baseline_streams: usize,
    occurrence_duration: Duration,
    debounce: Duration,
    last_detection: Option<DateTime<Utc>>,
}

impl PatternMatcher {
    pub fn new(tracks: Vec<BaselineTrack>, occurrence_duration: Duration, debounce: Duration) -> Self {
        let baseline_streams = tracks.len();
        let streams = tracks
            .into_iter()
            .map(|track| {
                let capacity = track.baseline.len();
                (
                    track.live_id,
                    StreamState {
                        baseline: track.baseline,
                        min_max: track.min_max,
                        precision: track.precision.clamp(0.0, 1.0),
                        window: VecDeque::with_capacity(capacity),
                    },
                )
            })
            .collect();
        Self {
            streams,
            baseline_streams,
            occurrence_duration,
            debounce,
            last_detection: None,
        }
    }

    pub fn tracks(&self, live_id: &str) -> bool {
        self.streams.contains_key(live_id)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Feed one live reading. Returns the occurrence interval when every
    /// tracked stream is simultaneously within tolerance and the debounce
    /// window since the last emitted detection has elapsed.
    pub fn push(&mut self, live_id: &str, value: f64, now: DateTime<Utc>) -> Option<DetectionSpan> {
        let state = self.streams.get_mut(live_id)?;
        state.window.push_back(value);
        while state.window.len() > state.baseline.len() {
            state.window.pop_front();
        }

        if !self.all_windows_full() {
            return None;
        }
        if !self.streams.values().all(stream_within_tolerance) {
            return None;
        }
        if let Some(last) = self.last_detection {
            if now - last < self.debounce {
                return None;
            }
        }
        self.last_detection = Some(now);
        Some(DetectionSpan {
            start: now - self.occurrence_duration,
            end: now,
        })
    }

    fn all_windows_full(&self) -> bool {
        self.streams.len() == self.baseline_streams
            && self
                .streams
                .values()
                .all(|state| state.window.len() == state.baseline.len())
    }

    #[cfg(test)]
    fn window(&self, live_id: &str) -> Vec<f64> {
        self.streams[live_id].window.iter().copied().collect()
    }
}

fn stream_within_tolerance(state: &StreamState) -> bool {
    let distance = length_normalized_distance(&state.baseline, &state.window, state.min_max);
    distance < 1.0 - state.precision
}

/// Euclidean distance between the normalized baseline and the normalized
/// window, divided by the baseline length. A degenerate declared range
/// (max <= min) falls back to raw comparison.
fn length_normalized_distance(
    baseline: &[f64],
    window: &VecDeque<f64>,
    min_max: Option<(f64, f64)>,
) -> f64 {
    let len = baseline.len();
    if len == 0 || window.len() != len {
        return f64::INFINITY;
    }
    let span = min_max.and_then(|(min, max)| {
        let span = max - min;
        (span > 0.0).then_some((min, span))
    });
    let mut sum = 0.0;
    for (b, w) in baseline.iter().zip(window.iter()) {
        let (b, w) = match span {
            Some((min, span)) => ((b - min) / span, (w - min) / span),
            None => (*b, *w),
        };
        sum += (b - w) * (b - w);
    }
    sum.sqrt() / len as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn matcher(tracks: Vec<BaselineTrack>) -> PatternMatcher {
        PatternMatcher::new(tracks, Duration::seconds(300), Duration::seconds(30))
    }

    fn flat_track(live_id: &str, level: f64, len: usize) -> BaselineTrack {
        BaselineTrack {
            live_id: live_id.to_string(),
            baseline: vec![level; len],
            min_max: Some((0.0, 10.0)),
            precision: 0.9,
        }
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut m = matcher(vec![flat_track("a", 2.0, 5)]);
        for value in 1..=7 {
            m.push("a", value as f64, at(value));
        }
        assert_eq!(m.window("a"), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn no_evaluation_until_every_window_is_full() {
        let mut m = matcher(vec![flat_track("a", 2.0, 5), flat_track("b", 5.0, 5)]);
        for i in 0..5 {
            assert_eq!(m.push("a", 2.0, at(i)), None);
        }
        // stream a matches perfectly but b has no samples yet
        for i in 0..4 {
            assert_eq!(m.push("b", 5.0, at(5 + i)), None);
        }
        assert!(m.push("b", 5.0, at(9)).is_some());
    }

    #[test]
    fn match_is_conjunctive_across_streams() {
        let mut m = matcher(vec![flat_track("a", 2.0, 5), flat_track("b", 5.0, 5)]);
        for i in 0..5 {
            m.push("a", 2.0, at(i));
        }
        // fill b far away from its baseline: every element normalizes 0.5
        // off, so the distance stays well over the 0.1 tolerance
        for i in 0..5 {
            assert_eq!(m.push("b", 0.0, at(5 + i)), None);
        }
        // slide b toward the baseline; the detection must fire exactly when
        // the last out-of-tolerance sample leaves the window
        let mut fired_at = None;
        for i in 0..5 {
            if m.push("b", 5.0, at(10 + i)).is_some() {
                fired_at = Some(i);
                break;
            }
        }
        assert_eq!(fired_at, Some(4));
    }

    #[test]
    fn detections_are_debounced() {
        let mut m = matcher(vec![flat_track("a", 2.0, 5)]);
        for i in 0..4 {
            assert_eq!(m.push("a", 2.0, at(i)), None);
        }
        // the fifth reading fills the window and fires the first detection
        let first = m.push("a", 2.0, at(10)).expect("first match fires");
        assert_eq!(first.end, at(10));
        assert_eq!(first.start, at(10) - Duration::seconds(300));
        // 10 seconds later: still matching, suppressed
        assert_eq!(m.push("a", 2.0, at(20)), None);
        // 31 seconds after the first emission: fires again
        assert!(m.push("a", 2.0, at(41)).is_some());
    }

    #[test]
    fn suppressed_matches_do_not_extend_the_debounce() {
        let mut m = matcher(vec![flat_track("a", 2.0, 5)]);
        for i in 0..4 {
            m.push("a", 2.0, at(i));
        }
        assert!(m.push("a", 2.0, at(10)).is_some());
        assert_eq!(m.push("a", 2.0, at(39)), None);
        assert!(m.push("a", 2.0, at(41)).is_some());
    }

    #[test]
    fn boolean_streams_compare_raw() {
        let mut m = matcher(vec![BaselineTrack {
            live_id: "valve".to_string(),
            baseline: vec![1.0, 1.0, 0.0],
            min_max: None,
            precision: 0.9,
        }]);
        m.push("valve", 1.0, at(0));
        m.push("valve", 1.0, at(1));
        assert!(m.push("valve", 0.0, at(2)).is_some());
    }

    #[test]
    fn capacities_may_differ_between_streams() {
        let mut m = matcher(vec![flat_track("short", 2.0, 2), flat_track("long", 2.0, 4)]);
        m.push("short", 2.0, at(0));
        m.push("short", 2.0, at(1));
        for i in 0..3 {
            assert_eq!(m.push("long", 2.0, at(2 + i)), None);
        }
        assert!(m.push("long", 2.0, at(5)).is_some());
    }

    #[test]
    fn readings_for_untracked_streams_are_ignored() {
        let mut m = matcher(vec![flat_track("a", 2.0, 2)]);
        assert_eq!(m.push("other", 2.0, at(0)), None);
        assert!(!m.tracks("other"));
        assert_eq!(m.window("a"), Vec::<f64>::new());
    }
}
