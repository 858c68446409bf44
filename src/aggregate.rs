//! Detection aggregation over a sliding time window.
//!
//! Each frame's detections are filtered by confidence, de-duplicated per class by box overlap,
//! and reduced to a per-class tally stamped with the frame's capture time. The window count of a
//! class is the sum of its per-frame tallies whose timestamp falls inside the window.
//!
//! Counts are an estimate, not object tracking: an object that stays in view is counted once
//! per frame it appears in. Within one frame, overlapping boxes of the same class count as one
//! object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::DetectionSettings;
use crate::detect::{Detection, TargetClass};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTally {
    pub human: u32,
    pub cat: u32,
    pub dog: u32,
}

impl ClassTally {
    pub fn get(&self, class: TargetClass) -> u32 {
        match class {
            TargetClass::Human => self.human,
            TargetClass::Cat => self.cat,
            TargetClass::Dog => self.dog,
        }
    }

    pub fn add(&mut self, class: TargetClass, n: u32) {
        let slot = match class {
            TargetClass::Human => &mut self.human,
            TargetClass::Cat => &mut self.cat,
            TargetClass::Dog => &mut self.dog,
        };
        *slot = slot.saturating_add(n);
    }

    pub fn total(&self) -> u32 {
        self.human
            .saturating_add(self.cat)
            .saturating_add(self.dog)
    }

    pub fn animals(&self) -> u32 {
        self.cat.saturating_add(self.dog)
    }

    /// Element-wise maximum.
    pub fn max(&self, other: &ClassTally) -> ClassTally {
        ClassTally {
            human: self.human.max(other.human),
            cat: self.cat.max(other.cat),
            dog: self.dog.max(other.dog),
        }
    }

    /// Classes whose count in `self` is strictly greater than in `baseline`.
    pub fn exceeds(&self, baseline: &ClassTally) -> Vec<TargetClass> {
        TargetClass::ALL
            .into_iter()
            .filter(|class| self.get(*class) > baseline.get(*class))
            .collect()
    }

    fn accumulate(&mut self, other: &ClassTally) {
        for class in TargetClass::ALL {
            self.add(class, other.get(class));
        }
    }
}

/// Snapshot of the live window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCount {
    pub human: u32,
    pub cat: u32,
    pub dog: u32,
    /// Largest per-frame count of each class inside the window.
    pub peak: ClassTally,
    /// Frames observed inside the window.
    pub frames: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl AggregatedCount {
    pub fn empty(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            human: 0,
            cat: 0,
            dog: 0,
            peak: ClassTally::default(),
            frames: 0,
            window_start,
            window_end,
        }
    }

    pub fn tally(&self) -> ClassTally {
        ClassTally {
            human: self.human,
            cat: self.cat,
            dog: self.dog,
        }
    }
}

/// Result of observing one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTally {
    pub counts: ClassTally,
    /// Detections the adapter reported, before filtering.
    pub raw_detections: usize,
    /// Mean confidence of the detections that survived the confidence filter.
    pub mean_confidence: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct AggregatorSettings {
    pub window: Duration,
    pub min_confidence: f32,
    pub duplicate_iou: f32,
}

impl From<&DetectionSettings> for AggregatorSettings {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            window: settings.window,
            min_confidence: settings.confidence_threshold,
            duplicate_iou: settings.duplicate_iou,
        }
    }
}

pub struct DetectionAggregator {
    settings: AggregatorSettings,
    entries: VecDeque<(DateTime<Utc>, ClassTally)>,
}

impl DetectionAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            entries: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.settings.window
    }

    /// Adds one frame's detections and evicts entries that fell out of the window.
    pub fn observe(&mut self, captured_at: DateTime<Utc>, detections: &[Detection]) -> FrameTally {
        let accepted: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.settings.min_confidence)
            .collect();
        let mean_confidence = if accepted.is_empty() {
            None
        } else {
            Some(accepted.iter().map(|d| d.confidence).sum::<f32>() / accepted.len() as f32)
        };

        let mut counts = ClassTally::default();
        for class in TargetClass::ALL {
            let mut boxes: Vec<&Detection> =
                accepted.iter().copied().filter(|d| d.class == class).collect();
            boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            let mut kept: Vec<&Detection> = Vec::new();
            for candidate in boxes {
                if kept
                    .iter()
                    .all(|k| k.bbox.iou(&candidate.bbox) <= self.settings.duplicate_iou)
                {
                    kept.push(candidate);
                }
            }
            counts.add(class, kept.len() as u32);
        }

        // Keep entries ordered by capture time so eviction only looks at the front.
        let position = self
            .entries
            .iter()
            .rposition(|(ts, _)| *ts <= captured_at)
            .map_or(0, |i| i + 1);
        self.entries.insert(position, (captured_at, counts));
        self.evict(captured_at);

        FrameTally {
            counts,
            raw_detections: detections.len(),
            mean_confidence,
        }
    }

    /// Counts for the window `(now - window, now]`.
    pub fn current_counts(&self, now: DateTime<Utc>) -> AggregatedCount {
        let window_start = now - crate::chrono_duration(self.settings.window);
        let mut totals = ClassTally::default();
        let mut peak = ClassTally::default();
        let mut frames = 0u32;
        for (ts, tally) in &self.entries {
            if *ts <= window_start || *ts > now {
                continue;
            }
            totals.accumulate(tally);
            peak = peak.max(tally);
            frames = frames.saturating_add(1);
        }
        AggregatedCount {
            human: totals.human,
            cat: totals.cat,
            dog: totals.dog,
            peak,
            frames,
            window_start,
            window_end: now,
        }
    }

    /// Drops every entry, e.g. after the camera was unavailable.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, newest: DateTime<Utc>) {
        let cutoff = newest - crate::chrono_duration(self.settings.window);
        while self.entries.front().is_some_and(|(ts, _)| *ts <= cutoff) {
            self.entries.pop_front();
        }
    }
}
