// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Typed content segments
//!
//! A response renders as an ordered list of text and reasoning segments.
//! `append_segment` never mutates its input: it returns a new list that shares
//! every untouched segment with the old one, so snapshots taken earlier stay
//! valid and cheap to keep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Text,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Persistent segment list
#[derive(Debug, Clone, Default)]
pub struct Segments(Arc<Vec<Arc<Segment>>>);

impl Segments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.0.last().map(|s| s.as_ref())
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.0.get(index).map(|s| s.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.0.iter().map(|s| s.as_ref())
    }

    /// True when both handles point at the same list
    pub fn ptr_eq(&self, other: &Segments) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True when segment `index` is the same allocation in both lists
    pub fn shares_segment(&self, other: &Segments, index: usize) -> bool {
        match (self.0.get(index), other.0.get(index)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Concatenated content of one kind
    pub fn joined(&self, kind: SegmentKind) -> String {
        self.iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.content.as_str())
            .collect()
    }

    pub fn append(&self, delta: &str, kind: SegmentKind) -> Segments {
        append_segment(self, delta, kind)
    }
}

impl Serialize for Segments {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// Merge a delta into the segment list.
///
/// Whitespace-only deltas return the same list. A delta of the same kind as
/// the last segment extends it; otherwise a new segment starts now.
pub fn append_segment(segments: &Segments, delta: &str, kind: SegmentKind) -> Segments {
    if delta.trim().is_empty() {
        return segments.clone();
    }

    let mut next: Vec<Arc<Segment>> = segments.0.as_ref().clone();
    match next.last_mut() {
        Some(last) if last.kind == kind => {
            let mut extended = Segment::clone(last);
            extended.content.push_str(delta);
            *last = Arc::new(extended);
        }
        _ => next.push(Arc::new(Segment {
            kind,
            content: delta.to_string(),
            timestamp: Utc::now(),
        })),
    }
    Segments(Arc::new(next))
}
