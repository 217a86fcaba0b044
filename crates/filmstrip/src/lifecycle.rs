// Lifecycle tracking: records when each sequence number leaves the
// sliding window and decides which thumbnails the sweep may reap.

use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::manifest::{Manifest, ManifestSegment, ManifestThumbnail};

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One thumbnail recorded against a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailEntry {
    /// Offset inside the segment, in seconds.
    pub time: f64,
    pub name: String,
}

/// Everything known about one sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub sn: u64,
    /// Wall-clock instant the segment left the window, unix
    /// milliseconds. `None` while still listed.
    pub removal_time: Option<i64>,
    /// Strictly ascending by `time`.
    pub thumbnails: Vec<ThumbnailEntry>,
}

/// Compact sliding record of removal instants: `times[i]` is when
/// sequence number `offset + i` left the window. Grows monotonically;
/// a sequence number is recorded at most once.
#[derive(Debug, Default)]
pub struct RemovalTimeline {
    offset: Option<u64>,
    times: VecDeque<i64>,
}

impl RemovalTimeline {
    pub fn is_initialized(&self) -> bool {
        self.offset.is_some()
    }

    /// Pin the timeline to the first window observed so later removals
    /// densely extend `times`. Only the first call has any effect.
    pub fn initialize(&mut self, first_present: u64) {
        if self.offset.is_none() {
            self.offset = Some(first_present);
        }
    }

    /// Sequence number the next removal will be recorded for.
    pub fn next_sequence(&self) -> Option<u64> {
        self.offset.map(|offset| offset + self.times.len() as u64)
    }

    /// Record `now_ms` for every unrecorded sequence number below
    /// `first_present`. Returns how many entries were appended.
    pub fn extend_to(&mut self, first_present: u64, now_ms: i64) -> usize {
        let Some(mut next) = self.next_sequence() else {
            return 0;
        };
        let before = self.times.len();
        while next < first_present {
            self.times.push_back(now_ms);
            next += 1;
        }
        self.times.len() - before
    }

    /// Drop every leading entry whose removal instant has aged past
    /// `expire_ms`, returning the highest sequence number dropped.
    pub fn reap_expired(&mut self, now_ms: i64, expire_ms: i64) -> Option<u64> {
        let mut highest = None;
        while let (Some(offset), Some(&front)) = (self.offset, self.times.front()) {
            if front + expire_ms > now_ms {
                break;
            }
            self.times.pop_front();
            self.offset = Some(offset + 1);
            highest = Some(offset);
        }
        highest
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Owns the per-sequence records and the removal timeline.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    timeline: RemovalTimeline,
    records: BTreeMap<u64, SegmentRecord>,
}

impl LifecycleManager {
    /// Record a freshly produced thumbnail. Creates the segment record
    /// lazily on first contact with a sequence number.
    pub fn record_thumbnail(&mut self, sn: u64, time: f64, name: String) {
        let record = self.records.entry(sn).or_insert_with(|| SegmentRecord {
            sn,
            removal_time: None,
            thumbnails: Vec::new(),
        });
        debug_assert!(
            record.thumbnails.last().is_none_or(|last| last.time < time),
            "thumbnails for a segment must be strictly ascending by time"
        );
        record.thumbnails.push(ThumbnailEntry { time, name });
    }

    /// How many thumbnails a sequence number already has; used to keep
    /// filename indexes unique across extraction passes.
    pub fn thumbnail_count(&self, sn: u64) -> usize {
        self.records.get(&sn).map_or(0, |r| r.thumbnails.len())
    }

    /// A changed playlist arrived with `first_present` as its first
    /// listed sequence number. Everything below it that has not been
    /// recorded yet is marked removed now. Returns how many sequence
    /// numbers were marked.
    pub fn observe_window_start(&mut self, first_present: u64, now_ms: i64) -> usize {
        if !self.timeline.is_initialized() {
            self.timeline.initialize(first_present);
            return 0;
        }
        let Some(from) = self.timeline.next_sequence() else {
            return 0;
        };
        let marked = self.timeline.extend_to(first_present, now_ms);
        for sn in from..first_present {
            if let Some(record) = self.records.get_mut(&sn) {
                record.removal_time = Some(now_ms);
            }
        }
        if marked > 0 {
            debug!(first_present, marked, "segments left the window");
        }
        marked
    }

    /// The playlist disappeared: everything in the last known window is
    /// marked removed. A timeline that was never initialized stays
    /// untouched; nothing was ever produced for it.
    pub fn mark_all_removed(&mut self, first_present: u64, window_len: usize, now_ms: i64) -> usize {
        if !self.timeline.is_initialized() {
            return 0;
        }
        self.observe_window_start(first_present + window_len as u64, now_ms)
    }

    /// Remove every record whose sequence number aged out of the
    /// timeline. Returns the reaped records so the caller can unlink
    /// their files.
    pub fn sweep(&mut self, now_ms: i64, expire_ms: i64) -> Vec<SegmentRecord> {
        let Some(highest) = self.timeline.reap_expired(now_ms, expire_ms) else {
            return Vec::new();
        };
        let keep = self.records.split_off(&(highest + 1));
        let reaped: Vec<SegmentRecord> =
            std::mem::replace(&mut self.records, keep).into_values().collect();
        if !reaped.is_empty() {
            debug!(
                highest,
                reaped = reaped.len(),
                "reaped expired segment records"
            );
        }
        reaped
    }

    /// True once every record has been reaped.
    pub fn is_drained(&self) -> bool {
        self.records.is_empty()
    }

    /// Thumbnail filenames across all live records, for teardown.
    pub fn all_file_names(&self) -> Vec<String> {
        self.records
            .values()
            .flat_map(|r| r.thumbnails.iter().map(|t| t.name.clone()))
            .collect()
    }

    pub fn to_manifest(&self, ended: bool) -> Manifest {
        Manifest {
            ended,
            segments: self
                .records
                .values()
                .map(|record| ManifestSegment {
                    sn: record.sn,
                    removal_time: record.removal_time,
                    thumbnails: record
                        .thumbnails
                        .iter()
                        .map(|t| ManifestThumbnail {
                            time: t.time,
                            name: t.name.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
