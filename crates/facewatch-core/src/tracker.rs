//! Temporal tracking of unknown-face sightings.
//!
//! Each unknown face is keyed by a fine spatial bucket of its box center. A
//! sighting becomes eligible once it has been seen for the dwell time and is
//! emitted at most once while it stays in view. Emissions are rate-limited per
//! cooldown key, a coarser bucket that groups neighbouring fine buckets so a
//! face drifting across a cell edge does not raise a second alert.
//!
//! ```text
//! absent -> tracking -> tracking+eligible -> emitted -> absent
//!               |               |
//!               +---------------+--> absent (flushed if eligible)
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::types::FaceBox;

// -- Default bucket geometry ------------------------------------------------

/// Fine tracking cell edge in source pixels.
pub const DEFAULT_CELL_PX: f32 = 48.0;

/// Fine cells per cooldown cell edge.
pub const DEFAULT_COOLDOWN_GROUP: i32 = 4;

/// Fine spatial key for one tracked sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackKey {
    pub col: i32,
    pub row: i32,
}

/// Coarse spatial key that cooldown windows are recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CooldownKey {
    pub col: i32,
    pub row: i32,
}

/// Quantisation of face boxes into tracking and cooldown buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketGrid {
    pub cell_px: f32,
    pub cooldown_group: i32,
}

impl BucketGrid {
    pub fn new(cell_px: f32, cooldown_group: i32) -> Self {
        Self {
            cell_px: if cell_px > 0.0 { cell_px } else { DEFAULT_CELL_PX },
            cooldown_group: cooldown_group.max(1),
        }
    }

    pub fn track_key(&self, bbox: &FaceBox) -> TrackKey {
        let (x, y) = bbox.center();
        TrackKey {
            col: (x / self.cell_px).floor() as i32,
            row: (y / self.cell_px).floor() as i32,
        }
    }

    pub fn cooldown_key(&self, key: TrackKey) -> CooldownKey {
        CooldownKey {
            col: key.col.div_euclid(self.cooldown_group),
            row: key.row.div_euclid(self.cooldown_group),
        }
    }
}

impl Default for BucketGrid {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_PX, DEFAULT_COOLDOWN_GROUP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerTimings {
    pub dwell: Duration,
    pub cooldown: Duration,
}

impl Default for TrackerTimings {
    fn default() -> Self {
        Self {
            dwell: Duration::seconds(1),
            cooldown: Duration::seconds(5),
        }
    }
}

/// One unknown face in the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownSighting {
    pub bbox: FaceBox,
    /// Distance to the nearest identity (infinite if none).
    pub distance: f32,
    pub confidence: f32,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct TrackedSighting {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    emitted: bool,
    latest: UnknownSighting,
}

impl TrackedSighting {
    fn dwell(&self) -> Duration {
        self.last_seen - self.first_seen
    }
}

/// A sighting the tracker decided to escalate.
#[derive(Debug, Clone, PartialEq)]
pub struct SightingAlert {
    pub key: TrackKey,
    pub cooldown_key: CooldownKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub bbox: FaceBox,
    pub distance: f32,
    pub confidence: f32,
    pub image_ref: Option<String>,
    /// Emitted on disappearance rather than while in view.
    pub flushed: bool,
}

impl SightingAlert {
    pub fn dwell(&self) -> Duration {
        self.last_seen - self.first_seen
    }
}

/// Per-session unknown-face state machine.
pub struct SightingTracker {
    grid: BucketGrid,
    timings: TrackerTimings,
    sightings: HashMap<TrackKey, TrackedSighting>,
    last_emitted: HashMap<CooldownKey, DateTime<Utc>>,
    last_frame: Option<DateTime<Utc>>,
}

impl SightingTracker {
    pub fn new(grid: BucketGrid, timings: TrackerTimings) -> Self {
        Self {
            grid,
            timings,
            sightings: HashMap::new(),
            last_emitted: HashMap::new(),
            last_frame: None,
        }
    }

    pub fn reconfigure(&mut self, timings: TrackerTimings) {
        self.timings = timings;
    }

    pub fn tracked_count(&self) -> usize {
        self.sightings.len()
    }

    /// Advance the tracker with every unknown face seen in the frame at `now`.
    ///
    /// Frames must arrive in capture order; a frame older than the previous
    /// one is ignored.
    pub fn update(&mut self, now: DateTime<Utc>, unknowns: &[UnknownSighting]) -> Vec<SightingAlert> {
        if let Some(last) = self.last_frame {
            if now < last {
                tracing::warn!(
                    frame_at = %now,
                    previous = %last,
                    "out-of-order frame ignored by tracker"
                );
                return Vec::new();
            }
        }
        self.last_frame = Some(now);

        let cooldown = self.timings.cooldown;
        self.last_emitted.retain(|_, at| now - *at < cooldown);

        let mut alerts = Vec::new();
        let mut seen: HashSet<TrackKey> = HashSet::with_capacity(unknowns.len());

        for sighting in unknowns {
            let key = self.grid.track_key(&sighting.bbox);
            if !seen.insert(key) {
                // Two faces in one fine cell: the first one tracks it.
                continue;
            }

            let tracked = self
                .sightings
                .entry(key)
                .and_modify(|t| {
                    t.last_seen = now;
                    t.latest = sighting.clone();
                })
                .or_insert_with(|| {
                    tracing::debug!(col = key.col, row = key.row, "tracking new unknown sighting");
                    TrackedSighting {
                        first_seen: now,
                        last_seen: now,
                        emitted: false,
                        latest: sighting.clone(),
                    }
                });

            if tracked.emitted || tracked.dwell() < self.timings.dwell {
                continue;
            }

            let cooldown_key = self.grid.cooldown_key(key);
            if !cooldown_clear(&self.last_emitted, cooldown_key, now, cooldown) {
                continue;
            }

            tracked.emitted = true;
            self.last_emitted.insert(cooldown_key, now);
            alerts.push(alert_for(key, cooldown_key, tracked, false));
        }

        let mut gone: Vec<TrackKey> = self
            .sightings
            .keys()
            .filter(|key| !seen.contains(key))
            .copied()
            .collect();
        gone.sort();

        for key in gone {
            if let Some(tracked) = self.sightings.remove(&key) {
                if let Some(alert) = self.flush(key, tracked, now) {
                    alerts.push(alert);
                }
            }
        }

        alerts
    }

    /// Flush every eligible, unemitted sighting and discard all state.
    pub fn finish(mut self, now: DateTime<Utc>) -> Vec<SightingAlert> {
        let mut remaining: Vec<(TrackKey, TrackedSighting)> = self.sightings.drain().collect();
        remaining.sort_by_key(|(key, _)| *key);

        let alerts: Vec<SightingAlert> = remaining
            .into_iter()
            .filter_map(|(key, tracked)| self.flush(key, tracked, now))
            .collect();

        tracing::debug!(flushed = alerts.len(), "tracker finished");
        alerts
    }

    fn flush(&mut self, key: TrackKey, tracked: TrackedSighting, now: DateTime<Utc>) -> Option<SightingAlert> {
        if tracked.emitted || tracked.dwell() < self.timings.dwell {
            return None;
        }

        let cooldown_key = self.grid.cooldown_key(key);
        if !cooldown_clear(&self.last_emitted, cooldown_key, now, self.timings.cooldown) {
            tracing::debug!(
                col = key.col,
                row = key.row,
                "eligible sighting dropped inside cooldown window"
            );
            return None;
        }

        self.last_emitted.insert(cooldown_key, now);
        Some(alert_for(key, cooldown_key, &tracked, true))
    }
}

fn cooldown_clear(
    last_emitted: &HashMap<CooldownKey, DateTime<Utc>>,
    key: CooldownKey,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool {
    last_emitted.get(&key).map_or(true, |at| now - *at >= cooldown)
}

fn alert_for(key: TrackKey, cooldown_key: CooldownKey, tracked: &TrackedSighting, flushed: bool) -> SightingAlert {
    SightingAlert {
        key,
        cooldown_key,
        first_seen: tracked.first_seen,
        last_seen: tracked.last_seen,
        bbox: tracked.latest.bbox,
        distance: tracked.latest.distance,
        confidence: tracked.latest.confidence,
        image_ref: tracked.latest.image_ref.clone(),
        flushed,
    }
}
