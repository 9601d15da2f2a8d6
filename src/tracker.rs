use std::cmp::Ordering;

use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::frame::CameraId;
use crate::track::{Track, TrackSnapshot, TrackState};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerUpdate {
    pub camera: CameraId,
    pub timestamp: f64,
    pub tracks: Vec<TrackSnapshot>,
    pub created: Vec<u32>,
    pub closed: Vec<u32>,
    pub multi_object: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    track: usize,
    det: usize,
    distance: f64,
    confidence: f64,
    track_id: u32,
}

// distance, then confidence, then track id, then detection order
fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.track_id.cmp(&b.track_id))
        .then_with(|| a.det.cmp(&b.det))
}

pub struct MultiObjectTracker {
    camera: CameraId,
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl MultiObjectTracker {
    pub fn new(camera: CameraId, config: &TrackerConfig) -> Self {
        Self {
            camera,
            config: config.clone(),
            tracks: Vec::with_capacity(config.max_objects),
            next_id: 1,
        }
    }

    /// Drops all tracks and restarts id numbering.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    /// Drops all tracks, ids keep increasing.
    pub fn clear_tracks(&mut self) {
        if !self.tracks.is_empty() {
            debug!(camera = ?self.camera, count = self.tracks.len(), "tracks cleared");
        }

        self.tracks.clear();
    }

    #[inline]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn update(&mut self, timestamp: f64, detections: &[Detection]) -> TrackerUpdate {
        let multi_object = if detections.len() > 1 {
            info!(camera = ?self.camera, timestamp, count = detections.len(), "multiple objects detected");
            Some(detections.len())
        } else {
            None
        };

        let mut candidates = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            let predicted = track.predict(timestamp);

            for (di, det) in detections.iter().enumerate() {
                let distance = det.distance(&predicted);

                if distance <= self.config.max_association_distance_px {
                    candidates.push(Candidate {
                        track: ti,
                        det: di,
                        distance,
                        confidence: det.confidence,
                        track_id: track.id,
                    });
                }
            }
        }

        candidates.sort_by(candidate_order);

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];

        for c in candidates {
            if track_taken[c.track] || det_taken[c.det] {
                continue;
            }

            track_taken[c.track] = true;
            det_taken[c.det] = true;
            self.tracks[c.track].update(&detections[c.det]);
        }

        for (track, taken) in self.tracks.iter_mut().zip(track_taken) {
            if !taken {
                track.miss(self.config.max_missing_frames);
            }
        }

        let mut closed = Vec::new();
        self.tracks.retain(|t| {
            if t.state == TrackState::Closed {
                closed.push(t.id);
                false
            } else {
                true
            }
        });

        for id in &closed {
            debug!(camera = ?self.camera, track = id, "track closed");
        }

        let mut spawn: Vec<usize> = (0..detections.len())
            .filter(|&i| !det_taken[i] && detections[i].confidence >= self.config.min_confidence)
            .collect();

        spawn.sort_by(|&a, &b| {
            detections[b]
                .confidence
                .total_cmp(&detections[a].confidence)
                .then_with(|| a.cmp(&b))
        });

        let mut created = Vec::new();
        for i in spawn {
            if self.tracks.len() >= self.config.max_objects {
                match self.weakest_stale() {
                    Some(at) => {
                        let evicted = self.tracks.remove(at);
                        debug!(camera = ?self.camera, track = evicted.id, "stale track evicted");
                        closed.push(evicted.id);
                    }
                    None => break,
                }
            }

            let id = self.next_id;
            self.next_id += 1;

            debug!(camera = ?self.camera, track = id, x = detections[i].x, y = detections[i].y, "track created");

            self.tracks.push(Track::new(
                id,
                &detections[i],
                self.config.history,
                self.config.confidence_window,
            ));
            created.push(id);
        }

        TrackerUpdate {
            camera: self.camera,
            timestamp,
            tracks: self.snapshots(),
            created,
            closed,
            multi_object,
        }
    }

    fn weakest_stale(&self) -> Option<usize> {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TrackState::Stale)
            .max_by(|(_, a), (_, b)| rank_order(a, b))
            .map(|(i, _)| i)
    }

    pub fn snapshots(&self) -> Vec<TrackSnapshot> {
        let mut ranked: Vec<&Track> = self.tracks.iter().collect();
        ranked.sort_by(|a, b| rank_order(a, b));

        ranked
            .into_iter()
            .enumerate()
            .map(|(rank, t)| t.snapshot(rank))
            .collect()
    }
}

fn rank_order(a: &Track, b: &Track) -> Ordering {
    b.recent_confidence()
        .total_cmp(&a.recent_confidence())
        .then_with(|| a.id.cmp(&b.id))
}
