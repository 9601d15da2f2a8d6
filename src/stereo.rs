use std::cmp::Ordering;

use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::StereoRig;
use crate::config::StereoConfig;
use crate::track::{TrackSnapshot, TrackState};

/// Triangulated shuttlecock position, world centimeters
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct StereoPoint {
    pub position: [f64; 3],
    pub track_a: u32,
    pub track_b: u32,
    /// Mean reprojection residual in pixels, lower is better
    pub quality: f64,
    pub pole_distance: f64,
    pub timestamp: f64,
}

impl StereoPoint {
    #[inline]
    pub fn point(&self) -> na::Point3<f64> {
        na::Point3::from(self.position)
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.position[2]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Best pair is too far from its epipolar line
    Correspondence {
        track_a: u32,
        track_b: u32,
        pole_distance: f64,
    },
    LowQuality {
        track_a: u32,
        track_b: u32,
        quality: f64,
    },
    /// Back-projected rays are parallel
    Degenerate { track_a: u32, track_b: u32 },
    OutOfBounds {
        track_a: u32,
        track_b: u32,
        position: [f64; 3],
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StereoOutcome {
    Point(StereoPoint),
    Rejected(Rejection),
    /// One of the cameras has no eligible track
    NoCandidates,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    pole_distance: f64,
    rank_sum: usize,
    a: usize,
    b: usize,
    id_a: u32,
    id_b: u32,
}

fn candidate_order(x: &Candidate, y: &Candidate) -> Ordering {
    x.pole_distance
        .total_cmp(&y.pole_distance)
        .then_with(|| x.rank_sum.cmp(&y.rank_sum))
        .then_with(|| x.id_a.cmp(&y.id_a))
        .then_with(|| x.id_b.cmp(&y.id_b))
}

pub struct StereoMatcher {
    rig: StereoRig,
    config: StereoConfig,
}

impl StereoMatcher {
    pub fn new(rig: StereoRig, config: &StereoConfig) -> Self {
        Self {
            rig,
            config: config.clone(),
        }
    }

    #[inline]
    pub fn rig(&self) -> &StereoRig {
        &self.rig
    }

    /// Picks the pair of active tracks with the smallest pole distance and
    /// triangulates it.
    pub fn match_tracks(
        &self,
        timestamp: f64,
        tracks_a: &[TrackSnapshot],
        tracks_b: &[TrackSnapshot],
    ) -> StereoOutcome {
        let eligible_a: Vec<&TrackSnapshot> = tracks_a
            .iter()
            .filter(|t| t.state == TrackState::Active)
            .collect();
        let eligible_b: Vec<&TrackSnapshot> = tracks_b
            .iter()
            .filter(|t| t.state == TrackState::Active)
            .collect();

        let mut best: Option<Candidate> = None;

        for (a, ta) in eligible_a.iter().enumerate() {
            for (b, tb) in eligible_b.iter().enumerate() {
                let candidate = Candidate {
                    pole_distance: self.rig.pole_distance(ta.point(), tb.point()),
                    rank_sum: ta.rank + tb.rank,
                    a,
                    b,
                    id_a: ta.id,
                    id_b: tb.id,
                };

                best = match best {
                    Some(current) if candidate_order(&current, &candidate) != Ordering::Greater => {
                        Some(current)
                    }
                    _ => Some(candidate),
                };
            }
        }

        let best = match best {
            Some(best) => best,
            None => return StereoOutcome::NoCandidates,
        };

        let ta = eligible_a[best.a];
        let tb = eligible_b[best.b];

        self.triangulate_pair(
            timestamp,
            (ta.id, ta.point()),
            (tb.id, tb.point()),
            best.pole_distance,
        )
    }

    /// Accepts or rejects a single correspondence.
    pub fn triangulate(
        &self,
        timestamp: f64,
        a: (u32, na::Point2<f64>),
        b: (u32, na::Point2<f64>),
    ) -> StereoOutcome {
        let pole_distance = self.rig.pole_distance(a.1, b.1);

        self.triangulate_pair(timestamp, a, b, pole_distance)
    }

    fn triangulate_pair(
        &self,
        timestamp: f64,
        (track_a, px_a): (u32, na::Point2<f64>),
        (track_b, px_b): (u32, na::Point2<f64>),
        pole_distance: f64,
    ) -> StereoOutcome {
        if !(pole_distance < self.config.pole_distance_threshold) {
            debug!(timestamp, track_a, track_b, pole_distance, "correspondence rejected");

            return StereoOutcome::Rejected(Rejection::Correspondence {
                track_a,
                track_b,
                pole_distance,
            });
        }

        let p = match self.rig.triangulate(px_a, px_b) {
            Some(p) => p,
            None => {
                debug!(timestamp, track_a, track_b, "parallel rays");
                return StereoOutcome::Rejected(Rejection::Degenerate { track_a, track_b });
            }
        };

        let quality = self.rig.reprojection_error(&p, px_a, px_b);
        if !(quality <= self.config.max_reprojection_error_px) {
            debug!(timestamp, track_a, track_b, quality, "low quality triangulation");

            return StereoOutcome::Rejected(Rejection::LowQuality {
                track_a,
                track_b,
                quality,
            });
        }

        let position = [p.x, p.y, p.z];
        if !self.config.bounds.contains(&position) {
            debug!(timestamp, track_a, track_b, ?position, "triangulated point out of bounds");

            return StereoOutcome::Rejected(Rejection::OutOfBounds {
                track_a,
                track_b,
                position,
            });
        }

        StereoOutcome::Point(StereoPoint {
            position,
            track_a,
            track_b,
            quality,
            pole_distance,
            timestamp,
        })
    }
}
