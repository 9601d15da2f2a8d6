use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::math::quadratic_ls;
use crate::stereo::StereoPoint;

const PHYSICS_WEIGHT: f64 = 0.375;
const CONTINUITY_WEIGHT: f64 = 0.3125;
const COMPLETENESS_WEIGHT: f64 = 0.3125;

/// Mean vertical speed, cm/s, below which a segment counts as descending
const DESCENT_SPEED: f64 = -50.0;
const MAX_SPEED_CHANGE: f64 = 1000.0;
const PARABOLA_TOLERANCE_CM: f64 = 100.0;
const FULL_LENGTH_POINTS: f64 = 8.0;

/// Plausibility of a buffered segment as one shuttlecock flight, every score in
/// 0..1.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct TrajectoryQuality {
    /// Descent, smooth velocity and a parabolic height profile
    pub physics: f64,
    /// Even frame spacing and plausible distance between points
    pub continuity: f64,
    /// Length, height range, ground proximity and time span
    pub completeness: f64,
    pub score: f64,
}

impl TrajectoryQuality {
    pub fn evaluate(points: &[StereoPoint], frame_rate: f64) -> Self {
        if points.len() < 3 {
            return Self::default();
        }

        let physics = physics_score(points);
        let continuity = continuity_score(points, 1.0 / frame_rate);
        let completeness = completeness_score(points);

        Self {
            physics,
            continuity,
            completeness,
            score: PHYSICS_WEIGHT * physics
                + CONTINUITY_WEIGHT * continuity
                + COMPLETENESS_WEIGHT * completeness,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));

    (n > 0).then(|| sum / n as f64)
}

fn physics_score(points: &[StereoPoint]) -> f64 {
    let velocities: Vec<na::Vector3<f64>> = points
        .windows(2)
        .filter_map(|w| {
            let dt = w[1].timestamp - w[0].timestamp;

            (dt > 0.0).then(|| (w[1].point() - w[0].point()) / dt)
        })
        .collect();

    if velocities.len() < 2 {
        return 0.0;
    }

    let descending = mean(velocities.iter().map(|v| v.z)).unwrap_or(0.0) < DESCENT_SPEED;

    let change = mean(velocities.windows(2).map(|v| (v[1] - v[0]).norm())).unwrap_or(0.0);
    let smooth = (1.0 - change / MAX_SPEED_CHANGE).max(0.0);

    let t0 = points[0].timestamp;
    let t = na::DVector::from_iterator(points.len(), points.iter().map(|p| p.timestamp - t0));
    let z = na::DVector::from_iterator(points.len(), points.iter().map(|p| p.height()));

    let parabola = match quadratic_ls(&t, &z) {
        Some(c) => {
            let err = mean(
                t.iter()
                    .zip(z.iter())
                    .map(|(&t, &z)| (z - (c[0] * t * t + c[1] * t + c[2])).abs()),
            )
            .unwrap_or(0.0);

            (1.0 - err / PARABOLA_TOLERANCE_CM).max(0.0)
        }
        None => 0.5,
    };

    let descent = if descending { 1.0 } else { 0.3 };

    (descent * 0.4 + smooth * 0.3 + parabola * 0.3).min(1.0)
}

fn continuity_score(points: &[StereoPoint], frame_interval: f64) -> f64 {
    let intervals: Vec<f64> = points
        .windows(2)
        .map(|w| w[1].timestamp - w[0].timestamp)
        .collect();

    let avg = mean(intervals.iter().copied()).unwrap_or(0.0);
    let std = mean(intervals.iter().map(|i| (i - avg) * (i - avg)))
        .unwrap_or(0.0)
        .sqrt();
    let timing = (1.0 - std / frame_interval).max(0.0);

    let step = mean(
        points
            .windows(2)
            .map(|w| na::distance(&w[0].point(), &w[1].point())),
    )
    .unwrap_or(0.0);

    let spacing = if (1.0..=50.0).contains(&step) {
        1.0
    } else {
        (1.0 - (step - 25.0).abs() / 100.0).max(0.0)
    };

    timing * 0.6 + spacing * 0.4
}

fn completeness_score(points: &[StereoPoint]) -> f64 {
    let length = (points.len() as f64 / FULL_LENGTH_POINTS).min(1.0);

    let (low, high) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        (lo.min(p.height()), hi.max(p.height()))
    });
    let height_range = ((high - low) / 100.0).min(1.0);
    let near_ground = (1.0 - low / 200.0).clamp(0.0, 1.0);

    let span = points[points.len() - 1].timestamp - points[0].timestamp;
    let duration = span.clamp(0.0, 1.0);

    length * 0.3 + height_range * 0.3 + near_ground * 0.2 + duration * 0.2
}
