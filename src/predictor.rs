use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use super::math::{weighted_linear_ls, weighted_rms};
use crate::config::{CourtConfig, PhysicsConfig, TrajectoryConfig};
use crate::court::Court;
use crate::quality::TrajectoryQuality;
use crate::stereo::StereoPoint;

/// Mass the air resistance length is specified for
const REFERENCE_MASS_G: f64 = 5.1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, thiserror::Error)]
pub enum Insufficient {
    #[error("{have} points, at least {need} required")]
    TooFewPoints { have: usize, need: usize },

    #[error("fit residual {residual_cm:.1} cm exceeds {max_cm:.1} cm")]
    ResidualTooLarge { residual_cm: f64, max_cm: f64 },

    #[error("fitted flight never descends to landing height")]
    NoLanding,

    #[error("observations do not span time")]
    Degenerate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub landing: [f64; 2],
    pub landing_time: f64,
    pub max_speed: f64,
    /// 0..1, grows with point count and shrinks with fit residual
    pub confidence: f64,
    pub in_court: Option<bool>,
    pub fit_residual_cm: f64,
    pub points_used: usize,
    pub quality: TrajectoryQuality,
    pub path: Vec<[f64; 3]>,
}

/// Horizontal motion decays under linear drag, `p(t) = p0 + v0 tau (1 - e^(-t/tau))`,
/// height follows free fall. Times are relative to `t0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightModel {
    pub t0: f64,
    pub tau: f64,
    pub gravity: f64,
    pub origin: na::Point3<f64>,
    pub velocity: na::Vector3<f64>,
    pub residual_cm: f64,
}

impl FlightModel {
    #[inline]
    fn drag_distance(&self, t: f64) -> f64 {
        self.tau * (1.0 - (-t / self.tau).exp())
    }

    pub fn position_at(&self, timestamp: f64) -> na::Point3<f64> {
        let t = timestamp - self.t0;
        let d = self.drag_distance(t);

        na::Point3::new(
            self.origin.x + self.velocity.x * d,
            self.origin.y + self.velocity.y * d,
            self.origin.z + self.velocity.z * t - 0.5 * self.gravity * t * t,
        )
    }

    /// Descending crossing of `height`, absolute time
    pub fn time_at_height(&self, height: f64) -> Option<f64> {
        let vz = self.velocity.z;
        let disc = vz * vz + 2.0 * self.gravity * (self.origin.z - height);

        if disc < 0.0 {
            return None;
        }

        let t = (vz + disc.sqrt()) / self.gravity;

        (t >= 0.0).then(|| self.t0 + t)
    }
}

/// Largest `|Δp| / |Δt|` over consecutive points, pairs without elapsed time
/// are skipped.
pub fn max_speed(points: &[StereoPoint]) -> f64 {
    points
        .windows(2)
        .filter_map(|w| {
            let dt = (w[1].timestamp - w[0].timestamp).abs();

            (dt > 0.0).then(|| na::distance(&w[0].point(), &w[1].point()) / dt)
        })
        .fold(0.0, f64::max)
}

pub struct PhysicsPredictor {
    config: PhysicsConfig,
    buffer_size: usize,
    landing_height: f64,
    court: Court,
}

impl PhysicsPredictor {
    pub fn new(physics: &PhysicsConfig, trajectory: &TrajectoryConfig, court: &CourtConfig) -> Self {
        Self {
            config: physics.clone(),
            buffer_size: trajectory.buffer_size,
            landing_height: trajectory.landing_height_cm,
            court: Court::new(court),
        }
    }

    #[inline]
    pub fn gravity(&self) -> f64 {
        self.config.gravity * 100.0
    }

    /// Horizontal drag time constant in seconds.
    pub fn tau(&self) -> f64 {
        let length_cm =
            self.config.air_resistance_length_m * 100.0 * self.config.mass_g / REFERENCE_MASS_G;

        (length_cm / self.gravity()).sqrt()
    }

    pub fn fit(&self, points: &[StereoPoint]) -> Result<FlightModel, Insufficient> {
        let n = points.len();
        if n < self.config.min_points {
            return Err(Insufficient::TooFewPoints {
                have: n,
                need: self.config.min_points,
            });
        }

        let t0 = points[0].timestamp;
        let tau = self.tau();
        let g = self.gravity();

        let t = na::DVector::from_iterator(n, points.iter().map(|p| p.timestamp - t0));
        let w = na::DVector::from_iterator(n, points.iter().map(|p| 1.0 / (1.0 + p.quality)));
        let d = t.map(|t| tau * (1.0 - (-t / tau).exp()));

        let axis = |i: usize| na::DVector::from_iterator(n, points.iter().map(|p| p.position[i]));
        let lifted_z = axis(2).zip_map(&t, |z, t| z + 0.5 * g * t * t);

        let fx = weighted_linear_ls(&d, &axis(0), &w).ok_or(Insufficient::Degenerate)?;
        let fy = weighted_linear_ls(&d, &axis(1), &w).ok_or(Insufficient::Degenerate)?;
        let fz = weighted_linear_ls(&t, &lifted_z, &w).ok_or(Insufficient::Degenerate)?;

        let mut model = FlightModel {
            t0,
            tau,
            gravity: g,
            origin: na::Point3::new(fx[1], fy[1], fz[1]),
            velocity: na::Vector3::new(fx[0], fy[0], fz[0]),
            residual_cm: 0.0,
        };

        model.residual_cm = weighted_rms(
            points
                .iter()
                .map(|p| na::distance(&model.position_at(p.timestamp), &p.point())),
            &w,
        );

        Ok(model)
    }

    pub fn predict(&self, points: &[StereoPoint]) -> Result<PredictionResult, Insufficient> {
        let model = self.fit(points)?;

        if model.residual_cm > self.config.max_fit_residual_cm {
            debug!(residual_cm = model.residual_cm, "flight fit rejected");

            return Err(Insufficient::ResidualTooLarge {
                residual_cm: model.residual_cm,
                max_cm: self.config.max_fit_residual_cm,
            });
        }

        let landing_time = model
            .time_at_height(self.landing_height)
            .ok_or(Insufficient::NoLanding)?;
        let landing = model.position_at(landing_time);

        let last = points[points.len() - 1].timestamp;
        let step = 1.0 / self.config.frame_rate;
        let mut path = Vec::new();
        let mut ts = last;
        while ts < landing_time {
            let p = model.position_at(ts);
            path.push([p.x, p.y, p.z]);
            ts += step;
        }
        path.push([landing.x, landing.y, landing.z]);

        let coverage = (points.len() as f64 / self.buffer_size as f64).min(1.0);
        let fit = 1.0 - model.residual_cm / self.config.max_fit_residual_cm;

        Ok(PredictionResult {
            landing: [landing.x, landing.y],
            landing_time,
            max_speed: max_speed(points),
            confidence: (coverage * fit).clamp(0.0, 1.0),
            in_court: Some(self.court.contains(na::Point2::new(landing.x, landing.y))),
            fit_residual_cm: model.residual_cm,
            points_used: points.len(),
            quality: TrajectoryQuality::evaluate(points, self.config.frame_rate),
            path,
        })
    }
}
