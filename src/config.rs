use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub physics: PhysicsConfig,
    pub tracker: TrackerConfig,
    pub stereo: StereoConfig,
    pub trajectory: TrajectoryConfig,
    pub sync: SyncConfig,
    pub detector: DetectorConfig,
    pub court: CourtConfig,
    /// Fail at session start when calibration is absent
    pub require_3d: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Shuttlecock mass in grams
    pub mass_g: f64,
    /// Gravity in m/s²
    pub gravity: f64,
    /// Air resistance length in meters
    pub air_resistance_length_m: f64,
    pub min_points: usize,
    pub max_fit_residual_cm: f64,
    /// Sampling rate of the predicted path, frames per second
    pub frame_rate: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            mass_g: 5.1,
            gravity: 9.81,
            air_resistance_length_m: 0.5,
            min_points: 5,
            max_fit_residual_cm: 25.0,
            frame_rate: 30.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_objects: usize,
    pub max_association_distance_px: f64,
    pub max_missing_frames: u32,
    /// Detections below this confidence never spawn a track
    pub min_confidence: f64,
    /// Detections kept per track
    pub history: usize,
    /// Number of recent detections used to rank tracks
    pub confidence_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_objects: 2,
            max_association_distance_px: 100.0,
            max_missing_frames: 10,
            min_confidence: 0.25,
            history: 50,
            confidence_window: 5,
        }
    }
}

/// Axis aligned volume in world centimeters
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct VolumeBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl VolumeBounds {
    #[inline]
    pub fn contains(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StereoConfig {
    pub pole_distance_threshold: f64,
    pub max_reprojection_error_px: f64,
    pub bounds: VolumeBounds,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            pole_distance_threshold: 5.0,
            max_reprojection_error_px: 8.0,
            bounds: VolumeBounds {
                min: [-150.0, -200.0, -20.0],
                max: [760.0, 1540.0, 800.0],
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrajectoryConfig {
    pub buffer_size: usize,
    /// Larger gaps between consecutive points start a new flight
    pub max_gap_secs: f64,
    pub landing_height_cm: f64,
    pub landing_confirm_frames: usize,
    /// Minimum number of buffered points before a landing may be confirmed
    pub landing_detection_threshold: usize,
    /// Extra time after an estimated landing during which points are absorbed
    pub cooldown_secs: f64,
    /// Points needed before an on-demand prediction is attempted
    pub trigger_min_points: usize,
    /// Capture time between two on-demand predictions
    pub trigger_cooldown_secs: f64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20,
            max_gap_secs: 0.25,
            landing_height_cm: 15.0,
            landing_confirm_frames: 3,
            landing_detection_threshold: 5,
            cooldown_secs: 2.0,
            trigger_min_points: 10,
            trigger_cooldown_secs: 2.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub tolerance_secs: f64,
    pub lookahead_frames: usize,
    pub stall_timeout_secs: f64,
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: 1.0 / 60.0,
            lookahead_frames: 3,
            stall_timeout_secs: 0.5,
            queue_capacity: 8,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub budget_ms: u64,
    pub duplicate_radius_px: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            budget_ms: 50,
            duplicate_radius_px: 4.0,
        }
    }
}

/// Court outline on the z = 0 plane, in centimeters
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CourtConfig {
    pub outline: Vec<[f64; 2]>,
}

impl Default for CourtConfig {
    fn default() -> Self {
        // singles sidelines inside the 610 x 1340 doubles court
        Self {
            outline: vec![[46.0, 0.0], [564.0, 0.0], [564.0, 1340.0], [46.0, 1340.0]],
        }
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), Error> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name,
            value,
            min,
            max,
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        let config: EngineConfig = toml::from_str(src)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let src = std::fs::read_to_string(path)?;

        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let p = &self.physics;
        check_range("physics.mass_g", p.mass_g, 4.0, 6.0)?;
        check_range("physics.gravity", p.gravity, 9.7, 9.9)?;
        check_range(
            "physics.air_resistance_length_m",
            p.air_resistance_length_m,
            0.1,
            2.0,
        )?;
        check_range("physics.min_points", p.min_points as f64, 3.0, 1000.0)?;
        check_range(
            "physics.max_fit_residual_cm",
            p.max_fit_residual_cm,
            f64::EPSILON,
            f64::MAX,
        )?;
        check_range("physics.frame_rate", p.frame_rate, 1.0, 1000.0)?;

        let t = &self.tracker;
        check_range("tracker.max_objects", t.max_objects as f64, 1.0, 16.0)?;
        check_range(
            "tracker.max_association_distance_px",
            t.max_association_distance_px,
            f64::EPSILON,
            f64::MAX,
        )?;
        check_range("tracker.min_confidence", t.min_confidence, 0.0, 1.0)?;
        check_range("tracker.history", t.history as f64, 2.0, 10_000.0)?;
        check_range(
            "tracker.confidence_window",
            t.confidence_window as f64,
            1.0,
            t.history as f64,
        )?;

        let s = &self.stereo;
        check_range(
            "stereo.pole_distance_threshold",
            s.pole_distance_threshold,
            f64::EPSILON,
            f64::MAX,
        )?;
        check_range(
            "stereo.max_reprojection_error_px",
            s.max_reprojection_error_px,
            f64::EPSILON,
            f64::MAX,
        )?;
        for i in 0..3 {
            check_range("stereo.bounds", s.bounds.min[i], f64::MIN, s.bounds.max[i])?;
        }

        let tr = &self.trajectory;
        check_range(
            "trajectory.buffer_size",
            tr.buffer_size as f64,
            p.min_points as f64,
            10_000.0,
        )?;
        check_range(
            "trajectory.max_gap_secs",
            tr.max_gap_secs,
            f64::EPSILON,
            f64::MAX,
        )?;
        check_range(
            "trajectory.landing_height_cm",
            tr.landing_height_cm,
            f64::MIN,
            f64::MAX,
        )?;
        check_range(
            "trajectory.landing_confirm_frames",
            tr.landing_confirm_frames as f64,
            1.0,
            tr.buffer_size as f64,
        )?;
        check_range(
            "trajectory.landing_detection_threshold",
            tr.landing_detection_threshold as f64,
            1.0,
            tr.buffer_size as f64,
        )?;
        check_range("trajectory.cooldown_secs", tr.cooldown_secs, 0.0, f64::MAX)?;
        check_range(
            "trajectory.trigger_min_points",
            tr.trigger_min_points as f64,
            p.min_points as f64,
            10_000.0,
        )?;
        check_range(
            "trajectory.trigger_cooldown_secs",
            tr.trigger_cooldown_secs,
            0.0,
            f64::MAX,
        )?;

        let sy = &self.sync;
        check_range("sync.tolerance_secs", sy.tolerance_secs, 0.0, f64::MAX)?;
        check_range(
            "sync.lookahead_frames",
            sy.lookahead_frames as f64,
            1.0,
            1000.0,
        )?;
        check_range(
            "sync.stall_timeout_secs",
            sy.stall_timeout_secs,
            f64::EPSILON,
            f64::MAX,
        )?;
        check_range("sync.queue_capacity", sy.queue_capacity as f64, 1.0, 10_000.0)?;

        check_range(
            "detector.budget_ms",
            self.detector.budget_ms as f64,
            1.0,
            60_000.0,
        )?;
        check_range(
            "detector.duplicate_radius_px",
            self.detector.duplicate_radius_px,
            0.0,
            f64::MAX,
        )?;

        check_range(
            "court.outline",
            self.court.outline.len() as f64,
            3.0,
            f64::MAX,
        )?;

        Ok(())
    }
}
