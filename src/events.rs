use serde_derive::{Deserialize, Serialize};

use crate::detector::DetectorFault;
use crate::frame::CameraId;
use crate::predictor::{Insufficient, PredictionResult};
use crate::stereo::{Rejection, StereoPoint};
use crate::track::TrackSnapshot;
use crate::trajectory::TrajectoryEvent;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Event {
    /// Tracks of one camera after a frame, ranked
    Tracks {
        camera: CameraId,
        timestamp: f64,
        tracks: Vec<TrackSnapshot>,
    },
    StereoPoint(StereoPoint),
    Prediction(PredictionResult),
    Trajectory(TrajectoryEvent),
    Degraded(Degradation),
    /// Both sources are exhausted and everything queued was processed
    Ended,
}

/// Non-fatal conditions, processing continues with reduced fidelity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Degradation {
    UnpairedFrame {
        camera: CameraId,
        timestamp: f64,
    },
    DroppedFrame {
        camera: CameraId,
        timestamp: f64,
    },
    StreamStalled {
        camera: CameraId,
        last_seen: Option<f64>,
    },
    StreamResumed {
        camera: CameraId,
    },
    Detector {
        camera: CameraId,
        timestamp: f64,
        fault: DetectorFault,
    },
    /// No calibration, tracking continues in 2D
    TriangulationDisabled,
    Stereo {
        timestamp: f64,
        rejection: Rejection,
    },
    MultiObject {
        camera: CameraId,
        timestamp: f64,
        detections: usize,
    },
    InsufficientConfidence {
        reason: Insufficient,
        terminal: bool,
    },
}
