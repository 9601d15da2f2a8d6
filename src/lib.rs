pub mod calibration;
pub mod camera;
pub mod config;
pub mod court;
pub mod detection;
pub mod detector;
pub mod error;
pub mod events;
pub mod frame;
pub mod math;
pub mod pipeline;
pub mod predictor;
pub mod quality;
pub mod rolling_avg;
pub mod session;
pub mod stereo;
pub mod sync;
pub mod tracker;
pub mod trajectory;

mod circular_queue;
mod track;

pub use calibration::{CalibrationParameters, CalibrationSource, NoCalibration, StereoRig};
pub use config::EngineConfig;
pub use detection::Detection;
pub use detector::{DetectionModel, ModelError, RawDetection};
pub use error::Error;
pub use events::{Degradation, Event};
pub use frame::{CameraId, Frame, FramePair};
pub use pipeline::Pipeline;
pub use predictor::{Insufficient, PhysicsPredictor, PredictionResult};
pub use quality::TrajectoryQuality;
pub use session::{FrameSource, Session, SourceKind};
pub use stereo::StereoPoint;
pub use track::{Track, TrackSnapshot, TrackState};
pub use trajectory::{TrajectoryEvent, TrajectoryState, TriggerRefusal};
