use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::calibration::{CalibrationSource, StereoRig};
use crate::config::EngineConfig;
use crate::detector::{DetectionModel, DetectorAdapter, DetectorOutput};
use crate::error::Error;
use crate::events::{Degradation, Event};
use crate::frame::{CameraId, Frame, FramePair};
use crate::predictor::PhysicsPredictor;
use crate::stereo::{StereoMatcher, StereoOutcome, StereoPoint};
use crate::sync::Synced;
use crate::tracker::{MultiObjectTracker, TrackerUpdate};
use crate::trajectory::{PredictionRequest, TrajectoryBuffer, TrajectoryEvent};

pub struct Pipeline {
    detectors: [DetectorAdapter; 2],
    trackers: [MultiObjectTracker; 2],
    stereo: Option<StereoMatcher>,
    trajectory: TrajectoryBuffer,
    predictor: PhysicsPredictor,
    disabled_reported: bool,
}

impl Pipeline {
    /// Validates configuration and calibration, fatal errors surface here
    /// before any frame is processed.
    pub fn new(
        config: &EngineConfig,
        calibration: &dyn CalibrationSource,
        model: Arc<dyn DetectionModel>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let rig = match StereoRig::from_source(calibration) {
            Ok(Some(rig)) => Some(rig),
            Ok(None) if config.require_3d => {
                return Err(Error::MissingCalibration { camera: CameraId::A })
            }
            Ok(None) => {
                info!("no calibration, running in 2D tracking mode");
                None
            }
            Err(err) if config.require_3d => return Err(err),
            Err(err) => {
                warn!(error = %err, "unusable calibration, running in 2D tracking mode");
                None
            }
        };

        Ok(Self {
            detectors: [
                DetectorAdapter::spawn(CameraId::A, model.clone(), &config.detector)?,
                DetectorAdapter::spawn(CameraId::B, model, &config.detector)?,
            ],
            trackers: [
                MultiObjectTracker::new(CameraId::A, &config.tracker),
                MultiObjectTracker::new(CameraId::B, &config.tracker),
            ],
            stereo: rig.map(|rig| StereoMatcher::new(rig, &config.stereo)),
            trajectory: TrajectoryBuffer::new(&config.trajectory),
            predictor: PhysicsPredictor::new(&config.physics, &config.trajectory, &config.court),
            disabled_reported: false,
        })
    }

    #[inline]
    pub fn has_stereo(&self) -> bool {
        self.stereo.is_some()
    }

    #[inline]
    pub fn trajectory(&self) -> &TrajectoryBuffer {
        &self.trajectory
    }

    #[inline]
    pub fn tracker(&self, camera: CameraId) -> &MultiObjectTracker {
        &self.trackers[camera.index()]
    }

    /// Drops all tracks and the current flight, track ids restart.
    pub fn reset(&mut self) {
        self.trackers.iter_mut().for_each(MultiObjectTracker::reset);
        self.trajectory.reset();
        self.disabled_reported = false;
    }

    pub fn process(&mut self, synced: Synced) -> Vec<Event> {
        match synced {
            Synced::Pair(pair) => self.process_pair(&pair),
            Synced::Unpaired(frame) => self.process_unpaired(&frame),
            Synced::Dropped { camera, timestamp } => {
                vec![Event::Degraded(Degradation::DroppedFrame { camera, timestamp })]
            }
            Synced::Stalled { camera, last_seen } => {
                vec![Event::Degraded(Degradation::StreamStalled { camera, last_seen })]
            }
            Synced::Resumed { camera } => {
                vec![Event::Degraded(Degradation::StreamResumed { camera })]
            }
        }
    }

    fn process_pair(&mut self, pair: &FramePair) -> Vec<Event> {
        let [da, db] = &mut self.detectors;
        let pending_a = da.submit(&pair.a);
        let pending_b = db.submit(&pair.b);

        let a = da.collect(pending_a);
        let b = db.collect(pending_b);

        self.process_detections(pair.timestamp(), a, b)
    }

    fn process_unpaired(&mut self, frame: &Frame) -> Vec<Event> {
        let mut events = vec![Event::Degraded(Degradation::UnpairedFrame {
            camera: frame.camera,
            timestamp: frame.timestamp,
        })];

        let output = self.detectors[frame.camera.index()].detect(frame);
        self.track(output, &mut events);

        events
    }

    /// Detections of a synchronized pair, `timestamp` is the pair's capture time.
    pub fn process_detections(
        &mut self,
        timestamp: f64,
        a: DetectorOutput,
        b: DetectorOutput,
    ) -> Vec<Event> {
        let mut events = Vec::new();

        let update_a = self.track(a, &mut events);
        let update_b = self.track(b, &mut events);

        let outcome = match &self.stereo {
            Some(stereo) => stereo.match_tracks(timestamp, &update_a.tracks, &update_b.tracks),
            None => {
                if !self.disabled_reported {
                    self.disabled_reported = true;
                    events.push(Event::Degraded(Degradation::TriangulationDisabled));
                }
                return events;
            }
        };

        match outcome {
            StereoOutcome::Point(point) => {
                events.push(Event::StereoPoint(point));
                self.advance_trajectory(point, &mut events);
            }
            StereoOutcome::Rejected(rejection) => {
                events.push(Event::Degraded(Degradation::Stereo {
                    timestamp,
                    rejection,
                }));
            }
            StereoOutcome::NoCandidates => {}
        }

        events
    }

    fn track(&mut self, output: DetectorOutput, events: &mut Vec<Event>) -> TrackerUpdate {
        if let Some(fault) = output.fault {
            events.push(Event::Degraded(Degradation::Detector {
                camera: output.camera,
                timestamp: output.timestamp,
                fault,
            }));
        }

        let update = self.trackers[output.camera.index()].update(output.timestamp, &output.detections);

        if let Some(detections) = update.multi_object {
            events.push(Event::Degraded(Degradation::MultiObject {
                camera: update.camera,
                timestamp: update.timestamp,
                detections,
            }));
        }

        events.push(Event::Tracks {
            camera: update.camera,
            timestamp: update.timestamp,
            tracks: update.tracks.clone(),
        });

        update
    }

    /// Fits the current flight now instead of waiting for the cap or a landing.
    pub fn trigger_prediction(&mut self) -> Vec<Event> {
        let mut events = Vec::new();

        let push = self.trajectory.trigger();
        events.extend(push.events.into_iter().map(Event::Trajectory));

        if let Some(request) = push.request {
            self.run_prediction(request, &mut events);
        }

        events
    }

    fn advance_trajectory(&mut self, point: StereoPoint, events: &mut Vec<Event>) {
        let push = self.trajectory.push(point);
        events.extend(push.events.into_iter().map(Event::Trajectory));

        if let Some(request) = push.request {
            self.run_prediction(request, events);
        }
    }

    fn run_prediction(&mut self, request: PredictionRequest, events: &mut Vec<Event>) {
        let outcome = self.predictor.predict(&request.points);

        match &outcome {
            Ok(result) => events.push(Event::Prediction(result.clone())),
            Err(reason) => events.push(Event::Degraded(Degradation::InsufficientConfidence {
                reason: reason.clone(),
                terminal: request.terminal,
            })),
        }

        let finished = self.trajectory.finish(&outcome);
        let concluded = finished.iter().any(|e| {
            matches!(
                e,
                TrajectoryEvent::Concluded { .. } | TrajectoryEvent::Discarded { .. }
            )
        });
        events.extend(finished.into_iter().map(Event::Trajectory));

        if concluded {
            debug!("flight over, clearing tracks");
            self.trackers.iter_mut().for_each(MultiObjectTracker::clear_tracks);
        }
    }
}
