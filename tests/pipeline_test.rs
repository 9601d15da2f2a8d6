use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra as na;
use ndarray::Array3;

use shuttletrack::calibration::CameraCalibration;
use shuttletrack::camera::{CameraIntrinsics, CameraModel, Pose};
use shuttletrack::sync::{FrameSynchronizer, Synced};
use shuttletrack::{
    CalibrationParameters, CalibrationSource, CameraId, Degradation, DetectionModel,
    EngineConfig, Error, Event, Frame, FrameSource, ModelError, NoCalibration, Pipeline,
    PredictionResult, RawDetection, Session, SourceKind, TrajectoryEvent, TriggerRefusal,
};

const WIDTH: usize = 480;
const HEIGHT: usize = 270;
const FPS: f64 = 60.0;

/// Finds the brightest spot and refines it with an intensity centroid
struct SpotModel;

impl DetectionModel for SpotModel {
    fn detect(&self, image: &Array3<u8>) -> Result<Vec<RawDetection>, ModelError> {
        let (mut best, mut at) = (0u8, (0usize, 0usize));

        for ((y, x, _), &v) in image.indexed_iter() {
            if v > best {
                best = v;
                at = (y, x);
            }
        }

        if best < 128 {
            return Ok(Vec::new());
        }

        let (mut sx, mut sy, mut sw) = (0.0, 0.0, 0.0);
        for y in at.0.saturating_sub(3)..(at.0 + 4).min(HEIGHT) {
            for x in at.1.saturating_sub(3)..(at.1 + 4).min(WIDTH) {
                let w = image[[y, x, 0]] as f64;
                sx += w * x as f64;
                sy += w * y as f64;
                sw += w;
            }
        }

        Ok(vec![RawDetection {
            x: sx / sw,
            y: sy / sw,
            confidence: best as f64 / 255.0,
        }])
    }
}

fn look_at(eye: [f64; 3], target: [f64; 3]) -> Pose {
    let eye = na::Point3::from(eye);
    let forward = (na::Point3::from(target) - eye).normalize();
    let right = forward.cross(&na::Vector3::z()).normalize();
    let down = forward.cross(&right);

    let rotation = na::Rotation3::from_matrix_unchecked(na::Matrix3::from_rows(&[
        right.transpose(),
        down.transpose(),
        forward.transpose(),
    ]));

    Pose::from_parts(&rotation, &(-(rotation * eye.coords)))
}

fn calibration() -> CalibrationParameters {
    let intrinsics = CameraIntrinsics::new(350.0, 350.0, 240.0, 135.0);

    CalibrationParameters {
        a: CameraCalibration {
            intrinsics,
            pose: Some(look_at([150.0, -600.0, 400.0], [305.0, 670.0, 100.0])),
        },
        b: CameraCalibration {
            intrinsics,
            pose: Some(look_at([460.0, 1940.0, 400.0], [305.0, 670.0, 100.0])),
        },
        extrinsics: None,
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.detector.budget_ms = 10_000;
    config.physics.frame_rate = FPS;
    config
}

const P0: [f64; 3] = [250.0, 500.0, 160.0];
const V0: [f64; 3] = [60.0, 700.0, 100.0];

fn flight(t: f64) -> [f64; 3] {
    let g = 981.0;
    let tau = (50.0f64 / g).sqrt();
    let d = tau * (1.0 - (-t / tau).exp());

    [
        P0[0] + V0[0] * d,
        P0[1] + V0[1] * d,
        P0[2] + V0[2] * t - 0.5 * g * t * t,
    ]
}

/// Time at which the synthetic flight descends to 15 cm
fn true_landing_time() -> f64 {
    let disc = V0[2] * V0[2] + 2.0 * 981.0 * (P0[2] - 15.0);
    (V0[2] + disc.sqrt()) / 981.0
}

fn render(camera: &CameraModel, p: [f64; 3]) -> Array3<u8> {
    let mut image = Array3::<u8>::zeros((HEIGHT, WIDTH, 1));

    if let Some(px) = camera.project(&na::Point3::from(p)) {
        let (cx, cy) = (px.x.round() as i64, px.y.round() as i64);

        for y in cy - 3..=cy + 3 {
            for x in cx - 3..=cx + 3 {
                if x < 0 || y < 0 || x >= WIDTH as i64 || y >= HEIGHT as i64 {
                    continue;
                }

                let r2 = (x as f64 - px.x).powi(2) + (y as f64 - px.y).powi(2);
                image[[y as usize, x as usize, 0]] = (250.0 * (-r2 / 2.0).exp()) as u8;
            }
        }
    }

    image
}

fn frames(frames: usize) -> Vec<(Frame, Frame)> {
    let params = calibration();
    let cam_a = CameraModel::new(params.a.intrinsics, &params.a.pose.unwrap());
    let cam_b = CameraModel::new(params.b.intrinsics, &params.b.pose.unwrap());

    (0..frames)
        .map(|i| {
            let t = i as f64 / FPS;
            let p = flight(t);

            (
                Frame::new(CameraId::A, render(&cam_a, p), t),
                Frame::new(CameraId::B, render(&cam_b, p), t + 0.002),
            )
        })
        .collect()
}

fn run(pipeline: &mut Pipeline, input: &[(Frame, Frame)]) -> Vec<Event> {
    let mut sync = FrameSynchronizer::new(&config().sync);
    let mut events = Vec::new();

    for (a, b) in input {
        for s in sync.push(a.clone()).into_iter().chain(sync.push(b.clone())) {
            events.extend(pipeline.process(s));
        }
    }

    for s in sync.flush() {
        events.extend(pipeline.process(s));
    }

    events
}

fn predictions(events: &[Event]) -> Vec<&PredictionResult> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Prediction(p) => Some(p),
            _ => None,
        })
        .collect()
}

fn stereo_points(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::StereoPoint(_)))
        .count()
}

/// Horizontal distance between the predicted and the true landing spot
fn landing_error(prediction: &PredictionResult) -> f64 {
    let truth = flight(true_landing_time());

    ((prediction.landing[0] - truth[0]).powi(2) + (prediction.landing[1] - truth[1]).powi(2))
        .sqrt()
}

#[test]
fn predicts_landing_before_touchdown() {
    let mut pipeline = Pipeline::new(&config(), &calibration(), Arc::new(SpotModel)).unwrap();
    let events = run(&mut pipeline, &frames(36));

    let points = stereo_points(&events);
    assert!(points >= 20, "only {} stereo points", points);

    let predictions = predictions(&events);
    assert_eq!(predictions.len(), 1);

    let prediction = predictions[0];
    let err = landing_error(prediction);

    assert!(err < 30.0, "landing off by {:.1} cm", err);
    assert!((prediction.landing_time - true_landing_time()).abs() < 3.0 / FPS);
    assert_eq!(prediction.in_court, Some(true));
    assert!(prediction.max_speed > 600.0 && prediction.max_speed < 900.0);
    assert!(prediction.confidence > 0.5);
}

#[test]
fn reset_pipeline_replays_bit_identical() {
    let input = frames(24);
    let mut pipeline = Pipeline::new(&config(), &calibration(), Arc::new(SpotModel)).unwrap();

    let first = run(&mut pipeline, &input);
    pipeline.reset();
    assert!(pipeline.trajectory().is_empty());
    let second = run(&mut pipeline, &input);

    assert!(first.iter().any(|e| matches!(e, Event::StereoPoint(_))));
    assert_eq!(first, second);
}

#[test]
fn missing_calibration_runs_in_2d() {
    let mut pipeline = Pipeline::new(&config(), &NoCalibration, Arc::new(SpotModel)).unwrap();
    assert!(!pipeline.has_stereo());

    let events = run(&mut pipeline, &frames(6));

    let disabled = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::Degraded(shuttletrack::Degradation::TriangulationDisabled)
            )
        })
        .count();
    assert_eq!(disabled, 1);
    assert!(events.iter().any(|e| matches!(e, Event::Tracks { tracks, .. } if !tracks.is_empty())));
    assert!(!events.iter().any(|e| matches!(e, Event::StereoPoint(_))));
}

#[test]
fn required_3d_without_calibration_fails_at_start() {
    let mut config = config();
    config.require_3d = true;

    let err = Pipeline::new(&config, &NoCalibration, Arc::new(SpotModel)).err().unwrap();
    assert!(matches!(err, Error::MissingCalibration { camera: CameraId::A }));
}

#[test]
fn unpaired_frames_still_track() {
    let mut pipeline = Pipeline::new(&config(), &calibration(), Arc::new(SpotModel)).unwrap();
    let (a, _) = frames(1).remove(0);

    let events = pipeline.process(Synced::Unpaired(a));

    assert!(matches!(
        events[0],
        Event::Degraded(shuttletrack::Degradation::UnpairedFrame {
            camera: CameraId::A,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Tracks { camera: CameraId::A, tracks, .. } if tracks.len() == 1)));
    assert_eq!(pipeline.tracker(CameraId::A).tracks().len(), 1);
    assert!(pipeline.tracker(CameraId::B).tracks().is_empty());
}

/// Calibration source that only knows camera A
struct OnlyA(CalibrationParameters);

impl CalibrationSource for OnlyA {
    fn get_calibration(&self, camera: CameraId) -> Option<CameraCalibration> {
        (camera == CameraId::A).then(|| self.0.a)
    }

    fn get_extrinsics(&self) -> Option<Pose> {
        None
    }
}

fn triangulation_disabled(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::Degraded(Degradation::TriangulationDisabled)))
        .count()
}

#[test]
fn partial_calibration_falls_back_to_2d() {
    let mut pipeline =
        Pipeline::new(&config(), &OnlyA(calibration()), Arc::new(SpotModel)).unwrap();
    assert!(!pipeline.has_stereo());

    let events = run(&mut pipeline, &frames(4));
    assert_eq!(triangulation_disabled(&events), 1);
    assert_eq!(stereo_points(&events), 0);

    let mut strict = config();
    strict.require_3d = true;
    let err = Pipeline::new(&strict, &OnlyA(calibration()), Arc::new(SpotModel))
        .err()
        .unwrap();
    assert!(matches!(err, Error::MissingCalibration { camera: CameraId::B }));
}

#[test]
fn extrinsics_without_world_pose_fall_back_to_2d() {
    let mut params = calibration();
    params.extrinsics = params.get_extrinsics();
    params.a.pose = None;
    params.b.pose = None;

    let mut pipeline = Pipeline::new(&config(), &params, Arc::new(SpotModel)).unwrap();
    assert!(!pipeline.has_stereo());
    assert_eq!(triangulation_disabled(&run(&mut pipeline, &frames(2))), 1);

    let mut strict = config();
    strict.require_3d = true;
    assert!(matches!(
        Pipeline::new(&strict, &params, Arc::new(SpotModel)),
        Err(Error::Calibration(_))
    ));
}

#[test]
fn on_demand_prediction_mid_flight() {
    let mut pipeline = Pipeline::new(&config(), &calibration(), Arc::new(SpotModel)).unwrap();

    let events = run(&mut pipeline, &frames(16));
    assert!(predictions(&events).is_empty());
    assert!(pipeline.trajectory().len() >= 10);

    let events = pipeline.trigger_prediction();
    assert!(matches!(
        events[0],
        Event::Trajectory(TrajectoryEvent::Triggered { .. })
    ));

    let predictions = predictions(&events);
    assert_eq!(predictions.len(), 1);
    assert!(landing_error(predictions[0]) < 60.0);
    assert!(predictions[0].quality.score > 0.0);

    let events = pipeline.trigger_prediction();
    assert_eq!(
        events,
        vec![Event::Trajectory(TrajectoryEvent::TriggerRefused(
            TriggerRefusal::NoFlight
        ))]
    );
}

struct VecSource {
    kind: SourceKind,
    frames: std::vec::IntoIter<Frame>,
}

impl FrameSource for VecSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn next_frame(&mut self) -> Option<(Array3<u8>, f64)> {
        let frame = self.frames.next()?;
        let image = Arc::try_unwrap(frame.image).unwrap_or_else(|shared| (*shared).clone());

        Some((image, frame.timestamp))
    }
}

/// Endless camera feed of empty frames
struct LiveSource(f64);

impl FrameSource for LiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    fn next_frame(&mut self) -> Option<(Array3<u8>, f64)> {
        thread::sleep(Duration::from_millis(5));
        self.0 += 1.0 / 200.0;

        Some((Array3::zeros((8, 8, 1)), self.0))
    }
}

/// File source that holds back everything after the first `open` frames until
/// the gate sender is dropped.
struct GatedSource {
    frames: std::vec::IntoIter<Frame>,
    open: usize,
    gate: Option<Receiver<()>>,
}

impl FrameSource for GatedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn next_frame(&mut self) -> Option<(Array3<u8>, f64)> {
        if self.open == 0 {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
        } else {
            self.open -= 1;
        }

        let frame = self.frames.next()?;
        let image = Arc::try_unwrap(frame.image).unwrap_or_else(|shared| (*shared).clone());

        Some((image, frame.timestamp))
    }
}

const OPEN_FRAMES: usize = 12;

/// Calibrated file session over a full flight, stopped after `OPEN_FRAMES`
/// pairs until the returned sender is dropped.
fn gated_session() -> (Session, Sender<()>) {
    let (gate, gate_rx) = unbounded();
    let (a, b): (Vec<Frame>, Vec<Frame>) = frames(36).into_iter().unzip();

    let source = |frames: Vec<Frame>| -> Box<dyn FrameSource> {
        Box::new(GatedSource {
            frames: frames.into_iter(),
            open: OPEN_FRAMES,
            gate: Some(gate_rx.clone()),
        })
    };

    let session = Session::start(
        config(),
        &calibration(),
        [source(a), source(b)],
        Arc::new(SpotModel),
    )
    .unwrap();

    (session, gate)
}

/// Receives events until the last released pair has been tracked by camera B.
fn until_gate(session: &Session) -> Vec<Event> {
    let last_b = (OPEN_FRAMES - 1) as f64 / FPS + 0.002;
    let mut events = Vec::new();

    loop {
        let event = session
            .events()
            .recv_timeout(Duration::from_secs(10))
            .expect("session stopped before the gate");

        let done = matches!(
            &event,
            Event::Tracks { camera: CameraId::B, timestamp, .. } if (*timestamp - last_b).abs() < 1e-9
        );
        events.push(event);

        if done {
            return events;
        }
    }
}

#[test]
fn cancelled_flight_never_predicts() {
    let (mut session, gate) = gated_session();

    let before = until_gate(&session);
    assert!(stereo_points(&before) >= 5);
    assert!(predictions(&before).is_empty());

    drop(gate);
    session.cancel().unwrap();

    assert!(session.events().try_recv().is_err());
}

#[test]
fn pause_keeps_the_flight_in_progress() {
    let (session, gate) = gated_session();

    let mut events = until_gate(&session);
    assert!(predictions(&events).is_empty());

    session.pause().unwrap();
    drop(gate);
    thread::sleep(Duration::from_millis(100));
    session.resume().unwrap();

    events.extend(session.events().iter());

    assert_eq!(events.last(), Some(&Event::Ended));

    let started = events
        .iter()
        .filter(|e| matches!(e, Event::Trajectory(TrajectoryEvent::Started { .. })))
        .count();
    assert_eq!(started, 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Trajectory(TrajectoryEvent::Invalidated { .. }))));

    let predictions = predictions(&events);
    assert_eq!(predictions.len(), 1);
    assert!(landing_error(predictions[0]) < 30.0);
}

#[test]
fn file_session_runs_to_end() {
    let (a, b): (Vec<Frame>, Vec<Frame>) = frames(8).into_iter().unzip();

    let session = Session::start(
        config(),
        &calibration(),
        [
            Box::new(VecSource {
                kind: SourceKind::File,
                frames: a.into_iter(),
            }),
            Box::new(VecSource {
                kind: SourceKind::File,
                frames: b.into_iter(),
            }),
        ],
        Arc::new(SpotModel),
    )
    .unwrap();

    session.set_playback_speed(4.0).unwrap();
    assert!(matches!(
        session.set_playback_speed(100.0),
        Err(Error::InvalidParameter { .. })
    ));

    let events: Vec<Event> = session.events().iter().collect();

    assert_eq!(events.last(), Some(&Event::Ended));
    assert!(events.iter().any(|e| matches!(e, Event::Tracks { .. })));
}

#[test]
fn live_session_has_no_speed_control_and_cancels() {
    let mut session = Session::start(
        config(),
        &NoCalibration,
        [Box::new(LiveSource(0.0)), Box::new(LiveSource(0.001))],
        Arc::new(SpotModel),
    )
    .unwrap();

    assert!(matches!(
        session.set_playback_speed(2.0),
        Err(Error::SpeedControlUnavailable)
    ));

    session.pause().unwrap();
    assert!(session.is_paused());
    session.resume().unwrap();
    thread::sleep(Duration::from_millis(50));

    session.cancel().unwrap();

    assert!(session.events().try_recv().is_err());
    assert!(matches!(session.cancel(), Err(Error::SessionClosed)));
    assert!(matches!(session.reset(), Err(Error::SessionClosed)));
}
