use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ndarray::Array3;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::detection::Detection;
use crate::error::Error;
use crate::frame::{CameraId, Frame};

/// Candidate produced by the model, in pixels of the input image
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("Detection Model Error: {0}")]
pub struct ModelError(pub String);

pub trait DetectionModel: Send + Sync {
    fn detect(&self, image: &Array3<u8>) -> Result<Vec<RawDetection>, ModelError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DetectorFault {
    Timeout { budget_ms: u64 },
    Busy,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorOutput {
    pub camera: CameraId,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub fault: Option<DetectorFault>,
}

struct Job {
    seq: u64,
    image: Arc<Array3<u8>>,
}

struct Reply {
    seq: u64,
    result: Result<Vec<RawDetection>, ModelError>,
}

/// Handle for a submitted frame
#[must_use]
pub struct Pending {
    seq: u64,
    timestamp: f64,
    deadline: Instant,
    rejected: bool,
}

/// Worker thread per camera, a reply later than the budget is discarded.
pub struct DetectorAdapter {
    camera: CameraId,
    jobs: Sender<Job>,
    replies: Receiver<Reply>,
    budget: Duration,
    duplicate_radius: f64,
    seq: u64,
}

impl DetectorAdapter {
    pub fn spawn(
        camera: CameraId,
        model: Arc<dyn DetectionModel>,
        config: &DetectorConfig,
    ) -> Result<Self, Error> {
        let (jobs, job_rx) = bounded::<Job>(1);
        let (reply_tx, replies) = bounded::<Reply>(4);

        thread::Builder::new()
            .name(format!("detector-{:?}", camera))
            .spawn(move || {
                for job in job_rx {
                    let result = model.detect(&job.image);

                    if reply_tx.send(Reply { seq: job.seq, result }).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            camera,
            jobs,
            replies,
            budget: Duration::from_millis(config.budget_ms),
            duplicate_radius: config.duplicate_radius_px,
            seq: 0,
        })
    }

    /// Hands the frame to the worker without blocking.
    pub fn submit(&mut self, frame: &Frame) -> Pending {
        self.seq += 1;

        let job = Job {
            seq: self.seq,
            image: frame.image.clone(),
        };

        // a full job slot means the model is still busy with an older frame
        let rejected = match self.jobs.try_send(job) {
            Ok(()) => false,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => true,
        };

        Pending {
            seq: self.seq,
            timestamp: frame.timestamp,
            deadline: Instant::now() + self.budget,
            rejected,
        }
    }

    pub fn collect(&self, pending: Pending) -> DetectorOutput {
        if pending.rejected {
            return self.degraded(pending.timestamp, DetectorFault::Busy);
        }

        loop {
            let remaining = pending.deadline.saturating_duration_since(Instant::now());

            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.seq < pending.seq => {
                    debug!(camera = ?self.camera, seq = reply.seq, "discarding late detection reply");
                }
                Ok(reply) => {
                    return match reply.result {
                        Ok(raw) => DetectorOutput {
                            camera: self.camera,
                            timestamp: pending.timestamp,
                            detections: self.postprocess(pending.timestamp, raw),
                            fault: None,
                        },
                        Err(err) => self.degraded(pending.timestamp, DetectorFault::Failed(err.0)),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {
                    let budget_ms = self.budget.as_millis() as u64;
                    return self.degraded(pending.timestamp, DetectorFault::Timeout { budget_ms });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.degraded(
                        pending.timestamp,
                        DetectorFault::Failed("detector worker terminated".into()),
                    );
                }
            }
        }
    }

    #[inline]
    pub fn detect(&mut self, frame: &Frame) -> DetectorOutput {
        let pending = self.submit(frame);
        self.collect(pending)
    }

    fn degraded(&self, timestamp: f64, fault: DetectorFault) -> DetectorOutput {
        warn!(camera = ?self.camera, timestamp, ?fault, "degraded frame, no detections");

        DetectorOutput {
            camera: self.camera,
            timestamp,
            detections: Vec::new(),
            fault: Some(fault),
        }
    }

    fn postprocess(&self, timestamp: f64, raw: Vec<RawDetection>) -> Vec<Detection> {
        let mut dets: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.x.is_finite() && d.y.is_finite() && d.confidence.is_finite())
            .map(|d| {
                Detection::new(
                    self.camera,
                    timestamp,
                    d.x,
                    d.y,
                    d.confidence.clamp(0.0, 1.0),
                )
            })
            .collect();

        suppress_duplicates(&mut dets, self.duplicate_radius);

        dets
    }
}

/// Keeps the most confident detection of every cluster closer than `radius`.
/// Output is ordered by descending confidence, ties keep model order.
pub fn suppress_duplicates(dets: &mut Vec<Detection>, radius: f64) {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut retained: Vec<Detection> = Vec::with_capacity(dets.len());

    for det in dets.drain(..) {
        if retained
            .iter()
            .all(|r| det.distance(&r.point()) > radius)
        {
            retained.push(det);
        }
    }

    *dets = retained;
}
