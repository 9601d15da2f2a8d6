use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::circular_queue::CircularQueue;
use crate::detection::Detection;
use crate::frame::CameraId;
use crate::rolling_avg::RollingAvg;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Matched in the latest frame
    Active,
    /// Missed one or more frames, still eligible for association
    Stale,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub camera: CameraId,
    pub state: TrackState,
    pub missing_frames: u32,
    head: Detection,
    detections: CircularQueue<Detection>,
    confidence: RollingAvg,
}

impl Track {
    pub fn new(id: u32, det: &Detection, history: usize, confidence_window: usize) -> Self {
        let mut detections = CircularQueue::with_capacity(history);
        detections.push(*det);

        let mut confidence = RollingAvg::new(confidence_window);
        confidence.push(det.confidence);

        Self {
            id,
            camera: det.camera,
            state: TrackState::Active,
            missing_frames: 0,
            head: *det,
            detections,
            confidence,
        }
    }

    #[inline]
    pub fn last(&self) -> &Detection {
        &self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Linear extrapolation of the last two detections to `ts`
    pub fn predict(&self, ts: f64) -> na::Point2<f64> {
        let last = &self.head;

        match self.detections.iter().nth(1) {
            Some(prev) if last.timestamp > prev.timestamp => {
                let vel = (last.point() - prev.point()) / (last.timestamp - prev.timestamp);

                last.point() + vel * (ts - last.timestamp)
            }
            _ => last.point(),
        }
    }

    #[inline]
    pub fn recent_confidence(&self) -> f64 {
        self.confidence.mean().unwrap_or(0.0)
    }

    pub fn update(&mut self, det: &Detection) {
        self.head = *det;
        self.detections.push(*det);
        self.confidence.push(det.confidence);
        self.missing_frames = 0;
        self.state = TrackState::Active;
    }

    pub fn miss(&mut self, max_missing_frames: u32) {
        self.missing_frames += 1;
        self.state = if self.missing_frames > max_missing_frames {
            TrackState::Closed
        } else {
            TrackState::Stale
        };
    }

    pub fn snapshot(&self, rank: usize) -> TrackSnapshot {
        let last = self.last();

        TrackSnapshot {
            id: self.id,
            camera: self.camera,
            state: self.state,
            x: last.x,
            y: last.y,
            timestamp: last.timestamp,
            missing_frames: self.missing_frames,
            recent_confidence: self.recent_confidence(),
            length: self.len(),
            rank,
        }
    }
}

/// Presentation view of a track
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackSnapshot {
    pub id: u32,
    pub camera: CameraId,
    pub state: TrackState,
    pub x: f64,
    pub y: f64,
    pub timestamp: f64,
    pub missing_frames: u32,
    pub recent_confidence: f64,
    pub length: usize,
    /// 0 for the most confident track of its camera
    pub rank: usize,
}

impl TrackSnapshot {
    #[inline]
    pub fn point(&self) -> na::Point2<f64> {
        na::Point2::new(self.x, self.y)
    }
}
