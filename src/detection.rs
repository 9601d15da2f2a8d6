use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::frame::CameraId;

/// Contains (x,y) of the shuttlecock center in pixels
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "p")]
    pub confidence: f64,
    #[serde(rename = "c")]
    pub camera: CameraId,
    #[serde(rename = "t")]
    pub timestamp: f64,
}

impl Detection {
    pub fn new(camera: CameraId, timestamp: f64, x: f64, y: f64, confidence: f64) -> Self {
        Self {
            x,
            y,
            confidence,
            camera,
            timestamp,
        }
    }

    #[inline(always)]
    pub fn point(&self) -> na::Point2<f64> {
        na::Point2::new(self.x, self.y)
    }

    #[inline]
    pub fn distance(&self, other: &na::Point2<f64>) -> f64 {
        na::distance(&self.point(), other)
    }
}
