use std::sync::Arc;

use ndarray::Array3;
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CameraId {
    A,
    B,
}

impl CameraId {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            CameraId::A => 0,
            CameraId::B => 1,
        }
    }
}

/// One decoded camera image, HxWxC
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera: CameraId,
    pub image: Arc<Array3<u8>>,
    pub timestamp: f64, // in seconds
}

impl Frame {
    pub fn new(camera: CameraId, image: Array3<u8>, timestamp: f64) -> Self {
        Self {
            camera,
            image: Arc::new(image),
            timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FramePair {
    pub a: Frame,
    pub b: Frame,
}

impl FramePair {
    /// Timestamp assigned to the pair, the later of the two captures
    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.a.timestamp.max(self.b.timestamp)
    }
}
