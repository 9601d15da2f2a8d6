use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

const UNDISTORT_ITERATIONS: usize = 20;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// k1, k2, p1, p2, k3
    #[serde(default)]
    pub distortion: [f64; 5],
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.iter())
            .all(|v| v.is_finite());

        if !finite || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(Error::Calibration(format!(
                "invalid intrinsics fx={} fy={} cx={} cy={}",
                self.fx, self.fy, self.cx, self.cy
            )));
        }

        Ok(())
    }

    #[inline]
    pub fn matrix(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    #[inline]
    fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&d| d != 0.0)
    }

    pub fn distort(&self, n: na::Point2<f64>) -> na::Point2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));

        na::Point2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Pixel to ideal normalized coordinates, inverting distortion by fixed
    /// point iteration.
    pub fn normalize(&self, px: na::Point2<f64>) -> na::Point2<f64> {
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;

        if !self.has_distortion() {
            return na::Point2::new(xd, yd);
        }

        let [k1, k2, p1, p2, k3] = self.distortion;
        let (mut x, mut y) = (xd, yd);

        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        na::Point2::new(x, y)
    }

    pub fn denormalize(&self, n: na::Point2<f64>) -> na::Point2<f64> {
        let d = self.distort(n);

        na::Point2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    pub fn undistort_pixel(&self, px: na::Point2<f64>) -> na::Point2<f64> {
        let n = self.normalize(px);

        na::Point2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }
}

/// World to camera transform, `x_cam = R * x_world + t`. The rotation is a
/// Rodrigues vector, the translation is in centimeters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            rotation: [0.0; 3],
            translation: [0.0; 3],
        }
    }
}

impl Pose {
    pub fn from_parts(rotation: &na::Rotation3<f64>, translation: &na::Vector3<f64>) -> Self {
        // the matrix log loses the axis at a half turn, the quaternion keeps it
        let r = na::UnitQuaternion::from_rotation_matrix(rotation).scaled_axis();

        Self {
            rotation: [r.x, r.y, r.z],
            translation: [translation.x, translation.y, translation.z],
        }
    }

    #[inline]
    pub fn rotation_matrix(&self) -> na::Rotation3<f64> {
        na::Rotation3::from_scaled_axis(na::Vector3::from(self.rotation))
    }

    #[inline]
    pub fn translation_vector(&self) -> na::Vector3<f64> {
        na::Vector3::from(self.translation)
    }
}

#[derive(Debug, Clone)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    pub rotation: na::Rotation3<f64>,
    pub translation: na::Vector3<f64>,
}

impl CameraModel {
    pub fn new(intrinsics: CameraIntrinsics, pose: &Pose) -> Self {
        Self {
            intrinsics,
            rotation: pose.rotation_matrix(),
            translation: pose.translation_vector(),
        }
    }

    #[inline]
    pub fn center(&self) -> na::Point3<f64> {
        na::Point3::from(-(self.rotation.inverse() * self.translation))
    }

    /// Projects a world point to distorted pixels, `None` behind the camera
    pub fn project(&self, p: &na::Point3<f64>) -> Option<na::Point2<f64>> {
        let c = self.rotation * p.coords + self.translation;

        if c.z <= f64::EPSILON {
            return None;
        }

        Some(
            self.intrinsics
                .denormalize(na::Point2::new(c.x / c.z, c.y / c.z)),
        )
    }

    /// Unit direction in world coordinates of the ray through a pixel
    pub fn ray(&self, px: na::Point2<f64>) -> na::Unit<na::Vector3<f64>> {
        let n = self.intrinsics.normalize(px);
        let dir = self.rotation.inverse() * na::Vector3::new(n.x, n.y, 1.0);

        na::Unit::new_normalize(dir)
    }
}
