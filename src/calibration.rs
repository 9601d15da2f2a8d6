use std::path::Path;

use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::camera::{CameraIntrinsics, CameraModel, Pose};
use crate::error::Error;
use crate::frame::CameraId;

/// Minimal distance between camera centers for epipolar geometry to be defined
const MIN_BASELINE_CM: f64 = 1.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CameraCalibration {
    pub intrinsics: CameraIntrinsics,
    #[serde(default)]
    pub pose: Option<Pose>,
}

/// Read-only view of the calibration, any part may be absent.
pub trait CalibrationSource {
    fn get_calibration(&self, camera: CameraId) -> Option<CameraCalibration>;

    /// Camera A to camera B transform
    fn get_extrinsics(&self) -> Option<Pose>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCalibration;

impl CalibrationSource for NoCalibration {
    fn get_calibration(&self, _camera: CameraId) -> Option<CameraCalibration> {
        None
    }

    fn get_extrinsics(&self) -> Option<Pose> {
        None
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CalibrationParameters {
    pub a: CameraCalibration,
    pub b: CameraCalibration,
    #[serde(default)]
    pub extrinsics: Option<Pose>,
}

impl CalibrationSource for CalibrationParameters {
    fn get_calibration(&self, camera: CameraId) -> Option<CameraCalibration> {
        Some(match camera {
            CameraId::A => self.a,
            CameraId::B => self.b,
        })
    }

    fn get_extrinsics(&self) -> Option<Pose> {
        match (self.a.pose, self.b.pose) {
            (Some(pa), Some(pb)) => Some(relative_pose(&pa, &pb)),
            _ => self.extrinsics,
        }
    }
}

impl CalibrationParameters {
    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        Ok(toml::from_str(src)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let src = std::fs::read_to_string(path)?;

        Self::from_toml_str(&src)
    }
}

/// Transform from camera A coordinates to camera B coordinates given both
/// world poses: `R = R_b R_aᵀ`, `t = t_b − R t_a`.
pub fn relative_pose(a: &Pose, b: &Pose) -> Pose {
    let ra = a.rotation_matrix();
    let rb = b.rotation_matrix();
    let r = rb * ra.inverse();
    let t = b.translation_vector() - r * a.translation_vector();

    Pose::from_parts(&r, &t)
}

fn chain_pose(a: &Pose, extrinsics: &Pose) -> Pose {
    let r = extrinsics.rotation_matrix() * a.rotation_matrix();
    let t = extrinsics.rotation_matrix() * a.translation_vector() + extrinsics.translation_vector();

    Pose::from_parts(&r, &t)
}

fn validate_pose(what: &str, pose: &Pose) -> Result<(), Error> {
    if pose
        .rotation
        .iter()
        .chain(pose.translation.iter())
        .all(|v| v.is_finite())
    {
        Ok(())
    } else {
        Err(Error::Calibration(format!("non-finite {} pose", what)))
    }
}

#[inline]
fn skew(v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

#[derive(Debug, Clone)]
pub struct StereoRig {
    a: CameraModel,
    b: CameraModel,
    /// Maps undistorted pixels of A to epipolar lines in undistorted pixels of B
    fundamental: na::Matrix3<f64>,
}

impl StereoRig {
    /// `Ok(None)` when the source holds no calibration at all. Incomplete or
    /// invalid calibration is an error, the caller decides whether it is fatal.
    pub fn from_source(source: &dyn CalibrationSource) -> Result<Option<Self>, Error> {
        let (ca, cb) = match (
            source.get_calibration(CameraId::A),
            source.get_calibration(CameraId::B),
        ) {
            (None, None) => return Ok(None),
            (None, Some(_)) => return Err(Error::MissingCalibration { camera: CameraId::A }),
            (Some(_), None) => return Err(Error::MissingCalibration { camera: CameraId::B }),
            (Some(a), Some(b)) => (a, b),
        };

        ca.intrinsics.validate()?;
        cb.intrinsics.validate()?;

        let pose_a = ca.pose.ok_or_else(|| {
            Error::Calibration("camera A needs a world pose to place the court".into())
        })?;
        validate_pose("camera A", &pose_a)?;

        let pose_b = match (cb.pose, source.get_extrinsics()) {
            (Some(pose), _) => pose,
            (None, Some(ext)) => {
                validate_pose("stereo extrinsic", &ext)?;
                debug!("camera B pose derived from stereo extrinsics");
                chain_pose(&pose_a, &ext)
            }
            (None, None) => {
                return Err(Error::Calibration(
                    "camera B needs a world pose or a stereo extrinsic transform".into(),
                ))
            }
        };
        validate_pose("camera B", &pose_b)?;

        Self::new(
            CameraModel::new(ca.intrinsics, &pose_a),
            CameraModel::new(cb.intrinsics, &pose_b),
        )
        .map(Some)
    }

    pub fn new(a: CameraModel, b: CameraModel) -> Result<Self, Error> {
        let baseline = na::distance(&a.center(), &b.center());
        if !(baseline >= MIN_BASELINE_CM) {
            return Err(Error::Calibration(format!(
                "camera baseline {:.3} cm is too short",
                baseline
            )));
        }

        let r = b.rotation * a.rotation.inverse();
        let t = b.translation - r * a.translation;

        let ka_inv = a
            .intrinsics
            .matrix()
            .try_inverse()
            .ok_or_else(|| Error::Calibration("singular camera matrix A".into()))?;
        let kb_inv = b
            .intrinsics
            .matrix()
            .try_inverse()
            .ok_or_else(|| Error::Calibration("singular camera matrix B".into()))?;

        let essential = skew(&t) * r.matrix();
        let fundamental = kb_inv.transpose() * essential * ka_inv;

        if !fundamental.iter().all(|v| v.is_finite()) {
            return Err(Error::Calibration("degenerate fundamental matrix".into()));
        }

        if baseline > 5_000.0 {
            warn!(baseline, "unusually wide camera baseline");
        }

        Ok(Self { a, b, fundamental })
    }

    #[inline]
    pub fn camera(&self, id: CameraId) -> &CameraModel {
        match id {
            CameraId::A => &self.a,
            CameraId::B => &self.b,
        }
    }

    /// Epipolar line `l` in camera B of a pixel seen by camera A, `l · x = 0`
    pub fn epipolar_line(&self, px_a: na::Point2<f64>) -> na::Vector3<f64> {
        let ua = self.a.intrinsics.undistort_pixel(px_a);

        self.fundamental * na::Vector3::new(ua.x, ua.y, 1.0)
    }

    pub fn pole_distance(&self, px_a: na::Point2<f64>, px_b: na::Point2<f64>) -> f64 {
        let line = self.epipolar_line(px_a);
        let norm = line.x.hypot(line.y);

        if norm <= f64::EPSILON {
            return f64::INFINITY;
        }

        let ub = self.b.intrinsics.undistort_pixel(px_b);

        (line.x * ub.x + line.y * ub.y + line.z).abs() / norm
    }

    /// Midpoint of the shortest segment between the two back-projected rays.
    /// `None` when the rays are parallel.
    pub fn triangulate(
        &self,
        px_a: na::Point2<f64>,
        px_b: na::Point2<f64>,
    ) -> Option<na::Point3<f64>> {
        let c1 = self.a.center();
        let c2 = self.b.center();
        let d1 = self.a.ray(px_a).into_inner();
        let d2 = self.b.ray(px_b).into_inner();

        let n = d1.cross(&d2);
        if n.norm() < 1e-10 {
            return None;
        }

        let n1 = d1.cross(&n);
        let n2 = d2.cross(&n);

        let t1 = (c2 - c1).dot(&n2) / d1.dot(&n2);
        let t2 = (c1 - c2).dot(&n1) / d2.dot(&n1);

        let p1 = c1 + d1 * t1;
        let p2 = c2 + d2 * t2;

        let mid = na::center(&p1, &p2);

        mid.coords.iter().all(|v| v.is_finite()).then(|| mid)
    }

    /// Mean pixel distance between the observations and the reprojected point.
    /// Infinite when the point falls behind either camera.
    pub fn reprojection_error(
        &self,
        p: &na::Point3<f64>,
        px_a: na::Point2<f64>,
        px_b: na::Point2<f64>,
    ) -> f64 {
        match (self.a.project(p), self.b.project(p)) {
            (Some(ra), Some(rb)) => {
                (na::distance(&ra, &px_a) + na::distance(&rb, &px_b)) / 2.0
            }
            _ => f64::INFINITY,
        }
    }
}
