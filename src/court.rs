use nalgebra as na;

use crate::config::CourtConfig;

/// Court outline on the ground plane, centimeters
#[derive(Debug, Clone)]
pub struct Court {
    outline: Vec<na::Point2<f64>>,
}

impl Court {
    pub fn new(config: &CourtConfig) -> Self {
        Self {
            outline: config
                .outline
                .iter()
                .map(|&[x, y]| na::Point2::new(x, y))
                .collect(),
        }
    }

    /// In/out call for a landing position, lines count as in.
    pub fn contains(&self, p: na::Point2<f64>) -> bool {
        on_boundary(p, &self.outline) || in_bounds(p, &self.outline)
    }
}

/// Even-odd ray casting test
pub fn in_bounds(p: na::Point2<f64>, poly: &[na::Point2<f64>]) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut p1 = poly[0];
    let mut xints = 0.0;

    for i in 1..=n {
        let p2 = poly[i % n];

        if p.y > f64::min(p1.y, p2.y) && p.y <= f64::max(p1.y, p2.y) && p.x <= f64::max(p1.x, p2.x)
        {
            if (p1.y - p2.y).abs() > f64::EPSILON {
                xints = (p.y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y) + p1.x;
            }

            if (p1.x - p2.x).abs() < f64::EPSILON || p.x <= xints {
                inside = !inside;
            }
        }

        p1 = p2;
    }

    inside
}

fn on_boundary(p: na::Point2<f64>, poly: &[na::Point2<f64>]) -> bool {
    const TOLERANCE: f64 = 1e-9;

    let n = poly.len();

    (0..n).any(|i| {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        let ab = b - a;
        let len2 = ab.norm_squared();

        if len2 <= f64::EPSILON {
            return na::distance(&a, &p) <= TOLERANCE;
        }

        let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);

        na::distance(&(a + ab * t), &p) <= TOLERANCE
    })
}
