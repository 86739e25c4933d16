//! Pinhole camera with radial-tangential lens distortion.
//!
//! Marker vertices and point events arrive in raw (distorted) image pixels.
//! Surface locations are estimated twice, once on undistorted pixels and once
//! on raw pixels, so the model only needs to map single points both ways.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn is_valid(self) -> bool {
        [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
            && self.fx.abs() > 1e-12
            && self.fy.abs() > 1e-12
    }

    fn pixel_to_normalized(self, xy: [f64; 2]) -> Option<[f64; 2]> {
        if !self.is_valid() {
            return None;
        }
        let x = (xy[0] - self.cx) / self.fx;
        let y = (xy[1] - self.cy) / self.fy;
        (x.is_finite() && y.is_finite()).then_some([x, y])
    }

    fn normalized_to_pixel(self, xy: [f64; 2]) -> [f64; 2] {
        [self.fx * xy[0] + self.cx, self.fy * xy[1] + self.cy]
    }
}

/// Brown-Conrady distortion coefficients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    fn tangential(self, x: f64, y: f64, r2: f64) -> (f64, f64) {
        (
            2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    fn radial(self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    fn apply(self, xy: [f64; 2]) -> [f64; 2] {
        let [x, y] = xy;
        let r2 = x * x + y * y;
        let radial = self.radial(r2);
        let (tx, ty) = self.tangential(x, y, r2);
        [x * radial + tx, y * radial + ty]
    }
}

const UNDISTORT_MAX_ITERS: usize = 20;
const UNDISTORT_EPS: f64 = 1e-12;

/// Camera model handed through to every geometry call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    #[serde(default)]
    pub distortion: Distortion,
}

impl CameraModel {
    /// Camera without lens distortion.
    pub fn pinhole(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics,
            distortion: Distortion::default(),
        }
    }

    pub fn distort(&self, p: Point2<f32>) -> Option<Point2<f32>> {
        let xy = [f64::from(p.x), f64::from(p.y)];
        let xn = self.intrinsics.pixel_to_normalized(xy)?;
        let xd = self.distortion.apply(xn);
        let [u, v] = self.intrinsics.normalized_to_pixel(xd);
        (u.is_finite() && v.is_finite()).then(|| Point2::new(u as f32, v as f32))
    }

    /// Invert the distortion by fixed-point iteration.
    pub fn undistort(&self, p: Point2<f32>) -> Option<Point2<f32>> {
        let xy = [f64::from(p.x), f64::from(p.y)];
        let xd = self.intrinsics.pixel_to_normalized(xy)?;
        let (mut x, mut y) = (xd[0], xd[1]);

        for _ in 0..UNDISTORT_MAX_ITERS {
            let r2 = x * x + y * y;
            let radial = self.distortion.radial(r2);
            if !radial.is_finite() || radial.abs() < 1e-12 {
                return None;
            }
            let (tx, ty) = self.distortion.tangential(x, y, r2);
            let x_next = (xd[0] - tx) / radial;
            let y_next = (xd[1] - ty) / radial;
            if !x_next.is_finite() || !y_next.is_finite() {
                return None;
            }
            let step = ((x_next - x).powi(2) + (y_next - y).powi(2)).sqrt();
            x = x_next;
            y = y_next;
            if step <= UNDISTORT_EPS {
                break;
            }
        }

        let [u, v] = self.intrinsics.normalized_to_pixel([x, y]);
        (u.is_finite() && v.is_finite()).then(|| Point2::new(u as f32, v as f32))
    }

    /// Undistort every point, failing if any single point fails.
    pub fn undistort_all(&self, pts: &[Point2<f32>]) -> Option<Vec<Point2<f32>>> {
        pts.iter().map(|&p| self.undistort(p)).collect()
    }

    pub fn distort_all(&self, pts: &[Point2<f32>]) -> Option<Vec<Point2<f32>>> {
        pts.iter().map(|&p| self.distort(p)).collect()
    }
}
