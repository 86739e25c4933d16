use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};

/// Planar projective transform acting on homogeneous 2D points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_fn(|r, c| rows[r][c]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.h[(r, c)];
            }
        }
        out
    }

    #[inline]
    pub fn apply(&self, p: Point2<f32>) -> Point2<f32> {
        let v = self.h * Vector3::new(p.x as f64, p.y as f64, 1.0);
        let w = v[2];
        Point2::new((v[0] / w) as f32, (v[1] / w) as f32)
    }

    /// Map a batch of points.
    pub fn apply_all(&self, pts: &[Point2<f32>]) -> Vec<Point2<f32>> {
        pts.iter().map(|&p| self.apply(p)).collect()
    }

    pub fn inverse(&self) -> Option<Self> {
        let inv = self.h.try_inverse()?;
        normalize_homography(inv).map(Self::new)
    }
}

/// Similarity transform moving the centroid to the origin with mean distance sqrt(2).
fn hartley_normalization(pts: &[Point2<f32>]) -> Matrix3<f64> {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y as f64).sum::<f64>() / n;

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x as f64 - cx).powi(2) + (p.y as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn transform_points(t: &Matrix3<f64>, pts: &[Point2<f32>]) -> Vec<Point2<f64>> {
    pts.iter()
        .map(|p| {
            let v = t * Vector3::new(p.x as f64, p.y as f64, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect()
}

fn normalize_homography(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(h / s)
}

fn denormalize_homography(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t_dst_inv = t_dst.try_inverse()?;
    Some(t_dst_inv * hn * t_src)
}

/// Points of both sets mapped into their Hartley-normalized frames.
struct NormalizedPairs {
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
    src: Vec<Point2<f64>>,
    dst: Vec<Point2<f64>>,
}

impl NormalizedPairs {
    fn new(src: &[Point2<f32>], dst: &[Point2<f32>]) -> Self {
        let t_src = hartley_normalization(src);
        let t_dst = hartley_normalization(dst);
        Self {
            src: transform_points(&t_src, src),
            dst: transform_points(&t_dst, dst),
            t_src,
            t_dst,
        }
    }

    fn pairs(&self) -> impl Iterator<Item = (&Point2<f64>, &Point2<f64>)> {
        self.src.iter().zip(&self.dst)
    }

    /// Undo the normalization of an estimate and scale it to `h33 = 1`.
    fn finish(&self, hn: Matrix3<f64>) -> Option<Homography> {
        let h = denormalize_homography(hn, self.t_src, self.t_dst)?;
        normalize_homography(h).map(Homography::new)
    }
}

/// Estimate H such that `dst ~ H * src` from at least four correspondences.
///
/// Four points are solved exactly; more go through a least-squares DLT.
pub fn estimate_homography(src: &[Point2<f32>], dst: &[Point2<f32>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    if let (Ok(s), Ok(d)) = (
        <&[Point2<f32>; 4]>::try_from(src),
        <&[Point2<f32>; 4]>::try_from(dst),
    ) {
        return homography_from_4pt(s, d);
    }

    let norm = NormalizedPairs::new(src, dst);
    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (k, (p, q)) in norm.pairs().enumerate() {
        let rows = [
            [-p.x, -p.y, -1.0, 0.0, 0.0, 0.0, q.x * p.x, q.x * p.y, q.x],
            [0.0, 0.0, 0.0, -p.x, -p.y, -1.0, q.y * p.x, q.y * p.y, q.y],
        ];
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                a[(2 * k + r, c)] = *value;
            }
        }
    }

    // null vector: right singular vector of the smallest singular value
    let v_t = a.svd(true, true).v_t?;
    let h = v_t.row(v_t.nrows().checked_sub(1)?);
    norm.finish(Matrix3::from_fn(|r, c| h[3 * r + c]))
}

/// Exact H with `dst ~ H * src` for four correspondences, fixing `h33 = 1`.
///
/// Corner order must match between `src` and `dst`.
pub fn homography_from_4pt(src: &[Point2<f32>; 4], dst: &[Point2<f32>; 4]) -> Option<Homography> {
    let norm = NormalizedPairs::new(src, dst);
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for (k, (p, q)) in norm.pairs().enumerate() {
        let rows = [
            ([p.x, p.y, 1.0, 0.0, 0.0, 0.0, -q.x * p.x, -q.x * p.y], q.x),
            ([0.0, 0.0, 0.0, p.x, p.y, 1.0, -q.y * p.x, -q.y * p.y], q.y),
        ];
        for (r, (row, rhs)) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                a[(2 * k + r, c)] = *value;
            }
            b[2 * k + r] = *rhs;
        }
    }

    let x = a.lu().solve(&b)?;
    let h = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
    norm.finish(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// A tilted view of a surface: unit square to a perspective quad in pixels.
    fn tilted_view() -> Homography {
        Homography::from_array([
            [310.0, -40.0, 150.0],
            [25.0, 260.0, 90.0],
            [0.15, -0.2, 1.0],
        ])
    }

    #[test]
    fn surface_points_survive_inverse() {
        let h = tilted_view();
        let back = h.inverse().expect("invertible");
        for uv in [
            Point2::new(0.0_f32, 0.0),
            Point2::new(0.3, 0.8),
            Point2::new(1.0, 1.0),
        ] {
            let p = back.apply(h.apply(uv));
            assert_abs_diff_eq!(p.x, uv.x, epsilon = 1e-4);
            assert_abs_diff_eq!(p.y, uv.y, epsilon = 1e-4);
        }
    }

    #[test]
    fn image_quad_recovers_surface_mapping() {
        let truth = tilted_view();
        let uv = [
            Point2::new(0.0_f32, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        let quad = uv.map(|p| truth.apply(p));

        let to_surface = homography_from_4pt(&quad, &uv).expect("quad");
        let centre = to_surface.apply(truth.apply(Point2::new(0.5, 0.5)));
        assert_abs_diff_eq!(centre.x, 0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(centre.y, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn corners_of_several_markers_fit_one_transform() {
        let truth = tilted_view();
        // two 0.2-wide markers in opposite corners of the surface
        let uv: Vec<Point2<f32>> = [(0.05_f32, 0.05_f32), (0.75, 0.75)]
            .iter()
            .flat_map(|&(x, y)| {
                [(0.0, 0.0), (0.2, 0.0), (0.2, 0.2), (0.0, 0.2)]
                    .map(|(dx, dy)| Point2::new(x + dx, y + dy))
            })
            .collect();
        let px = truth.apply_all(&uv);

        let fitted = estimate_homography(&px, &uv).expect("fit");
        let probe = fitted.apply(truth.apply(Point2::new(0.4, 0.6)));
        assert_abs_diff_eq!(probe.x, 0.4, epsilon = 1e-3);
        assert_abs_diff_eq!(probe.y, 0.6, epsilon = 1e-3);
    }

    #[test]
    fn stored_matrix_is_reproduced() {
        let h = tilted_view();
        assert_eq!(Homography::from_array(h.to_array()), h);
    }

    #[test]
    fn collapsed_or_short_input_is_rejected() {
        let collapsed = [Point2::new(3.0_f32, 3.0); 4];
        assert!(estimate_homography(&collapsed, &collapsed).is_none());
        let short = [Point2::new(1.0_f32, 1.0); 3];
        assert!(estimate_homography(&short, &short).is_none());
    }
}
