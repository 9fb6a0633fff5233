//! # Interpolation over the Hypothesis Grid
//!
//! Point-by-point strategies only train at a sparse subset of hypotheses. A
//! metric known at those points is spread over the full grid by piecewise
//! linear interpolation inside the convex hull of the training points:
//!
//! - 1-D hypothesis spaces: linear interpolation between sorted neighbours.
//! - 2-D hypothesis spaces: a Delaunay triangulation of the training points
//!   (Bowyer-Watson), with barycentric interpolation inside each triangle.
//!
//! Targets outside the hull get NaN. Coordinates are rescaled to the unit box
//! before triangulating, so that axes with different ranges are treated alike.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// Relative tolerance of the in-circle and in-triangle tests.
const GEOMETRY_TOLERANCE: f64 = 1e-10;
/// Distance of the enclosing triangle's corners from the unit box.
const SUPER_TRIANGLE_SCALE: f64 = 1e3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    #[error("Interpolation is only available in one or two dimensions, got {0}.")]
    UnsupportedDimension(usize),
    #[error("At least {needed} points are needed to interpolate in {dims} dimensions, got {found}.")]
    NotEnoughPoints {
        needed: usize,
        dims: usize,
        found: usize,
    },
    #[error("Training points {0} and {1} coincide.")]
    DuplicatePoints(usize, usize),
    #[error("All training points lie on one line; they do not span a two-dimensional hull.")]
    Collinear,
    #[error("Non-finite coordinate in training point {0}.")]
    NonFinitePoint(usize),
    #[error("Expected {expected} {what}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
enum Geometry {
    /// Training coordinates sorted ascending, with the original index.
    Line(Vec<(f64, usize)>),
    Plane {
        lower: [f64; 2],
        extent: [f64; 2],
        /// Normalised training points.
        vertices: Vec<[f64; 2]>,
        triangles: Vec<[usize; 3]>,
    },
}

/// Piecewise-linear interpolator over a fixed set of training points.
#[derive(Debug, Clone)]
pub struct LinearInterpolator {
    n_points: usize,
    geometry: Geometry,
}

impl LinearInterpolator {
    pub fn new(points: ArrayView2<f64>) -> Result<Self, InterpolationError> {
        let (n_points, dims) = points.dim();
        if !(1..=2).contains(&dims) {
            return Err(InterpolationError::UnsupportedDimension(dims));
        }
        if n_points < dims + 1 {
            return Err(InterpolationError::NotEnoughPoints {
                needed: dims + 1,
                dims,
                found: n_points,
            });
        }
        if let Some((i, _)) = points
            .axis_iter(Axis(0))
            .enumerate()
            .find(|(_, p)| p.iter().any(|v| !v.is_finite()))
        {
            return Err(InterpolationError::NonFinitePoint(i));
        }
        for i in 0..n_points {
            for j in (i + 1)..n_points {
                if points.row(i) == points.row(j) {
                    return Err(InterpolationError::DuplicatePoints(i, j));
                }
            }
        }

        let geometry = if dims == 1 {
            let mut sorted: Vec<(f64, usize)> =
                points.column(0).iter().copied().zip(0..n_points).collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
            Geometry::Line(sorted)
        } else {
            triangulate(points)?
        };

        Ok(Self { n_points, geometry })
    }

    /// Number of Delaunay triangles (0 in one dimension).
    pub fn n_triangles(&self) -> usize {
        match &self.geometry {
            Geometry::Line(_) => 0,
            Geometry::Plane { triangles, .. } => triangles.len(),
        }
    }

    /// Interpolates `values` (one per training point) at every row of `targets`.
    pub fn interpolate(
        &self,
        values: ArrayView1<f64>,
        targets: ArrayView2<f64>,
    ) -> Result<Array1<f64>, InterpolationError> {
        if values.len() != self.n_points {
            return Err(InterpolationError::ShapeMismatch {
                what: "values",
                expected: self.n_points,
                found: values.len(),
            });
        }
        let dims = match self.geometry {
            Geometry::Line(_) => 1,
            Geometry::Plane { .. } => 2,
        };
        if targets.ncols() != dims {
            return Err(InterpolationError::ShapeMismatch {
                what: "target coordinates",
                expected: dims,
                found: targets.ncols(),
            });
        }

        let out = targets
            .axis_iter(Axis(0))
            .map(|target| match &self.geometry {
                Geometry::Line(sorted) => interpolate_line(sorted, values, target[0]),
                Geometry::Plane {
                    lower,
                    extent,
                    vertices,
                    triangles,
                } => {
                    let p = [
                        (target[0] - lower[0]) / extent[0],
                        (target[1] - lower[1]) / extent[1],
                    ];
                    interpolate_plane(vertices, triangles, values, p)
                }
            })
            .collect();
        Ok(Array1::from_vec(out))
    }
}

fn interpolate_line(sorted: &[(f64, usize)], values: ArrayView1<f64>, x: f64) -> f64 {
    let (first, last) = (sorted[0].0, sorted[sorted.len() - 1].0);
    if !(first..=last).contains(&x) {
        return f64::NAN;
    }
    let upper = sorted.partition_point(|&(xi, _)| xi < x);
    if upper == 0 {
        return values[sorted[0].1];
    }
    let (x0, i0) = sorted[upper - 1];
    let (x1, i1) = sorted[upper];
    let fraction = (x - x0) / (x1 - x0);
    values[i0] * (1.0 - fraction) + values[i1] * fraction
}

fn interpolate_plane(
    vertices: &[[f64; 2]],
    triangles: &[[usize; 3]],
    values: ArrayView1<f64>,
    p: [f64; 2],
) -> f64 {
    for triangle in triangles {
        let [a, b, c] = triangle.map(|i| vertices[i]);
        let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
        let l1 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
        let l2 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
        let l3 = 1.0 - l1 - l2;
        if l1 >= -GEOMETRY_TOLERANCE && l2 >= -GEOMETRY_TOLERANCE && l3 >= -GEOMETRY_TOLERANCE {
            return l1 * values[triangle[0]] + l2 * values[triangle[1]] + l3 * values[triangle[2]];
        }
    }
    f64::NAN
}

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Circumcentre and squared circumradius, `None` for degenerate triangles.
fn circumcircle(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> Option<([f64; 2], f64)> {
    let d = 2.0 * cross(a, b, c);
    if d.abs() < f64::EPSILON {
        return None;
    }
    let a2 = a[0] * a[0] + a[1] * a[1];
    let b2 = b[0] * b[0] + b[1] * b[1];
    let c2 = c[0] * c[0] + c[1] * c[1];
    let ux = (a2 * (b[1] - c[1]) + b2 * (c[1] - a[1]) + c2 * (a[1] - b[1])) / d;
    let uy = (a2 * (c[0] - b[0]) + b2 * (a[0] - c[0]) + c2 * (b[0] - a[0])) / d;
    let r2 = (a[0] - ux).powi(2) + (a[1] - uy).powi(2);
    Some(([ux, uy], r2))
}

fn triangulate(points: ArrayView2<f64>) -> Result<Geometry, InterpolationError> {
    let n = points.nrows();
    let mut lower = [f64::INFINITY; 2];
    let mut upper = [f64::NEG_INFINITY; 2];
    for row in points.axis_iter(Axis(0)) {
        for d in 0..2 {
            lower[d] = lower[d].min(row[d]);
            upper[d] = upper[d].max(row[d]);
        }
    }
    let extent = [upper[0] - lower[0], upper[1] - lower[1]];
    if extent.iter().any(|&e| e <= 0.0) {
        return Err(InterpolationError::Collinear);
    }

    let mut vertices: Vec<[f64; 2]> = points
        .axis_iter(Axis(0))
        .map(|row| [(row[0] - lower[0]) / extent[0], (row[1] - lower[1]) / extent[1]])
        .collect();

    let spans_plane = vertices
        .iter()
        .any(|&v| vertices.iter().any(|&w| cross(vertices[0], v, w).abs() > GEOMETRY_TOLERANCE));
    if !spans_plane {
        return Err(InterpolationError::Collinear);
    }

    let s = SUPER_TRIANGLE_SCALE;
    vertices.push([-s, -s]);
    vertices.push([2.0 * s + 1.0, -s]);
    vertices.push([-s, 2.0 * s + 1.0]);
    let mut triangles: Vec<[usize; 3]> = vec![[n, n + 1, n + 2]];

    for i in 0..n {
        let p = vertices[i];
        let (bad, good): (Vec<[usize; 3]>, Vec<[usize; 3]>) =
            triangles.into_iter().partition(|t| {
                match circumcircle(vertices[t[0]], vertices[t[1]], vertices[t[2]]) {
                    Some((centre, r2)) => {
                        let d2 = (p[0] - centre[0]).powi(2) + (p[1] - centre[1]).powi(2);
                        d2 < r2 * (1.0 - GEOMETRY_TOLERANCE)
                    }
                    None => false,
                }
            });

        // Cavity boundary: edges that belong to exactly one removed triangle.
        let edges: Vec<(usize, usize)> = bad
            .iter()
            .flat_map(|t| [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])])
            .collect();
        let boundary = edges.iter().filter(|&&(a, b)| {
            edges
                .iter()
                .filter(|&&(c, d)| (a == c && b == d) || (a == d && b == c))
                .count()
                == 1
        });

        triangles = good;
        triangles.extend(boundary.map(|&(a, b)| [a, b, i]));
    }

    triangles.retain(|t| t.iter().all(|&v| v < n));
    vertices.truncate(n);
    if triangles.is_empty() {
        return Err(InterpolationError::Collinear);
    }

    Ok(Geometry::Plane {
        lower,
        extent,
        vertices,
        triangles,
    })
}
