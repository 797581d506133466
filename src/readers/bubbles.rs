//! Student id from the bubble grid on exam cover pages.
//!
//! The grid outline must be the largest closed contour on the page. It is
//! rectified to a canonical rectangle, cut into digit columns and value rows,
//! and in every column the darkest row is the marked digit.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use tracing::debug;

use super::morphology::{dilate_rect, open_rect};
use super::{ReadFailure, StudentIdReader};
use crate::config::BubbleGridConfig;

const BINARIZE_THRESHOLD: u8 = 200;
const MEDIAN_RADIUS: u32 = 2;
const CANNY_LOW: f32 = 75.0;
const CANNY_HIGH: f32 = 150.0;
/// Polygon approximation tolerance, relative to the contour perimeter.
const APPROX_TOLERANCE: f64 = 0.02;

/// Reads the student id marked in the cover-page bubble grid.
pub struct ContourBubbleReader {
    grid: BubbleGridConfig,
}

impl ContourBubbleReader {
    pub fn new(grid: BubbleGridConfig) -> Self {
        Self { grid }
    }

    /// Locate the grid outline and warp it to the canonical rectangle.
    pub fn rectify(&self, gray: &GrayImage) -> Result<GrayImage, ReadFailure> {
        let edges = grid_edges(gray);
        let outline = largest_outer_contour(&edges).ok_or(ReadFailure::NoContour)?;

        let perimeter = arc_length(&outline.points, true);
        let polygon = simplify_closed(
            approximate_polygon_dp(&outline.points, APPROX_TOLERANCE * perimeter, true),
            APPROX_TOLERANCE * perimeter,
        );
        if polygon.len() != 4 {
            return Err(ReadFailure::NotQuadrilateral(polygon.len()));
        }

        let corners: Vec<(f32, f32)> = polygon.iter().map(|p| (p.x as f32, p.y as f32)).collect();
        let from = order_corners(&corners).ok_or(ReadFailure::DegenerateGrid)?;
        let (w, h) = (
            self.grid.canonical_width as f32,
            self.grid.canonical_height as f32,
        );
        let to = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
        let projection =
            Projection::from_control_points(from, to).ok_or(ReadFailure::DegenerateGrid)?;

        let mut canonical = GrayImage::new(self.grid.canonical_width, self.grid.canonical_height);
        warp_into(gray, &projection, Interpolation::Bilinear, Luma([255]), &mut canonical);
        Ok(canonical)
    }

    /// Read the digits from an already rectified grid image.
    pub fn read_digits(&self, canonical: &GrayImage) -> Result<String, ReadFailure> {
        let binary = imageproc::contrast::threshold(canonical, self.grid.binarize_threshold);
        let xs = boundaries(self.grid.x_range, self.grid.columns);
        let ys = boundaries(self.grid.y_range, self.grid.rows);

        let mut digits = String::with_capacity(self.grid.columns as usize);
        for (col, x) in xs.windows(2).enumerate() {
            let means: Vec<u32> = ys
                .windows(2)
                .map(|y| cell_mean(&binary, (x[0], x[1]), (y[0], y[1])))
                .collect();

            let (best_row, &best) = means
                .iter()
                .enumerate()
                .min_by_key(|(_, &m)| m)
                .ok_or(ReadFailure::AmbiguousColumn(col))?;
            let runner_up = means
                .iter()
                .enumerate()
                .filter(|(row, _)| *row != best_row)
                .map(|(_, &m)| m)
                .min()
                .unwrap_or(u32::MAX);
            if runner_up.saturating_sub(best) < self.grid.min_contrast as u32 {
                return Err(ReadFailure::AmbiguousColumn(col));
            }
            digits.push_str(&best_row.to_string());
        }
        Ok(digits)
    }
}

impl Default for ContourBubbleReader {
    fn default() -> Self {
        Self::new(BubbleGridConfig::default())
    }
}

impl StudentIdReader for ContourBubbleReader {
    fn name(&self) -> &str {
        "bubble-grid"
    }

    fn read_student_id(&self, image: &DynamicImage) -> Result<String, ReadFailure> {
        let canonical = self.rectify(&image.to_luma8())?;
        let digits = self.read_digits(&canonical)?;
        debug!("Bubble grid read as {}", digits);
        Ok(digits)
    }
}

/// Binarize, denoise, detect edges and thicken them until the grid outline
/// forms one closed band.
fn grid_edges(gray: &GrayImage) -> GrayImage {
    let binary = imageproc::contrast::threshold(gray, BINARIZE_THRESHOLD);
    let smooth = imageproc::filter::median_filter(&binary, MEDIAN_RADIUS, MEDIAN_RADIUS);
    let edges = imageproc::edges::canny(&smooth, CANNY_LOW, CANNY_HIGH);
    let thick = dilate_rect(&dilate_rect(&edges, 10, 4), 4, 10);
    open_rect(&thick, 5, 5)
}

fn largest_outer_contour(edges: &GrayImage) -> Option<Contour<i32>> {
    find_contours::<i32>(edges)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| c.points.len() >= 4)
        .max_by(|a, b| polygon_area(&a.points).total_cmp(&polygon_area(&b.points)))
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let (p, q) = (points[i], points[(i + 1) % n]);
            p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64
        })
        .sum();
    (twice as f64 / 2.0).abs()
}

/// Drop repeated points and vertices lying within `tolerance` of the chord
/// joining their neighbours.
fn simplify_closed(mut points: Vec<Point<i32>>, tolerance: f64) -> Vec<Point<i32>> {
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    loop {
        let n = points.len();
        if n <= 3 {
            return points;
        }
        let flat = (0..n).find(|&i| {
            let (prev, cur, next) = (points[(i + n - 1) % n], points[i], points[(i + 1) % n]);
            chord_distance(prev, cur, next) < tolerance
        });
        match flat {
            Some(i) => {
                points.remove(i);
            }
            None => return points,
        }
    }
}

fn chord_distance(a: Point<i32>, p: Point<i32>, b: Point<i32>) -> f64 {
    let (dx, dy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let len = dx.hypot(dy);
    if len == 0.0 {
        return ((p.x - a.x) as f64).hypot((p.y - a.y) as f64);
    }
    (dy * (p.x - a.x) as f64 - dx * (p.y - a.y) as f64).abs() / len
}

/// Order four corners clockwise from the top-left: smallest `x + y` is the
/// top-left, largest the bottom-right, and of the other two the one further
/// right is the top-right.
pub(crate) fn order_corners(corners: &[(f32, f32)]) -> Option<[(f32, f32); 4]> {
    if corners.len() != 4 {
        return None;
    }
    let sum = |i: usize| corners[i].0 + corners[i].1;
    let tl = (0..4).min_by(|&a, &b| sum(a).total_cmp(&sum(b)))?;
    let br = (0..4).max_by(|&a, &b| sum(a).total_cmp(&sum(b)))?;
    if tl == br {
        return None;
    }
    let rest: Vec<usize> = (0..4).filter(|&i| i != tl && i != br).collect();
    let (tr, bl) = if corners[rest[0]].0 >= corners[rest[1]].0 {
        (rest[0], rest[1])
    } else {
        (rest[1], rest[0])
    };
    Some([corners[tl], corners[tr], corners[br], corners[bl]])
}

/// `count + 1` evenly spaced integer boundaries spanning `range`.
fn boundaries(range: [u32; 2], count: u32) -> Vec<u32> {
    let (lo, hi) = (range[0] as f64, range[1] as f64);
    (0..=count)
        .map(|i| (lo + (hi - lo) * i as f64 / count as f64).floor() as u32)
        .collect()
}

fn cell_mean(image: &GrayImage, (x0, x1): (u32, u32), (y0, y1): (u32, u32)) -> u32 {
    let (x1, y1) = (x1.min(image.width()), y1.min(image.height()));
    let mut total = 0u64;
    let mut count = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            total += image.get_pixel(x, y)[0] as u64;
            count += 1;
        }
    }
    if count == 0 {
        return 255;
    }
    (total / count) as u32
}
