//! 2D spatial index over a frame's keypoints.
//!
//! Bins keypoints into a fixed cell grid for O(1) radius lookups during
//! projection matching.

use crate::camera::ImageBounds;
use crate::feature::KeyPoint;

/// Number of grid columns and rows over the image rectangle.
const GRID_COLS: usize = 64;
const GRID_ROWS: usize = 48;

/// Keypoint indices binned by image cell.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    bounds: ImageBounds,
    cell_width_inv: f64,
    cell_height_inv: f64,
    cells: Vec<Vec<usize>>,
}

impl FeatureGrid {
    pub fn build(keypoints: &[KeyPoint], bounds: ImageBounds) -> Self {
        let cell_width_inv = GRID_COLS as f64 / bounds.width().max(1.0);
        let cell_height_inv = GRID_ROWS as f64 / bounds.height().max(1.0);
        let mut cells = vec![Vec::new(); GRID_COLS * GRID_ROWS];

        for (idx, kp) in keypoints.iter().enumerate() {
            if let Some(cell) = cell_index(kp.x, kp.y, &bounds, cell_width_inv, cell_height_inv) {
                cells[cell].push(idx);
            }
        }

        Self {
            bounds,
            cell_width_inv,
            cell_height_inv,
            cells,
        }
    }

    /// Indices of keypoints within `radius` of `(x, y)`, optionally limited
    /// to an octave range (inclusive).
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        radius: f64,
        min_octave: Option<u32>,
        max_octave: Option<u32>,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        if !self.bounds.contains(x, y) && radius < 1.0 {
            return out;
        }

        let min_col = (((x - radius - self.bounds.min_x) * self.cell_width_inv).floor() as i64)
            .clamp(0, GRID_COLS as i64 - 1) as usize;
        let max_col = (((x + radius - self.bounds.min_x) * self.cell_width_inv).ceil() as i64)
            .clamp(0, GRID_COLS as i64 - 1) as usize;
        let min_row = (((y - radius - self.bounds.min_y) * self.cell_height_inv).floor() as i64)
            .clamp(0, GRID_ROWS as i64 - 1) as usize;
        let max_row = (((y + radius - self.bounds.min_y) * self.cell_height_inv).ceil() as i64)
            .clamp(0, GRID_ROWS as i64 - 1) as usize;

        let radius_sq = radius * radius;
        for row in min_row..=max_row {
            for col in min_col..=max_col {
                for &idx in &self.cells[row * GRID_COLS + col] {
                    let kp = &keypoints[idx];
                    if let Some(min) = min_octave {
                        if kp.octave < min {
                            continue;
                        }
                    }
                    if let Some(max) = max_octave {
                        if kp.octave > max {
                            continue;
                        }
                    }
                    let dx = kp.x - x;
                    let dy = kp.y - y;
                    if dx * dx + dy * dy <= radius_sq {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}

fn cell_index(
    x: f64,
    y: f64,
    bounds: &ImageBounds,
    cell_width_inv: f64,
    cell_height_inv: f64,
) -> Option<usize> {
    if !bounds.contains(x, y) {
        return None;
    }
    let col = ((x - bounds.min_x) * cell_width_inv) as usize;
    let row = ((y - bounds.min_y) * cell_height_inv) as usize;
    if col >= GRID_COLS || row >= GRID_ROWS {
        return None;
    }
    Some(row * GRID_COLS + col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> ImageBounds {
        ImageBounds {
            min_x: 0.0,
            max_x: 640.0,
            min_y: 0.0,
            max_y: 480.0,
        }
    }

    #[test]
    fn test_radius_lookup() {
        let keypoints = vec![
            KeyPoint::new(100.0, 100.0, 0),
            KeyPoint::new(103.0, 101.0, 1),
            KeyPoint::new(400.0, 300.0, 0),
        ];
        let grid = FeatureGrid::build(&keypoints, bounds());

        let near = grid.features_in_area(&keypoints, 100.0, 100.0, 5.0, None, None);
        assert_eq!(near.len(), 2);
        assert!(near.contains(&0) && near.contains(&1));

        let far = grid.features_in_area(&keypoints, 400.0, 300.0, 1.0, None, None);
        assert_eq!(far, vec![2]);
    }

    #[test]
    fn test_octave_filter() {
        let keypoints = vec![KeyPoint::new(50.0, 50.0, 0), KeyPoint::new(51.0, 50.0, 2)];
        let grid = FeatureGrid::build(&keypoints, bounds());

        let only_fine = grid.features_in_area(&keypoints, 50.0, 50.0, 5.0, Some(0), Some(0));
        assert_eq!(only_fine, vec![0]);
        let only_coarse = grid.features_in_area(&keypoints, 50.0, 50.0, 5.0, Some(2), None);
        assert_eq!(only_coarse, vec![1]);
    }

    #[test]
    fn test_out_of_bounds_keypoints_ignored() {
        let keypoints = vec![KeyPoint::new(-10.0, 50.0, 0), KeyPoint::new(700.0, 50.0, 0)];
        let grid = FeatureGrid::build(&keypoints, bounds());
        let found = grid.features_in_area(&keypoints, 0.0, 50.0, 50.0, None, None);
        assert!(found.is_empty());
    }
}
