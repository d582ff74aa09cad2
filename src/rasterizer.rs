//! Contour to mask conversion.
//!
//! Every curve is rasterized on its own axial slice with an even-odd
//! point-in-polygon test at the voxel centers and then merged into the
//! structure mask with exclusive-or. A curve drawn inside another one on the
//! same slice therefore cuts a hole, which is how RT structure sets encode
//! rings. Curves that only partially overlap follow the same rule: the
//! intersection is removed.

use log::{debug, warn};
use ndarray::{Array2, Array3, Zip, s};

use crate::structure::{ContourSet, Point, Structure};
use crate::volume::{Grid, Volume};

#[derive(Clone, Copy, Debug, Default)]
pub struct RasterizeOptions {
    /// Rasterize structures even when their frame of reference differs from
    /// the reference volume's.
    pub override_frame_of_reference: bool,
}

pub struct ContourRasterizer;

impl ContourRasterizer {
    /// Rasterize every contour set against `reference`, dropping the ones that
    /// are skipped or end up empty.
    pub fn rasterize_all(
        contour_sets: &[ContourSet],
        reference: &Volume,
        options: &RasterizeOptions,
    ) -> Vec<Structure> {
        contour_sets
            .iter()
            .filter_map(|contours| {
                Self::rasterize(
                    contours,
                    reference.grid(),
                    reference.frame_of_reference_uid(),
                    options,
                )
            })
            .collect()
    }

    /// Build the mask of one structure on `grid`.
    ///
    /// Returns `None` when the frame of reference does not match (and no
    /// override is set) or when no voxel ends up inside the structure.
    pub fn rasterize(
        contours: &ContourSet,
        grid: &Grid,
        reference_frame_uid: &str,
        options: &RasterizeOptions,
    ) -> Option<Structure> {
        if contours.frame_of_reference_uid != reference_frame_uid {
            if !options.override_frame_of_reference {
                warn!(
                    "skipping structure '{}': frame of reference {} does not match {}",
                    contours.name, contours.frame_of_reference_uid, reference_frame_uid
                );
                return None;
            }
            debug!(
                "rasterizing '{}' across frames of reference on request",
                contours.name
            );
        }

        let mut mask = Array3::from_elem(grid.shape(), false);
        for (index, curve) in contours.curves.iter().enumerate() {
            if curve.is_empty() {
                debug!("structure '{}': curve {index} has no points", contours.name);
                continue;
            }
            let Some(slice) = Self::slice_index(curve, grid) else {
                warn!(
                    "structure '{}': curve {index} at z = {:.3} cm lies outside the volume",
                    contours.name, curve[0][2]
                );
                continue;
            };

            let curve_mask = Self::rasterize_curve(curve, grid);
            let mut plane = mask.slice_mut(s![.., .., slice]);
            Zip::from(&mut plane)
                .and(&curve_mask)
                .for_each(|voxel, &inside| *voxel ^= inside);
        }

        let structure = Structure::from_contours(contours, grid, mask);
        if structure.voxel_count() == 0 {
            warn!("dropping structure '{}': empty mask", contours.name);
            return None;
        }
        Some(structure)
    }

    fn slice_index(curve: &[Point], grid: &Grid) -> Option<usize> {
        grid.nearest_index(2, curve[0][2])
    }

    /// Mask of the voxel centers of one slice that lie inside `curve`.
    pub fn rasterize_curve(curve: &[Point], grid: &Grid) -> Array2<bool> {
        let [nx, ny, _] = grid.dimensions;
        let mut slice = Array2::from_elem((nx, ny), false);

        let (min, max) = curve.iter().fold(
            ([f64::INFINITY; 2], [f64::NEG_INFINITY; 2]),
            |(min, max), p| {
                (
                    [min[0].min(p[0]), min[1].min(p[1])],
                    [max[0].max(p[0]), max[1].max(p[1])],
                )
            },
        );
        let Some(columns) = Self::index_range(grid, 0, min[0], max[0]) else {
            return slice;
        };
        let Some(rows) = Self::index_range(grid, 1, min[1], max[1]) else {
            return slice;
        };

        for i in columns {
            let x = grid.center(0, i);
            for j in rows.clone() {
                if Self::point_in_polygon(x, grid.center(1, j), curve) {
                    slice[[i, j]] = true;
                }
            }
        }
        slice
    }

    /// Voxel indices along `axis` whose centers fall in `[low, high]`.
    fn index_range(
        grid: &Grid,
        axis: usize,
        low: f64,
        high: f64,
    ) -> Option<std::ops::RangeInclusive<usize>> {
        let last = grid.dimensions[axis].checked_sub(1)? as f64;
        let first = grid.continuous_index(axis, low).ceil().max(0.0);
        let end = grid.continuous_index(axis, high).floor().min(last);
        if first > end {
            return None;
        }
        Some(first as usize..=end as usize)
    }

    /// Even-odd crossing test in the XY plane.
    pub fn point_in_polygon(x: f64, y: f64, polygon: &[Point]) -> bool {
        let mut inside = false;
        let mut previous = match polygon.last() {
            Some(point) => point,
            None => return false,
        };
        for current in polygon {
            let (xi, yi) = (current[0], current[1]);
            let (xj, yj) = (previous[0], previous[1]);
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            previous = current;
        }
        inside
    }
}
