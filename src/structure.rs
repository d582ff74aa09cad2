use ndarray::Array3;

use crate::coordinate_frame::FrameError;
use crate::volume::Grid;

/// Canonical point in centimetres.
pub type Point = [f64; 3];

/// Closed polygon lying in one axial plane; the last point connects to the first.
pub type Curve = Vec<Point>;

/// Contours of one ROI before rasterization, already in canonical centimetres.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContourSet {
    pub number: i32,
    pub name: String,
    pub color: [u8; 3],
    pub frame_of_reference_uid: String,
    pub curves: Vec<Curve>,
}

/// Rasterized region of interest.
///
/// Holds its own copy of the reference grid so it stays valid after the
/// image volume it was built against is dropped.
#[derive(Clone, Debug)]
pub struct Structure {
    name: String,
    color: [u8; 3],
    mask: Array3<bool>,
    points: Vec<Curve>,
    volume_cc: f64,
    frame_of_reference_uid: String,
    grid: Grid,
}

impl Structure {
    /// Wrap an existing mask. `mask` must have the grid's dimensions and the
    /// grid positive widths.
    pub fn from_mask(
        name: impl Into<String>,
        color: [u8; 3],
        grid: &Grid,
        mask: Array3<bool>,
        frame_of_reference_uid: impl Into<String>,
    ) -> Result<Self, FrameError> {
        grid.validate()?;
        let (x, y, z) = mask.dim();
        if [x, y, z] != grid.dimensions {
            return Err(FrameError::ShapeMismatch {
                expected: grid.dimensions,
                actual: [x, y, z],
            });
        }
        Ok(Self::assemble(
            name.into(),
            color,
            grid,
            mask,
            Vec::new(),
            frame_of_reference_uid.into(),
        ))
    }

    pub(crate) fn from_contours(contours: &ContourSet, grid: &Grid, mask: Array3<bool>) -> Self {
        Self::assemble(
            contours.name.clone(),
            contours.color,
            grid,
            mask,
            contours.curves.clone(),
            contours.frame_of_reference_uid.clone(),
        )
    }

    fn assemble(
        name: String,
        color: [u8; 3],
        grid: &Grid,
        mask: Array3<bool>,
        points: Vec<Curve>,
        frame_of_reference_uid: String,
    ) -> Self {
        let voxels = mask.iter().filter(|&&inside| inside).count();
        Self {
            name,
            color,
            mask,
            points,
            volume_cc: voxels as f64 * grid.voxel_volume(),
            frame_of_reference_uid,
            grid: grid.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> [u8; 3] {
        self.color
    }

    pub fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    pub fn points(&self) -> &[Curve] {
        &self.points
    }

    pub fn volume_cc(&self) -> f64 {
        self.volume_cc
    }

    pub fn voxel_count(&self) -> usize {
        self.mask.iter().filter(|&&inside| inside).count()
    }

    pub fn frame_of_reference_uid(&self) -> &str {
        &self.frame_of_reference_uid
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn volume_counts_true_voxels() {
        let grid = Grid::new([0.0; 3], [0.5, 0.5, 2.0], [3, 3, 3]);
        let mut mask = Array3::from_elem((3, 3, 3), false);
        mask[[0, 0, 0]] = true;
        mask[[2, 1, 2]] = true;
        let structure = Structure::from_mask("Cord", [0, 255, 0], &grid, mask, "1.2.3").unwrap();

        assert_eq!(structure.voxel_count(), 2);
        assert_relative_eq!(structure.volume_cc(), 1.0);
        assert_eq!(structure.grid(), &grid);
    }

    #[test]
    fn rejects_mask_of_wrong_shape() {
        let grid = Grid::new([0.0; 3], [1.0; 3], [3, 3, 3]);
        let mask = Array3::from_elem((3, 3, 2), true);
        assert!(Structure::from_mask("Body", [0; 3], &grid, mask, "").is_err());
    }

    #[test]
    fn rejects_zero_width_grid() {
        let grid = Grid::new([0.0; 3], [1.0, 1.0, 0.0], [2, 2, 2]);
        let mask = Array3::from_elem((2, 2, 2), true);
        assert_eq!(
            Structure::from_mask("Body", [0; 3], &grid, mask, "").unwrap_err(),
            FrameError::NonPositiveSpacing(0.0)
        );
    }
}
