use crate::coordinate_frame::FrameError;
use crate::enums::Modality;
use crate::enums::Orientation;
use crate::enums::PatientOrientation;

use image::ImageBuffer;
use image::Luma;
use image::Rgb;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

/// Largest start/width difference (cm) for two grids to count as identical.
pub const GRID_TOLERANCE: f64 = 1e-6;

/// Regular voxel grid in the canonical frame. Lengths are in centimetres and
/// `start` is the center of voxel `[0, 0, 0]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    pub start: [f64; 3],
    pub width: [f64; 3],
    pub dimensions: [usize; 3],
}

impl Grid {
    /// Unchecked constructor; [`Volume::new`] and [`Structure::from_mask`]
    /// reject grids that fail [`Grid::validate`].
    ///
    /// [`Structure::from_mask`]: crate::structure::Structure::from_mask
    pub fn new(start: [f64; 3], width: [f64; 3], dimensions: [usize; 3]) -> Self {
        Self {
            start,
            width,
            dimensions,
        }
    }

    /// Dimensions as an ndarray shape `(x, y, z)`
    pub fn shape(&self) -> (usize, usize, usize) {
        let [x, y, z] = self.dimensions;
        (x, y, z)
    }

    pub fn voxel_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    /// Volume of one voxel in cm³
    pub fn voxel_volume(&self) -> f64 {
        self.width.iter().product()
    }

    #[inline]
    pub fn center(&self, axis: usize, index: usize) -> f64 {
        self.start[axis] + index as f64 * self.width[axis]
    }

    #[inline]
    pub fn continuous_index(&self, axis: usize, coordinate: f64) -> f64 {
        (coordinate - self.start[axis]) / self.width[axis]
    }

    /// Index of the voxel whose center is closest to `coordinate`, if inside.
    pub fn nearest_index(&self, axis: usize, coordinate: f64) -> Option<usize> {
        let index = self.continuous_index(axis, coordinate).round();
        if index < 0.0 || index >= self.dimensions[axis] as f64 {
            return None;
        }
        Some(index as usize)
    }

    /// Every width must be finite and strictly positive.
    pub fn validate(&self) -> Result<(), FrameError> {
        match self.width.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            Some(&width) => Err(FrameError::NonPositiveSpacing(width)),
            None => Ok(()),
        }
    }

    pub fn matches(&self, other: &Grid) -> bool {
        self.dimensions == other.dimensions
            && self
                .start
                .iter()
                .chain(&self.width)
                .zip(other.start.iter().chain(&other.width))
                .all(|(a, b)| (a - b).abs() <= GRID_TOLERANCE)
    }
}

/// Dense sample volume indexed `[x, y, z]` on a canonical [`Grid`].
#[derive(Clone, Debug)]
pub struct Volume {
    grid: Grid,
    data: Array3<f32>,
    modality: Modality,
    orientation: PatientOrientation,
    frame_of_reference_uid: String,
}

impl Volume {
    pub fn new(grid: Grid, data: Array3<f32>) -> Result<Self, FrameError> {
        Self::check_shape(&grid, &data)?;
        Ok(Self {
            grid,
            data,
            modality: Modality::default(),
            orientation: PatientOrientation::default(),
            frame_of_reference_uid: String::new(),
        })
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    pub fn with_orientation(mut self, orientation: PatientOrientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_frame_of_reference(mut self, uid: impl Into<String>) -> Self {
        self.frame_of_reference_uid = uid.into();
        self
    }

    /// Same metadata, new samples on `grid`.
    pub(crate) fn derive(&self, grid: Grid, data: Array3<f32>) -> Result<Self, FrameError> {
        Self::check_shape(&grid, &data)?;
        Ok(Self {
            grid,
            data,
            modality: self.modality.clone(),
            orientation: self.orientation,
            frame_of_reference_uid: self.frame_of_reference_uid.clone(),
        })
    }

    fn check_shape(grid: &Grid, data: &Array3<f32>) -> Result<(), FrameError> {
        grid.validate()?;
        let (x, y, z) = data.dim();
        if [x, y, z] != grid.dimensions {
            return Err(FrameError::ShapeMismatch {
                expected: grid.dimensions,
                actual: [x, y, z],
            });
        }
        Ok(())
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn modality(&self) -> &Modality {
        &self.modality
    }

    pub fn orientation(&self) -> PatientOrientation {
        self.orientation
    }

    pub fn frame_of_reference_uid(&self) -> &str {
        &self.frame_of_reference_uid
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// 2D view of one slice, `(columns, rows)` as displayed.
    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data.slice(s![.., .., index]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![index, .., ..]),
        };
        Some(slice_result)
    }

    /// Grayscale preview of a slice, windowed to the volume's value range.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let (width, height) = slice.dim();
        let window = self.window();
        let flip = !matches!(orientation, Orientation::Axial);

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map_iter(|row| {
                let row = if flip { height - 1 - row } else { row };
                (0..width).map(move |column| Self::normalize_to_u8(slice[[column, row]], window))
            })
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    /// Like [`Volume::get_image_from_axis`], with `mask` blended in `color`.
    pub fn get_overlay_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
        mask: &Array3<bool>,
        color: [u8; 3],
    ) -> Option<ImageBuffer<Rgb<u8>, Vec<u8>>> {
        if mask.dim() != self.data.dim() {
            return None;
        }
        let gray = self.get_image_from_axis(index, orientation)?;
        let (width, height) = gray.dimensions();
        let flip = !matches!(orientation, Orientation::Axial);

        Some(ImageBuffer::from_fn(width, height, |column, row| {
            let value = gray.get_pixel(column, row).0[0];
            let (column, row) = (column as usize, row as usize);
            let row = if flip { height as usize - 1 - row } else { row };
            let inside = match orientation {
                Orientation::Axial => mask[[column, row, index]],
                Orientation::Coronal => mask[[column, index, row]],
                Orientation::Sagittal => mask[[index, column, row]],
            };
            if inside {
                Rgb(color.map(|c| ((u16::from(c) + u16::from(value)) / 2) as u8))
            } else {
                Rgb([value; 3])
            }
        }))
    }

    fn window(&self) -> (f32, f32) {
        (self.min_value(), self.max_value())
    }

    #[inline]
    fn normalize_to_u8(value: f32, (low, high): (f32, f32)) -> u8 {
        if high <= low {
            return 0;
        }
        (((value - low) / (high - low)) * 255.0).clamp(0.0, 255.0) as u8
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.2,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.0,
        };
        index < max_index
    }
}
