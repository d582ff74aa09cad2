//! Canonical voxel frames.
//!
//! Positional metadata reported by the codec (direction cosines, image
//! positions, pixel spacing and slice offsets, all in millimetres) is turned
//! into a [`Grid`] in centimetres. Patient orientation is reduced to one of
//! the four supported [`PatientOrientation`] codes whose sign triple is applied
//! to every coordinate crossing this boundary.

use thiserror::Error;

use crate::enums::PatientOrientation;
use crate::volume::Grid;

/// Largest accepted `(max - min) / mean` deviation of consecutive pitches.
pub const SPACING_TOLERANCE: f64 = 0.01;
/// Per-component tolerance when matching direction cosines.
pub const COSINE_TOLERANCE: f64 = 1e-3;
pub const MM_PER_CM: f64 = 10.0;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("unsupported patient orientation {0:?}")]
    UnsupportedOrientation(Vec<f64>),

    #[error(
        "non-uniform grid spacing: pitch deviates by {:.3}% (min {min}, max {max}, mean {mean})",
        .deviation * 100.0
    )]
    NonUniformSpacing {
        min: f64,
        max: f64,
        mean: f64,
        deviation: f64,
    },

    #[error("axis has no positions")]
    EmptyAxis,

    #[error("single slice without a slice thickness")]
    SingleSlice,

    #[error("axis pitch must be positive, got {0}")]
    NonPositiveSpacing(f64),

    #[error("image planes disagree on {0}")]
    InconsistentPlanes(&'static str),

    #[error("data shape {actual:?} does not match grid dimensions {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
}

/// One regularly spaced axis: center of the first voxel, pitch and count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformAxis {
    pub start: f64,
    pub width: f64,
    pub count: usize,
}

/// Geometry of a single image plane as reported by the codec, in millimetres.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaneGeometry {
    pub orientation: [f64; 6],
    pub position: [f64; 3],
    /// Row spacing (between rows) followed by column spacing.
    pub pixel_spacing: [f64; 2],
    pub rows: usize,
    pub columns: usize,
}

/// Result of canonicalizing a stack of planes.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameLayout {
    pub grid: Grid,
    pub orientation: PatientOrientation,
    /// Input slice indices in ascending canonical Z order.
    pub slice_order: Vec<usize>,
}

impl PatientOrientation {
    /// Classify a row/column direction-cosine pair.
    pub fn from_cosines(cosines: &[f64]) -> Result<Self, FrameError> {
        const KNOWN: [([f64; 6], PatientOrientation); 4] = [
            ([1.0, 0.0, 0.0, 0.0, 1.0, 0.0], PatientOrientation::Hfs),
            ([-1.0, 0.0, 0.0, 0.0, -1.0, 0.0], PatientOrientation::Hfp),
            ([-1.0, 0.0, 0.0, 0.0, 1.0, 0.0], PatientOrientation::Ffs),
            ([1.0, 0.0, 0.0, 0.0, -1.0, 0.0], PatientOrientation::Ffp),
        ];

        if cosines.len() == 6 {
            for (expected, orientation) in KNOWN {
                if expected
                    .iter()
                    .zip(cosines)
                    .all(|(e, c)| (e - c).abs() <= COSINE_TOLERANCE)
                {
                    return Ok(orientation);
                }
            }
        }
        Err(FrameError::UnsupportedOrientation(cosines.to_vec()))
    }

    /// Convert a patient point in millimetres to canonical centimetres.
    pub fn to_canonical(self, point_mm: [f64; 3]) -> [f64; 3] {
        let sign = self.sign();
        [
            sign[0] * point_mm[0] / MM_PER_CM,
            sign[1] * point_mm[1] / MM_PER_CM,
            sign[2] * point_mm[2] / MM_PER_CM,
        ]
    }
}

/// Mean pitch of an ascending position sequence, rejecting irregular grids.
pub fn uniform_pitch(positions: &[f64]) -> Result<f64, FrameError> {
    let diffs: Vec<f64> = positions.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.is_empty() {
        return Err(FrameError::EmptyAxis);
    }

    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    if mean <= 0.0 {
        return Err(FrameError::NonPositiveSpacing(mean));
    }

    let (min, max) = diffs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| {
            (lo.min(d), hi.max(d))
        });
    let deviation = (max - min) / mean;
    if deviation > SPACING_TOLERANCE {
        return Err(FrameError::NonUniformSpacing {
            min,
            max,
            mean,
            deviation,
        });
    }
    Ok(mean)
}

/// Axis from `N + 1` voxel boundaries.
pub fn axis_from_boundaries(boundaries: &[f64]) -> Result<UniformAxis, FrameError> {
    let sorted = sorted(boundaries);
    let width = uniform_pitch(&sorted)?;
    Ok(UniformAxis {
        start: sorted[0] + width / 2.0,
        width,
        count: sorted.len() - 1,
    })
}

/// Axis from `N` voxel centers. A lone center needs `fallback_width`.
pub fn axis_from_centers(
    centers: &[f64],
    fallback_width: Option<f64>,
) -> Result<UniformAxis, FrameError> {
    let sorted = sorted(centers);
    let width = match sorted.len() {
        0 => return Err(FrameError::EmptyAxis),
        1 => match fallback_width {
            Some(width) if width > 0.0 => width,
            Some(width) => return Err(FrameError::NonPositiveSpacing(width)),
            None => return Err(FrameError::SingleSlice),
        },
        _ => uniform_pitch(&sorted)?,
    };
    Ok(UniformAxis {
        start: sorted[0],
        width,
        count: sorted.len(),
    })
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

pub struct CoordinateFrame;

impl CoordinateFrame {
    /// Canonical layout of an image series, one plane per slice.
    ///
    /// # Errors
    ///
    /// Fails on an unsupported orientation, planes that disagree on
    /// orientation, matrix size or pixel spacing, and non-uniform slice
    /// spacing.
    pub fn image_layout(
        planes: &[PlaneGeometry],
        slice_thickness_mm: Option<f64>,
    ) -> Result<FrameLayout, FrameError> {
        let first = planes.first().ok_or(FrameError::EmptyAxis)?;
        let orientation = PatientOrientation::from_cosines(&first.orientation)?;

        for plane in &planes[1..] {
            if PatientOrientation::from_cosines(&plane.orientation)? != orientation {
                return Err(FrameError::InconsistentPlanes("orientation"));
            }
            if plane.rows != first.rows || plane.columns != first.columns {
                return Err(FrameError::InconsistentPlanes("matrix size"));
            }
            if plane
                .pixel_spacing
                .iter()
                .zip(first.pixel_spacing)
                .any(|(a, b)| (a - b).abs() > 1e-6)
            {
                return Err(FrameError::InconsistentPlanes("pixel spacing"));
            }
        }

        let slice_z: Vec<f64> = planes.iter().map(|p| p.position[2]).collect();
        Self::layout(first, orientation, &slice_z, slice_thickness_mm)
    }

    /// Canonical layout of a multi-frame dose grid.
    ///
    /// Frame positions are `ImagePositionPatient` displaced by each grid frame
    /// offset along the plane normal.
    pub fn dose_layout(
        plane: &PlaneGeometry,
        frame_offsets_mm: &[f64],
        slice_thickness_mm: Option<f64>,
    ) -> Result<FrameLayout, FrameError> {
        let orientation = PatientOrientation::from_cosines(&plane.orientation)?;
        let [rx, ry, _, cx, cy, _] = plane.orientation;
        let normal_z = rx * cy - ry * cx;

        let slice_z: Vec<f64> = frame_offsets_mm
            .iter()
            .map(|offset| plane.position[2] + normal_z * offset)
            .collect();
        Self::layout(plane, orientation, &slice_z, slice_thickness_mm)
    }

    fn layout(
        plane: &PlaneGeometry,
        orientation: PatientOrientation,
        slice_z_mm: &[f64],
        slice_thickness_mm: Option<f64>,
    ) -> Result<FrameLayout, FrameError> {
        let [row_spacing, column_spacing] = plane.pixel_spacing;
        for spacing in [row_spacing, column_spacing] {
            if spacing <= 0.0 {
                return Err(FrameError::NonPositiveSpacing(spacing));
            }
        }

        let sign = orientation.sign();
        let slice_z: Vec<f64> = slice_z_mm
            .iter()
            .map(|z| sign[2] * z / MM_PER_CM)
            .collect();
        let mut slice_order: Vec<usize> = (0..slice_z.len()).collect();
        slice_order.sort_by(|&a, &b| slice_z[a].total_cmp(&slice_z[b]));

        let z_axis = axis_from_centers(&slice_z, slice_thickness_mm.map(|t| t / MM_PER_CM))?;

        // With the sign applied, rows and columns ascend in the canonical frame.
        let origin = orientation.to_canonical(plane.position);
        let grid = Grid::new(
            [origin[0], origin[1], z_axis.start],
            [
                column_spacing / MM_PER_CM,
                row_spacing / MM_PER_CM,
                z_axis.width,
            ],
            [plane.columns, plane.rows, z_axis.count],
        );

        Ok(FrameLayout {
            grid,
            orientation,
            slice_order,
        })
    }
}
