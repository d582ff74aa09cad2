use ndarray::{Array3, ArrayView3, Zip};
use thiserror::Error;

use crate::coordinate_frame::FrameError;
use crate::volume::Grid;

/// Continuous indices closer than this to an integer are snapped onto it, so
/// that target centers sitting on a source center do not fall just outside
/// the extent through rounding.
const INDEX_SNAP: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("no interpolation strategy configured")]
    NoStrategy,

    #[error("no compatible GPU adapter: {0}")]
    Adapter(String),

    #[error("GPU device request failed: {0}")]
    Device(String),

    #[error("{bytes} bytes exceed the GPU storage buffer limit of {limit} bytes")]
    TooLarge { bytes: u64, limit: u64 },

    #[error("GPU execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Source-space continuous indices of every target voxel center.
///
/// Grids are axis aligned, so the dense 3D mesh separates into one
/// coordinate vector per axis.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleMesh {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
}

impl SampleMesh {
    pub fn between(source: &Grid, target: &Grid) -> Self {
        let axis = |a: usize| -> Vec<f32> {
            (0..target.dimensions[a])
                .map(|i| snap(source.continuous_index(a, target.center(a, i))) as f32)
                .collect()
        };
        Self {
            x: axis(0),
            y: axis(1),
            z: axis(2),
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        (self.x.len(), self.y.len(), self.z.len())
    }

    pub fn len(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snap(index: f64) -> f64 {
    let rounded = index.round();
    if (index - rounded).abs() < INDEX_SNAP {
        rounded
    } else {
        index
    }
}

/// Evaluates trilinear interpolation of a source volume over a sample mesh.
///
/// Every implementation must produce the standard trilinear weights and
/// return 0 for samples outside the source extent.
pub trait TrilinearInterpolator {
    fn name(&self) -> &'static str;

    fn interpolate(
        &self,
        source: ArrayView3<'_, f32>,
        mesh: &SampleMesh,
    ) -> Result<Array3<f32>, ResampleError>;
}

/// Reference implementation, parallel over voxels with rayon.
pub struct CpuInterpolator;

impl CpuInterpolator {
    /// Lower index, upper index and fraction along one axis.
    #[inline]
    pub(crate) fn axis_weights(index: f32, len: usize) -> Option<(usize, usize, f32)> {
        let last = len.checked_sub(1)?;
        if !(index >= 0.0 && index <= last as f32) {
            return None;
        }
        let i0 = index.floor() as usize;
        let i1 = (i0 + 1).min(last);
        Some((i0, i1, index - i0 as f32))
    }

    #[inline]
    pub(crate) fn trilinear_interpolate(source: &ArrayView3<f32>, x: f32, y: f32, z: f32) -> f32 {
        let (nx, ny, nz) = source.dim();
        let (Some((x0, x1, dx)), Some((y0, y1, dy)), Some((z0, z1, dz))) = (
            Self::axis_weights(x, nx),
            Self::axis_weights(y, ny),
            Self::axis_weights(z, nz),
        ) else {
            return 0.0;
        };

        // Same operation order as the compute shader.
        let c00 = source[[x0, y0, z0]] * (1.0 - dx) + source[[x1, y0, z0]] * dx;
        let c10 = source[[x0, y1, z0]] * (1.0 - dx) + source[[x1, y1, z0]] * dx;
        let c01 = source[[x0, y0, z1]] * (1.0 - dx) + source[[x1, y0, z1]] * dx;
        let c11 = source[[x0, y1, z1]] * (1.0 - dx) + source[[x1, y1, z1]] * dx;

        let c0 = c00 * (1.0 - dy) + c10 * dy;
        let c1 = c01 * (1.0 - dy) + c11 * dy;

        c0 * (1.0 - dz) + c1 * dz
    }
}

impl TrilinearInterpolator for CpuInterpolator {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn interpolate(
        &self,
        source: ArrayView3<'_, f32>,
        mesh: &SampleMesh,
    ) -> Result<Array3<f32>, ResampleError> {
        let mut output = Array3::<f32>::zeros(mesh.dim());
        Zip::indexed(&mut output).par_for_each(|(i, j, k), value| {
            *value = Self::trilinear_interpolate(&source, mesh.x[i], mesh.y[j], mesh.z[k]);
        });
        Ok(output)
    }
}
