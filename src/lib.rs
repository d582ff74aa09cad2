//! # DICOM-RT volume library
//!
//! This crate turns radiotherapy DICOM objects into voxel volumes on one
//! canonical, axis-aligned coordinate frame and computes cumulative
//! dose-volume histograms (DVHs) from them.
//!
//! It builds on the dicom-rs ecosystem for parsing and pixel decoding:
//!  - CT and MR series become a [`Volume`] in centimetres, indexed `[x, y, z]`
//!  - RTSTRUCT contours are rasterized into boolean [`Structure`] masks on
//!    the image grid
//!  - RTDOSE grids are scaled to Gy and, when their grid differs from the
//!    structures', resampled with trilinear interpolation
//!  - the DVH engine produces one percent-volume column per structure and
//!    [`DvhWriter`] stores it as CSV
//!
//! Only head-first/feet-first supine/prone patient orientations with axial
//! slices are accepted. Resampling runs on the CPU using rayon, or on the GPU
//! through a WGPU compute shader with automatic CPU fallback.
//!
//! A [`ScanIndex`] groups a directory of files into studies and links each
//! dose to its plan and beam and each structure set to its image series.
//!
//! # Examples
//!
//! ## Computing a DVH
//!
//! Load a CT series, rasterize a structure set against it and histogram a
//! dose grid.
//!
//! ```no_run
//! # use dicom_rt_volume::{DvhEngine, DvhOptions, DvhWriter, RasterizeOptions, VolumeLoader};
//! let image = VolumeLoader::load_image_series_from_directory("ct")
//!     .expect("should have loaded the image series");
//! let structures =
//!     VolumeLoader::load_structures_from_path("rtstruct.dcm", &image, &RasterizeOptions::default())
//!         .expect("should have rasterized the structure set");
//! let dose = VolumeLoader::load_dose_from_path("rtdose.dcm").expect("should have loaded dose");
//! let curve = DvhEngine::compute(&dose, &structures, &DvhOptions::default())
//!     .expect("should have computed the DVH");
//! DvhWriter::write_to_path(&curve, "rtdose.dcm", "dvh.csv").expect("should have written CSV");
//! ```

pub mod coordinate_frame;
pub mod dicom_source;
pub mod dvh;
pub mod dvh_writer;
pub mod enums;
pub mod error;
pub mod gpu_interpolator;
pub mod interpolator;
pub mod rasterizer;
pub mod resampler;
pub mod scan_index;
pub mod structure;
pub mod volume;
pub mod volume_loader;

pub use coordinate_frame::{CoordinateFrame, FrameError, PlaneGeometry};
pub use dvh::{DvhCurve, DvhEngine, DvhError, DvhOptions};
pub use dvh_writer::{DvhWriter, WriteError};
pub use enums::{Modality, Orientation, PatientOrientation, Processor};
pub use error::{Error, Result};
pub use interpolator::{CpuInterpolator, ResampleError, TrilinearInterpolator};
pub use rasterizer::{ContourRasterizer, RasterizeOptions};
pub use resampler::VolumeResampler;
pub use scan_index::{ScanIndex, Study};
pub use structure::{ContourSet, Structure};
pub use volume::{Grid, Volume};
pub use volume_loader::{LoaderError, VolumeLoader};
