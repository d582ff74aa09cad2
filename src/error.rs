use thiserror::Error;

use crate::coordinate_frame::FrameError;
use crate::dvh::DvhError;
use crate::dvh_writer::WriteError;
use crate::interpolator::ResampleError;
use crate::volume_loader::LoaderError;

/// Any failure of the load, rasterize, resample and histogram pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Resample(#[from] ResampleError),

    #[error(transparent)]
    Dvh(#[from] DvhError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Preview error: {0}")]
    Preview(#[from] image::ImageError),

    #[error("Scan report error: {0}")]
    Report(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Incomplete study: {0}")]
    IncompleteStudy(String),
}

pub type Result<T> = std::result::Result<T, Error>;
