use crate::{
    coordinate_frame::{CoordinateFrame, FrameError},
    dicom_source::{self, DicomFile, ImageHeader, RoiContours},
    enums::{Modality, PatientOrientation},
    rasterizer::{ContourRasterizer, RasterizeOptions},
    structure::{ContourSet, Structure},
    volume::Volume,
};

use dicom::object::open_file;
use log::{debug, info};
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing {0}")]
    MissingTag(&'static str),

    #[error("Invalid {0}")]
    InvalidTag(&'static str),

    #[error("Pixel data error: {0}")]
    PixelData(String),

    #[error("{decoded} frames decoded, {expected} expected")]
    FrameCount { decoded: usize, expected: usize },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load an image series (CT, MR) into a canonical volume.
    ///
    /// Slices may come in any order; they are placed by ascending canonical z.
    /// Stored values go through `RescaleSlope` and `RescaleIntercept`. Only the
    /// first frame of each object is used.
    ///
    /// # Errors
    ///
    /// Returns error if no objects are given, a geometry tag is missing or
    /// the slices do not form a uniform grid.
    pub fn load_image_series(objects: &[DicomFile]) -> Result<Volume, LoaderError> {
        if objects.is_empty() {
            return Err(LoaderError::NoValidImages);
        }

        let headers: Vec<ImageHeader> = objects
            .iter()
            .map(|obj| dicom_source::image_header(obj))
            .collect::<Result<_, _>>()?;
        let planes: Vec<_> = headers.iter().map(|h| h.plane.clone()).collect();
        let slice_thickness = headers.iter().find_map(|h| h.slice_thickness);
        let layout = CoordinateFrame::image_layout(&planes, slice_thickness)?;

        let images = layout
            .slice_order
            .par_iter()
            .map(|&i| Self::decode_image(&objects[i], &headers[i]))
            .collect::<Result<Vec<_>, _>>()?;
        Self::validate_dimensions(&images)?;

        let first = &headers[layout.slice_order[0]];
        debug!(
            "image series {:?}: {} slices, orientation {}",
            first.modality,
            images.len(),
            layout.orientation
        );

        Ok(Volume::new(layout.grid, Self::build_volume_array(&images))?
            .with_modality(first.modality.clone())
            .with_orientation(layout.orientation)
            .with_frame_of_reference(first.frame_of_reference_uid.clone()))
    }

    /// Load a multi-frame RTDOSE object, values scaled to Gy.
    pub fn load_dose(obj: &DicomFile) -> Result<Volume, LoaderError> {
        let header = dicom_source::dose_header(obj)?;
        let layout = CoordinateFrame::dose_layout(
            &header.plane,
            &header.frame_offsets,
            header.slice_thickness,
        )?;

        let frames = dicom_source::decode_frames(obj)?;
        let (decoded, rows, columns) = frames.dim();
        if decoded != header.frame_offsets.len() {
            return Err(LoaderError::FrameCount {
                decoded,
                expected: header.frame_offsets.len(),
            });
        }
        if (rows, columns) != (header.plane.rows, header.plane.columns) {
            return Err(LoaderError::InconsistentDimensions);
        }

        let scaling = header.dose_grid_scaling as f32;
        let mut data = Array3::<f32>::zeros((columns, rows, decoded));
        for (k, &frame) in layout.slice_order.iter().enumerate() {
            data.slice_mut(s![.., .., k])
                .assign(&frames.slice(s![frame, .., ..]).t());
        }
        data.mapv_inplace(|v| v * scaling);

        Ok(Volume::new(layout.grid, data)?
            .with_modality(Modality::RtDose)
            .with_orientation(layout.orientation)
            .with_frame_of_reference(header.frame_of_reference_uid))
    }

    /// Rasterize every ROI of an RTSTRUCT object onto `reference`'s grid.
    ///
    /// Contours are converted with the reference volume's patient
    /// orientation. ROIs that are skipped or end up empty are left out.
    pub fn load_structures(
        obj: &DicomFile,
        reference: &Volume,
        options: &RasterizeOptions,
    ) -> Result<Vec<Structure>, LoaderError> {
        let contour_sets: Vec<ContourSet> = dicom_source::roi_contours(obj)?
            .into_iter()
            .map(|roi| Self::contour_set(roi, reference.orientation()))
            .collect();
        let structures = ContourRasterizer::rasterize_all(&contour_sets, reference, options);
        info!(
            "rasterized {} of {} structures",
            structures.len(),
            contour_sets.len()
        );
        Ok(structures)
    }

    /// Load an image series from file paths
    pub fn load_image_series_from_paths(
        paths: &[impl AsRef<Path> + Sync],
    ) -> Result<Volume, LoaderError> {
        Self::load_image_series(&Self::read_objects(paths)?)
    }

    /// Load an image series from a directory containing .dcm files
    pub fn load_image_series_from_directory(path: impl AsRef<Path>) -> Result<Volume, LoaderError> {
        let paths = Self::dicom_paths(path)?;
        if paths.is_empty() {
            return Err(LoaderError::NoValidImages);
        }
        Self::load_image_series_from_paths(&paths)
    }

    pub fn load_dose_from_path(path: impl AsRef<Path>) -> Result<Volume, LoaderError> {
        Self::load_dose(&open_file(path.as_ref())?)
    }

    pub fn load_structures_from_path(
        path: impl AsRef<Path>,
        reference: &Volume,
        options: &RasterizeOptions,
    ) -> Result<Vec<Structure>, LoaderError> {
        Self::load_structures(&open_file(path.as_ref())?, reference, options)
    }

    /// Sorted paths of the .dcm files directly inside `path`.
    pub fn dicom_paths(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, LoaderError> {
        let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_objects(paths: &[impl AsRef<Path> + Sync]) -> Result<Vec<DicomFile>, LoaderError> {
        paths
            .par_iter()
            .map(|path| open_file(path.as_ref()).map_err(LoaderError::from))
            .collect()
    }

    fn decode_image(obj: &DicomFile, header: &ImageHeader) -> Result<Array2<f32>, LoaderError> {
        let frames = dicom_source::decode_frames(obj)?;
        if frames.dim().0 == 0 {
            return Err(LoaderError::PixelData("no frames".to_owned()));
        }
        let slope = header.rescale_slope as f32;
        let intercept = header.rescale_intercept as f32;
        let mut image = frames.slice_move(s![0, .., ..]);
        image.mapv_inplace(|v| v * slope + intercept);
        Ok(image)
    }

    fn contour_set(roi: RoiContours, orientation: PatientOrientation) -> ContourSet {
        ContourSet {
            number: roi.number,
            name: roi.name,
            color: roi.color,
            frame_of_reference_uid: roi.frame_of_reference_uid,
            curves: roi
                .contours
                .into_iter()
                .map(|curve| {
                    curve
                        .into_iter()
                        .map(|point| orientation.to_canonical(point))
                        .collect()
                })
                .collect(),
        }
    }

    fn validate_dimensions(images: &[Array2<f32>]) -> Result<(), LoaderError> {
        let first_dim = images.first().ok_or(LoaderError::NoValidImages)?.dim();
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(LoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    /// Stack `(rows, columns)` images into an `[x, y, z]` array.
    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (rows, columns) = images[0].dim();
        let mut volume = Array3::<f32>::zeros((columns, rows, images.len()));

        for (k, image) in images.iter().enumerate() {
            volume.slice_mut(s![.., .., k]).assign(&image.t());
        }

        volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use dicom::core::value::C;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
    use dicom_dictionary_std::tags;
    use ndarray::array;

    /// Feet-first supine dose, 3 frames of 2 rows by 3 columns. The stored
    /// value of frame `f`, row `r`, column `c` is `100 f + 10 r + c`.
    fn ffs_dose(offsets: &[&str]) -> DicomFile {
        let pixels: Vec<u8> = (0..3_u16)
            .flat_map(|f| {
                (0..2_u16).flat_map(move |r| (0..3_u16).map(move |c| 100 * f + 10 * r + c))
            })
            .flat_map(u16::to_le_bytes)
            .collect();
        let offsets: C<String> = offsets.iter().map(|o| (*o).to_owned()).collect();

        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("RTDOSE")),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["-1", "0", "0", "0", "1", "0"]),
            ),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["10", "-20", "100"]),
            ),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, dicom_value!(Strs, ["2", "1"])),
            DataElement::new(
                tags::GRID_FRAME_OFFSET_VECTOR,
                VR::DS,
                PrimitiveValue::Strs(offsets),
            ),
            DataElement::new(tags::DOSE_GRID_SCALING, VR::DS, PrimitiveValue::from("0.5")),
            DataElement::new(
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                PrimitiveValue::from("1.2.3"),
            ),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                PrimitiveValue::from("MONOCHROME2"),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(2_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(3_u16)),
            DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, PrimitiveValue::from("3")),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
            DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)),
        ]);
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.481.2")
            .media_storage_sop_instance_uid("1.2.3.4.5");
        obj.with_meta(meta).unwrap()
    }

    #[test]
    fn loads_scaled_dose_in_canonical_order() {
        let dose = VolumeLoader::load_dose(&ffs_dose(&["0", "-5", "-10"])).unwrap();

        assert_eq!(dose.dim(), (3, 2, 3));
        assert_eq!(dose.orientation(), PatientOrientation::Ffs);
        assert_eq!(dose.modality(), &Modality::RtDose);
        assert_eq!(dose.frame_of_reference_uid(), "1.2.3");

        // Frames sit at 100, 105 and 110 mm; feet first flips z, so the last
        // frame comes first.
        let grid = dose.grid();
        assert_relative_eq!(grid.start[0], -1.0);
        assert_relative_eq!(grid.start[1], -2.0);
        assert_relative_eq!(grid.start[2], -11.0);
        assert_relative_eq!(grid.width[0], 0.1);
        assert_relative_eq!(grid.width[1], 0.2);
        assert_relative_eq!(grid.width[2], 0.5);

        let data = dose.data();
        assert_eq!(data[[2, 1, 0]], 106.0);
        assert_eq!(data[[1, 0, 1]], 50.5);
        assert_eq!(data[[0, 1, 2]], 5.0);
        assert_eq!(data[[0, 0, 2]], 0.0);
    }

    #[test]
    fn frame_count_must_match_offsets() {
        assert!(matches!(
            VolumeLoader::load_dose(&ffs_dose(&["0", "-5"])),
            Err(LoaderError::FrameCount {
                decoded: 3,
                expected: 2
            })
        ));
    }

    #[test]
    fn stacks_images_column_major() {
        let images = vec![
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            array![[7.0, 8.0, 9.0], [10.0, 11.0, 12.0]],
        ];
        let volume = VolumeLoader::build_volume_array(&images);
        assert_eq!(volume.dim(), (3, 2, 2));
        // [column, row, slice]
        assert_eq!(volume[[2, 0, 0]], 3.0);
        assert_eq!(volume[[0, 1, 0]], 4.0);
        assert_eq!(volume[[1, 1, 1]], 11.0);
    }

    #[test]
    fn rejects_mixed_dimensions() {
        let images = vec![Array2::<f32>::zeros((2, 3)), Array2::<f32>::zeros((3, 2))];
        assert!(matches!(
            VolumeLoader::validate_dimensions(&images),
            Err(LoaderError::InconsistentDimensions)
        ));
        assert!(matches!(
            VolumeLoader::validate_dimensions(&[]),
            Err(LoaderError::NoValidImages)
        ));
    }

    #[test]
    fn contours_follow_patient_orientation() {
        let roi = RoiContours {
            number: 3,
            name: "Bladder".to_owned(),
            color: [0, 255, 0],
            frame_of_reference_uid: "1.2.3".to_owned(),
            contours: vec![vec![[10.0, -20.0, 35.0]]],
        };

        let hfs = VolumeLoader::contour_set(roi.clone(), PatientOrientation::Hfs);
        assert_eq!(hfs.curves, vec![vec![[1.0, -2.0, 3.5]]]);
        assert_eq!(hfs.number, 3);

        let ffp = VolumeLoader::contour_set(roi, PatientOrientation::Ffp);
        let sign = PatientOrientation::Ffp.sign();
        assert_eq!(
            ffp.curves,
            vec![vec![[sign[0] * 1.0, sign[1] * -2.0, sign[2] * 3.5]]]
        );
    }

    #[test]
    fn missing_directory_is_io_error() {
        assert!(matches!(
            VolumeLoader::load_image_series_from_directory("/nonexistent/dicom/dir"),
            Err(LoaderError::Io(_))
        ));
    }

    #[test]
    fn empty_series_is_rejected() {
        assert!(matches!(
            VolumeLoader::load_image_series(&[]),
            Err(LoaderError::NoValidImages)
        ));
    }
}
