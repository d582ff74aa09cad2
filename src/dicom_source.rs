//! Typed header records read from dicom-rs objects.
//!
//! Only the fields the geometry, rasterization and scan code consume are
//! extracted. Positions and contour points stay in millimetres here; the
//! conversion to canonical centimetres happens in [`crate::coordinate_frame`].

use std::path::Path;

use dicom::core::Tag;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject, OpenFileOptions};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use log::{debug, warn};
use ndarray::{Array3, s};

use crate::coordinate_frame::PlaneGeometry;
use crate::enums::Modality;
use crate::scan_index::{BeamRecord, ScanRecord};
use crate::volume_loader::LoaderError;

pub type DicomFile = FileDicomObject<InMemDicomObject>;

/// Color given to ROIs without `ROIDisplayColor`.
pub const DEFAULT_ROI_COLOR: [u8; 3] = [255, 0, 0];

#[derive(Clone, Debug, PartialEq)]
pub struct ImageHeader {
    pub plane: PlaneGeometry,
    pub slice_thickness: Option<f64>,
    pub modality: Modality,
    pub frame_of_reference_uid: String,
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DoseHeader {
    pub plane: PlaneGeometry,
    /// `GridFrameOffsetVector`, one entry per frame
    pub frame_offsets: Vec<f64>,
    pub slice_thickness: Option<f64>,
    pub dose_grid_scaling: f64,
    pub frame_of_reference_uid: String,
}

/// Contours of one ROI, points in millimetres.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoiContours {
    pub number: i32,
    pub name: String,
    pub color: [u8; 3],
    pub frame_of_reference_uid: String,
    pub contours: Vec<Vec<[f64; 3]>>,
}

fn element(obj: &InMemDicomObject, tag: Tag) -> Option<&InMemElement> {
    obj.element(tag).ok()
}

fn items(obj: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    element(obj, tag).and_then(|e| e.items()).unwrap_or(&[])
}

fn optional_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = element(obj, tag)?.to_str().ok()?;
    let value = value.trim_end_matches('\0').trim();
    (!value.is_empty()).then(|| value.to_owned())
}

fn string(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<String, LoaderError> {
    optional_string(obj, tag).ok_or(LoaderError::MissingTag(name))
}

fn optional_float(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    element(obj, tag)?.to_float64().ok()
}

fn optional_int(obj: &InMemDicomObject, tag: Tag) -> Option<i32> {
    element(obj, tag)?.to_int::<i32>().ok()
}

fn floats(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Vec<f64>, LoaderError> {
    element(obj, tag)
        .ok_or(LoaderError::MissingTag(name))?
        .to_multi_float64()
        .map_err(|_| LoaderError::InvalidTag(name))
}

fn float_array<const N: usize>(
    obj: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<[f64; N], LoaderError> {
    floats(obj, tag, name)?
        .try_into()
        .map_err(|_| LoaderError::InvalidTag(name))
}

fn unsigned(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<usize, LoaderError> {
    element(obj, tag)
        .ok_or(LoaderError::MissingTag(name))?
        .to_int::<u32>()
        .map(|v| v as usize)
        .map_err(|_| LoaderError::InvalidTag(name))
}

pub fn plane_geometry(obj: &InMemDicomObject) -> Result<PlaneGeometry, LoaderError> {
    Ok(PlaneGeometry {
        orientation: float_array(obj, tags::IMAGE_ORIENTATION_PATIENT, "ImageOrientationPatient")?,
        position: float_array(obj, tags::IMAGE_POSITION_PATIENT, "ImagePositionPatient")?,
        pixel_spacing: float_array(obj, tags::PIXEL_SPACING, "PixelSpacing")?,
        rows: unsigned(obj, tags::ROWS, "Rows")?,
        columns: unsigned(obj, tags::COLUMNS, "Columns")?,
    })
}

pub fn image_header(obj: &InMemDicomObject) -> Result<ImageHeader, LoaderError> {
    Ok(ImageHeader {
        plane: plane_geometry(obj)?,
        slice_thickness: optional_float(obj, tags::SLICE_THICKNESS),
        modality: Modality::from_code(&string(obj, tags::MODALITY, "Modality")?),
        frame_of_reference_uid: optional_string(obj, tags::FRAME_OF_REFERENCE_UID)
            .unwrap_or_default(),
        rescale_slope: optional_float(obj, tags::RESCALE_SLOPE).unwrap_or(1.0),
        rescale_intercept: optional_float(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
    })
}

pub fn dose_header(obj: &InMemDicomObject) -> Result<DoseHeader, LoaderError> {
    let frame_offsets = match element(obj, tags::GRID_FRAME_OFFSET_VECTOR) {
        Some(_) => floats(obj, tags::GRID_FRAME_OFFSET_VECTOR, "GridFrameOffsetVector")?,
        None if optional_int(obj, tags::NUMBER_OF_FRAMES).unwrap_or(1) == 1 => vec![0.0],
        None => return Err(LoaderError::MissingTag("GridFrameOffsetVector")),
    };
    let dose_grid_scaling = optional_float(obj, tags::DOSE_GRID_SCALING).unwrap_or_else(|| {
        warn!("DoseGridScaling missing, assuming 1.0");
        1.0
    });

    Ok(DoseHeader {
        plane: plane_geometry(obj)?,
        frame_offsets,
        slice_thickness: optional_float(obj, tags::SLICE_THICKNESS),
        dose_grid_scaling,
        frame_of_reference_uid: optional_string(obj, tags::FRAME_OF_REFERENCE_UID)
            .unwrap_or_default(),
    })
}

/// ROIs of a structure set in `StructureSetROISequence` order.
pub fn roi_contours(obj: &InMemDicomObject) -> Result<Vec<RoiContours>, LoaderError> {
    element(obj, tags::STRUCTURE_SET_ROI_SEQUENCE)
        .ok_or(LoaderError::MissingTag("StructureSetROISequence"))?;

    let mut rois: Vec<RoiContours> = items(obj, tags::STRUCTURE_SET_ROI_SEQUENCE)
        .iter()
        .filter_map(|item| {
            let Some(number) = optional_int(item, tags::ROI_NUMBER) else {
                warn!("skipping ROI without ROINumber");
                return None;
            };
            Some(RoiContours {
                number,
                name: optional_string(item, tags::ROI_NAME)
                    .unwrap_or_else(|| format!("ROI {number}")),
                color: DEFAULT_ROI_COLOR,
                frame_of_reference_uid: optional_string(
                    item,
                    tags::REFERENCED_FRAME_OF_REFERENCE_UID,
                )
                .unwrap_or_default(),
                contours: Vec::new(),
            })
        })
        .collect();

    for item in items(obj, tags::ROI_CONTOUR_SEQUENCE) {
        let number = optional_int(item, tags::REFERENCED_ROI_NUMBER);
        let Some(roi) = rois.iter_mut().find(|roi| Some(roi.number) == number) else {
            warn!("contours reference unknown ROI {number:?}");
            continue;
        };
        if let Some(color) = element(item, tags::ROI_DISPLAY_COLOR)
            .and_then(|e| e.to_multi_int::<i32>().ok())
            .and_then(|c| <[i32; 3]>::try_from(c).ok())
        {
            roi.color = color.map(|c| c.clamp(0, 255) as u8);
        }
        for contour in items(item, tags::CONTOUR_SEQUENCE) {
            let data = element(contour, tags::CONTOUR_DATA)
                .and_then(|e| e.to_multi_float64().ok())
                .unwrap_or_default();
            if data.len() % 3 != 0 {
                warn!(
                    "ROI '{}': ContourData length {} is not a multiple of 3",
                    roi.name,
                    data.len()
                );
            }
            roi.contours.push(
                data.chunks_exact(3)
                    .map(|p| [p[0], p[1], p[2]])
                    .collect(),
            );
        }
    }
    Ok(rois)
}

pub fn scan_record(obj: &InMemDicomObject, path: &Path) -> Result<ScanRecord, LoaderError> {
    let modality = Modality::from_code(&string(obj, tags::MODALITY, "Modality")?);

    let frame_of_reference_uid = optional_string(obj, tags::FRAME_OF_REFERENCE_UID).or_else(|| {
        items(obj, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
            .first()
            .and_then(|item| optional_string(item, tags::FRAME_OF_REFERENCE_UID))
    });

    let plan_reference = items(obj, tags::REFERENCED_RT_PLAN_SEQUENCE).first();
    let referenced_plan_uid =
        plan_reference.and_then(|item| optional_string(item, tags::REFERENCED_SOP_INSTANCE_UID));
    let referenced_beam_number = plan_reference
        .and_then(|item| items(item, tags::REFERENCED_FRACTION_GROUP_SEQUENCE).first())
        .and_then(|item| items(item, tags::REFERENCED_BEAM_SEQUENCE).first())
        .and_then(|item| optional_int(item, tags::REFERENCED_BEAM_NUMBER));

    let beams = items(obj, tags::BEAM_SEQUENCE)
        .iter()
        .filter_map(|beam| {
            Some(BeamRecord {
                number: optional_int(beam, tags::BEAM_NUMBER)?,
                name: optional_string(beam, tags::BEAM_NAME),
                machine: optional_string(beam, tags::TREATMENT_MACHINE_NAME),
                energy: items(beam, tags::CONTROL_POINT_SEQUENCE)
                    .first()
                    .and_then(|cp| optional_float(cp, tags::NOMINAL_BEAM_ENERGY)),
            })
        })
        .collect();

    Ok(ScanRecord {
        path: path.to_path_buf(),
        modality,
        sop_instance_uid: string(obj, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        study_instance_uid: string(obj, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
        series_instance_uid: optional_string(obj, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
        frame_of_reference_uid,
        referenced_plan_uid,
        referenced_beam_number,
        beams,
    })
}

/// Read the header of `path`, stopping before the pixel data.
pub fn scan_file(path: &Path) -> Result<ScanRecord, LoaderError> {
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)?;
    debug!("scanned {}", path.display());
    scan_record(&obj, path)
}

/// Raw stored values of every frame, shape `(frames, rows, columns)`.
pub fn decode_frames(obj: &DicomFile) -> Result<Array3<f32>, LoaderError> {
    let pixel_data = obj
        .decode_pixel_data()
        .map_err(|e| LoaderError::PixelData(e.to_string()))?;
    let options = ConvertOptions::new()
        .with_modality_lut(ModalityLutOption::None)
        .with_voi_lut(VoiLutOption::Identity);
    pixel_data
        .to_ndarray_with_options::<f32>(&options)
        .map(|arr| arr.slice_move(s![.., .., .., 0]))
        .map_err(|e| LoaderError::PixelData(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};

    fn image_object() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
            ),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                dicom_value!(Strs, ["-250.0", "-250.0", "12.5"]),
            ),
            DataElement::new(
                tags::PIXEL_SPACING,
                VR::DS,
                dicom_value!(Strs, ["0.9765625", "0.9765625"]),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(512_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(512_u16)),
            DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2.5")),
            DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from("-1024")),
            DataElement::new(
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                PrimitiveValue::from("1.2.3\0"),
            ),
        ])
    }

    #[test]
    fn reads_image_header() {
        let header = image_header(&image_object()).unwrap();
        assert_eq!(header.modality, Modality::Ct);
        assert_eq!(header.plane.orientation, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(header.plane.position, [-250.0, -250.0, 12.5]);
        assert_eq!(header.plane.rows, 512);
        assert_eq!(header.slice_thickness, Some(2.5));
        assert_eq!(header.rescale_slope, 1.0);
        assert_eq!(header.rescale_intercept, -1024.0);
        assert_eq!(header.frame_of_reference_uid, "1.2.3");
    }

    #[test]
    fn missing_geometry_is_reported() {
        let mut obj = image_object();
        obj.remove_element(tags::PIXEL_SPACING);
        assert!(matches!(
            image_header(&obj),
            Err(LoaderError::MissingTag("PixelSpacing"))
        ));
    }

    fn dose_object(frames: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
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
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(2_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(3_u16)),
            DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, PrimitiveValue::from(frames)),
        ])
    }

    #[test]
    fn reads_dose_header() {
        let mut obj = dose_object("3");
        obj.put(DataElement::new(
            tags::GRID_FRAME_OFFSET_VECTOR,
            VR::DS,
            dicom_value!(Strs, ["0", "-5", "-10"]),
        ));
        obj.put(DataElement::new(
            tags::DOSE_GRID_SCALING,
            VR::DS,
            PrimitiveValue::from("0.5"),
        ));

        let header = dose_header(&obj).unwrap();
        assert_eq!(header.frame_offsets, vec![0.0, -5.0, -10.0]);
        assert_eq!(header.dose_grid_scaling, 0.5);
        assert_eq!(header.plane.pixel_spacing, [2.0, 1.0]);
        assert_eq!((header.plane.rows, header.plane.columns), (2, 3));
        assert_eq!(header.slice_thickness, None);
    }

    #[test]
    fn single_frame_dose_defaults() {
        let header = dose_header(&dose_object("1")).unwrap();
        assert_eq!(header.frame_offsets, vec![0.0]);
        assert_eq!(header.dose_grid_scaling, 1.0);
    }

    #[test]
    fn multi_frame_dose_needs_offsets() {
        assert!(matches!(
            dose_header(&dose_object("3")),
            Err(LoaderError::MissingTag("GridFrameOffsetVector"))
        ));
    }

    #[test]
    fn reads_structure_set_rois() {
        let roi = InMemDicomObject::from_element_iter([
            DataElement::new(tags::ROI_NUMBER, VR::IS, PrimitiveValue::from("4")),
            DataElement::new(tags::ROI_NAME, VR::LO, PrimitiveValue::from("PTV ")),
            DataElement::new(
                tags::REFERENCED_FRAME_OF_REFERENCE_UID,
                VR::UI,
                PrimitiveValue::from("1.2.3"),
            ),
        ]);
        let contour = InMemDicomObject::from_element_iter([DataElement::new(
            tags::CONTOUR_DATA,
            VR::DS,
            dicom_value!(Strs, ["0", "0", "5", "10", "0", "5", "10", "10", "5"]),
        )]);
        let roi_contour = InMemDicomObject::from_element_iter([
            DataElement::new(tags::REFERENCED_ROI_NUMBER, VR::IS, PrimitiveValue::from("4")),
            DataElement::new(
                tags::ROI_DISPLAY_COLOR,
                VR::IS,
                dicom_value!(Strs, ["0", "128", "300"]),
            ),
            DataElement::new(
                tags::CONTOUR_SEQUENCE,
                VR::SQ,
                dicom::core::value::DataSetSequence::from(vec![contour]),
            ),
        ]);
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::STRUCTURE_SET_ROI_SEQUENCE,
                VR::SQ,
                dicom::core::value::DataSetSequence::from(vec![roi]),
            ),
            DataElement::new(
                tags::ROI_CONTOUR_SEQUENCE,
                VR::SQ,
                dicom::core::value::DataSetSequence::from(vec![roi_contour]),
            ),
        ]);

        let rois = roi_contours(&obj).unwrap();
        assert_eq!(rois.len(), 1);
        assert_eq!(rois[0].name, "PTV");
        assert_eq!(rois[0].color, [0, 128, 255]);
        assert_eq!(rois[0].frame_of_reference_uid, "1.2.3");
        assert_eq!(
            rois[0].contours,
            vec![vec![[0.0, 0.0, 5.0], [10.0, 0.0, 5.0], [10.0, 10.0, 5.0]]]
        );
    }

    #[test]
    fn scan_record_links_dose_to_plan_beam() {
        let beam_ref = InMemDicomObject::from_element_iter([DataElement::new(
            tags::REFERENCED_BEAM_NUMBER,
            VR::IS,
            PrimitiveValue::from("2"),
        )]);
        let fraction_group = InMemDicomObject::from_element_iter([DataElement::new(
            tags::REFERENCED_BEAM_SEQUENCE,
            VR::SQ,
            dicom::core::value::DataSetSequence::from(vec![beam_ref]),
        )]);
        let plan_ref = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::REFERENCED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from("9.8.7"),
            ),
            DataElement::new(
                tags::REFERENCED_FRACTION_GROUP_SEQUENCE,
                VR::SQ,
                dicom::core::value::DataSetSequence::from(vec![fraction_group]),
            ),
        ]);
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("RTDOSE")),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.1")),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.0")),
            DataElement::new(
                tags::REFERENCED_RT_PLAN_SEQUENCE,
                VR::SQ,
                dicom::core::value::DataSetSequence::from(vec![plan_ref]),
            ),
        ]);

        let record = scan_record(&obj, Path::new("dose.dcm")).unwrap();
        assert_eq!(record.modality, Modality::RtDose);
        assert_eq!(record.referenced_plan_uid.as_deref(), Some("9.8.7"));
        assert_eq!(record.referenced_beam_number, Some(2));
        assert!(record.frame_of_reference_uid.is_none());
    }
}
