use approx::assert_relative_eq;
use dicom_rt_volume::{
    ContourRasterizer, ContourSet, DvhEngine, DvhOptions, DvhWriter, Grid, Modality,
    RasterizeOptions, Volume,
};
use ndarray::Array3;

const FRAME: &str = "1.2.840.10008.1";

fn image() -> Volume {
    let grid = Grid::new([0.0; 3], [1.0; 3], [10, 10, 10]);
    Volume::new(grid, Array3::zeros((10, 10, 10)))
        .unwrap()
        .with_modality(Modality::Ct)
        .with_frame_of_reference(FRAME)
}

fn square(low: f64, high: f64, z: f64) -> Vec<[f64; 3]> {
    vec![[low, low, z], [high, low, z], [high, high, z], [low, high, z]]
}

fn contour_sets() -> Vec<ContourSet> {
    vec![
        ContourSet {
            number: 1,
            name: "PTV".to_owned(),
            color: [255, 0, 0],
            frame_of_reference_uid: FRAME.to_owned(),
            curves: vec![square(3.5, 5.5, 4.0), square(3.5, 5.5, 5.0)],
        },
        ContourSet {
            number: 2,
            name: "Elsewhere".to_owned(),
            color: [0, 255, 0],
            frame_of_reference_uid: "9.9.9".to_owned(),
            curves: vec![square(1.5, 2.5, 1.0)],
        },
    ]
}

#[test]
fn constant_dose_covers_whole_structure() {
    let image = image();
    let structures =
        ContourRasterizer::rasterize_all(&contour_sets(), &image, &RasterizeOptions::default());
    assert_eq!(structures.len(), 1);
    assert_eq!(structures[0].voxel_count(), 8);
    assert_relative_eq!(structures[0].volume_cc(), 8.0);

    let dose = Volume::new(image.grid().clone(), Array3::from_elem((10, 10, 10), 2.0))
        .unwrap()
        .with_modality(Modality::RtDose);
    let curve = DvhEngine::compute(&dose, &structures, &DvhOptions::default()).unwrap();

    assert_eq!(curve.dose_axis.len(), 1001);
    assert_relative_eq!(curve.max_dose(), 2.0);
    let ptv = curve.column("PTV").unwrap();
    assert!(ptv.percent_volume.iter().all(|&v| v == 100.0));
    assert_relative_eq!(ptv.statistics.mean, 2.0);

    let mut buffer = Vec::new();
    DvhWriter::write(&curve, "rtdose.dcm", &mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2 + 1001);
    assert_eq!(lines[1], "Dose (Gy),PTV (0)(volume: 8.00)");
    assert_eq!(lines[1002], "2,100.0000");
}

#[test]
fn override_keeps_foreign_frame_structures() {
    let options = RasterizeOptions {
        override_frame_of_reference: true,
    };
    let structures = ContourRasterizer::rasterize_all(&contour_sets(), &image(), &options);
    let names: Vec<&str> = structures.iter().map(|s| s.name()).collect();
    assert_eq!(names, ["PTV", "Elsewhere"]);
    assert_eq!(structures[1].voxel_count(), 1);
}

#[test]
fn coarse_dose_is_resampled_onto_structure_grid() {
    let image = image();
    let structures =
        ContourRasterizer::rasterize_all(&contour_sets(), &image, &RasterizeOptions::default());

    let coarse = Grid::new([-0.5; 3], [2.0; 3], [6, 6, 6]);
    let dose = Volume::new(coarse, Array3::from_elem((6, 6, 6), 3.0))
        .unwrap()
        .with_modality(Modality::RtDose)
        .with_frame_of_reference(FRAME);
    let curve = DvhEngine::compute(&dose, &structures, &DvhOptions::default()).unwrap();

    assert!(curve.flagged.is_empty());
    assert_relative_eq!(curve.max_dose(), 3.0, max_relative = 1e-5);
    let ptv = curve.column("PTV").unwrap();
    assert_eq!(ptv.percent_volume[0], 100.0);
    assert_eq!(curve.volume_at_dose(ptv, 0.99 * curve.max_dose()), 100.0);
}
