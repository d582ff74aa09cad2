//! Study assembly from per-file metadata.
//!
//! Records are keyed by SOP instance UID in ordered maps, so the resolved
//! index is the same whatever order the files were read in. Links that cannot
//! be resolved (a dose without its plan, a beam number missing from the plan,
//! a structure set without an image series) stay `None`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::warn;
use rayon::prelude::*;
use serde::Serialize;

use crate::enums::Modality;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BeamRecord {
    pub number: i32,
    pub name: Option<String>,
    pub machine: Option<String>,
    /// Nominal energy of the first control point, MV or MeV.
    pub energy: Option<f64>,
}

/// Metadata extracted from one file, no pixel data.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanRecord {
    pub path: PathBuf,
    pub modality: Modality,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub frame_of_reference_uid: Option<String>,
    /// RTDOSE: referenced RTPLAN SOP instance
    pub referenced_plan_uid: Option<String>,
    /// RTDOSE: beam the dose was calculated for
    pub referenced_beam_number: Option<i32>,
    /// RTPLAN: beams of the plan
    pub beams: Vec<BeamRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageSeries {
    pub series_instance_uid: String,
    pub modality: Modality,
    pub frame_of_reference_uid: Option<String>,
    /// Sorted paths of the slices
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanEntry {
    pub sop_instance_uid: String,
    pub path: PathBuf,
    pub frame_of_reference_uid: Option<String>,
    pub beams: Vec<BeamRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DoseEntry {
    pub sop_instance_uid: String,
    pub path: PathBuf,
    pub frame_of_reference_uid: Option<String>,
    pub plan_uid: Option<String>,
    pub beam: Option<BeamRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StructureSetEntry {
    pub sop_instance_uid: String,
    pub path: PathBuf,
    pub frame_of_reference_uid: Option<String>,
    /// Image series sharing the frame of reference
    pub image_series_uid: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Study {
    pub study_instance_uid: String,
    pub image_series: Vec<ImageSeries>,
    pub plans: Vec<PlanEntry>,
    pub doses: Vec<DoseEntry>,
    pub structure_sets: Vec<StructureSetEntry>,
}

impl Study {
    /// Image series acquired in `frame_of_reference_uid`.
    pub fn image_series_for_frame(&self, frame_of_reference_uid: &str) -> Vec<&ImageSeries> {
        self.image_series
            .iter()
            .filter(|s| s.frame_of_reference_uid.as_deref() == Some(frame_of_reference_uid))
            .collect()
    }

    pub fn image_series(&self, series_instance_uid: &str) -> Option<&ImageSeries> {
        self.image_series
            .iter()
            .find(|s| s.series_instance_uid == series_instance_uid)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScanIndex {
    pub studies: BTreeMap<String, Study>,
}

impl ScanIndex {
    /// Read the metadata of every file in parallel, skipping unreadable ones.
    pub fn from_files(paths: &[PathBuf]) -> Self {
        let records: Vec<ScanRecord> = paths
            .par_iter()
            .filter_map(|path| match crate::dicom_source::scan_file(path) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!("skipping {}: {err}", path.display());
                    None
                }
            })
            .collect();
        Self::build(records)
    }

    pub fn build(records: impl IntoIterator<Item = ScanRecord>) -> Self {
        // First pass: one record per SOP instance, independent of input order.
        let mut by_uid: BTreeMap<String, ScanRecord> = BTreeMap::new();
        for record in records {
            match by_uid.get(&record.sop_instance_uid) {
                Some(existing) if existing.path <= record.path => {
                    warn!(
                        "duplicate SOP instance {} in {}, keeping {}",
                        record.sop_instance_uid,
                        record.path.display(),
                        existing.path.display()
                    );
                }
                _ => {
                    by_uid.insert(record.sop_instance_uid.clone(), record);
                }
            }
        }

        let mut studies: BTreeMap<String, Study> = BTreeMap::new();
        let mut series: BTreeMap<(String, String), ImageSeries> = BTreeMap::new();
        for record in by_uid.values() {
            let study = studies
                .entry(record.study_instance_uid.clone())
                .or_insert_with(|| Study {
                    study_instance_uid: record.study_instance_uid.clone(),
                    ..Study::default()
                });
            match record.modality {
                Modality::Ct | Modality::Mr => {
                    let key = (
                        record.study_instance_uid.clone(),
                        record.series_instance_uid.clone(),
                    );
                    series
                        .entry(key)
                        .or_insert_with(|| ImageSeries {
                            series_instance_uid: record.series_instance_uid.clone(),
                            modality: record.modality.clone(),
                            frame_of_reference_uid: record.frame_of_reference_uid.clone(),
                            files: Vec::new(),
                        })
                        .files
                        .push(record.path.clone());
                }
                Modality::RtPlan => study.plans.push(PlanEntry {
                    sop_instance_uid: record.sop_instance_uid.clone(),
                    path: record.path.clone(),
                    frame_of_reference_uid: record.frame_of_reference_uid.clone(),
                    beams: record.beams.clone(),
                }),
                Modality::RtDose => study.doses.push(DoseEntry {
                    sop_instance_uid: record.sop_instance_uid.clone(),
                    path: record.path.clone(),
                    frame_of_reference_uid: record.frame_of_reference_uid.clone(),
                    plan_uid: None,
                    beam: None,
                }),
                Modality::RtStruct => study.structure_sets.push(StructureSetEntry {
                    sop_instance_uid: record.sop_instance_uid.clone(),
                    path: record.path.clone(),
                    frame_of_reference_uid: record.frame_of_reference_uid.clone(),
                    image_series_uid: None,
                }),
                _ => {}
            }
        }

        for ((study_uid, _), mut image_series) in series {
            image_series.files.sort();
            if let Some(study) = studies.get_mut(&study_uid) {
                study.image_series.push(image_series);
            }
        }

        // Second pass: cross references.
        for study in studies.values_mut() {
            Self::resolve_doses(study, &by_uid);
            Self::resolve_structure_sets(study);
        }

        Self { studies }
    }

    fn resolve_doses(study: &mut Study, by_uid: &BTreeMap<String, ScanRecord>) {
        for dose in &mut study.doses {
            let Some(record) = by_uid.get(&dose.sop_instance_uid) else {
                continue;
            };
            let Some(plan_uid) = &record.referenced_plan_uid else {
                warn!("dose {} references no plan", dose.path.display());
                continue;
            };
            let Some(plan) = by_uid
                .get(plan_uid)
                .filter(|plan| plan.modality == Modality::RtPlan)
            else {
                warn!(
                    "dose {} references plan {plan_uid} which was not found",
                    dose.path.display()
                );
                continue;
            };
            dose.plan_uid = Some(plan.sop_instance_uid.clone());

            if let Some(number) = record.referenced_beam_number {
                dose.beam = plan.beams.iter().find(|b| b.number == number).cloned();
                if dose.beam.is_none() {
                    warn!(
                        "dose {} references beam {number} missing from plan {plan_uid}",
                        dose.path.display()
                    );
                }
            }
        }
    }

    fn resolve_structure_sets(study: &mut Study) {
        for index in 0..study.structure_sets.len() {
            let Some(frame) = study.structure_sets[index].frame_of_reference_uid.clone() else {
                warn!(
                    "structure set {} has no frame of reference",
                    study.structure_sets[index].path.display()
                );
                continue;
            };
            let series_uid = study
                .image_series_for_frame(&frame)
                .first()
                .map(|s| s.series_instance_uid.clone());
            if series_uid.is_none() {
                warn!(
                    "structure set {} has no image series in frame {frame}",
                    study.structure_sets[index].path.display()
                );
            }
            study.structure_sets[index].image_series_uid = series_uid;
        }
    }

    pub fn study(&self, study_instance_uid: &str) -> Option<&Study> {
        self.studies.get(study_instance_uid)
    }

    /// Studies that hold at least one dose and one structure set.
    pub fn complete_studies(&self) -> impl Iterator<Item = &Study> {
        self.studies
            .values()
            .filter(|s| !s.doses.is_empty() && !s.structure_sets.is_empty())
    }

    /// Whether `path` ended up in the index.
    pub fn contains_path(&self, path: &Path) -> bool {
        self.studies.values().any(|study| {
            study.image_series.iter().any(|s| s.files.iter().any(|f| f == path))
                || study.plans.iter().any(|p| p.path == path)
                || study.doses.iter().any(|d| d.path == path)
                || study.structure_sets.iter().any(|s| s.path == path)
        })
    }
}
