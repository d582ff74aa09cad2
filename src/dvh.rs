//! Cumulative dose-volume histograms.

use log::{info, warn};
use ndarray::Zip;
use thiserror::Error;

use crate::enums::Processor;
use crate::interpolator::ResampleError;
use crate::resampler::VolumeResampler;
use crate::structure::Structure;
use crate::volume::Volume;

/// Histogram bins; the dose axis has one more row.
pub const DEFAULT_BINS: usize = 1000;

#[derive(Debug, Error)]
pub enum DvhError {
    #[error("empty dose array: maximum dose is {0}")]
    EmptyDose(f32),

    #[error("number of bins must be positive")]
    InvalidBins,

    #[error(transparent)]
    Resample(#[from] ResampleError),
}

#[derive(Clone, Copy, Debug)]
pub struct DvhOptions {
    pub nbins: usize,
    pub processor: Processor,
}

impl Default for DvhOptions {
    fn default() -> Self {
        Self {
            nbins: DEFAULT_BINS,
            processor: Processor::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DoseStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub voxels: usize,
}

/// Percent-volume column of one structure.
#[derive(Clone, Debug, PartialEq)]
pub struct DvhColumn {
    pub name: String,
    /// Position of the structure in the input slice.
    pub index: usize,
    pub volume_cc: f64,
    pub percent_volume: Vec<f64>,
    pub statistics: DoseStatistics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagReason {
    /// No dose sample falls inside the mask.
    NoMaskedSamples,
    /// The structure was rasterized on a grid other than the first structure's.
    GridMismatch,
}

/// Structure that produced no column.
#[derive(Clone, Debug, PartialEq)]
pub struct FlaggedStructure {
    pub name: String,
    pub index: usize,
    pub reason: FlagReason,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DvhCurve {
    /// Dose in Gy, `nbins + 1` values from 0 to the maximum dose.
    pub dose_axis: Vec<f64>,
    pub columns: Vec<DvhColumn>,
    pub flagged: Vec<FlaggedStructure>,
}

impl DvhCurve {
    pub fn max_dose(&self) -> f64 {
        self.dose_axis.last().copied().unwrap_or(0.0)
    }

    pub fn column(&self, name: &str) -> Option<&DvhColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Highest dose on the axis still received by at least `percent` of the
    /// structure (D<sub>x</sub>).
    pub fn dose_at_volume(&self, column: &DvhColumn, percent: f64) -> f64 {
        self.dose_axis
            .iter()
            .zip(&column.percent_volume)
            .take_while(|&(_, &volume)| volume >= percent)
            .last()
            .map_or(0.0, |(&dose, _)| dose)
    }

    /// Percent of the structure receiving at least `dose` (V<sub>x</sub>),
    /// read at the first bin at or above `dose`.
    pub fn volume_at_dose(&self, column: &DvhColumn, dose: f64) -> f64 {
        let bin = self.dose_axis.partition_point(|&d| d < dose);
        column.percent_volume.get(bin).copied().unwrap_or(0.0)
    }
}

pub struct DvhEngine;

impl DvhEngine {
    /// Compute one cumulative DVH per structure against `dose`.
    ///
    /// When the dose grid differs from the structures' grid the dose is
    /// resampled first with the strategy selected by `options.processor`.
    ///
    /// # Errors
    ///
    /// Fails when the (aligned) dose has no positive sample or when
    /// resampling fails on every strategy.
    pub fn compute(
        dose: &Volume,
        structures: &[Structure],
        options: &DvhOptions,
    ) -> Result<DvhCurve, DvhError> {
        if options.nbins == 0 {
            return Err(DvhError::InvalidBins);
        }

        let aligned = match structures.first() {
            Some(first) if !dose.grid().matches(first.grid()) => {
                info!("resampling dose onto the structure grid");
                VolumeResampler::new(options.processor).resample(dose, first.grid())?
            }
            _ => dose.clone(),
        };
        Self::compute_aligned(&aligned, structures, options.nbins)
    }

    /// Like [`DvhEngine::compute`] for a dose already on the structure grid.
    pub fn compute_aligned(
        dose: &Volume,
        structures: &[Structure],
        nbins: usize,
    ) -> Result<DvhCurve, DvhError> {
        if nbins == 0 {
            return Err(DvhError::InvalidBins);
        }
        let max_dose = dose.max_value();
        if !(max_dose > 0.0) {
            return Err(DvhError::EmptyDose(max_dose));
        }

        let max_dose = f64::from(max_dose);
        let dose_axis: Vec<f64> = (0..=nbins)
            .map(|bin| max_dose * (bin as f64 / nbins as f64))
            .collect();

        let mut columns = Vec::new();
        let mut flagged = Vec::new();
        for (index, structure) in structures.iter().enumerate() {
            let flag = |reason| FlaggedStructure {
                name: structure.name().to_owned(),
                index,
                reason,
            };

            if !structure.grid().matches(dose.grid()) {
                warn!("structure '{}' is not on the dose grid", structure.name());
                flagged.push(flag(FlagReason::GridMismatch));
                continue;
            }

            let mut samples = Self::masked_samples(dose, structure);
            if samples.is_empty() {
                warn!("structure '{}' has no dose samples", structure.name());
                flagged.push(flag(FlagReason::NoMaskedSamples));
                continue;
            }
            samples.sort_by(f64::total_cmp);

            columns.push(DvhColumn {
                name: structure.name().to_owned(),
                index,
                volume_cc: structure.volume_cc(),
                percent_volume: Self::cumulative(&samples, &dose_axis),
                statistics: Self::statistics(&samples),
            });
        }

        Ok(DvhCurve {
            dose_axis,
            columns,
            flagged,
        })
    }

    /// Dose samples inside the mask, zero-dose voxels included.
    fn masked_samples(dose: &Volume, structure: &Structure) -> Vec<f64> {
        let mut samples = Vec::with_capacity(structure.voxel_count());
        Zip::from(dose.data())
            .and(structure.mask())
            .for_each(|&value, &inside| {
                if inside {
                    samples.push(f64::from(value));
                }
            });
        samples
    }

    /// `100 * #(samples >= d) / #samples` for every `d` on the axis.
    /// `sorted` must be ascending and non-empty.
    pub fn cumulative(sorted: &[f64], dose_axis: &[f64]) -> Vec<f64> {
        let total = sorted.len() as f64;
        dose_axis
            .iter()
            .map(|&dose| {
                let below = sorted.partition_point(|&sample| sample < dose);
                100.0 * (sorted.len() - below) as f64 / total
            })
            .collect()
    }

    fn statistics(sorted: &[f64]) -> DoseStatistics {
        DoseStatistics {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            voxels: sorted.len(),
        }
    }
}
