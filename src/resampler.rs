use log::{debug, warn};
use web_time::Instant;

use crate::enums::Processor;
use crate::gpu_interpolator::GpuInterpolator;
use crate::interpolator::{CpuInterpolator, ResampleError, SampleMesh, TrilinearInterpolator};
use crate::volume::{Grid, Volume};

/// Moves a volume's samples onto another grid.
///
/// Strategies are tried in order; a failing one is logged and the next one
/// runs. The CPU interpolator always closes the list.
pub struct VolumeResampler {
    strategies: Vec<Box<dyn TrilinearInterpolator>>,
}

impl Default for VolumeResampler {
    fn default() -> Self {
        Self::new(Processor::Cpu)
    }
}

impl VolumeResampler {
    pub fn new(processor: Processor) -> Self {
        let mut strategies: Vec<Box<dyn TrilinearInterpolator>> = Vec::new();
        if processor == Processor::Gpu {
            match futures::executor::block_on(GpuInterpolator::new()) {
                Ok(gpu) => strategies.push(Box::new(gpu)),
                Err(err) => warn!("GPU interpolation unavailable, using the CPU: {err}"),
            }
        }
        strategies.push(Box::new(CpuInterpolator));
        Self { strategies }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn TrilinearInterpolator>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resample `source` onto `target`; samples outside the source are 0.
    ///
    /// # Errors
    ///
    /// Returns the last strategy's error when every strategy failed.
    pub fn resample(&self, source: &Volume, target: &Grid) -> Result<Volume, ResampleError> {
        if source.grid().matches(target) {
            debug!("grids already match, skipping resampling");
            return Ok(source.derive(target.clone(), source.data().clone())?);
        }

        let mesh = SampleMesh::between(source.grid(), target);
        let mut last_error = None;
        for strategy in &self.strategies {
            let started = Instant::now();
            match strategy.interpolate(source.data().view(), &mesh) {
                Ok(data) => {
                    debug!(
                        "{} resampled {:?} onto {:?} in {:?}",
                        strategy.name(),
                        source.grid().dimensions,
                        target.dimensions,
                        started.elapsed()
                    );
                    return Ok(source.derive(target.clone(), data)?);
                }
                Err(err) => {
                    warn!("{} interpolation failed: {err}", strategy.name());
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(ResampleError::NoStrategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, ArrayView3};

    struct FailingInterpolator;

    impl TrilinearInterpolator for FailingInterpolator {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn interpolate(
            &self,
            _source: ArrayView3<'_, f32>,
            _mesh: &SampleMesh,
        ) -> Result<Array3<f32>, ResampleError> {
            Err(ResampleError::Execution("device lost".to_owned()))
        }
    }

    fn linear_volume() -> Volume {
        let grid = Grid::new([0.0, 0.0, 0.0], [1.0, 1.0, 2.0], [6, 6, 4]);
        let data = Array3::from_shape_fn((6, 6, 4), |(x, y, z)| {
            x as f32 + 2.0 * y as f32 + 6.0 * z as f32
        });
        Volume::new(grid, data)
            .unwrap()
            .with_frame_of_reference("1.2.3")
    }

    #[test]
    fn identical_grid_is_identity() {
        let volume = linear_volume();
        let resampled = VolumeResampler::default()
            .resample(&volume, volume.grid())
            .unwrap();
        assert_eq!(resampled.data(), volume.data());
        assert_eq!(resampled.frame_of_reference_uid(), "1.2.3");
    }

    #[test]
    fn finer_grid_reproduces_linear_field() {
        let volume = linear_volume();
        let target = Grid::new([0.5, 1.0, 1.0], [0.5, 0.5, 1.0], [8, 6, 5]);
        let resampled = VolumeResampler::default().resample(&volume, &target).unwrap();

        for ((i, j, k), value) in resampled.data().indexed_iter() {
            let x = target.center(0, i);
            let y = target.center(1, j);
            let z = target.center(2, k);
            // Source value at (x, y, z) cm: x + 2y + 6 (z / 2)
            assert_abs_diff_eq!(*value as f64, x + 2.0 * y + 3.0 * z, epsilon = 1e-4);
        }
    }

    #[test]
    fn outside_extent_is_zero() {
        let volume = linear_volume();
        let target = Grid::new([-2.0, 0.0, 0.0], [1.0, 1.0, 2.0], [3, 1, 1]);
        let resampled = VolumeResampler::default().resample(&volume, &target).unwrap();
        assert_eq!(resampled.data()[[0, 0, 0]], 0.0);
        assert_eq!(resampled.data()[[1, 0, 0]], 0.0);
        assert_eq!(resampled.data()[[2, 0, 0]], 0.0);

        let target = Grid::new([4.0, 0.0, 0.0], [1.0, 1.0, 2.0], [3, 1, 1]);
        let resampled = VolumeResampler::default().resample(&volume, &target).unwrap();
        assert_eq!(resampled.data()[[1, 0, 0]], 5.0);
        assert_eq!(resampled.data()[[2, 0, 0]], 0.0);
    }

    #[test]
    fn failing_strategy_falls_back_with_equal_output() {
        let volume = linear_volume();
        let target = Grid::new([0.25, 0.25, 0.5], [0.5, 0.75, 1.5], [9, 6, 4]);

        let reference = VolumeResampler::default().resample(&volume, &target).unwrap();
        let degraded = VolumeResampler::with_strategies(vec![
            Box::new(FailingInterpolator),
            Box::new(CpuInterpolator),
        ])
        .resample(&volume, &target)
        .unwrap();
        assert_eq!(degraded.data(), reference.data());
    }

    #[test]
    fn all_strategies_failing_is_an_error() {
        let volume = linear_volume();
        let target = Grid::new([0.5; 3], [1.0; 3], [2, 2, 2]);
        let resampler = VolumeResampler::with_strategies(vec![Box::new(FailingInterpolator)]);
        assert!(matches!(
            resampler.resample(&volume, &target),
            Err(ResampleError::Execution(_))
        ));
        let empty = VolumeResampler::with_strategies(Vec::new());
        assert!(matches!(
            empty.resample(&volume, &target),
            Err(ResampleError::NoStrategy)
        ));
    }

    #[test]
    fn cpu_processor_has_single_strategy() {
        assert_eq!(VolumeResampler::new(Processor::Cpu).strategy_names(), vec!["cpu"]);
    }
}
