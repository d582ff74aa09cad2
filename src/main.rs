use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, Log, Metadata, Record, error, info, warn};

use dicom_rt_volume::{
    DvhEngine, DvhOptions, DvhWriter, Error, Orientation, Processor, RasterizeOptions, Result,
    ScanIndex, Structure, Study, Volume, VolumeLoader, dvh::DEFAULT_BINS,
};

#[derive(Parser)]
#[command(name = "dicom-rt-volume")]
#[command(about = "Dose-volume histograms from a directory of DICOM-RT files")]
#[command(version)]
struct Cli {
    /// Directory holding the image series, RTSTRUCT, RTPLAN and RTDOSE files
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// DVH table; with several doses each gets a numbered file next to it
    #[arg(short, long, default_value = "dvh.csv")]
    output: PathBuf,

    /// Number of histogram bins
    #[arg(short, long, default_value_t = DEFAULT_BINS)]
    bins: usize,

    /// Processor used when the dose has to be resampled
    #[arg(short, long, value_enum, default_value_t = Processor::Cpu)]
    processor: Processor,

    /// Rasterize structures whose frame of reference differs from the images'
    #[arg(long)]
    override_frame_of_reference: bool,

    /// Write a PNG of the central axial slice with the first structure overlaid
    #[arg(long, value_name = "PNG")]
    preview: Option<PathBuf>,

    /// Print the resolved study as JSON
    #[arg(long)]
    summary: bool,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger(verbose: bool) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let paths = VolumeLoader::dicom_paths(&cli.input)?;
    let index = ScanIndex::from_files(&paths);
    let study = index.complete_studies().next().ok_or_else(|| {
        Error::IncompleteStudy(format!(
            "no study with images, structures and dose in {}",
            cli.input.display()
        ))
    })?;

    if cli.summary {
        println!("{}", serde_json::to_string_pretty(study)?);
    }

    let (image, structures) = load_image_and_structures(study, cli)?;
    if let Some(path) = &cli.preview {
        write_preview(&image, structures.first(), path)?;
    }

    let options = DvhOptions {
        nbins: cli.bins,
        processor: cli.processor,
    };
    for (n, entry) in study.doses.iter().enumerate() {
        let dose = VolumeLoader::load_dose_from_path(&entry.path)?;
        let curve = DvhEngine::compute(&dose, &structures, &options)?;
        for flagged in &curve.flagged {
            warn!(
                "structure '{}' ({}) has no DVH: {:?}",
                flagged.name, flagged.index, flagged.reason
            );
        }

        let output = output_path(&cli.output, n, study.doses.len());
        let source = match &entry.beam {
            Some(beam) => format!("{} (beam {})", entry.path.display(), beam.number),
            None => entry.path.display().to_string(),
        };
        DvhWriter::write_to_path(&curve, &source, &output)?;
        info!(
            "wrote {} columns, max dose {:.3} Gy, to {}",
            curve.columns.len(),
            curve.max_dose(),
            output.display()
        );
    }
    Ok(())
}

fn load_image_and_structures(study: &Study, cli: &Cli) -> Result<(Volume, Vec<Structure>)> {
    let structure_set = study
        .structure_sets
        .iter()
        .find(|s| s.image_series_uid.is_some())
        .ok_or_else(|| Error::IncompleteStudy("no structure set with an image series".into()))?;
    let series = structure_set
        .image_series_uid
        .as_deref()
        .and_then(|uid| study.image_series(uid))
        .ok_or_else(|| Error::IncompleteStudy("image series not found".into()))?;

    let image = VolumeLoader::load_image_series_from_paths(&series.files)?;
    info!(
        "loaded {:?} series {} with shape {:?}",
        image.modality(),
        series.series_instance_uid,
        image.dim()
    );

    let options = RasterizeOptions {
        override_frame_of_reference: cli.override_frame_of_reference,
    };
    let structures = VolumeLoader::load_structures_from_path(&structure_set.path, &image, &options)?;
    for structure in &structures {
        info!("{}: {:.2} cc", structure.name(), structure.volume_cc());
    }
    Ok((image, structures))
}

fn write_preview(image: &Volume, structure: Option<&Structure>, path: &Path) -> Result<()> {
    let index = image.dim().2 / 2;
    match structure {
        Some(structure) => {
            if let Some(preview) = image.get_overlay_from_axis(
                index,
                Orientation::Axial,
                structure.mask(),
                structure.color(),
            ) {
                preview.save(path)?;
            }
        }
        None => {
            if let Some(preview) = image.get_image_from_axis(index, Orientation::Axial) {
                preview.save(path)?;
            }
        }
    }
    info!("wrote preview to {}", path.display());
    Ok(())
}

fn output_path(output: &Path, n: usize, total: usize) -> PathBuf {
    if total <= 1 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dvh".to_owned());
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "csv".to_owned());
    output.with_file_name(format!("{stem}_{}.{extension}", n + 1))
}
