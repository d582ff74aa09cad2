use std::fs::File;
use std::io::Write;
use std::path::Path;

use csv::{Terminator, WriterBuilder};
use thiserror::Error;

use crate::dvh::DvhCurve;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Writes a [`DvhCurve`] as a comma separated table:
///
/// ```text
/// <source identifier>
/// Dose (Gy),<name> (<index>)(volume: <cc>),...
/// <dose>,<percent>,...
/// ```
///
/// `<index>` is the 0-based position of the structure in the input list, so
/// gaps show which structures were flagged. Doses are written in their
/// shortest exact form; volumes get at least two decimals and more when a
/// structure is smaller than 0.01 cc.
pub struct DvhWriter;

impl DvhWriter {
    pub fn write_to_path(
        curve: &DvhCurve,
        source: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), WriteError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::write(curve, source, File::create(path)?)
    }

    pub fn write<W: Write>(curve: &DvhCurve, source: &str, writer: W) -> Result<(), WriteError> {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(writer);

        writer.write_record([source])?;

        let mut header = vec!["Dose (Gy)".to_owned()];
        header.extend(curve.columns.iter().map(|column| {
            format!(
                "{} ({})(volume: {})",
                column.name,
                column.index,
                volume_label(column.volume_cc)
            )
        }));
        writer.write_record(&header)?;

        for (row, dose) in curve.dose_axis.iter().enumerate() {
            let mut record = vec![format!("{dose}")];
            record.extend(
                curve
                    .columns
                    .iter()
                    .map(|column| format!("{:.4}", column.percent_volume[row])),
            );
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// `cc` with the fewest decimals (2 to 6) that keep it from printing as 0.
fn volume_label(cc: f64) -> String {
    let decimals = (2..=6)
        .find(|&d| cc * 10f64.powi(d as i32) >= 1.0)
        .unwrap_or(6);
    format!("{cc:.decimals$}")
}
