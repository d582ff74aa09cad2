use std::fmt;

use serde::Serialize;

/// Medical axis used when extracting a 2D slice from a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Patient position on the couch, derived from the image direction cosines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PatientOrientation {
    /// Head first, supine
    #[default]
    Hfs,
    /// Head first, prone
    Hfp,
    /// Feet first, supine
    Ffs,
    /// Feet first, prone
    Ffp,
}

impl PatientOrientation {
    pub const ALL: [PatientOrientation; 4] = [Self::Hfs, Self::Hfp, Self::Ffs, Self::Ffp];

    /// Signs applied to patient coordinates to reach the canonical frame.
    pub fn sign(self) -> [f64; 3] {
        match self {
            Self::Hfs => [1.0, 1.0, 1.0],
            Self::Hfp => [-1.0, -1.0, 1.0],
            Self::Ffs => [-1.0, 1.0, -1.0],
            Self::Ffp => [1.0, -1.0, -1.0],
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Hfs => "HFS",
            Self::Hfp => "HFP",
            Self::Ffs => "FFS",
            Self::Ffp => "FFP",
        }
    }
}

impl fmt::Display for PatientOrientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Modality {
    Ct,
    Mr,
    RtDose,
    RtPlan,
    RtStruct,
    Other(String),
    #[default]
    Unknown,
}

impl Modality {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "CT" => Self::Ct,
            "MR" => Self::Mr,
            "RTDOSE" => Self::RtDose,
            "RTPLAN" => Self::RtPlan,
            "RTSTRUCT" => Self::RtStruct,
            "" => Self::Unknown,
            other => Self::Other(other.to_owned()),
        }
    }

    /// CT and MR series carry the reference grid for structures.
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Ct | Self::Mr)
    }
}

/// Execution strategy requested for trilinear resampling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Processor {
    #[default]
    Cpu,
    /// Try a wgpu compute shader first, degrade to the CPU on any failure
    Gpu,
}
