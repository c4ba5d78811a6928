use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

/// Voxel representation the resampled scan is stored in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// HU shifted by the lower tissue bound, clamped to `[0, hi - lo]`.
    #[default]
    Int16,
    /// HU scaled to `[0, 1]` over the tissue range, then zero-centered.
    Float32,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Int16 => "int16",
            StorageType::Float32 => "float32",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int16" => Ok(StorageType::Int16),
            "float32" => Ok(StorageType::Float32),
            other => Err(format!(
                "invalid data type `{other}`, use int16 or float32"
            )),
        }
    }
}

/// On-disk layout of one patient's raw scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeFormat {
    /// One directory of 2-D DICOM slices per patient.
    DicomSeries,
    /// One `.mhd` / `.mha` file per patient.
    MetaImage,
    /// One `.nii` / `.nii.gz` file per patient.
    Nifti,
}

impl VolumeFormat {
    /// Guess the format of a single patient entry.
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(VolumeFormat::DicomSeries);
        }
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".mhd") || name.ends_with(".mha") {
            Some(VolumeFormat::MetaImage)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(VolumeFormat::Nifti)
        } else {
            None
        }
    }

    /// Whether `path` is a patient entry of this format.
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            VolumeFormat::DicomSeries => path.is_dir(),
            _ => path.is_file() && Self::detect(path) == Some(*self),
        }
    }

    /// Patient identifier derived from a patient entry.
    pub fn patient_id(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let id = match self {
            VolumeFormat::DicomSeries => name,
            VolumeFormat::MetaImage => name
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(name),
            VolumeFormat::Nifti => name
                .strip_suffix(".gz")
                .unwrap_or(name)
                .strip_suffix(".nii")
                .unwrap_or(name),
        };
        Some(id.to_string())
    }
}

impl FromStr for VolumeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dicom" => Ok(VolumeFormat::DicomSeries),
            "meta-image" | "mhd" => Ok(VolumeFormat::MetaImage),
            "nifti" => Ok(VolumeFormat::Nifti),
            other => Err(format!("unknown volume format `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_parses_known_names_only() {
        assert_eq!("int16".parse::<StorageType>(), Ok(StorageType::Int16));
        assert_eq!("float32".parse::<StorageType>(), Ok(StorageType::Float32));
        assert!("uint8".parse::<StorageType>().is_err());
    }

    #[test]
    fn patient_id_strips_format_suffix() {
        let nifti = VolumeFormat::Nifti;
        assert_eq!(
            nifti.patient_id(Path::new("/data/p01.nii.gz")).as_deref(),
            Some("p01")
        );
        assert_eq!(
            nifti.patient_id(Path::new("/data/p02.nii")).as_deref(),
            Some("p02")
        );
        let mhd = VolumeFormat::MetaImage;
        assert_eq!(
            mhd.patient_id(Path::new("/luna/1.3.6.1.4.mhd")).as_deref(),
            Some("1.3.6.1.4")
        );
    }
}
