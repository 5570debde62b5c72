//! Output directory layout.
//!
//! Every artifact lives directly under the configured video directory. A
//! capture is first written as `<prefix>_<dd-mm-YYYY_HH-MM-SS>_temp.mp4`
//! (UTC) and finalized under the same base name without the `_temp` marker.
//! When a clip with that name already exists (two triggers in the same
//! second), the final name gets a `_2`, `_3`, ... suffix.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub const TEMP_MARKER: &str = "_temp";
pub const CLIP_EXTENSION: &str = "mp4";
const TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H-%M-%S";

#[derive(Clone, Debug)]
pub struct ClipLayout {
    dir: PathBuf,
    prefix: String,
}

impl ClipLayout {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the video directory if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create video dir {}", self.dir.display()))
    }

    /// Temporary capture path for a trigger at `at`.
    pub fn temp_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!(
            "{}_{}{}.{}",
            self.prefix,
            at.format(TIMESTAMP_FORMAT),
            TEMP_MARKER,
            CLIP_EXTENSION
        ))
    }

    /// Finalized clip path for a temporary capture path. Never names an
    /// existing file.
    pub fn final_path(&self, temp: &Path) -> Result<PathBuf> {
        let stem = temp
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid capture path {}", temp.display()))?;
        let base = stem.strip_suffix(TEMP_MARKER).ok_or_else(|| {
            anyhow!(
                "capture path {} is missing the {} marker",
                temp.display(),
                TEMP_MARKER
            )
        })?;
        let candidate = temp.with_file_name(format!("{}.{}", base, CLIP_EXTENSION));
        if !candidate.exists() {
            return Ok(candidate);
        }
        (2u32..)
            .map(|n| temp.with_file_name(format!("{}_{}.{}", base, n, CLIP_EXTENSION)))
            .find(|path| !path.exists())
            .ok_or_else(|| anyhow!("no free clip name for {}", temp.display()))
    }
}

/// True for in-progress captures that have not been finalized.
pub fn is_temp_artifact(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|stem| stem.ends_with(TEMP_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn temp_and_final_names_share_base() -> Result<()> {
        let layout = ClipLayout::new("/tmp/videos", "person_detected");
        let at = Utc
            .with_ymd_and_hms(2026, 3, 7, 9, 5, 1)
            .single()
            .expect("valid timestamp");
        let temp = layout.temp_path(at);
        assert_eq!(
            temp,
            PathBuf::from("/tmp/videos/person_detected_07-03-2026_09-05-01_temp.mp4")
        );
        assert!(is_temp_artifact(&temp));

        let done = layout.final_path(&temp)?;
        assert_eq!(
            done,
            PathBuf::from("/tmp/videos/person_detected_07-03-2026_09-05-01.mp4")
        );
        assert!(!is_temp_artifact(&done));
        Ok(())
    }

    #[test]
    fn final_path_does_not_overwrite_existing_clip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = ClipLayout::new(dir.path(), "person_detected");
        let temp = dir.path().join("person_detected_07-03-2026_09-05-01_temp.mp4");

        let first = layout.final_path(&temp)?;
        std::fs::write(&first, b"first")?;
        let second = layout.final_path(&temp)?;
        assert_eq!(
            second,
            dir.path().join("person_detected_07-03-2026_09-05-01_2.mp4")
        );
        std::fs::write(&second, b"second")?;
        assert_eq!(
            layout.final_path(&temp)?,
            dir.path().join("person_detected_07-03-2026_09-05-01_3.mp4")
        );
        Ok(())
    }

    #[test]
    fn final_path_requires_marker() {
        let layout = ClipLayout::new("/tmp/videos", "person_detected");
        assert!(layout
            .final_path(Path::new("/tmp/videos/clip.mp4"))
            .is_err());
    }
}
