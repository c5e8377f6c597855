//! Persistence of raw calibration samples and focus traces for later audit.
//!
//! Artifacts are written once, at the end of a successful or cancelled run.
//! The engine only sees the [`ResultsStore`] trait; `JsonResultsStore` writes one
//! timestamped JSON document per artifact.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::autofocus::FocusTrace;
use crate::calibration::TipSampleSet;
use crate::error::RigResult;

/// Sink for run artifacts. Engines call it at most once per run.
pub trait ResultsStore: Send + Sync {
    /// Store the raw per-pose tip samples of a calibration run.
    fn save_tip_samples(&self, label: &str, samples: &TipSampleSet) -> RigResult<()>;

    /// Store the full position/score trace of a focus search.
    fn save_focus_trace(&self, trace: &FocusTrace) -> RigResult<()>;
}

/// Discards every artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl ResultsStore for NullStore {
    fn save_tip_samples(&self, _label: &str, _samples: &TipSampleSet) -> RigResult<()> {
        Ok(())
    }

    fn save_focus_trace(&self, _trace: &FocusTrace) -> RigResult<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Artifact<'a, T: Serialize> {
    run_id: Uuid,
    label: &'a str,
    written_at: String,
    data: &'a T,
}

/// Writes `<label>_<YYYY-mm-dd_HH-MM-SS>_<run id prefix>.json` files into a directory.
#[derive(Debug, Clone)]
pub struct JsonResultsStore {
    dir: PathBuf,
}

impl JsonResultsStore {
    /// Creates the directory if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>) -> RigResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory artifacts are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write<T: Serialize>(&self, label: &str, data: &T) -> RigResult<PathBuf> {
        let now = Local::now();
        let run_id = Uuid::new_v4();
        let path = self.dir.join(format!(
            "{}_{}_{}.json",
            label,
            now.format("%Y-%m-%d_%H-%M-%S"),
            &run_id.simple().to_string()[..8]
        ));
        let artifact = Artifact {
            run_id,
            label,
            written_at: now.to_rfc3339(),
            data,
        };

        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, &artifact)?;
        writer.flush()?;
        info!(path = %path.display(), "saved {label}");
        Ok(path)
    }
}

impl ResultsStore for JsonResultsStore {
    fn save_tip_samples(&self, label: &str, samples: &TipSampleSet) -> RigResult<()> {
        self.write(label, samples).map(|_| ())
    }

    fn save_focus_trace(&self, trace: &FocusTrace) -> RigResult<()> {
        self.write("autofocus_trace", trace).map(|_| ())
    }
}
