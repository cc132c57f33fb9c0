//! Row-oriented CSV interchange file between the scraper and the uploader.

use std::fs;
use std::path::{Path, PathBuf};

use hsync_core::{HackathonRecord, RawRow, COLUMNS};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum InterchangeError {
    #[error("interchange file not found: {0}")]
    NotFound(PathBuf),
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct InterchangeFile {
    path: PathBuf,
}

impl InterchangeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Rows keyed by header name, in file order.
    pub fn read_rows(&self) -> Result<Vec<RawRow>, InterchangeError> {
        if !self.exists() {
            return Err(InterchangeError::NotFound(self.path.clone()));
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|source| self.csv_error(source))?;
        reader
            .deserialize::<RawRow>()
            .map(|row| row.map_err(|source| self.csv_error(source)))
            .collect()
    }

    pub fn read_records(&self) -> Result<Vec<HackathonRecord>, InterchangeError> {
        let records: Vec<_> = self
            .read_rows()?
            .iter()
            .map(HackathonRecord::from_row)
            .collect();
        info!(path = %self.path.display(), rows = records.len(), "loaded interchange file");
        Ok(records)
    }

    /// Replace the file with `records`, writing to a sibling temp file first.
    pub fn write_records(&self, records: &[HackathonRecord]) -> Result<usize, InterchangeError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| InterchangeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "interchange.csv".to_string());
        let temp_path = self.path.with_file_name(format!(".{file_name}.tmp"));

        let result = self.write_to(&temp_path, records);
        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        fs::rename(&temp_path, &self.path).map_err(|source| InterchangeError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), rows = records.len(), "wrote interchange file");
        Ok(records.len())
    }

    fn write_to(&self, path: &Path, records: &[HackathonRecord]) -> Result<(), InterchangeError> {
        let csv_err = |source| InterchangeError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(csv_err)?;
        writer.write_record(COLUMNS).map_err(csv_err)?;
        for record in records {
            writer.serialize(record).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| InterchangeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn csv_error(&self, source: csv::Error) -> InterchangeError {
        InterchangeError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}
