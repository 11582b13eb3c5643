use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::RunAggregate;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// One durable record per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub tests: RunAggregate,
}

impl RunRecord {
    pub fn new(tests: RunAggregate) -> Self {
        Self {
            timestamp: Utc::now(),
            tests,
        }
    }

    fn file_stamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Somewhere a finished run can be written. Returns the path written to.
pub trait ResultStore: Send + Sync {
    fn record_run(&self, record: &RunRecord) -> Result<PathBuf, PersistError>;
}

/// Opens `<dir>/<stem>.<ext>` for writing without ever replacing an existing
/// file; collisions get a numeric suffix.
fn create_unique(dir: &Path, stem: &str, ext: &str) -> Result<(File, PathBuf), PersistError> {
    fs::create_dir_all(dir)?;

    let mut attempt = 0usize;
    loop {
        let name = if attempt == 0 {
            format!("{stem}.{ext}")
        } else {
            format!("{stem}-{attempt}.{ext}")
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(error) => return Err(error.into()),
        }
    }
}

/// Pretty JSON file per run: `run_<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct JsonRunLog {
    dir: PathBuf,
}

impl JsonRunLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RunRecord, PersistError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl ResultStore for JsonRunLog {
    fn record_run(&self, record: &RunRecord) -> Result<PathBuf, PersistError> {
        let (file, path) = create_unique(&self.dir, &format!("run_{}", record.file_stamp()), "json")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(path)
    }
}

/// Flat per-test rows: `Type, Name, Transcript, Score_<evaluation>...`.
#[derive(Debug, Clone)]
pub struct CsvResultLog {
    dir: PathBuf,
}

impl CsvResultLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl ResultStore for CsvResultLog {
    fn record_run(&self, record: &RunRecord) -> Result<PathBuf, PersistError> {
        let mut score_columns: Vec<&str> = Vec::new();
        for result in record.tests.values() {
            for evaluation in &result.evaluation_results {
                if !score_columns.contains(&evaluation.name.as_str()) {
                    score_columns.push(&evaluation.name);
                }
            }
        }

        let (file, path) = create_unique(
            &self.dir,
            &format!("evaluation_results_{}", record.file_stamp()),
            "csv",
        )?;
        let mut writer = BufWriter::new(file);

        let mut header = vec!["Type".to_string(), "Name".to_string(), "Transcript".to_string()];
        header.extend(score_columns.iter().map(|name| format!("Score_{name}")));
        write_row(&mut writer, &header)?;

        for result in record.tests.values() {
            let scores: BTreeMap<&str, f64> = result
                .evaluation_results
                .iter()
                .map(|evaluation| (evaluation.name.as_str(), evaluation.score))
                .collect();

            let mut row = vec![
                result.service_config.provider.to_string(),
                result.service_config.model().to_string(),
                result.transcript.clone(),
            ];
            row.extend(
                score_columns
                    .iter()
                    .map(|name| scores.get(name).map(f64::to_string).unwrap_or_default()),
            );
            write_row(&mut writer, &row)?;
        }

        writer.flush()?;
        Ok(path)
    }
}

fn write_row(writer: &mut impl Write, fields: &[String]) -> io::Result<()> {
    let line = fields
        .iter()
        .map(|field| quote_field(field))
        .collect::<Vec<_>>()
        .join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
