use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use polars::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// Suffix attempts per run date before giving up on a free snapshot name.
const MAX_SAME_DAY_SNAPSHOTS: usize = 99;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown output format {:?}",
                other
            ))),
        }
    }
}

pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

pub fn validate_run_date(run_date: &str) -> PipelineResult<()> {
    NaiveDate::parse_from_str(run_date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| PipelineError::InvalidConfig(format!("run date {:?} is not YYYY-MM-DD", run_date)))
}

pub fn read_table(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).with_context(|| format!("failed to open snapshot {:?}", path))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => CsvReader::new(file)
            .finish()
            .with_context(|| format!("failed to read csv file {:?}", path)),
        _ => ParquetReader::new(file)
            .finish()
            .with_context(|| format!("failed to read parquet file {:?}", path)),
    }
}

pub fn write_table(path: &Path, df: &mut DataFrame, format: OutputFormat) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create snapshot file {:?}", path))?;
    match format {
        OutputFormat::Parquet => {
            ParquetWriter::new(file)
                .finish(df)
                .with_context(|| format!("failed to write parquet file {:?}", path))?;
        }
        OutputFormat::Csv => {
            CsvWriter::new(BufWriter::new(file))
                .finish(df)
                .with_context(|| format!("failed to write csv file {:?}", path))?;
        }
    }
    Ok(())
}

/// Snapshot file name stem, if `file_name` is a snapshot of `prefix`.
fn snapshot_stem<'a>(file_name: &'a str, prefix: &str) -> Option<&'a str> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if ext != "parquet" && ext != "csv" {
        return None;
    }
    let rest = stem.strip_prefix(prefix)?.strip_prefix('_')?;
    rest.starts_with(|c: char| c.is_ascii_digit()).then_some(stem)
}

/// Latest snapshot of `prefix` in `dir` by file name; on equal stems the
/// parquet file is preferred.
pub fn latest_snapshot(dir: &Path, prefix: &str) -> PipelineResult<PathBuf> {
    let not_found = || PipelineError::SnapshotNotFound {
        dir: dir.to_path_buf(),
        prefix: prefix.to_string(),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to list snapshot dir {:?}", dir))
                .into())
        }
    };

    let mut best: Option<(String, bool, PathBuf)> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list snapshot dir {:?}", dir))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = snapshot_stem(&name, prefix) else {
            continue;
        };
        let key = (stem.to_string(), name.ends_with(".parquet"));
        let newer = match &best {
            Some((best_stem, best_parquet, _)) => key > (best_stem.clone(), *best_parquet),
            None => true,
        };
        if newer {
            best = Some((key.0, key.1, entry.path()));
        }
    }
    best.map(|(_, _, path)| path).ok_or_else(not_found)
}

/// Append-only, date-stamped table snapshots under one data directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    format: OutputFormat,
    run_date: String,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, format: OutputFormat, run_date: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            format,
            run_date: run_date.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_date(&self) -> &str {
        &self.run_date
    }

    pub fn dir(&self, subdir: &str) -> PathBuf {
        self.root.join(subdir)
    }

    pub fn load_latest_table(&self, subdir: &str, prefix: &str) -> PipelineResult<DataFrame> {
        let path = latest_snapshot(&self.dir(subdir), prefix)?;
        debug!(path = %path.display(), "loading latest snapshot");
        Ok(read_table(&path)?)
    }

    /// Writes `df` as a new snapshot and returns its path. Existing snapshots
    /// are never replaced: a same-day name collision moves on to the next
    /// `_NN` suffix. The file appears only once it is completely written.
    pub fn save_table(&self, df: &mut DataFrame, subdir: &str, prefix: &str) -> Result<PathBuf> {
        let dir = self.dir(subdir);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create snapshot dir {:?}", dir))?;

        let ext = self.format.extension();
        let tmp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), ext));
        write_table(&tmp_path, df, self.format)?;

        let published = self.publish(&dir, prefix, &tmp_path);
        let _ = fs::remove_file(&tmp_path);
        let path = published?;
        info!(path = %path.display(), rows = df.height(), "saved snapshot");
        Ok(path)
    }

    fn publish(&self, dir: &Path, prefix: &str, tmp_path: &Path) -> Result<PathBuf> {
        let ext = self.format.extension();
        for attempt in 0..=MAX_SAME_DAY_SNAPSHOTS {
            let stem = if attempt == 0 {
                format!("{}_{}", prefix, self.run_date)
            } else {
                format!("{}_{}_{:02}", prefix, self.run_date, attempt)
            };
            let taken = ["parquet", "csv"]
                .iter()
                .any(|other| dir.join(format!("{}.{}", stem, other)).exists());
            if taken {
                continue;
            }
            let target = dir.join(format!("{}.{}", stem, ext));
            match fs::hard_link(tmp_path, &target) {
                Ok(()) => return Ok(target),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to publish snapshot {:?}", target))
                }
            }
        }
        Err(anyhow!(
            "no free snapshot name left for {} on {} in {:?}",
            prefix,
            self.run_date,
            dir
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample() -> DataFrame {
        df!("product_id" => &[1i64, 2], "label" => &["a", "b"]).unwrap()
    }

    #[rstest]
    #[case("products_2024-01-02.parquet", "products", Some("products_2024-01-02"))]
    #[case("products_2024-01-02_03.csv", "products", Some("products_2024-01-02_03"))]
    #[case("products_enriched_2024-01-02.csv", "products", None)]
    #[case("products_2024-01-02.json", "products", None)]
    #[case(".tmp.parquet", "products", None)]
    fn recognizes_snapshot_names(
        #[case] name: &str,
        #[case] prefix: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(snapshot_stem(name, prefix), expected);
    }

    #[test]
    fn same_day_saves_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), OutputFormat::Parquet, "2024-03-01");
        let first = store.save_table(&mut sample(), "raw", "items").unwrap();
        let second = store.save_table(&mut sample(), "raw", "items").unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("items_2024-03-01_01.parquet"));
        assert_eq!(latest_snapshot(&dir.path().join("raw"), "items").unwrap(), second);
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("raw"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn latest_is_lexically_greatest_date() {
        let dir = tempfile::tempdir().unwrap();
        for date in ["2024-01-09", "2024-01-10", "2023-12-31"] {
            SnapshotStore::new(dir.path(), OutputFormat::Csv, date)
                .save_table(&mut sample(), "d", "t")
                .unwrap();
        }
        let latest = latest_snapshot(&dir.path().join("d"), "t").unwrap();
        assert!(latest.ends_with("t_2024-01-10.csv"));
    }

    #[test]
    fn parquet_wins_over_csv_with_the_same_stem() {
        let dir = tempfile::tempdir().unwrap();
        for format in [OutputFormat::Csv, OutputFormat::Parquet] {
            let path = dir.path().join(format!("t_2024-01-01.{}", format.extension()));
            write_table(&path, &mut sample(), format).unwrap();
        }
        let latest = latest_snapshot(dir.path(), "t").unwrap();
        assert!(latest.ends_with("t_2024-01-01.parquet"));
    }

    #[test]
    fn csv_and_parquet_read_back() {
        let dir = tempfile::tempdir().unwrap();
        for format in [OutputFormat::Csv, OutputFormat::Parquet] {
            let store = SnapshotStore::new(dir.path(), format, "2024-05-05");
            store.save_table(&mut sample(), format.extension(), "t").unwrap();
            let df = store.load_latest_table(format.extension(), "t").unwrap();
            assert_eq!(df.height(), 2);
            assert_eq!(df.get_column_names(), vec!["product_id", "label"]);
        }
    }

    #[test]
    fn missing_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), OutputFormat::Parquet, "2024-05-05");
        assert!(matches!(
            store.load_latest_table("nowhere", "t"),
            Err(PipelineError::SnapshotNotFound { .. })
        ));
    }

    #[rstest]
    #[case("CSV", Some(OutputFormat::Csv))]
    #[case(" parquet ", Some(OutputFormat::Parquet))]
    #[case("json", None)]
    fn parses_output_format(#[case] text: &str, #[case] expected: Option<OutputFormat>) {
        assert_eq!(text.parse::<OutputFormat>().ok(), expected);
    }

    #[test]
    fn run_dates_are_validated() {
        assert!(validate_run_date("2024-02-29").is_ok());
        assert!(validate_run_date("2024/02/29").is_err());
        assert!(validate_run_date(&today()).is_ok());
    }
}
