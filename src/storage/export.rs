//! Session export
//!
//! The durable record is written as CSV (`Index, Value, Time`) next to a JSON
//! sidecar with the same stem holding the session metadata.

use chrono::{DateTime, Datelike, Local};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::acquisition::sample::Sample;
use crate::error::ExportError;
use crate::protocol::DeviceInfo;
use crate::storage::stats::Statistics;
use crate::storage::store::SessionStore;

pub const CSV_HEADER: [&str; 3] = ["Index", "Value", "Time"];
/// Header names are joined with a space after each comma
pub const CSV_HEADER_SEPARATOR: &str = ", ";
pub const TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// Longest subterm kept in a folder name
const MAX_SUBTERM_LEN: usize = 20;

/// Who measured what
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementLabel {
    /// Measurement or sample name
    pub name: String,
    /// Group letter or full group name
    pub group: String,
    /// Optional subgroup
    pub subterm: String,
}

/// Contents of the JSON sidecar
#[derive(Debug, Clone, Serialize)]
pub struct ExportMetadata {
    #[serde(rename = "dc:date")]
    pub date: String,
    #[serde(rename = "dc:creator")]
    pub creator: String,
    #[serde(rename = "dc:title")]
    pub title: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub measurement_name: String,
    pub subgroup: String,
    pub session_id: Uuid,
    pub sample_count: usize,
    pub statistics: Statistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

impl ExportMetadata {
    /// Describe the current session of `store`
    pub fn for_session(
        store: &SessionStore,
        label: &MeasurementLabel,
        target: Option<String>,
        device: Option<DeviceInfo>,
    ) -> Self {
        let start = store.started_at();
        let end = store
            .samples()
            .last()
            .map(|s| s.timestamp)
            .unwrap_or_else(Local::now);

        Self {
            date: start.format("%Y-%m-%d").to_string(),
            creator: creator_name(&label.group, start),
            title: label.name.clone(),
            start_time: start,
            end_time: end,
            measurement_name: label.name.clone(),
            subgroup: label.subterm.clone(),
            session_id: store.session_id(),
            sample_count: store.len(),
            statistics: store.statistics(),
            target,
            device,
        }
    }
}

/// Paths written by an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub csv_path: PathBuf,
    pub metadata_path: PathBuf,
    pub rows: usize,
}

/// Write samples as CSV rows with a header
pub fn write_csv<W: Write>(samples: &[Sample], writer: W) -> Result<usize, ExportError> {
    if samples.is_empty() {
        return Err(ExportError::Empty);
    }

    let mut writer = writer;
    writeln!(writer, "{}", CSV_HEADER.join(CSV_HEADER_SEPARATOR))?;
    let mut csv = csv::Writer::from_writer(writer);
    for sample in samples {
        csv.write_record(&[
            sample.index.to_string(),
            sample.value.to_string(),
            sample.timestamp.format(TIME_FORMAT).to_string(),
        ])?;
    }
    csv.flush()?;
    Ok(samples.len())
}

/// Write the durable record to `path` and the metadata to its `.json` sibling
///
/// Parent directories are created as needed.
pub fn export_session(
    samples: &[Sample],
    metadata: &ExportMetadata,
    path: impl AsRef<Path>,
) -> Result<ExportSummary, ExportError> {
    if samples.is_empty() {
        return Err(ExportError::Empty);
    }

    let csv_path = path.as_ref().to_path_buf();
    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let rows = write_csv(samples, BufWriter::new(File::create(&csv_path)?))?;

    let metadata_path = csv_path.with_extension("json");
    let mut json = BufWriter::new(File::create(&metadata_path)?);
    serde_json::to_writer_pretty(&mut json, metadata)?;
    json.flush()?;

    tracing::info!("Exported {} samples to {}", rows, csv_path.display());
    Ok(ExportSummary {
        csv_path,
        metadata_path,
        rows,
    })
}

/// Generates `GROUP_subterm/YYYY_MM_DD-NN-name-suffix.csv` names
#[derive(Debug, Default)]
pub struct FileNamer {
    index: u32,
}

impl FileNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next file name relative to the export directory
    pub fn next_name(
        &mut self,
        label: &MeasurementLabel,
        suffix: &str,
        now: DateTime<Local>,
    ) -> Result<PathBuf, ExportError> {
        if label.name.trim().is_empty() {
            return Err(ExportError::InvalidName("measurement name is empty".to_string()));
        }
        if label.group.trim().is_empty() {
            return Err(ExportError::InvalidName("group is empty".to_string()));
        }

        self.index += 1;
        let mut folder = label.group.to_uppercase();
        let subterm = sanitize_subterm(&label.subterm, MAX_SUBTERM_LEN);
        if !subterm.is_empty() {
            folder.push('_');
            folder.push_str(&subterm);
        }

        let suffix = match suffix {
            "" => String::new(),
            s if s.starts_with('-') => s.to_string(),
            s => format!("-{}", s),
        };
        let file = format!(
            "{}-{:02}-{}{}.csv",
            now.format("%Y_%m_%d"),
            self.index,
            label.name,
            suffix
        );
        Ok(Path::new(&folder).join(file))
    }
}

/// Make a subterm safe for a folder name and shorten it to `max_len` chars
///
/// Long subterms have each word cut to three letters; if that is still too
/// long the result is truncated and marked with `_xxx`.
pub fn sanitize_subterm(subterm: &str, max_len: usize) -> String {
    let replaced: String = subterm
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let words: Vec<&str> = replaced
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();
    let joined = words.join("_");
    if joined.chars().count() <= max_len {
        return joined;
    }

    let abbreviated = words
        .iter()
        .map(|w| w.chars().take(3).collect::<String>())
        .collect::<Vec<_>>()
        .join("_");
    if abbreviated.chars().count() <= max_len {
        return abbreviated;
    }

    let head: String = abbreviated.chars().take(max_len.saturating_sub(4)).collect();
    format!("{}_xxx", head.trim_end_matches('_'))
}

/// Full group name for the metadata creator field
///
/// A single group letter expands to `<semester><year>_<day>_<letter>`, where
/// the winter semester runs October to December.
pub fn creator_name(group: &str, at: DateTime<Local>) -> String {
    let mut chars = group.chars();
    let (Some(letter), None) = (chars.next(), chars.next()) else {
        return group.to_string();
    };
    if !letter.is_ascii_alphabetic() {
        return group.to_string();
    }

    let semester = if (10..=12).contains(&at.month()) {
        "WiSe"
    } else {
        "SoSe"
    };
    let day: String = at.format("%a").to_string().chars().take(2).collect();
    format!(
        "{}{}_{}_{}",
        semester,
        at.year(),
        day,
        letter.to_ascii_uppercase()
    )
}

/// Export into a directory under an automatically generated name
pub fn export_auto(
    store: &SessionStore,
    dir: impl AsRef<Path>,
    namer: &mut FileNamer,
    label: &MeasurementLabel,
    suffix: &str,
    target: Option<String>,
    device: Option<DeviceInfo>,
) -> Result<ExportSummary, ExportError> {
    if store.is_empty() {
        return Err(ExportError::Empty);
    }
    let name = namer.next_name(label, suffix, Local::now())?;
    let metadata = ExportMetadata::for_session(store, label, target, device);
    export_session(store.samples(), &metadata, dir.as_ref().join(name))
}
