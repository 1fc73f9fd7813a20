use crate::score::{ScoredResult, Summary};
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors while writing result artifacts, summaries, or the archive.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV summary error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON summary error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Timestamp string shared by every file a run produces.
pub fn run_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Metadata block at the top of the JSON summary.
#[derive(Debug, Serialize)]
struct RunMetadata {
    tool: &'static str,
    version: &'static str,
    generated_at: String,
    run_stamp: String,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    run: RunMetadata,
    #[serde(flatten)]
    summary: &'a Summary,
}

/// Writes all per-run output below one root directory:
/// `artifacts/<domain>/…` raw captures, `summary_<stamp>.{json,csv}`, and a
/// `results_<stamp>.tar.gz` archive of the artifact tree.
#[derive(Debug)]
pub struct ReportWriter {
    root: PathBuf,
    artifacts_dir: PathBuf,
    stamp: String,
}

impl ReportWriter {
    pub fn create(root: PathBuf, stamp: String) -> Result<Self, ReportError> {
        let artifacts_dir = root.join("artifacts");
        fs::create_dir_all(&artifacts_dir).map_err(|e| ReportError::Io {
            path: artifacts_dir.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            artifacts_dir,
            stamp,
        })
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Writes the raw-output capture for one processed work item. The file
    /// name derives from the target, the item identity, and the run stamp,
    /// so re-running the same item in the same run is idempotent.
    pub fn write_artifact(&self, scored: &ScoredResult) -> Result<PathBuf, ReportError> {
        let domain_dir = self.artifacts_dir.join(sanitize(&scored.item.domain()));
        fs::create_dir_all(&domain_dir).map_err(|e| ReportError::Io {
            path: domain_dir.clone(),
            source: e,
        })?;

        let short_id = &scored.result.work_item_id[..12.min(scored.result.work_item_id.len())];
        let name = format!(
            "{}_{}_{}.txt",
            sanitize(&scored.item.url),
            short_id,
            self.stamp
        );
        let path = domain_dir.join(name);

        let file = File::create(&path).map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);
        write!(
            writer,
            "URL: {}\nPayload: {}\nStatus: {}\nAttempts: {}\nScore: {}\n\nOutput:\n{}\n\nError:\n{}\n",
            scored.item.url,
            scored.item.payload,
            scored.result.status.as_str(),
            scored.result.attempt_count,
            scored.score,
            scored.result.stdout,
            scored.result.stderr,
        )
        .map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        writer.flush().map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// Emits the machine-readable JSON summary.
    pub fn write_json_summary(&self, summary: &Summary) -> Result<PathBuf, ReportError> {
        let path = self.root.join(format!("summary_{}.json", self.stamp));
        let file = File::create(&path).map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        let report = JsonReport {
            run: RunMetadata {
                tool: "paraprobe",
                version: env!("CARGO_PKG_VERSION"),
                generated_at: Utc::now().to_rfc3339(),
                run_stamp: self.stamp.clone(),
            },
            summary,
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        info!(path = %path.display(), "JSON summary written");
        Ok(path)
    }

    /// Emits the CSV summary, one row per summary entry in aggregated order.
    pub fn write_csv_summary(&self, summary: &Summary) -> Result<PathBuf, ReportError> {
        let path = self.root.join(format!("summary_{}.csv", self.stamp));
        let mut wtr = csv::Writer::from_path(&path)?;
        wtr.write_record([
            "domain",
            "url",
            "payload",
            "status",
            "score",
            "attempts",
            "exit_code",
            "duration_ms",
            "output",
            "error",
        ])?;
        for entry in &summary.entries {
            wtr.write_record([
                entry.domain.as_str(),
                entry.url.as_str(),
                entry.payload.as_str(),
                entry.status.as_str(),
                &entry.score.to_string(),
                &entry.attempt_count.to_string(),
                &entry
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                &entry.duration_ms.to_string(),
                entry.output_snippet.as_str(),
                entry.error_snippet.as_str(),
            ])?;
        }
        wtr.flush().map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "CSV summary written");
        Ok(path)
    }

    /// Bundles the whole artifact tree into `results_<stamp>.tar.gz`.
    pub fn archive_artifacts(&self) -> Result<PathBuf, ReportError> {
        let path = self.root.join(format!("results_{}.tar.gz", self.stamp));
        let file = File::create(&path).map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all("artifacts", &self.artifacts_dir)
            .map_err(|e| ReportError::Io {
                path: self.artifacts_dir.clone(),
                source: e,
            })?;
        let encoder = builder.into_inner().map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        encoder.finish().map_err(|e| ReportError::Io {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "result archive written");
        Ok(path)
    }
}

/// Collapses a URL or domain into a filesystem-safe token.
fn sanitize(text: &str) -> String {
    let mut out: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            c
        } else {
            '_'
        })
        .collect();
    out.truncate(80);
    out
}
