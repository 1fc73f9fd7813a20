use crate::runner::wait_with_timeout;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Named rule category passed to the pattern-filter tool.
pub const FILTER_RULE: &str = "rce";

/// Errors from parameter extraction. These are contained per work item and
/// never abort the run; the scheduler logs them and moves on.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("parameter corpus I/O error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("pattern filter failed: {0}")]
    Filter(String),
}

/// Append-only, deduplicated store of parameter names the filter tool has
/// flagged as RCE-relevant, persisted as one name per line.
///
/// Appends go through an append-then-flush discipline: a crash mid-write can
/// lose at most the batch being written, never prior entries.
#[derive(Debug)]
pub struct ParameterCorpus {
    path: PathBuf,
    known: HashSet<String>,
}

impl ParameterCorpus {
    /// Opens the corpus, loading any entries persisted by earlier runs.
    pub fn open(path: PathBuf) -> Result<Self, ExtractError> {
        let mut known = HashSet::new();
        if path.is_file() {
            let file = File::open(&path).map_err(|e| ExtractError::Io {
                path: path.clone(),
                source: e,
            })?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| ExtractError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    known.insert(trimmed.to_string());
                }
            }
        }
        debug!(entries = known.len(), path = %path.display(), "parameter corpus opened");
        Ok(Self { path, known })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Appends every name not already present, then flushes. Returns how
    /// many entries were new.
    pub fn record<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, ExtractError> {
        let fresh: Vec<String> = names
            .into_iter()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .filter(|n| !self.known.contains(*n))
            .map(str::to_string)
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ExtractError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        for name in &fresh {
            writeln!(file, "{name}").map_err(|e| ExtractError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        file.flush().map_err(|e| ExtractError::Io {
            path: self.path.clone(),
            source: e,
        })?;

        let added = fresh.len();
        self.known.extend(fresh);
        Ok(added)
    }
}

/// Configuration for [`ParameterExtractor`].
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Resolved path of the pattern-filter tool.
    pub filter_tool: PathBuf,
    /// Rule category handed to the tool as its argument.
    pub rule: String,
    /// Timeout for one filter invocation.
    pub timeout: Duration,
    /// Dry-run disables filter invocations entirely.
    pub enabled: bool,
}

/// Pipes captured tool output through the pattern-filter tool and feeds the
/// resulting parameter names into the persistent corpus.
///
/// Also remembers, per run, which source URLs produced at least one flagged
/// parameter; the scorer consumes that as a feature.
#[derive(Debug)]
pub struct ParameterExtractor {
    config: ExtractorConfig,
    corpus: ParameterCorpus,
    flagged_urls: HashSet<String>,
}

impl ParameterExtractor {
    pub fn new(config: ExtractorConfig, corpus: ParameterCorpus) -> Self {
        Self {
            config,
            corpus,
            flagged_urls: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Runs the filter over one invocation's stdout and records any newly
    /// discovered parameter names. Returns the number of new corpus entries.
    pub fn process(&mut self, source_url: &str, raw_output: &str) -> Result<usize, ExtractError> {
        if !self.config.enabled || raw_output.is_empty() {
            return Ok(0);
        }
        let filter_output = run_filter(
            &self.config.filter_tool,
            &self.config.rule,
            raw_output,
            self.config.timeout,
        )?;
        let names = parse_filter_output(&filter_output);
        self.record_flagged(source_url, &names)
    }

    /// Records already-parsed filter output: flags the source URL and appends
    /// new names to the corpus. Split from [`process`](Self::process) so
    /// callers can run the filter subprocess without holding a lock on the
    /// extractor.
    pub fn record_flagged(
        &mut self,
        source_url: &str,
        names: &[String],
    ) -> Result<usize, ExtractError> {
        if names.is_empty() {
            return Ok(0);
        }
        self.flagged_urls.insert(source_url.to_string());
        let added = self.corpus.record(names.iter().map(String::as_str))?;
        if added > 0 {
            debug!(url = source_url, added, "new RCE-relevant parameters recorded");
        }
        Ok(added)
    }

    /// Whether this run's extraction flagged the given URL.
    pub fn is_flagged(&self, url: &str) -> bool {
        self.flagged_urls.contains(url)
    }

    pub fn corpus(&self) -> &ParameterCorpus {
        &self.corpus
    }
}

/// Parses the filter tool's stdout: one parameter name per line, trimmed,
/// deduplicated in first-seen order.
pub fn parse_filter_output(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}

pub(crate) fn run_filter(
    tool: &Path,
    rule: &str,
    input: &str,
    timeout: Duration,
) -> Result<String, ExtractError> {
    let mut child = Command::new(tool)
        .arg(rule)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ExtractError::Filter(format!("failed to spawn {tool:?}: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input.as_bytes()) {
            warn!(error = %e, "writing to filter stdin failed");
        }
    }

    let stdout_handle = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    match wait_with_timeout(&mut child, timeout) {
        Ok(Some(status)) if status.success() => Ok(stdout_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default()),
        Ok(Some(status)) => Err(ExtractError::Filter(format!(
            "filter exited with {:?}",
            status.code()
        ))),
        Ok(None) => Err(ExtractError::Filter("filter timed out".to_string())),
        Err(e) => Err(ExtractError::Filter(format!(
            "error waiting for filter: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn fake_filter(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("gf");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn extractor_config(tool: PathBuf) -> ExtractorConfig {
        ExtractorConfig {
            filter_tool: tool,
            rule: FILTER_RULE.to_string(),
            timeout: Duration::from_secs(5),
            enabled: true,
        }
    }

    #[test]
    fn corpus_deduplicates_within_a_batch_and_across_calls() {
        let dir = tempdir().unwrap();
        let mut corpus = ParameterCorpus::open(dir.path().join("params.txt")).unwrap();
        assert_eq!(corpus.record(["id", "cmd", "id"]).unwrap(), 2);
        assert_eq!(corpus.record(["cmd", "exec"]).unwrap(), 1);
        assert_eq!(corpus.len(), 3);
    }

    #[test]
    fn preseeded_corpus_keeps_exactly_one_entry_per_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.txt");
        fs::write(&path, "id\n").unwrap();

        let mut corpus = ParameterCorpus::open(path.clone()).unwrap();
        assert!(corpus.contains("id"));
        assert_eq!(corpus.record(["id"]).unwrap(), 0);

        let contents = fs::read_to_string(&path).unwrap();
        let id_lines = contents.lines().filter(|l| *l == "id").count();
        assert_eq!(id_lines, 1);
    }

    #[test]
    fn corpus_appends_preserve_prior_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.txt");
        {
            let mut corpus = ParameterCorpus::open(path.clone()).unwrap();
            corpus.record(["id"]).unwrap();
        }
        {
            let mut corpus = ParameterCorpus::open(path.clone()).unwrap();
            corpus.record(["cmd"]).unwrap();
        }
        let reopened = ParameterCorpus::open(path).unwrap();
        assert!(reopened.contains("id"));
        assert!(reopened.contains("cmd"));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn parse_filter_output_trims_and_deduplicates() {
        let parsed = parse_filter_output("id\n  cmd \n\nid\nexec\n");
        assert_eq!(parsed, vec!["id", "cmd", "exec"]);
    }

    #[test]
    fn extractor_records_names_and_flags_the_source_url() {
        let dir = tempdir().unwrap();
        // Filter that ignores its input and reports two parameter names.
        let tool = fake_filter(dir.path(), "cat >/dev/null\necho id\necho cmd");
        let corpus = ParameterCorpus::open(dir.path().join("params.txt")).unwrap();
        let mut extractor = ParameterExtractor::new(extractor_config(tool), corpus);

        let added = extractor
            .process("http://example.com/a?id=1", "http://example.com/a?id=PAYLOAD")
            .unwrap();
        assert_eq!(added, 2);
        assert!(extractor.is_flagged("http://example.com/a?id=1"));
        assert!(!extractor.is_flagged("http://other.com/?x=1"));
        assert!(extractor.corpus().contains("id"));
    }

    #[test]
    fn extractor_is_inert_when_disabled_or_output_empty() {
        let dir = tempdir().unwrap();
        let tool = fake_filter(dir.path(), "echo never");
        let corpus = ParameterCorpus::open(dir.path().join("params.txt")).unwrap();
        let mut cfg = extractor_config(tool);
        cfg.enabled = false;
        let mut extractor = ParameterExtractor::new(cfg, corpus);

        assert_eq!(extractor.process("http://e.com/?a=1", "output").unwrap(), 0);
        assert!(!extractor.is_flagged("http://e.com/?a=1"));
    }

    #[test]
    fn failing_filter_surfaces_a_contained_error() {
        let dir = tempdir().unwrap();
        let tool = fake_filter(dir.path(), "exit 7");
        let corpus = ParameterCorpus::open(dir.path().join("params.txt")).unwrap();
        let mut extractor = ParameterExtractor::new(extractor_config(tool), corpus);

        let result = extractor.process("http://e.com/?a=1", "output");
        assert!(matches!(result, Err(ExtractError::Filter(_))));
    }
}
