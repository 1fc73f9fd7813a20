use crate::runner::{join_pipe_reader, spawn_pipe_reader, wait_with_timeout};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Timeout for the trivial `-h` probe used to verify a tool is runnable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Description of an external tool the engine depends on.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    /// Binary name searched for on PATH.
    pub name: &'static str,
    /// Environment variable that may override the tool's location.
    pub env_var: &'static str,
    /// Shown in the error when the tool cannot be found.
    pub install_hint: &'static str,
}

/// The URL-parameter substitution tool.
pub const SUBSTITUTION_TOOL: ToolSpec = ToolSpec {
    name: "qsreplace",
    env_var: "QSREPLACE_PATH",
    install_hint: "install it with: go install github.com/tomnomnom/qsreplace@latest",
};

/// The grep-like pattern filter tool.
pub const FILTER_TOOL: ToolSpec = ToolSpec {
    name: "gf",
    env_var: "GF_PATH",
    install_hint: "install it with: go install github.com/tomnomnom/gf@latest",
};

/// Errors raised while resolving external tools at startup.
#[derive(Error, Debug)]
pub enum LocateError {
    /// The tool was not found via explicit path, environment override, or
    /// PATH search. Fatal unless the run is a dry-run.
    #[error("{name} not found; {hint}")]
    ToolUnavailable { name: &'static str, hint: &'static str },

    /// A candidate path exists but the probe invocation did not behave like
    /// a runnable tool.
    #[error("{name} at {path:?} is not functional")]
    NotFunctional { name: &'static str, path: PathBuf },
}

/// Immutable resolved tool paths for the whole run.
///
/// In dry-run mode unresolved tools are left as bare names; nothing is ever
/// spawned with them.
#[derive(Debug, Clone)]
pub struct ResolvedTools {
    pub substitution: PathBuf,
    pub filter: PathBuf,
}

/// Resolves both external tools once at startup.
///
/// Resolution failures abort the run, except under `dry_run` where they are
/// downgraded to warnings.
pub fn locate_tools(
    substitution_path: Option<PathBuf>,
    filter_path: Option<PathBuf>,
    dry_run: bool,
) -> Result<ResolvedTools, LocateError> {
    let substitution = resolve_or_placeholder(&SUBSTITUTION_TOOL, substitution_path, dry_run)?;
    let filter = resolve_or_placeholder(&FILTER_TOOL, filter_path, dry_run)?;
    Ok(ResolvedTools {
        substitution,
        filter,
    })
}

fn resolve_or_placeholder(
    spec: &ToolSpec,
    explicit: Option<PathBuf>,
    dry_run: bool,
) -> Result<PathBuf, LocateError> {
    match resolve_tool(spec, explicit.as_deref()) {
        Ok(path) => Ok(path),
        Err(e) if dry_run => {
            warn!(tool = spec.name, error = %e, "[dry-run] tool unavailable, continuing");
            Ok(PathBuf::from(spec.name))
        }
        Err(e) => Err(e),
    }
}

/// Resolves a single tool in priority order: explicit path, environment
/// variable override, PATH lookup, then a few well-known directories. The
/// winning candidate must also pass [`probe_tool`].
pub fn resolve_tool(spec: &ToolSpec, explicit: Option<&Path>) -> Result<PathBuf, LocateError> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(spec.env_var) {
        if !env_path.is_empty() {
            candidates.push(PathBuf::from(env_path));
        }
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            candidates.push(dir.join(spec.name));
        }
    }
    for dir in well_known_dirs() {
        candidates.push(dir.join(spec.name));
    }

    for candidate in candidates {
        if !is_executable_file(&candidate) {
            continue;
        }
        if probe_tool(&candidate) {
            info!(tool = spec.name, path = %candidate.display(), "resolved external tool");
            return Ok(candidate);
        }
        warn!(
            tool = spec.name,
            path = %candidate.display(),
            "candidate exists but failed the probe invocation"
        );
        return Err(LocateError::NotFunctional {
            name: spec.name,
            path: candidate,
        });
    }

    Err(LocateError::ToolUnavailable {
        name: spec.name,
        hint: spec.install_hint,
    })
}

/// Runs `<tool> -h` under a short timeout. A tool counts as functional when
/// the probe exits zero or its output mentions "usage".
pub fn probe_tool(path: &Path) -> bool {
    let spawned = Command::new(path)
        .arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(_) => return false,
    };

    // Drain both pipes while waiting; a verbose tool must not be able to
    // fill the pipe buffer and stall until the probe timeout.
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let exited = wait_with_timeout(&mut child, PROBE_TIMEOUT);
    let mut output = join_pipe_reader(stdout_reader);
    output.push_str(&join_pipe_reader(stderr_reader));

    match exited {
        Ok(Some(status)) => status.success() || output.to_lowercase().contains("usage"),
        _ => false,
    }
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/usr/bin")];
    if let Some(home) = std::env::home_dir() {
        dirs.push(home.join(".npm-global/bin"));
        dirs.push(home.join("bin"));
    }
    dirs
}
