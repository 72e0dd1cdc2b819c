//! PATH reconstruction for the backend launch
//!
//! Desktop launches inherit a minimal PATH, so the user's interactive login shell is asked
//! for its PATH once and the result is merged with the inherited one and a few well-known
//! install locations.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};

static SHELL_PATH: OnceCell<Option<String>> = OnceCell::const_new();

const SHELL_PATH_TIMEOUT: Duration = Duration::from_secs(5);

/// Markers around the PATH so shell banners can be ignored
const PATH_MARKER: &str = "__AGENTGATE_PATH__";

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

/// Install locations checked even when no shell reports them
fn common_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".opencode").join("bin"));
        dirs.push(home.join(".bun").join("bin"));
        dirs.push(home.join(".local").join("bin"));
        dirs.push(home.join(".cargo").join("bin"));
    }
    for dir in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"] {
        dirs.push(PathBuf::from(dir));
    }
    dirs
}

/// PATH reported by `$SHELL -lic`, cached for the life of the process
async fn login_shell_path() -> Option<String> {
    SHELL_PATH
        .get_or_init(|| async {
            let shell = std::env::var("SHELL").ok().filter(|s| !s.is_empty())?;
            let script = format!("printf '{m}%s{m}' \"$PATH\"", m = PATH_MARKER);

            let output = match timeout(
                SHELL_PATH_TIMEOUT,
                Command::new(&shell)
                    .args(["-lic", &script])
                    .stdin(std::process::Stdio::null())
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    warn!("Failed to run {} to read PATH: {}", shell, e);
                    return None;
                }
                Err(_) => {
                    warn!("{} did not report PATH within {:?}", shell, SHELL_PATH_TIMEOUT);
                    return None;
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let path = extract_marked_path(&stdout);
            debug!("Login shell PATH: {:?}", path);
            path
        })
        .await
        .clone()
}

fn extract_marked_path(output: &str) -> Option<String> {
    let start = output.find(PATH_MARKER)? + PATH_MARKER.len();
    let rest = &output[start..];
    let end = rest.find(PATH_MARKER)?;
    let path = rest[..end].trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// Join PATH sources in priority order, dropping empty and duplicate entries
pub fn merge_path_entries<I, S>(sources: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut merged: Vec<String> = Vec::new();
    for source in sources {
        for entry in source.as_ref().split(PATH_SEPARATOR) {
            let entry = entry.trim();
            if !entry.is_empty() && seen.insert(entry.to_string()) {
                merged.push(entry.to_string());
            }
        }
    }
    merged.join(&PATH_SEPARATOR.to_string())
}

/// PATH for the backend: login shell, then inherited, then well-known directories
pub async fn augmented_path(use_login_shell: bool) -> String {
    let shell = if use_login_shell {
        login_shell_path().await.unwrap_or_default()
    } else {
        String::new()
    };
    let inherited = std::env::var("PATH").unwrap_or_default();
    let common = common_dirs()
        .into_iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(&PATH_SEPARATOR.to_string());

    merge_path_entries([shell, inherited, common])
}

/// Resolve the backend executable: explicit override, then PATH search, then the bare name
pub fn resolve_program(binary_override: Option<&Path>, command: &str, path: &str) -> PathBuf {
    if let Some(binary) = binary_override {
        return binary.to_path_buf();
    }

    // Anything with a separator is already a path
    if command.contains('/') || command.contains('\\') {
        return PathBuf::from(command);
    }

    for dir in path.split(PATH_SEPARATOR).filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(command);
        if is_executable(&candidate) {
            return candidate;
        }
        #[cfg(windows)]
        {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return exe;
            }
        }
    }

    PathBuf::from(command)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_dedupes_in_priority_order() {
        let merged = merge_path_entries(["/a:/b", "/b::/c", "/a:/d"]);
        assert_eq!(merged, "/a:/b:/c:/d");
    }

    #[test]
    fn test_extract_marked_path_ignores_banner() {
        let out = format!("Welcome!\nlast login\n{m}/usr/bin:/opt/x{m}", m = PATH_MARKER);
        assert_eq!(extract_marked_path(&out).as_deref(), Some("/usr/bin:/opt/x"));
        assert_eq!(extract_marked_path("no markers"), None);
    }

    #[test]
    fn test_resolve_prefers_override() {
        let resolved = resolve_program(Some(Path::new("/custom/opencode")), "opencode", "/usr/bin");
        assert_eq!(resolved, PathBuf::from("/custom/opencode"));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_searches_path_then_falls_back() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fake-agent");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(resolve_program(None, "fake-agent", &path), bin);
        assert_eq!(
            resolve_program(None, "missing-agent", &path),
            PathBuf::from("missing-agent")
        );
    }
}
