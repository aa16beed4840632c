//! Phase 3: semantic check against the real binary
//!
//! Artifacts are written into a directory layout matching what HAProxy
//! will see on the pods, then `haproxy -c -f <cfg>` is executed. Binary
//! invocations interfere with each other even from isolated sandboxes, so
//! the exec (and only the exec) is serialized process-wide.

use std::path::{Path, PathBuf};

use htc_core::RenderedArtifact;
use htc_crd::ResourceDirs;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::Validator;

/// The process-wide binary-check critical section.
static BINARY_CHECK_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o600;

/// Filesystem layout the semantic check writes into.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    dirs: ResourceDirs,
}

impl Sandbox {
    /// A sandbox rooted at `root`; all configured directories are rebased
    /// under it.
    pub fn new(root: PathBuf, dirs: ResourceDirs) -> Self {
        Self { root, dirs }
    }

    fn rebase(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn config_dir(&self) -> PathBuf {
        Path::new(&self.dirs.config_file)
            .parent()
            .map(|p| self.rebase(&p.to_string_lossy()))
            .unwrap_or_else(|| self.root.clone())
    }

    /// Resolve an auxiliary file name: absolute paths are rebased,
    /// relative paths with subdirectories resolve against the config
    /// directory, bare names land in the type-specific directory.
    fn resolve_aux(&self, name: &str, type_dir: &str) -> PathBuf {
        if name.starts_with('/') {
            self.rebase(name)
        } else if name.contains('/') {
            self.config_dir().join(name)
        } else {
            self.rebase(type_dir).join(name)
        }
    }

    /// Clear and rebuild the sandbox with the artifact's files. Returns
    /// the path of the written main configuration.
    pub async fn prepare(&self, artifact: &RenderedArtifact) -> Result<PathBuf> {
        for dir in [
            self.rebase(&self.dirs.maps_dir),
            self.rebase(&self.dirs.ssl_certs_dir),
            self.rebase(&self.dirs.general_storage_dir),
            self.config_dir(),
        ] {
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            create_dir(&dir).await?;
        }

        for (name, content) in &artifact.maps {
            write_file(&self.resolve_aux(name, &self.dirs.maps_dir), content).await?;
        }
        for (name, content) in &artifact.certs {
            write_file(&self.resolve_aux(name, &self.dirs.ssl_certs_dir), content).await?;
        }
        for (name, content) in &artifact.files {
            write_file(&self.resolve_aux(name, &self.dirs.general_storage_dir), content).await?;
        }

        let config_path = self.rebase(&self.dirs.config_file);
        write_file(&config_path, &artifact.main_config).await?;
        Ok(config_path)
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    set_mode(dir, DIR_MODE).await
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            create_dir(parent).await?;
        }
    }
    tokio::fs::write(path, content).await?;
    set_mode(path, FILE_MODE).await
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Run the binary check for one artifact.
pub async fn check(
    validator: &Validator,
    artifact: &RenderedArtifact,
    dirs: &ResourceDirs,
) -> Result<()> {
    let sandbox = Sandbox::new(validator.sandbox_root.clone(), dirs.clone());
    let config_path = sandbox.prepare(artifact).await?;

    let output = {
        let _guard = BINARY_CHECK_LOCK.lock().await;
        debug!(config = %config_path.display(), "running haproxy -c");
        Command::new(&validator.haproxy_bin)
            .arg("-c")
            .arg("-f")
            .arg(&config_path)
            .output()
            .await
            .map_err(|e| Error::Setup(format!("failed to exec {}: {e}", validator.haproxy_bin)))?
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(status = ?output.status.code(), "haproxy -c rejected the configuration");
    Err(Error::Semantic { message: annotate_alerts(&stderr, &artifact.main_config) })
}

/// Keep `[ALERT]` lines from stderr and augment each `[file:line]`
/// reference with ±3 lines of the rendered configuration.
pub(crate) fn annotate_alerts(stderr: &str, config: &str) -> String {
    static LINE_REF: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\[[^\[\]:]+:(\d+)\]").expect("alert line regex"));

    let config_lines: Vec<&str> = config.lines().collect();
    let mut blocks = Vec::new();
    for line in stderr.lines() {
        if !line.contains("[ALERT]") {
            continue;
        }
        let mut block = line.to_string();
        if let Some(captures) = LINE_REF.captures(line) {
            if let Ok(lineno) = captures[1].parse::<usize>() {
                block.push('\n');
                block.push_str(&context_snippet(&config_lines, lineno));
            }
        }
        blocks.push(block);
    }
    if blocks.is_empty() {
        stderr.trim().to_string()
    } else {
        blocks.join("\n")
    }
}

fn context_snippet(lines: &[&str], lineno: usize) -> String {
    let start = lineno.saturating_sub(4);
    let end = (lineno + 3).min(lines.len());
    (start..end)
        .map(|i| {
            let marker = if i + 1 == lineno { ">" } else { " " };
            format!("  {marker} {:>4} | {}", i + 1, lines.get(i).unwrap_or(&""))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn artifact() -> RenderedArtifact {
        let mut maps = BTreeMap::new();
        maps.insert("hosts.map".to_string(), "example.com be_web\n".to_string());
        maps.insert("/etc/haproxy/maps/extra.map".to_string(), "x y\n".to_string());
        maps.insert("sub/nested.map".to_string(), "a b\n".to_string());
        RenderedArtifact::new(
            "global\n  maxconn 2000\n".to_string(),
            maps,
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn prepare_resolves_the_three_path_forms() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(tmp.path().to_path_buf(), ResourceDirs::default());
        let config_path = sandbox.prepare(&artifact()).await.unwrap();

        assert_eq!(config_path, tmp.path().join("etc/haproxy/haproxy.cfg"));
        assert!(tmp.path().join("etc/haproxy/maps/hosts.map").exists());
        assert!(tmp.path().join("etc/haproxy/maps/extra.map").exists());
        assert!(tmp.path().join("etc/haproxy/sub/nested.map").exists());
    }

    #[tokio::test]
    async fn prepare_clears_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(tmp.path().to_path_buf(), ResourceDirs::default());
        sandbox.prepare(&artifact()).await.unwrap();

        let stale = tmp.path().join("etc/haproxy/maps/stale.map");
        tokio::fs::write(&stale, "old").await.unwrap();
        sandbox.prepare(&artifact()).await.unwrap();
        assert!(!stale.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(tmp.path().to_path_buf(), ResourceDirs::default());
        let config_path = sandbox.prepare(&artifact()).await.unwrap();
        let mode = std::fs::metadata(&config_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn succeeding_binary_passes_the_check() {
        let tmp = tempfile::tempdir().unwrap();
        let validator = Validator {
            haproxy_bin: "true".to_string(),
            sandbox_root: tmp.path().to_path_buf(),
        };
        check(&validator, &artifact(), &ResourceDirs::default()).await.unwrap();
    }

    #[tokio::test]
    async fn failing_binary_yields_semantic_error() {
        let tmp = tempfile::tempdir().unwrap();
        let validator = Validator {
            haproxy_bin: "false".to_string(),
            sandbox_root: tmp.path().to_path_buf(),
        };
        let err = check(&validator, &artifact(), &ResourceDirs::default()).await.unwrap_err();
        assert!(matches!(err, Error::Semantic { .. }));
    }

    #[test]
    fn alerts_gain_config_context() {
        let config = "global\n  maxconn 2000\n\nfrontend www\n  bind *:80\n  http-request deny\n";
        let stderr = "[NOTICE]   (1) : haproxy version is 3.0.5\n[ALERT]    (1) : config : parsing [/etc/haproxy/haproxy.cfg:6] : 'http-request' : unknown parameter\n[ALERT]    (1) : config : fatal errors found in configuration.\n";
        let annotated = annotate_alerts(stderr, config);
        assert!(annotated.contains("'http-request'"));
        assert!(annotated.contains("> "));
        assert!(annotated.contains("6 |   http-request deny"));
        assert!(annotated.contains("4 | frontend www"));
        assert!(!annotated.contains("[NOTICE]"));
    }

    #[test]
    fn alert_free_stderr_passes_through() {
        assert_eq!(annotate_alerts("some failure\n", "global\n"), "some failure");
    }
}
