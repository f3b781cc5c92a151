/// Skill Package Preparation
///
/// Resolves a job's `skill_path` into something the sandbox can run.
///
/// **Discovery order:**
/// 1. `skill.json` manifest: `{"entrypoint": "<relative path>", "runtime": "<program>"}`
/// 2. `run.sh`   → `sh run.sh`
/// 3. `main.py`  → `python3 main.py`
/// 4. `index.js` → `node index.js`
///
/// Preparation happens once per job. Any failure here is an infrastructure
/// failure: the job goes to FAILED without running a single test case.

use crate::error::InfraError;
use serde::Deserialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "skill.json";

/// Conventional entrypoints, in priority order
const CONVENTIONAL_ENTRYPOINTS: &[(&str, &str)] = &[
    ("run.sh", "sh"),
    ("main.py", "python3"),
    ("index.js", "node"),
];

#[derive(Debug, Deserialize)]
struct Manifest {
    entrypoint: String,
    #[serde(default)]
    runtime: Option<String>,
}

/// How to launch a skill, relative to wherever the package is mounted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    /// Interpreter; `None` executes the script directly
    pub runtime: Option<String>,
    /// Path of the script inside the package
    pub script: PathBuf,
}

impl Entrypoint {
    /// Full argv with the package mounted at `mount`
    pub fn argv(&self, mount: &Path) -> Vec<String> {
        let script = mount.join(&self.script).to_string_lossy().into_owned();
        match &self.runtime {
            Some(runtime) => vec![runtime.clone(), script],
            None => vec![script],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillPackage {
    pub root: PathBuf,
    pub entrypoint: Entrypoint,
}

/// Resolve and validate a skill package directory
pub async fn prepare(skill_path: &str) -> Result<SkillPackage, InfraError> {
    let root = PathBuf::from(skill_path.trim());

    let metadata = match tokio::fs::metadata(&root).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(InfraError::PackageNotFound { path: root })
        }
        Err(source) => return Err(InfraError::Io { path: root, source }),
    };
    if !metadata.is_dir() {
        return Err(InfraError::NotADirectory { path: root });
    }

    // Canonical form so bind mounts and scratch dirs see the real location
    let root = tokio::fs::canonicalize(&root)
        .await
        .map_err(|source| InfraError::Io { path: root.clone(), source })?;

    let entrypoint = match read_manifest(&root).await? {
        Some(manifest) => manifest_entrypoint(&root, manifest).await?,
        None => discover_entrypoint(&root).await?,
    };

    debug!(
        root = %root.display(),
        script = %entrypoint.script.display(),
        runtime = ?entrypoint.runtime,
        "Skill package prepared"
    );

    Ok(SkillPackage { root, entrypoint })
}

async fn read_manifest(root: &Path) -> Result<Option<Manifest>, InfraError> {
    let path = root.join(MANIFEST_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(InfraError::Io { path, source }),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| InfraError::InvalidManifest {
            path,
            reason: e.to_string(),
        })
}

async fn manifest_entrypoint(root: &Path, manifest: Manifest) -> Result<Entrypoint, InfraError> {
    let manifest_path = root.join(MANIFEST_FILE);
    let script = PathBuf::from(manifest.entrypoint.trim());

    if script.as_os_str().is_empty() {
        return Err(InfraError::InvalidManifest {
            path: manifest_path,
            reason: "entrypoint is empty".to_string(),
        });
    }
    // Must stay inside the package
    if !script
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(InfraError::InvalidManifest {
            path: manifest_path,
            reason: format!("entrypoint '{}' escapes the package", script.display()),
        });
    }
    if !is_file(&root.join(&script)).await {
        return Err(InfraError::InvalidManifest {
            path: manifest_path,
            reason: format!("entrypoint '{}' does not exist", script.display()),
        });
    }

    let runtime = manifest
        .runtime
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .or_else(|| runtime_for_extension(&script).map(str::to_string));

    Ok(Entrypoint { runtime, script })
}

async fn discover_entrypoint(root: &Path) -> Result<Entrypoint, InfraError> {
    for (file, runtime) in CONVENTIONAL_ENTRYPOINTS {
        if is_file(&root.join(file)).await {
            return Ok(Entrypoint {
                runtime: Some(runtime.to_string()),
                script: PathBuf::from(file),
            });
        }
    }
    Err(InfraError::NoEntrypoint {
        path: root.to_path_buf(),
    })
}

fn runtime_for_extension(script: &Path) -> Option<&'static str> {
    match script.extension()?.to_str()? {
        "sh" => Some("sh"),
        "py" => Some("python3"),
        "js" | "mjs" => Some("node"),
        _ => None,
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
