use sdk::errors::EngineError;
use std::path::{Component, Path, PathBuf};

/// FileSystemGuard confines skill file access to the run workspace.
///
/// # Security Model
///
/// Existing paths pass four gates:
/// 1. Check deny list before canonicalization
/// 2. Canonicalize path to resolve symlinks and .. patterns
/// 3. Check deny list after canonicalization
/// 4. Verify path is within workspace
///
/// Paths that do not exist yet (write targets) are checked against the deny
/// list, must not contain `..`, and their nearest existing ancestor must
/// canonicalize inside the workspace.
#[derive(Debug, Clone)]
pub struct FileSystemGuard {
    workspace: PathBuf,
    deny_list: Vec<PathBuf>,
}

impl FileSystemGuard {
    /// Creates a guard rooted at `workspace`, which must exist.
    ///
    /// The deny list covers key material and credential files (.ssh, .env,
    /// cloud and package-registry credentials, GPG and kube config).
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self, EngineError> {
        let workspace = workspace.as_ref();
        // Canonicalize workspace to handle symlinks (e.g., /var -> /private/var on macOS)
        let workspace = workspace.canonicalize().map_err(|e| {
            EngineError::PathCanonicalization(workspace.to_path_buf(), e.to_string())
        })?;

        let deny_list = [
            ".ssh",
            ".env",
            ".aws/credentials",
            ".config/gcloud",
            "id_rsa",
            "id_ed25519",
            "id_dsa",
            ".gnupg",
            ".kube/config",
            "credentials",
            "private_key",
            ".npmrc",
            ".pypirc",
        ]
        .into_iter()
        .map(PathBuf::from)
        .collect();

        Ok(Self {
            workspace,
            deny_list,
        })
    }

    /// Validates an existing path through the four gates and returns its
    /// canonical form.
    pub fn validate_path(&self, path: &Path) -> Result<PathBuf, EngineError> {
        // Gate 1
        self.check_denied(path)?;

        // Gate 2
        let canonical = path
            .canonicalize()
            .map_err(|e| EngineError::PathCanonicalization(path.to_path_buf(), e.to_string()))?;

        // Gate 3: catches symlink bypasses
        if self.is_denied(&canonical) {
            return Err(EngineError::PathDenied(canonical));
        }

        // Gate 4
        if !canonical.starts_with(&self.workspace) {
            return Err(EngineError::PathOutsideWorkspace(canonical));
        }

        Ok(canonical)
    }

    /// Resolve a skill-supplied path (absolute or workspace-relative) that
    /// must already exist.
    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf, EngineError> {
        self.validate_path(&self.absolute(path))
    }

    /// Resolve a write target that may not exist yet.
    ///
    /// Does not create anything; callers create missing parents after the
    /// check passes.
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, EngineError> {
        let target = self.absolute(path);
        self.check_denied(&target)?;

        if target.exists() {
            return self.validate_path(&target);
        }

        if target.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(EngineError::PathOutsideWorkspace(target));
        }

        let ancestor = target
            .ancestors()
            .skip(1)
            .find(|p| p.exists())
            .ok_or_else(|| EngineError::PathOutsideWorkspace(target.clone()))?;
        let canonical_ancestor = self.validate_path(ancestor)?;

        let suffix = target
            .strip_prefix(ancestor)
            .map_err(|e| EngineError::PathCanonicalization(target.clone(), e.to_string()))?;
        Ok(canonical_ancestor.join(suffix))
    }

    fn absolute(&self, path: &str) -> PathBuf {
        let target = Path::new(path);
        if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.workspace.join(target)
        }
    }

    /// True when the path ends with a denied entry or has a component equal
    /// to one.
    fn is_denied(&self, path: &Path) -> bool {
        self.deny_list.iter().any(|denied| {
            path.ends_with(denied)
                || path
                    .components()
                    .any(|c| c.as_os_str() == denied.as_os_str())
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Check a path against the deny list without touching the disk.
    pub fn check_denied(&self, path: &Path) -> Result<(), EngineError> {
        if self.is_denied(path) {
            return Err(EngineError::PathDenied(path.to_path_buf()));
        }
        Ok(())
    }
}
