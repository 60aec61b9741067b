use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::persist::{path_component, sha256_hex, write_atomic};

/// Checkpoint reference to a committed namespace state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    pub digest: String,
}

/// Variable space of one agent run.
///
/// The state is an opaque pickled blob produced by the sandbox. Every
/// committed state is stored under its content digest, so a checkpoint that
/// references a digest can always be restored even after later commits.
#[derive(Debug)]
pub struct Namespace {
    run_id: String,
    dir: PathBuf,
    state: Vec<u8>,
    digest: Option<String>,
}

impl Namespace {
    /// Empty namespace for a fresh run.
    pub fn create(root: &Path, run_id: &str) -> Result<Self> {
        let dir = root.join(path_component(run_id));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create namespace dir {}", dir.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
            state: Vec::new(),
            digest: None,
        })
    }

    /// Load the state a checkpoint points at.
    pub fn restore(root: &Path, run_id: &str, snapshot: &NamespaceSnapshot) -> Result<Self> {
        let mut namespace = Self::create(root, run_id)?;
        let path = namespace.state_path(&snapshot.digest);
        let state = std::fs::read(&path)
            .with_context(|| format!("namespace state {} is missing", path.display()))?;
        let actual = sha256_hex(&state);
        if actual != snapshot.digest {
            bail!(
                "namespace state {} is corrupt: expected digest {}, found {actual}",
                path.display(),
                snapshot.digest
            );
        }
        namespace.state = state;
        namespace.digest = Some(snapshot.digest.clone());
        Ok(namespace)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn snapshot(&self) -> Option<NamespaceSnapshot> {
        self.digest.clone().map(|digest| NamespaceSnapshot { digest })
    }

    /// Persist a new state and make it current.
    pub fn commit(&mut self, state: Vec<u8>) -> Result<NamespaceSnapshot> {
        let digest = sha256_hex(&state);
        let path = self.state_path(&digest);
        if !path.exists() {
            write_atomic(&path, &state)?;
        }
        self.state = state;
        self.digest = Some(digest.clone());
        Ok(NamespaceSnapshot { digest })
    }

    /// Independent copy for a nested run (for example a chart sub-loop).
    ///
    /// Changes made by the fork never flow back into this namespace.
    pub fn fork(&self, run_id: &str) -> Result<Self> {
        let root = self
            .dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.clone());
        let mut forked = Self::create(&root, run_id)?;
        if self.digest.is_some() {
            forked.commit(self.state.clone())?;
        }
        Ok(forked)
    }

    fn state_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("state-{}.pkl", path_component(digest)))
    }
}
