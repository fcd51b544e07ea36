use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::{self, DiffOp, PatchBatch, PatchError};

/// Owner of one note's authoritative text.
///
/// Every mutation goes through [`DocResolver::apply_and_diff`], so the
/// (text, version) pair only ever changes atomically under the state lock and
/// writes are linearized. Nothing outside the resolver touches the text.
pub struct DocResolver {
    path: PathBuf,
    state: Mutex<DocState>,
}

struct DocState {
    text: String,
    version: u64,
}

#[derive(Debug)]
pub enum ResolverError {
    Load(std::io::Error),
    Persist(std::io::Error),
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverError::Load(e) => write!(f, "failed to read note during resolver init: {e}"),
            ResolverError::Persist(e) => write!(f, "resolver failed to write note to disk: {e}"),
        }
    }
}

impl Error for ResolverError {}

impl DocResolver {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(DocState {
                text: String::new(),
                version: 0,
            }),
        }
    }

    /// Load the backing note. Failure here must abort session creation.
    pub async fn initialize(&self) -> Result<(), ResolverError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(ResolverError::Load)?;

        let mut state = self.state.lock().await;
        state.text = data;
        state.version = 0;
        Ok(())
    }

    /// Apply a patch batch and return the delta it produced.
    ///
    /// The diff is always computed against the authoritative pre-apply text,
    /// never against whatever was last broadcast. A batch that does not fully
    /// apply leaves text and version untouched.
    pub async fn apply_and_diff(&self, patches: &PatchBatch) -> Result<Vec<DiffOp>, PatchError> {
        let mut state = self.state.lock().await;

        let new_text = engine::apply(&state.text, patches)?;
        let diffs = engine::diff(&state.text, &new_text);

        state.text = new_text;
        state.version += 1;
        debug!(
            "applied patch batch against {}: now at version {}",
            self.path.display(),
            state.version
        );

        Ok(diffs)
    }

    /// Coherent read of the current state, for bootstrapping a new member.
    pub async fn snapshot(&self) -> (String, u64) {
        let state = self.state.lock().await;
        (state.text.clone(), state.version)
    }

    /// Persist the current text to the backing store.
    ///
    /// Runs once, when the owning session is torn down; the registry never
    /// calls it while a write is in flight.
    pub async fn flush(&self) -> Result<(), ResolverError> {
        let text = {
            let state = self.state.lock().await;
            state.text.clone()
        };

        tokio::fs::write(&self.path, text)
            .await
            .map_err(ResolverError::Persist)?;
        debug!("flushed note to {}", self.path.display());
        Ok(())
    }
}
