//! Shared fixtures for lifecycle BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use ebsmount::MountResult;
use ebsmount::test_support::Harness;
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Clone)]
pub struct LifecycleContext {
    pub harness: Harness,
    pub mount_point: Utf8PathBuf,
    pub outcome: Option<LifecycleOutcome>,
    pub(crate) scratch: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum LifecycleOutcome {
    Mounted(MountResult),
    TornDown,
    Failed { kind: String, message: String },
}

#[derive(Clone, Debug, Error)]
pub enum LifecycleTestError {
    #[error("failed to create scratch directory: {0}")]
    Workspace(String),
}

#[fixture]
pub fn lifecycle_context_result() -> Result<LifecycleContext, LifecycleTestError> {
    build_lifecycle_context()
}

#[fixture]
pub fn lifecycle_context(
    lifecycle_context_result: Result<LifecycleContext, LifecycleTestError>,
) -> LifecycleContext {
    lifecycle_context_result
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

pub fn build_lifecycle_context() -> Result<LifecycleContext, LifecycleTestError> {
    let scratch =
        TempDir::new().map_err(|err| LifecycleTestError::Workspace(format!("tempdir: {err}")))?;
    let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|path| {
        LifecycleTestError::Workspace(format!("non-utf8 tempdir path: {}", path.display()))
    })?;

    Ok(LifecycleContext {
        harness: Harness::new(),
        mount_point: root.join("data"),
        outcome: None,
        scratch: Arc::new(scratch),
    })
}
