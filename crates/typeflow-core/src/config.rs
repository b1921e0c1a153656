//! Analysis configuration

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for the drain loop and the optional passes.
///
/// Deserializes from JSON with every field optional:
///
/// ```
/// use typeflow_core::AnalysisConfig;
///
/// let config = AnalysisConfig::from_json(r#"{ "parallel": false, "batch_size": 8 }"#).unwrap();
/// assert!(!config.parallel);
/// assert_eq!(config.batch_size, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Process each batch on the rayon pool
    pub parallel: bool,
    /// Maximum blocks taken per batch, `0` drains the whole queue at once
    pub batch_size: usize,
    /// Safety valve on forced flushes of the dirty set. Stalls are caught
    /// earlier by two flushes in a row without progress; the drain loop
    /// raises this cap to the program's block count.
    pub max_dirty_flushes: usize,
    /// Abandon the drain loop after this many milliseconds
    pub deadline_ms: Option<u64>,
    /// Emit `UndefinedVariable` diagnostics
    pub report_undefined_variables: bool,
    /// Run the reachability pass after convergence
    pub reachability: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            batch_size: 64,
            max_dirty_flushes: 256,
            deadline_ms: None,
            report_undefined_variables: true,
            reachability: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json(source: &str) -> anyhow::Result<Self> {
        let config: AnalysisConfig = serde_json::from_str(source)
            .map_err(|e| anyhow::anyhow!("malformed analysis configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Run every batch on the calling thread
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn without_reachability(mut self) -> Self {
        self.reachability = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_dirty_flushes == 0 {
            return Err(FlowError::InvalidConfig(
                "max_dirty_flushes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Whether batches actually run in parallel for this build
    pub fn runs_parallel(&self) -> bool {
        self.parallel && !cfg!(feature = "deterministic")
    }
}
