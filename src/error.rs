use thiserror::Error;

/// Typed failures the orchestrators raise. Anything else reaching `main` is fatal.
#[derive(Debug, Error)]
pub enum KairosError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid retention '{0}': expected <integer><m|h|d|w>")]
    InvalidRetentionFormat(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{target}: {detail}")]
    RemoteCommand { target: String, detail: String },

    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey {
        collection: &'static str,
        key: String,
    },

    #[error("snapshot '{snapshot}' on {svm}:{volume} is busy")]
    SnapshotBusy {
        svm: String,
        volume: String,
        snapshot: String,
    },

    #[error("another operation is in progress for cluster '{0}'")]
    OperationInProgress(String),
}

impl KairosError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn remote(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::RemoteCommand {
            target: target.into(),
            detail: detail.into(),
        }
    }
}

/// One failed sub-operation of a best-effort loop.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub target: String,
    pub error: String,
}

/// Outcome of a loop that logs and continues on failure.
#[derive(Debug, Default, Clone)]
pub struct StepReport {
    pub attempted: usize,
    pub failures: Vec<StepFailure>,
}

impl StepReport {
    pub fn record(&mut self, step: &str, target: &str, res: anyhow::Result<()>) {
        self.attempted += 1;
        if let Err(e) = res {
            tracing::warn!("[{step}] {target} failed: {e:#}");
            self.failures.push(StepFailure {
                step: step.to_string(),
                target: target.to_string(),
                error: format!("{e:#}"),
            });
        }
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn report_collects_only_failures() {
        let mut r = StepReport::default();
        r.record("delete", "svm1:vol1", Ok(()));
        r.record("delete", "svm1:vol2", Err(anyhow!("boom")));
        assert_eq!(r.attempted, 2);
        assert!(!r.is_clean());
        assert_eq!(r.failed_targets(), vec!["svm1:vol2"]);
        assert!(r.failures[0].error.contains("boom"));
    }

    #[test]
    fn anyhow_keeps_variant_through_context() {
        use anyhow::Context;
        let res: anyhow::Result<()> =
            Err(KairosError::not_found("cluster", "rs0")).context("lookup");
        let err = res.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KairosError>(),
            Some(KairosError::NotFound { kind: "cluster", .. })
        ));
    }
}
