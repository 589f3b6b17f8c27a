use std::fmt;

/// Setup stage that produced a [`TelemetryError::Setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Tracing,
    Metrics,
    Logging,
}

impl SetupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracing => "tracing",
            Self::Metrics => "metrics",
            Self::Logging => "logging",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors are `Clone` so every caller of a one-shot shutdown can receive the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("Exporter error: {0}")]
    Exporter(String),
    #[error("Initialization error: {0}")]
    Init(String),
    #[error("Metrics server error: {0}")]
    Server(String),
    #[error("Shutdown error: {0}")]
    Shutdown(String),
    #[error("failed to setup {stage}: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: Box<TelemetryError>,
    },
}

impl TelemetryError {
    /// Wrap this error with the name of the setup stage it aborted.
    pub(crate) fn in_stage(self, stage: SetupStage) -> Self {
        Self::Setup {
            stage,
            source: Box::new(self),
        }
    }

    /// The stage this error aborted, if it was raised during setup.
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            Self::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<opentelemetry_otlp::ExporterBuildError> for TelemetryError {
    fn from(err: opentelemetry_otlp::ExporterBuildError) -> Self {
        Self::Exporter(err.to_string())
    }
}
