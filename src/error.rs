use polars::error::PolarsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing timezone, missing column, or a schema the pipeline cannot use.
    #[error("malformed source: {0}")]
    MalformedSource(String),

    #[error("assembly error: {0}")]
    Assembly(String),

    #[error("invalid split ratio: {0}")]
    InvalidRatio(String),

    #[error("no rows left after dropping missing values ({rows_before} rows before filtering)")]
    EmptyMatrix { rows_before: usize },

    #[error("degenerate optimization: {0}")]
    OptimizationDegenerate(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A pipeline stage aborted; carries the stage name and the parameters it ran with.
    #[error("stage {stage} failed with {params}: {source}")]
    Stage {
        stage: &'static str,
        params: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("data loading error: {0}")]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn in_stage(self, stage: &'static str, params: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            params: params.into(),
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_names_stage_and_params() {
        let err = PipelineError::EmptyMatrix { rows_before: 12 }.in_stage("final_fit", "ratios=[0.7, 0.3]");
        let msg = err.to_string();
        assert!(msg.contains("final_fit"));
        assert!(msg.contains("ratios=[0.7, 0.3]"));
        assert!(msg.contains("12 rows"));
    }
}
