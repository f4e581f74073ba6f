pub mod alignment;
pub mod bayes;
pub mod config;
pub mod data_loader;
pub mod dataset;
pub mod error;
pub mod fire;
pub mod frame;
pub mod importance;
pub mod lag;
pub mod meta;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod pruning;
pub mod search;
pub mod tuning;

pub use alignment::{RawSource, TemporalAligner};
pub use bayes::BayesianOptimizer;
pub use config::Config;
pub use dataset::{AssemblerConfig, DatasetAssembler, FeatureTable, IndexSlice, SplitIndices};
pub use error::{PipelineError, Result};
pub use fire::{FireFeatureSynthesizer, FireParameters, FireRecord};
pub use lag::{LagExpander, LagParameters};
pub use meta::ModelMetadata;
pub use models::{EstimatorKind, Regressor};
pub use pipeline::{Overrides, Stage, TrainingOrchestrator, TrainingReport};
pub use pruning::GreedyColumnPruner;
pub use search::RandomizedSearch;
