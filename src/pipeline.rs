//! The staged training run: estimator search, column pruning, fire and lag tuning, final fit.

use ndarray::{ArrayView1, ArrayView2};
use std::fmt;
use std::path::PathBuf;
use tracing::{info, info_span, warn};

use crate::bayes::BayesianOptimizer;
use crate::config::Config;
use crate::dataset::{DatasetAssembler, FeatureTable};
use crate::error::{PipelineError, Result};
use crate::fire::FireParameters;
use crate::importance::{
    collapse_lag_importance, feature_importance, least_important_first, save_importance,
    FeatureImportance,
};
use crate::lag::LagParameters;
use crate::meta::{load_meta, save_meta, ModelMetadata};
use crate::metrics::ScoreSet;
use crate::models::{load_model, save_model, Regressor};
use crate::pruning::GreedyColumnPruner;
use crate::search::{RandomizedSearch, SearchSpace};
use crate::tuning::{tune_fire, tune_lag, FireSearchSpace, LagSearchSpace, FIRE_SPLIT, LAG_SPLIT};

pub const SEARCH_SPLIT: [f64; 3] = [0.4, 0.3, 0.3];
pub const FINAL_SPLIT: [f64; 2] = [0.7, 0.3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AssembleBase,
    TuneEstimator,
    PruneBaseColumns,
    TuneFire,
    TuneLag,
    PruneLagColumns,
    FinalFit,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::AssembleBase => "assemble_base",
            Self::TuneEstimator => "tune_estimator",
            Self::PruneBaseColumns => "prune_base_columns",
            Self::TuneFire => "tune_fire",
            Self::TuneLag => "tune_lag",
            Self::PruneLagColumns => "prune_lag_columns",
            Self::FinalFit => "final_fit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values that skip the matching search stages when supplied.
#[derive(Default)]
pub struct Overrides {
    /// A pre-tuned estimator; with `base_columns` it skips estimator search and base pruning.
    pub estimator: Option<Box<dyn Regressor>>,
    pub base_columns: Option<Vec<String>>,
    pub fire: Option<FireParameters>,
    pub lag: Option<LagParameters>,
    /// Final feature columns; only read when `lag` is supplied.
    pub x_cols: Option<Vec<String>>,
}

pub struct TrainingReport {
    pub metadata: ModelMetadata,
    pub estimator: Box<dyn Regressor>,
    pub importance: Vec<FeatureImportance>,
    pub collapsed_importance: Vec<FeatureImportance>,
    pub stages_run: Vec<Stage>,
    pub model_path: PathBuf,
    pub meta_path: PathBuf,
}

fn run_stage<T>(
    stage: Stage,
    params: String,
    stages_run: &mut Vec<Stage>,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let span = info_span!("stage", stage = stage.name());
    let _guard = span.enter();
    info!(params = %params, "stage started");
    let result = body().map_err(|e| e.in_stage(stage.name(), params));
    stages_run.push(stage);
    result
}

pub struct TrainingOrchestrator {
    config: Config,
    assembler: DatasetAssembler,
    search_space: Option<SearchSpace>,
    fire_space: FireSearchSpace,
    lag_space: LagSearchSpace,
}

impl TrainingOrchestrator {
    pub fn new(config: Config, assembler: DatasetAssembler) -> Self {
        Self {
            config,
            assembler,
            search_space: None,
            fire_space: FireSearchSpace::default(),
            lag_space: LagSearchSpace::default(),
        }
    }

    /// Replaces the estimator's default randomized-search space.
    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.search_space = Some(space);
        self
    }

    pub fn with_fire_space(mut self, space: FireSearchSpace) -> Self {
        self.fire_space = space;
        self
    }

    pub fn with_lag_space(mut self, space: LagSearchSpace) -> Self {
        self.lag_space = space;
        self
    }

    pub fn assembler(&self) -> &DatasetAssembler {
        &self.assembler
    }

    fn optimizer(&self) -> BayesianOptimizer {
        let search = &self.config.search;
        BayesianOptimizer::new(search.bayes_calls, search.bayes_initial, search.bayes_seed)
    }

    fn pollutant(&self) -> &str {
        &self.config.feature_params.pollutant
    }

    fn model_path(&self) -> PathBuf {
        self.config
            .model_dir()
            .join(format!("{}_model.json", self.config.pollutant_file_stem()))
    }

    fn importance_path(&self) -> PathBuf {
        self.config
            .model_dir()
            .join(format!("{}_importance.json", self.config.pollutant_file_stem()))
    }

    fn importance_of(
        &self,
        estimator: &dyn Regressor,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        columns: &[String],
    ) -> Result<Vec<FeatureImportance>> {
        feature_importance(
            estimator,
            x,
            y,
            columns,
            self.config.search.importance_shuffles,
            self.config.model_params.seed,
        )
    }

    /// Runs every stage in order. Nothing is written to disk unless the final fit succeeds.
    pub fn run(&mut self, overrides: Overrides) -> Result<TrainingReport> {
        let Overrides {
            estimator: estimator_override,
            base_columns: base_override,
            fire: fire_override,
            lag: lag_override,
            x_cols: x_cols_override,
        } = overrides;
        let mut stages_run = Vec::new();
        let fire_columns = self.assembler.fire_columns();
        let met_columns = self.assembler.config().met_columns.clone();

        // 1. Base table with default or supplied fire parameters and no lags.
        let mut fire = fire_override.unwrap_or(self.config.fire.defaults);
        let skip_estimator_search = estimator_override.is_some() && base_override.is_some();
        let mut base_columns = base_override.unwrap_or_else(|| {
            let mut columns = self.assembler.original_columns();
            columns.extend(fire_columns.iter().cloned());
            columns
        });
        {
            let assembler = &mut self.assembler;
            run_stage(Stage::AssembleBase, format!("fire={fire:?}"), &mut stages_run, || {
                assembler.assemble(&base_columns, &fire, None).map(|_| ())
            })?;
        }

        // 2-3. Estimator search, then importance-ordered pruning of the base columns.
        let mut estimator = match estimator_override {
            Some(estimator) if skip_estimator_search => {
                info!("estimator and base columns supplied, skipping search and base pruning");
                estimator
            }
            _ => {
                let table = self.assembler.table()?;
                let outcome = run_stage(
                    Stage::TuneEstimator,
                    format!("kind={:?} n_columns={}", self.config.model_params.estimator, base_columns.len()),
                    &mut stages_run,
                    || {
                        let split = table.split(&SEARCH_SPLIT)?;
                        let (x, y) = table.matrix(&split[0], &base_columns)?;
                        let kind = self.config.model_params.estimator;
                        let space = self
                            .search_space
                            .clone()
                            .unwrap_or_else(|| SearchSpace::for_estimator(kind, base_columns.len()));
                        let search = &self.config.search;
                        let outcome = RandomizedSearch::new(kind, space)
                            .with_n_iter(search.n_iter)
                            .with_cv(search.cv)
                            .with_seed(search.search_seed)
                            .with_model_seed(self.config.model_params.seed)
                            .fit(x.view(), y.view())?;
                        let importance = self.importance_of(outcome.estimator.as_ref(), x.view(), y.view(), &base_columns)?;
                        Ok((outcome, importance, split))
                    },
                )?;
                let (search, importance, split) = outcome;

                let pruned = run_stage(
                    Stage::PruneBaseColumns,
                    format!("params={:?}", search.params),
                    &mut stages_run,
                    || {
                        let candidates: Vec<String> = least_important_first(&importance)
                            .into_iter()
                            .filter(|c| !fire_columns.contains(c) && !met_columns.contains(c))
                            .collect();
                        let pruner = GreedyColumnPruner::new(met_columns.iter().chain(&fire_columns).cloned());
                        pruner.prune(table, &base_columns, &candidates, search.estimator, &split[0], &split[1])
                    },
                )?;
                base_columns = pruned.columns;
                pruned.estimator
            }
        };

        // 4. Fire parameters.
        if fire_override.is_none() {
            let outcome = run_stage(
                Stage::TuneFire,
                format!("incumbent={fire:?}"),
                &mut stages_run,
                || {
                    tune_fire(
                        &self.assembler,
                        &base_columns,
                        estimator.as_ref(),
                        &fire,
                        &self.fire_space,
                        &self.optimizer(),
                    )
                },
            )?;
            fire = outcome.params;
        }

        // 5. Lag parameters.
        let lag = match lag_override {
            Some(lag) => lag,
            None => {
                run_stage(
                    Stage::TuneLag,
                    format!("fire={fire:?} space={:?}", self.lag_space),
                    &mut stages_run,
                    || {
                        tune_lag(
                            &self.assembler,
                            &base_columns,
                            &fire,
                            estimator.as_ref(),
                            None,
                            &self.lag_space,
                            &self.optimizer(),
                        )
                    },
                )?
                .params
            }
        };

        // 6. Lag columns, least important first; base columns are exempt.
        let next = if lag_override.is_some() {
            Stage::FinalFit
        } else {
            Stage::PruneLagColumns
        };
        let lagged = self
            .assembler
            .assemble(&base_columns, &fire, Some(&lag))
            .map_err(|e| e.in_stage(next.name(), format!("lag={lag:?}")))?
            .clone();
        let x_cols = if lag_override.is_some() {
            x_cols_override.unwrap_or_else(|| lagged.feature_columns())
        } else {
            let pruned = run_stage(
                Stage::PruneLagColumns,
                format!("lag={lag:?}"),
                &mut stages_run,
                || {
                    let columns = lagged.feature_columns();
                    let split = lagged.split(&LAG_SPLIT)?;
                    let (x, y) = lagged.matrix(&split[0], &columns)?;
                    estimator.fit(x.view(), y.view())?;
                    let importance = self.importance_of(estimator.as_ref(), x.view(), y.view(), &columns)?;
                    let candidates: Vec<String> = least_important_first(&importance)
                        .into_iter()
                        .filter(|c| lagged.lag_columns.contains(c))
                        .collect();
                    let pruner = GreedyColumnPruner::new(base_columns.iter().chain(&fire_columns).cloned());
                    pruner.prune(&lagged, &columns, &candidates, estimator.boxed_clone(), &split[0], &split[1])
                },
            )?;
            estimator = pruned.estimator;
            pruned.columns
        };

        // 7. Final fit and persistence.
        let report = run_stage(
            Stage::FinalFit,
            format!("fire={fire:?} lag={lag:?} n_columns={}", x_cols.len()),
            &mut stages_run,
            || self.final_fit(&lagged, estimator, &base_columns, &x_cols, fire, lag),
        )?;
        Ok(TrainingReport {
            stages_run,
            ..report
        })
    }

    /// Refits the stored model on new data with the stored feature recipe. Runs no search.
    pub fn update(&mut self) -> Result<TrainingReport> {
        let meta_path = self.config.meta_path();
        let meta = load_meta(&meta_path, self.pollutant())?;
        let stored = load_model(&self.model_path())?;
        let mut stages_run = Vec::new();

        let rolling_window = self.assembler.config().rolling_window;
        if meta.rolling_win != rolling_window {
            return Err(PipelineError::MalformedSource(format!(
                "target was smoothed over {} hours at training time, new data uses {rolling_window}",
                meta.rolling_win
            )));
        }
        let fire_columns = self.assembler.fire_columns();
        let available = self.assembler.original_columns();
        if let Some(missing) = meta
            .x_cols_org
            .iter()
            .find(|c| !available.contains(c) && !fire_columns.contains(c))
        {
            return Err(PipelineError::MalformedSource(format!(
                "stored column `{missing}` is not in the new data"
            )));
        }
        let lagged = self
            .assembler
            .assemble(&meta.x_cols_org, &meta.fire_dict, Some(&meta.lag_dict))?
            .clone();
        let features = lagged.feature_columns();
        if let Some(missing) = meta.x_cols.iter().find(|c| !features.contains(c)) {
            return Err(PipelineError::MalformedSource(format!(
                "stored feature `{missing}` cannot be rebuilt from the new data"
            )));
        }

        let report = run_stage(
            Stage::FinalFit,
            format!("update fire={:?} lag={:?}", meta.fire_dict, meta.lag_dict),
            &mut stages_run,
            || {
                self.final_fit(
                    &lagged,
                    stored.boxed_clone(),
                    &meta.x_cols_org,
                    &meta.x_cols,
                    meta.fire_dict,
                    meta.lag_dict,
                )
            },
        )?;
        Ok(TrainingReport {
            stages_run,
            ..report
        })
    }

    fn final_fit(
        &self,
        table: &FeatureTable,
        mut estimator: Box<dyn Regressor>,
        base_columns: &[String],
        x_cols: &[String],
        fire: FireParameters,
        lag: LagParameters,
    ) -> Result<TrainingReport> {
        let split = table.split(&FINAL_SPLIT)?;
        let (x_train, y_train) = table.matrix(&split[0], x_cols)?;
        let (x_test, y_test) = table.matrix(&split[1], x_cols)?;
        estimator.fit(x_train.view(), y_train.view())?;
        let predicted = estimator.predict(x_test.view())?;
        let scores = ScoreSet::compute(&y_test.to_vec(), &predicted, "test_");
        if scores.get("test_r2_score").is_some_and(f64::is_nan) {
            warn!("test R² is undefined for this split");
        }

        let importance = self.importance_of(estimator.as_ref(), x_train.view(), y_train.view(), x_cols)?;
        let collapsed_importance = collapse_lag_importance(&importance);

        let metadata = ModelMetadata {
            x_cols_org: base_columns.to_vec(),
            x_cols: x_cols.to_vec(),
            fire_cols: table.fire_columns.clone(),
            fire_dict: fire,
            lag_dict: lag,
            rf_score: scores,
            rf_params: estimator.params(),
            rolling_win: self.assembler.config().rolling_window,
            estimator: estimator.kind(),
        };

        let model_path = self.model_path();
        let meta_path = self.config.meta_path();
        save_model(estimator.as_ref(), &model_path)?;
        save_importance(&self.importance_path(), &collapsed_importance)?;
        save_meta(&meta_path, self.pollutant(), &metadata)?;
        info!(
            scores = ?metadata.rf_score,
            n_features = x_cols.len(),
            model = %model_path.display(),
            "model trained and saved"
        );
        Ok(TrainingReport {
            metadata,
            estimator,
            importance,
            collapsed_importance,
            stages_run: Vec::new(),
            model_path,
            meta_path,
        })
    }
}
