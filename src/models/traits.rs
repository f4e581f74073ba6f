use ndarray::{ArrayView1, ArrayView2};

use super::{EstimatorKind, HyperParams, SavedModelRef};
use crate::error::Result;

/// What the search, pruning and training stages need from an estimator.
///
/// `fit` always starts from scratch, so one instance can be refit on different column sets.
pub trait Regressor: Send + Sync {
    fn fit(&mut self, features: ArrayView2<f64>, targets: ArrayView1<f64>) -> Result<()>;
    fn predict(&self, features: ArrayView2<f64>) -> Result<Vec<f64>>;

    /// Impurity-based importances, one per feature column, if the estimator exposes them.
    fn feature_importances(&self) -> Option<Vec<f64>>;

    fn params(&self) -> HyperParams;
    fn kind(&self) -> EstimatorKind;

    /// Unfitted copy carrying the same hyperparameters and seed.
    fn boxed_clone(&self) -> Box<dyn Regressor>;

    fn saved(&self) -> SavedModelRef<'_>;
}

pub trait ModelFactory: Sized {
    fn create(params: &HyperParams, seed: u64) -> Result<Self>;
}
