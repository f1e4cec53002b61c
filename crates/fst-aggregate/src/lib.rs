#![forbid(unsafe_code)]

use std::collections::HashMap;

use fst_accum::{AccumLimits, FeatureAccumulator, FeatureError, FinalizeScope};
use fst_histogram::ExactMass;
use fst_runtime::{ConfigError, FeatureOrder, IssueLedger, StatsOptions};
use fst_schema::{DatasetFeatureStatistics, DatasetFeatureStatisticsList};
use fst_types::{Example, FeatureInput, FeaturePath, FeatureType, TypeError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("cannot merge aggregators built with different options")]
    OptionsMismatch,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Complete,
    /// At least one feature failed and was left out.
    Partial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetReport {
    pub statistics: DatasetFeatureStatistics,
    pub status: DatasetStatus,
    pub feature_errors: Vec<FeatureError>,
    pub ledger: IssueLedger,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetOutcome {
    pub name: String,
    pub status: DatasetStatus,
    pub feature_errors: Vec<FeatureError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub statistics: DatasetFeatureStatisticsList,
    pub outcomes: Vec<DatasetOutcome>,
    pub ledger: IssueLedger,
}

impl BatchResult {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.status == DatasetStatus::Complete)
    }
}

/// Routes the examples of one dataset to per-feature accumulators.
#[derive(Debug, Clone)]
pub struct DatasetAggregator {
    name: String,
    options: StatsOptions,
    limits: AccumLimits,
    features: Vec<FeatureAccumulator>,
    index: HashMap<FeaturePath, usize>,
    declared: HashMap<FeaturePath, FeatureType>,
    example_weights: ExactMass,
    saw_weights: bool,
    ledger: IssueLedger,
}

impl DatasetAggregator {
    #[must_use]
    pub fn new(name: impl Into<String>, options: StatsOptions) -> Self {
        Self {
            name: name.into(),
            limits: AccumLimits::from_options(&options),
            options,
            features: Vec::new(),
            index: HashMap::new(),
            declared: HashMap::new(),
            example_weights: ExactMass::new(),
            saw_weights: false,
            ledger: IssueLedger::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn options(&self) -> &StatsOptions {
        &self.options
    }

    #[must_use]
    pub fn num_examples(&self) -> u64 {
        self.example_weights.count()
    }

    #[must_use]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Pins the type of `path`, for accumulators created before or after.
    pub fn declare_feature(&mut self, path: FeaturePath, feature_type: FeatureType) {
        if let Some(&slot) = self.index.get(&path) {
            self.features[slot].declare(feature_type);
        }
        self.declared.insert(path, feature_type);
    }

    pub fn add_example(&mut self, example: &Example) {
        let weight = self.resolve_weight(example);
        self.example_weights.add(weight);
        for (path, input) in example.features() {
            let accumulator = self.accumulator(path);
            match input {
                FeatureInput::Missing => accumulator.observe_missing(Some(weight)),
                input => accumulator.observe(input, Some(weight)),
            }
        }
    }

    fn accumulator(&mut self, path: &FeaturePath) -> &mut FeatureAccumulator {
        let slot = match self.index.get(path) {
            Some(&slot) => slot,
            None => {
                tracing::debug!(dataset = %self.name, path = %path, "feature accumulator created");
                let mut accumulator = FeatureAccumulator::new(path.clone(), self.limits);
                if let Some(&feature_type) = self.declared.get(path) {
                    accumulator.declare(feature_type);
                }
                self.features.push(accumulator);
                self.index.insert(path.clone(), self.features.len() - 1);
                self.features.len() - 1
            }
        };
        &mut self.features[slot]
    }

    /// Explicit example weight, else the weight feature, else 1.
    fn resolve_weight(&mut self, example: &Example) -> f64 {
        let raw = match example.weight {
            Some(weight) => {
                self.saw_weights = true;
                Some(fst_types::validate_weight(weight))
            }
            None => self
                .options
                .weight_feature
                .as_ref()
                .and_then(|path| example.get(path))
                .and_then(|input| match input.first_f64() {
                    Err(TypeError::EmptyValueList) => None,
                    read => Some(read.and_then(fst_types::validate_weight)),
                }),
        };
        match raw {
            None => 1.0,
            Some(Ok(weight)) => weight,
            Some(Err(err)) => {
                self.options.policy().decide_invalid_weight(
                    self.name.clone(),
                    format!("{err}; using weight 1"),
                    &mut self.ledger,
                );
                1.0
            }
        }
    }

    /// Unions feature sets. Features new to `self` are appended in `other`'s order.
    pub fn merge(&mut self, other: &Self) -> Result<(), AggregateError> {
        if self.options != other.options {
            return Err(AggregateError::OptionsMismatch);
        }
        for (path, feature_type) in &other.declared {
            self.declared.entry(path.clone()).or_insert(*feature_type);
        }
        for accumulator in &other.features {
            match self.index.get(accumulator.path()) {
                Some(&slot) => self.features[slot].merge(accumulator),
                None => {
                    self.index
                        .insert(accumulator.path().clone(), self.features.len());
                    self.features.push(accumulator.clone());
                }
            }
        }
        self.example_weights.merge(&other.example_weights);
        self.saw_weights |= other.saw_weights;
        self.ledger.extend(other.ledger.clone());
        Ok(())
    }

    fn emits_weighted(&self) -> bool {
        self.saw_weights || self.options.weight_feature.is_some()
    }

    #[must_use]
    pub fn finalize(&self) -> DatasetReport {
        let scope = FinalizeScope::new(&self.options)
            .with_example_weights(&self.example_weights)
            .with_weighted(self.emits_weighted());
        let mut ledger = self.ledger.clone();

        let mut ordered: Vec<&FeatureAccumulator> = self.features.iter().collect();
        if self.options.feature_order == FeatureOrder::Sorted {
            ordered.sort_by(|a, b| a.path().cmp(b.path()));
        }

        let mut features = Vec::with_capacity(ordered.len());
        let mut feature_errors = Vec::new();
        for accumulator in ordered {
            match accumulator.finalize(scope, &mut ledger) {
                Ok(feature) => features.push(feature),
                Err(err) => feature_errors.push(err),
            }
        }

        let total = self.example_weights.mass();
        let status = if feature_errors.is_empty() {
            DatasetStatus::Complete
        } else {
            DatasetStatus::Partial
        };
        tracing::debug!(
            dataset = %self.name,
            num_examples = total.count,
            features = features.len(),
            failed = feature_errors.len(),
            "dataset finalized"
        );

        DatasetReport {
            statistics: DatasetFeatureStatistics {
                name: self.name.clone(),
                num_examples: total.count,
                weighted_num_examples: total.weight,
                features,
            },
            status,
            feature_errors,
            ledger,
        }
    }
}

/// Aggregates several named datasets in one pass.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    options: StatsOptions,
    declared: Vec<(FeaturePath, FeatureType)>,
    datasets: Vec<DatasetAggregator>,
    index: HashMap<String, usize>,
}

impl StatsAggregator {
    pub fn new(options: StatsOptions) -> Result<Self, AggregateError> {
        options.validate()?;
        Ok(Self {
            options,
            declared: Vec::new(),
            datasets: Vec::new(),
            index: HashMap::new(),
        })
    }

    #[must_use]
    pub fn options(&self) -> &StatsOptions {
        &self.options
    }

    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&DatasetAggregator> {
        self.index.get(name).map(|&slot| &self.datasets[slot])
    }

    /// Applies to every dataset, present and future.
    pub fn declare_feature(&mut self, path: FeaturePath, feature_type: FeatureType) {
        for dataset in &mut self.datasets {
            dataset.declare_feature(path.clone(), feature_type);
        }
        self.declared.push((path, feature_type));
    }

    pub fn add_example(&mut self, dataset: &str, example: &Example) {
        self.dataset_mut(dataset).add_example(example);
    }

    fn dataset_mut(&mut self, name: &str) -> &mut DatasetAggregator {
        let slot = match self.index.get(name) {
            Some(&slot) => slot,
            None => {
                let mut dataset = DatasetAggregator::new(name, self.options.clone());
                for (path, feature_type) in &self.declared {
                    dataset.declare_feature(path.clone(), *feature_type);
                }
                self.datasets.push(dataset);
                self.index.insert(name.to_owned(), self.datasets.len() - 1);
                self.datasets.len() - 1
            }
        };
        &mut self.datasets[slot]
    }

    pub fn merge(&mut self, other: &Self) -> Result<(), AggregateError> {
        if self.options != other.options {
            return Err(AggregateError::OptionsMismatch);
        }
        for (path, feature_type) in &other.declared {
            if !self.declared.contains(&(path.clone(), *feature_type)) {
                self.declared.push((path.clone(), *feature_type));
            }
        }
        for dataset in &other.datasets {
            match self.index.get(dataset.name()) {
                Some(&slot) => self.datasets[slot].merge(dataset)?,
                None => {
                    self.index
                        .insert(dataset.name().to_owned(), self.datasets.len());
                    self.datasets.push(dataset.clone());
                }
            }
        }
        Ok(())
    }

    /// One dataset's failure never aborts the batch.
    #[must_use]
    pub fn finalize(&self) -> BatchResult {
        let mut ordered: Vec<&DatasetAggregator> = self.datasets.iter().collect();
        if self.options.feature_order == FeatureOrder::Sorted {
            ordered.sort_by(|a, b| a.name().cmp(b.name()));
        }

        let mut datasets = Vec::with_capacity(ordered.len());
        let mut outcomes = Vec::with_capacity(ordered.len());
        let mut ledger = IssueLedger::new();
        for dataset in ordered {
            let report = dataset.finalize();
            outcomes.push(DatasetOutcome {
                name: dataset.name().to_owned(),
                status: report.status,
                feature_errors: report.feature_errors,
            });
            ledger.extend(report.ledger);
            datasets.push(report.statistics);
        }

        BatchResult {
            statistics: DatasetFeatureStatisticsList { datasets },
            outcomes,
            ledger,
        }
    }
}

/// Aggregates each shard of `(dataset, example)` pairs independently on the
/// rayon pool, then tree-reduces the partials with `merge`.
pub fn aggregate_shards(
    shards: &[Vec<(String, Example)>],
    options: &StatsOptions,
) -> Result<BatchResult, AggregateError> {
    options.validate()?;
    let merged = shards
        .par_iter()
        .map(|shard| -> Result<StatsAggregator, AggregateError> {
            let mut aggregator = StatsAggregator::new(options.clone())?;
            for (dataset, example) in shard {
                aggregator.add_example(dataset, example);
            }
            Ok(aggregator)
        })
        .try_reduce_with(|mut left, right| {
            left.merge(&right)?;
            Ok(left)
        });

    let aggregator = match merged {
        Some(result) => result?,
        None => StatsAggregator::new(options.clone())?,
    };
    tracing::debug!(
        shards = shards.len(),
        datasets = aggregator.datasets.len(),
        "shards aggregated"
    );
    Ok(aggregator.finalize())
}
