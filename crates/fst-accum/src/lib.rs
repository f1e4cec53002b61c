#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use fst_histogram::{
    DistinctSketch, ExactMass, HistogramBuilder, RankHistogramBuilder, RankOptions, Tally,
    Weighting,
};
use fst_runtime::{DecisionAction, IssueLedger, QuantileMode, StatsOptions};
use fst_schema::{
    BytesStatistics, CommonStatistics, CustomStatistic, FeatureId, FeatureNameStatistics,
    FeatureStats, Histogram, HistogramType, NumericStatistics, StringStatistics,
    StructStatistics, WeightedCommonStatistics, WeightedNumericStatistics,
    WeightedStringStatistics,
};
use fst_types::{FeatureInput, FeaturePath, FeatureType, TypeError, TypeFamily, ValueKind, ValueList};
use thiserror::Error;

pub const NUM_TYPE_CONFLICTS: &str = "num_type_conflicts";
pub const UNIQUE_IS_ESTIMATE: &str = "unique_is_estimate";
pub const QUANTILE_RANK_ERROR: &str = "quantile_rank_error";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("feature {path}: {conflicts} value lists disagree with dominant type {dominant}")]
    MixedTypes {
        path: FeaturePath,
        dominant: FeatureType,
        conflicts: u64,
    },
    #[error("feature {path}: cannot merge partials declared as {left} and {right}")]
    IncompatibleMerge {
        path: FeaturePath,
        left: FeatureType,
        right: FeatureType,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Missingness and value-count distributions of one feature. Each tally
/// holds one entry per distinct value count, whatever the weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonStatsTracker {
    num_values: Tally<u64>,
    list_lengths: Tally<u64>,
    missing: ExactMass,
}

impl CommonStatsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An example that supplied the feature, possibly with an empty list.
    pub fn record_present(&mut self, num_values: u64, weight: f64) {
        self.num_values.add(num_values, weight);
    }

    pub fn record_list_length(&mut self, length: u64, weight: f64) {
        self.list_lengths.add(length, weight);
    }

    pub fn record_missing(&mut self, weight: f64) {
        self.missing.add(weight);
    }

    pub fn merge(&mut self, other: &Self) {
        self.num_values.merge(&other.num_values);
        self.list_lengths.merge(&other.list_lengths);
        self.missing.merge(&other.missing);
    }

    #[must_use]
    pub fn num_non_missing(&self) -> u64 {
        self.num_values.total_count()
    }

    /// Count and total weight of the examples that supplied the feature.
    #[must_use]
    pub fn present_weights(&self) -> ExactMass {
        self.num_values.total_exact()
    }

    /// Number of stored tally entries, bounded by the distinct value counts.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.num_values.distinct() + self.list_lengths.distinct()
    }

    /// `missing` overrides the explicitly recorded missing examples.
    #[must_use]
    pub fn finalize(
        &self,
        num_values_buckets: usize,
        missing: Option<&ExactMass>,
        weighted: bool,
    ) -> CommonStatistics {
        let missing = missing.unwrap_or(&self.missing);
        let groups = self.num_values.groups();
        let num_non_missing = self.num_values.total_count();
        let tot_num_values: u64 = groups.iter().map(|(k, mass)| **k * mass.count).sum();
        let avg_num_values = if num_non_missing == 0 {
            0.0
        } else {
            (tot_num_values as f64 / num_non_missing as f64) as f32
        };

        let weighted_common_stats = weighted.then(|| {
            let non_missing = self.num_values.total().weight;
            let tot: f64 = groups.iter().map(|(k, mass)| **k as f64 * mass.weight).sum();
            WeightedCommonStatistics {
                num_non_missing: non_missing,
                num_missing: missing.mass().weight,
                avg_num_values: if non_missing > 0.0 { tot / non_missing } else { 0.0 },
                tot_num_values: tot,
            }
        });

        CommonStatistics {
            num_non_missing,
            num_missing: missing.count(),
            min_num_values: groups.first().map_or(0, |(k, _)| **k),
            max_num_values: groups.last().map_or(0, |(k, _)| **k),
            avg_num_values,
            tot_num_values,
            num_values_histogram: (num_non_missing > 0)
                .then(|| quantiles_over(&self.num_values, num_values_buckets)),
            weighted_common_stats,
            feature_list_length_histogram: (!self.list_lengths.is_empty())
                .then(|| quantiles_over(&self.list_lengths, num_values_buckets)),
        }
    }
}

fn quantiles_over(tally: &Tally<u64>, num_buckets: usize) -> Histogram {
    let mut builder = HistogramBuilder::new();
    for (key, mass) in tally.iter() {
        builder.add_mass(*key as f64, mass);
    }
    builder.finalize(HistogramType::Quantiles, num_buckets, Weighting::Unweighted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KindCount {
    lists: u64,
    values: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct NumericState {
    histogram: HistogramBuilder,
    num_zeros: u64,
}

impl NumericState {
    fn add(&mut self, value: f64, weight: f64) {
        if value == 0.0 {
            self.num_zeros += 1;
        }
        self.histogram.add(value, weight);
    }

    fn merge(&mut self, other: &Self) {
        self.histogram.merge(&other.histogram);
        self.num_zeros += other.num_zeros;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct StringState {
    values: RankHistogramBuilder,
    sketch: DistinctSketch,
    capped: bool,
    total_length: u64,
    count: u64,
}

/// Values past the cardinality cap keep being counted. The tally is trimmed
/// back to the `cap` heaviest values only once it holds more than twice
/// `cap`, so the reported top values are exact whenever the feature has at
/// most `2 * cap` distinct values.
impl StringState {
    fn add(&mut self, value: &str, weight: f64, cap: usize) {
        self.sketch.insert(value.as_bytes());
        self.total_length += value.len() as u64;
        self.count += 1;
        self.values.add(value, weight);
        self.settle(cap);
    }

    fn merge(&mut self, other: &Self, cap: usize) {
        self.values.merge(&other.values);
        self.sketch.merge(&other.sketch);
        self.total_length += other.total_length;
        self.count += other.count;
        self.capped |= other.capped;
        self.settle(cap);
    }

    fn settle(&mut self, cap: usize) {
        if self.values.distinct() <= cap {
            return;
        }
        self.capped = true;
        if self.values.distinct() > cap.saturating_mul(2) {
            let dropped = self.values.truncate(cap);
            tracing::trace!(dropped = dropped.count, cap, "trimmed string tally");
        }
    }

    /// The `cap` heaviest values, ties broken lexicographically.
    fn top(&self, cap: usize) -> Cow<'_, RankHistogramBuilder> {
        if self.values.distinct() <= cap {
            return Cow::Borrowed(&self.values);
        }
        let mut values = self.values.clone();
        values.truncate(cap);
        Cow::Owned(values)
    }

    fn unique(&self) -> u64 {
        if self.capped {
            self.sketch.estimate().round() as u64
        } else {
            self.values.distinct() as u64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BytesState {
    distinct: BTreeSet<Vec<u8>>,
    sketch: DistinctSketch,
    capped: bool,
    min_len: Option<u64>,
    max_len: Option<u64>,
    total_len: u64,
    count: u64,
}

impl BytesState {
    fn add(&mut self, value: &[u8], cap: usize) {
        let len = value.len() as u64;
        self.sketch.insert(value);
        self.min_len = Some(self.min_len.map_or(len, |m| m.min(len)));
        self.max_len = Some(self.max_len.map_or(len, |m| m.max(len)));
        self.total_len += len;
        self.count += 1;
        if self.distinct.len() >= cap && !self.distinct.contains(value) {
            self.capped = true;
            return;
        }
        self.distinct.insert(value.to_vec());
    }

    fn merge(&mut self, other: &Self, cap: usize) {
        self.distinct.extend(other.distinct.iter().cloned());
        while self.distinct.len() > cap {
            self.distinct.pop_last();
            self.capped = true;
        }
        self.sketch.merge(&other.sketch);
        self.capped |= other.capped;
        self.min_len = match (self.min_len, other.min_len) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_len = match (self.max_len, other.max_len) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.total_len += other.total_len;
        self.count += other.count;
    }

    fn unique(&self) -> u64 {
        if self.capped {
            self.sketch.estimate().round() as u64
        } else {
            self.distinct.len() as u64
        }
    }
}

/// Options an accumulator needs while observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumLimits {
    pub max_distinct_values: usize,
    pub max_centroids: Option<usize>,
}

impl AccumLimits {
    #[must_use]
    pub fn from_options(options: &StatsOptions) -> Self {
        Self {
            max_distinct_values: options.max_distinct_values,
            max_centroids: match options.quantile_mode {
                QuantileMode::Exact => None,
                QuantileMode::Bounded { max_centroids } => Some(max_centroids),
            },
        }
    }
}

impl Default for AccumLimits {
    fn default() -> Self {
        Self::from_options(&StatsOptions::default())
    }
}

/// What finalization needs from the surrounding dataset.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeScope<'a> {
    pub options: &'a StatsOptions,
    /// Count and weight of every example in the dataset. When set, missing
    /// counts are this total minus the examples that supplied the feature,
    /// instead of explicit `observe_missing` calls.
    pub example_weights: Option<&'a ExactMass>,
    pub weighted: bool,
}

impl<'a> FinalizeScope<'a> {
    #[must_use]
    pub fn new(options: &'a StatsOptions) -> Self {
        Self {
            options,
            example_weights: None,
            weighted: false,
        }
    }

    #[must_use]
    pub fn with_example_weights(mut self, weights: &'a ExactMass) -> Self {
        self.example_weights = Some(weights);
        self
    }

    #[must_use]
    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }
}

/// Running state of one feature within one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureAccumulator {
    path: FeaturePath,
    declared: Option<FeatureType>,
    limits: AccumLimits,
    common: CommonStatsTracker,
    kinds: BTreeMap<ValueKind, KindCount>,
    numeric: NumericState,
    strings: StringState,
    bytes: BytesState,
    saw_weights: bool,
    merge_error: Option<FeatureError>,
}

impl FeatureAccumulator {
    #[must_use]
    pub fn new(path: FeaturePath, limits: AccumLimits) -> Self {
        Self {
            path,
            declared: None,
            limits,
            common: CommonStatsTracker::new(),
            kinds: BTreeMap::new(),
            numeric: NumericState::default(),
            strings: StringState::default(),
            bytes: BytesState::default(),
            saw_weights: false,
            merge_error: None,
        }
    }

    #[must_use]
    pub fn with_declared_type(mut self, feature_type: FeatureType) -> Self {
        self.declared = Some(feature_type);
        self
    }

    pub fn declare(&mut self, feature_type: FeatureType) {
        self.declared = Some(feature_type);
    }

    #[must_use]
    pub fn path(&self) -> &FeaturePath {
        &self.path
    }

    #[must_use]
    pub fn declared_type(&self) -> Option<FeatureType> {
        self.declared
    }

    #[must_use]
    pub fn common(&self) -> &CommonStatsTracker {
        &self.common
    }

    /// Invalid weights count as 1; callers that need them reported validate first.
    pub fn observe(&mut self, input: &FeatureInput, weight: Option<f64>) {
        let weight = self.accept_weight(weight);
        match input {
            FeatureInput::Missing => {
                self.common.record_missing(weight);
                return;
            }
            FeatureInput::Values(_) => {}
            FeatureInput::Sequence(lists) => {
                self.common.record_list_length(lists.len() as u64, weight);
            }
        }
        self.common.record_present(input.num_values(), weight);
        for list in input.lists() {
            self.observe_list(list, weight);
        }
        if let Some(max_centroids) = self.limits.max_centroids {
            self.numeric.histogram.compact(max_centroids);
        }
    }

    pub fn observe_missing(&mut self, weight: Option<f64>) {
        let weight = self.accept_weight(weight);
        self.common.record_missing(weight);
    }

    fn accept_weight(&mut self, weight: Option<f64>) -> f64 {
        self.saw_weights |= weight.is_some();
        weight
            .map_or(Ok(1.0), fst_types::validate_weight)
            .unwrap_or(1.0)
    }

    fn observe_list(&mut self, list: &ValueList, weight: f64) {
        let count = self.kinds.entry(list.kind()).or_default();
        count.lists += 1;
        count.values += list.len();
        let cap = self.limits.max_distinct_values;
        match list {
            ValueList::Int(values) => {
                for v in values {
                    self.numeric.add(*v as f64, weight);
                }
            }
            ValueList::Float(values) => {
                for v in values {
                    self.numeric.add(*v, weight);
                }
            }
            ValueList::Str(values) => {
                for v in values {
                    self.strings.add(v, weight, cap);
                }
            }
            ValueList::Bytes(values) => {
                for v in values {
                    self.bytes.add(v, cap);
                }
            }
            ValueList::Struct(_) => {}
        }
    }

    /// Folds `other` into `self`. Partials declared with different types
    /// leave a sticky error that surfaces at finalize.
    pub fn merge(&mut self, other: &Self) {
        match (self.declared, other.declared) {
            (Some(left), Some(right)) if left != right && self.merge_error.is_none() => {
                self.merge_error = Some(FeatureError::IncompatibleMerge {
                    path: self.path.clone(),
                    left: left.min(right),
                    right: left.max(right),
                });
            }
            (None, declared) => self.declared = declared,
            _ => {}
        }
        if self.merge_error.is_none() {
            self.merge_error = other.merge_error.clone();
        }

        let cap = self.limits.max_distinct_values;
        self.common.merge(&other.common);
        for (kind, count) in &other.kinds {
            let entry = self.kinds.entry(*kind).or_default();
            entry.lists += count.lists;
            entry.values += count.values;
        }
        self.numeric.merge(&other.numeric);
        if let Some(max_centroids) = self.limits.max_centroids {
            self.numeric.histogram.compact(max_centroids);
        }
        self.strings.merge(&other.strings, cap);
        self.bytes.merge(&other.bytes, cap);
        self.saw_weights |= other.saw_weights;
    }

    /// Whether any observation carried an explicit weight.
    #[must_use]
    pub fn saw_weights(&self) -> bool {
        self.saw_weights
    }

    /// Declared type, else the majority value kind. FLOAT wins over INT
    /// whenever any float list was seen.
    #[must_use]
    pub fn dominant_type(&self) -> FeatureType {
        if let Some(declared) = self.declared {
            return declared;
        }
        let mut families: BTreeMap<TypeFamily, u64> = BTreeMap::new();
        for (kind, count) in &self.kinds {
            *families.entry(kind.family()).or_default() += count.lists;
        }
        let family = families
            .iter()
            .fold(None::<(TypeFamily, u64)>, |best, (family, lists)| match best {
                Some((_, top)) if top >= *lists => best,
                _ => Some((*family, *lists)),
            })
            .map_or(TypeFamily::Numeric, |(family, _)| family);
        match family {
            TypeFamily::Numeric if self.kinds.contains_key(&ValueKind::Float) => FeatureType::Float,
            TypeFamily::Numeric => FeatureType::Int,
            TypeFamily::String => FeatureType::String,
            TypeFamily::Bytes => FeatureType::Bytes,
            TypeFamily::Struct => FeatureType::Struct,
        }
    }

    fn conflicts(&self, dominant: FeatureType) -> KindCount {
        let family = dominant.family();
        self.kinds
            .iter()
            .filter(|(kind, _)| kind.family() != family)
            .fold(KindCount::default(), |acc, (_, count)| KindCount {
                lists: acc.lists + count.lists,
                values: acc.values + count.values,
            })
    }

    pub fn finalize(
        &self,
        scope: FinalizeScope<'_>,
        ledger: &mut IssueLedger,
    ) -> Result<FeatureNameStatistics, FeatureError> {
        let policy = scope.options.policy();
        if let Some(err) = &self.merge_error {
            policy.decide_incompatible_merge(self.path.to_string(), err.to_string(), ledger);
            return Err(err.clone());
        }

        let feature_type = self.dominant_type();
        let conflicts = self.conflicts(feature_type);
        let mut custom_stats = Vec::new();
        if conflicts.lists > 0 {
            let action = policy.decide_type_conflict(
                self.path.to_string(),
                format!(
                    "{} value lists disagree with {feature_type}",
                    conflicts.lists
                ),
                ledger,
            );
            if action == DecisionAction::Reject {
                return Err(FeatureError::MixedTypes {
                    path: self.path.clone(),
                    dominant: feature_type,
                    conflicts: conflicts.lists,
                });
            }
            custom_stats.push(CustomStatistic::num(NUM_TYPE_CONFLICTS, conflicts.lists as f64));
        }

        let missing = scope.example_weights.map(|all| {
            let mut missing = all.clone();
            missing.saturating_sub(&self.common.present_weights());
            missing
        });
        let weighted = scope.weighted;
        let common_stats = self.common.finalize(
            scope.options.num_values_histogram_buckets,
            missing.as_ref(),
            weighted,
        );

        let stats = match feature_type {
            FeatureType::Int | FeatureType::Float => {
                if let Some(rank_error) = scope.options.quantile_rank_error() {
                    custom_stats.push(CustomStatistic::num(QUANTILE_RANK_ERROR, rank_error));
                }
                FeatureStats::Numeric(self.numeric_stats(
                    common_stats,
                    scope.options,
                    conflicts.values,
                    weighted,
                ))
            }
            FeatureType::String => {
                if self.strings.capped {
                    self.flag_estimate(&policy, &mut custom_stats, ledger);
                }
                FeatureStats::String(self.string_stats(common_stats, scope.options, weighted))
            }
            FeatureType::Bytes => {
                if self.bytes.capped {
                    self.flag_estimate(&policy, &mut custom_stats, ledger);
                }
                FeatureStats::Bytes(self.bytes_stats(common_stats))
            }
            FeatureType::Struct => FeatureStats::Struct(StructStatistics { common_stats }),
        };

        tracing::debug!(
            path = %self.path,
            feature_type = %feature_type,
            num_non_missing = self.common.num_non_missing(),
            "feature finalized"
        );

        Ok(FeatureNameStatistics {
            id: FeatureId::from_path(&self.path),
            feature_type,
            stats,
            custom_stats,
        })
    }

    fn flag_estimate(
        &self,
        policy: &fst_runtime::RuntimePolicy,
        custom_stats: &mut Vec<CustomStatistic>,
        ledger: &mut IssueLedger,
    ) {
        policy.decide_cardinality_cap(
            self.path.to_string(),
            format!(
                "more than {} distinct values; unique is estimated",
                self.limits.max_distinct_values
            ),
            ledger,
        );
        custom_stats.push(CustomStatistic::num(UNIQUE_IS_ESTIMATE, 1.0));
    }

    fn numeric_histograms(
        &self,
        options: &StatsOptions,
        undefined: u64,
        weighting: Weighting,
    ) -> Vec<Histogram> {
        let builder = &self.numeric.histogram;
        [
            (HistogramType::Standard, options.num_histogram_buckets),
            (HistogramType::Quantiles, options.num_quantiles_histogram_buckets),
        ]
        .into_iter()
        .map(|(histogram_type, buckets)| {
            let mut histogram = builder.finalize(histogram_type, buckets, weighting);
            histogram.num_undefined += undefined;
            histogram
        })
        .collect()
    }

    fn numeric_stats(
        &self,
        common_stats: CommonStatistics,
        options: &StatsOptions,
        undefined: u64,
        weighted: bool,
    ) -> NumericStatistics {
        let builder = &self.numeric.histogram;
        let moments = builder.moments(Weighting::Unweighted);
        let weighted_numeric_stats = weighted.then(|| {
            let moments = builder.moments(Weighting::Weighted);
            WeightedNumericStatistics {
                mean: moments.mean,
                std_dev: moments.std_dev(),
                median: builder.median(Weighting::Weighted).unwrap_or(0.0),
                histograms: self.numeric_histograms(options, undefined, Weighting::Weighted),
            }
        });
        NumericStatistics {
            common_stats,
            mean: moments.mean,
            std_dev: moments.std_dev(),
            num_zeros: self.numeric.num_zeros,
            min: builder.min().unwrap_or(0.0),
            median: builder.median(Weighting::Unweighted).unwrap_or(0.0),
            max: builder.max().unwrap_or(0.0),
            histograms: self.numeric_histograms(options, undefined, Weighting::Unweighted),
            weighted_numeric_stats,
        }
    }

    fn string_stats(
        &self,
        common_stats: CommonStatistics,
        options: &StatsOptions,
        weighted: bool,
    ) -> StringStatistics {
        let rank_options = RankOptions {
            top_k: options.num_top_values,
            bucket_width: options.rank_bucket_width,
            max_buckets: options.num_rank_histogram_buckets,
        };
        let values = self.strings.top(self.limits.max_distinct_values);
        let (top_values, rank_histogram) = values.finalize(rank_options, Weighting::Unweighted);
        let weighted_string_stats = weighted.then(|| {
            let (top_values, rank_histogram) = values.finalize(rank_options, Weighting::Weighted);
            WeightedStringStatistics {
                top_values,
                rank_histogram: Some(rank_histogram),
            }
        });
        StringStatistics {
            common_stats,
            unique: self.strings.unique(),
            top_values,
            avg_length: ratio(self.strings.total_length, self.strings.count),
            rank_histogram: Some(rank_histogram),
            weighted_string_stats,
        }
    }

    fn bytes_stats(&self, common_stats: CommonStatistics) -> BytesStatistics {
        BytesStatistics {
            common_stats,
            unique: self.bytes.unique(),
            avg_num_bytes: ratio(self.bytes.total_len, self.bytes.count),
            min_num_bytes: self.bytes.min_len.unwrap_or(0) as f32,
            max_num_bytes: self.bytes.max_len.unwrap_or(0) as f32,
        }
    }
}

fn ratio(total: u64, count: u64) -> f32 {
    if count == 0 {
        0.0
    } else {
        (total as f64 / count as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use fst_histogram::ExactMass;
    use fst_runtime::{IssueKind, IssueLedger, QuantileMode, RuntimeMode, StatsOptions};
    use fst_schema::{CustomValue, HistogramType};
    use fst_types::{FeatureInput, FeaturePath, FeatureType, ValueList};

    use super::{
        AccumLimits, CommonStatsTracker, FeatureAccumulator, FeatureError, FinalizeScope,
        NUM_TYPE_CONFLICTS, UNIQUE_IS_ESTIMATE,
    };

    fn floats(values: &[f64]) -> FeatureInput {
        FeatureInput::Values(ValueList::Float(values.to_vec()))
    }

    fn strings(values: &[&str]) -> FeatureInput {
        FeatureInput::Values(ValueList::Str(values.iter().map(|s| (*s).to_owned()).collect()))
    }

    fn accumulator(name: &str) -> FeatureAccumulator {
        FeatureAccumulator::new(FeaturePath::from_name(name), AccumLimits::default())
    }

    #[test]
    fn common_tracker_counts_values_per_example() {
        let mut tracker = CommonStatsTracker::new();
        tracker.record_present(1, 1.0);
        tracker.record_present(3, 2.0);
        tracker.record_present(0, 1.0);
        tracker.record_missing(4.0);
        let stats = tracker.finalize(10, None, true);
        assert_eq!(stats.num_non_missing, 3);
        assert_eq!(stats.num_missing, 1);
        assert_eq!(stats.min_num_values, 0);
        assert_eq!(stats.max_num_values, 3);
        assert_eq!(stats.tot_num_values, 4);
        assert_relative_eq!(stats.avg_num_values, 4.0_f32 / 3.0);
        let weighted = stats.weighted_common_stats.expect("weighted");
        assert_relative_eq!(weighted.num_non_missing, 4.0);
        assert_relative_eq!(weighted.num_missing, 4.0);
        assert_relative_eq!(weighted.tot_num_values, 7.0);
        assert_relative_eq!(weighted.avg_num_values, 1.75);
        let hist = stats.num_values_histogram.expect("num values histogram");
        assert_eq!(hist.histogram_type, HistogramType::Quantiles);
        assert_relative_eq!(hist.total_sample_count(), 3.0);
    }

    #[test]
    fn age_feature_summary() {
        let options = StatsOptions::default();
        let mut acc = accumulator("age");
        acc.observe(&floats(&[10.0]), None);
        acc.observe(&floats(&[20.0]), None);
        acc.observe_missing(None);
        let mut ledger = IssueLedger::new();
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut ledger)
            .expect("finalize");
        assert_eq!(stats.feature_type, FeatureType::Float);
        let numeric = stats.numeric().expect("numeric");
        assert_eq!(numeric.common_stats.num_non_missing, 2);
        assert_eq!(numeric.common_stats.num_missing, 1);
        assert_relative_eq!(numeric.mean, 15.0);
        assert_relative_eq!(numeric.std_dev, 5.0);
        assert_eq!(numeric.min, 10.0);
        assert_eq!(numeric.max, 20.0);
        assert_eq!(numeric.median, 15.0);
        assert!(numeric.weighted_numeric_stats.is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn nan_values_are_counted_apart() {
        let options = StatsOptions::default();
        let mut acc = accumulator("x");
        acc.observe(&floats(&[1.0, f64::NAN, 0.0, f64::NEG_INFINITY]), None);
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let numeric = stats.numeric().expect("numeric");
        assert_eq!(numeric.num_zeros, 1);
        assert_eq!(numeric.min, 0.0);
        assert_eq!(numeric.max, 1.0);
        let standard = numeric.histogram(HistogramType::Standard).expect("standard");
        assert_eq!(standard.num_nan, 2);
        assert_eq!(standard.total_sample_count(), 2.0);
    }

    #[test]
    fn string_feature_ranks_values() {
        let options = StatsOptions::default();
        let mut acc = accumulator("color");
        for value in ["red", "red", "blue"] {
            acc.observe(&strings(&[value]), None);
        }
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let string = stats.string().expect("string");
        assert_eq!(string.unique, 2);
        assert_eq!(string.top_values[0].value, "red");
        assert_eq!(string.top_values[0].frequency, 2.0);
        assert_eq!(string.top_values[1].value, "blue");
        let rank = string.rank_histogram.as_ref().expect("rank histogram");
        assert_eq!(rank.buckets[0].label, "red");
        assert_eq!(rank.buckets[0].sample_count, 2.0);
        assert_relative_eq!(string.avg_length, 10.0_f32 / 3.0);
    }

    #[test]
    fn mixed_types_repair_by_majority() {
        let options = StatsOptions::default();
        let mut acc = accumulator("mixed");
        acc.observe(&floats(&[1.0]), None);
        acc.observe(&floats(&[2.0]), None);
        acc.observe(&strings(&["oops"]), None);
        let mut ledger = IssueLedger::new();
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut ledger)
            .expect("finalize");
        assert_eq!(stats.feature_type, FeatureType::Float);
        assert_eq!(
            stats.custom_stat(NUM_TYPE_CONFLICTS),
            Some(&CustomValue::Num(1.0))
        );
        let numeric = stats.numeric().expect("numeric");
        assert_eq!(numeric.histograms[0].num_undefined, 1);
        assert_eq!(ledger.count(IssueKind::MixedTypes), 1);
    }

    #[test]
    fn mixed_types_reject_in_strict_mode() {
        let options = StatsOptions {
            runtime_mode: RuntimeMode::Strict,
            ..StatsOptions::default()
        };
        let mut acc = accumulator("mixed");
        acc.observe(&floats(&[1.0]), None);
        acc.observe(&strings(&["a"]), None);
        acc.observe(&strings(&["b"]), None);
        let err = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect_err("strict mode rejects");
        assert!(matches!(
            err,
            FeatureError::MixedTypes {
                dominant: FeatureType::String,
                conflicts: 1,
                ..
            }
        ));
    }

    #[test]
    fn declared_type_overrides_majority() {
        let options = StatsOptions::default();
        let mut acc = accumulator("id").with_declared_type(FeatureType::String);
        acc.observe(&floats(&[1.0]), None);
        acc.observe(&floats(&[2.0]), None);
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        assert_eq!(stats.feature_type, FeatureType::String);
        assert_eq!(
            stats.custom_stat(NUM_TYPE_CONFLICTS),
            Some(&CustomValue::Num(2.0))
        );
    }

    #[test]
    fn int_and_float_lists_share_numeric_family() {
        let mut acc = accumulator("n");
        acc.observe(&FeatureInput::Values(ValueList::Int(vec![1, 2])), None);
        assert_eq!(acc.dominant_type(), FeatureType::Int);
        acc.observe(&floats(&[0.5]), None);
        assert_eq!(acc.dominant_type(), FeatureType::Float);
    }

    #[test]
    fn incompatible_declared_types_fail_on_merge() {
        let options = StatsOptions::default();
        let mut left = accumulator("f").with_declared_type(FeatureType::Int);
        let right = accumulator("f").with_declared_type(FeatureType::String);
        left.merge(&right);
        let mut ledger = IssueLedger::new();
        let err = left
            .finalize(FinalizeScope::new(&options), &mut ledger)
            .expect_err("incompatible");
        assert!(matches!(
            err,
            FeatureError::IncompatibleMerge {
                left: FeatureType::Int,
                right: FeatureType::String,
                ..
            }
        ));
        assert_eq!(ledger.count(IssueKind::IncompatibleMerge), 1);
    }

    #[test]
    fn merge_matches_single_pass() {
        let options = StatsOptions::default();
        let inputs = [
            floats(&[1.5, 2.5]),
            floats(&[]),
            floats(&[-3.0]),
            FeatureInput::Missing,
            floats(&[7.0, 7.0, 0.0]),
        ];
        let mut single = accumulator("v");
        for (i, input) in inputs.iter().enumerate() {
            single.observe(input, Some(1.0 + i as f64));
        }
        let mut left = accumulator("v");
        let mut right = accumulator("v");
        for (i, input) in inputs.iter().enumerate() {
            let target = if i % 2 == 0 { &mut left } else { &mut right };
            target.observe(input, Some(1.0 + i as f64));
        }
        right.merge(&left);
        let scope = FinalizeScope::new(&options).with_weighted(true);
        assert_eq!(
            single.finalize(scope, &mut IssueLedger::new()).expect("single"),
            right.finalize(scope, &mut IssueLedger::new()).expect("merged"),
        );
    }

    #[test]
    fn missing_derives_from_example_weights() {
        let options = StatsOptions::default();
        let mut acc = accumulator("sparse");
        acc.observe(&floats(&[1.0]), Some(2.0));
        let mut all = ExactMass::new();
        for weight in [2.0, 3.0, 5.0] {
            all.add(weight);
        }
        let scope = FinalizeScope::new(&options)
            .with_example_weights(&all)
            .with_weighted(true);
        let stats = acc.finalize(scope, &mut IssueLedger::new()).expect("finalize");
        let common = stats.common();
        assert_eq!(common.num_missing, 2);
        let weighted = common.weighted_common_stats.as_ref().expect("weighted");
        assert_relative_eq!(weighted.num_missing, 8.0);
        assert_relative_eq!(weighted.num_non_missing, 2.0);
    }

    #[test]
    fn cardinality_cap_degrades_to_estimate() {
        let options = StatsOptions {
            max_distinct_values: 4,
            ..StatsOptions::default()
        };
        let mut acc = FeatureAccumulator::new(
            FeaturePath::from_name("token"),
            AccumLimits::from_options(&options),
        );
        for i in 0..10 {
            acc.observe(&strings(&[&format!("t{i}")]), None);
        }
        let mut ledger = IssueLedger::new();
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut ledger)
            .expect("finalize");
        assert_eq!(
            stats.custom_stat(UNIQUE_IS_ESTIMATE),
            Some(&CustomValue::Num(1.0))
        );
        assert_eq!(stats.string().expect("string").unique, 10);
        assert_eq!(stats.common().num_non_missing, 10);
        assert_eq!(ledger.count(IssueKind::CardinalityCap), 1);
    }

    fn capped_accumulator(cap: usize) -> (StatsOptions, FeatureAccumulator) {
        let options = StatsOptions {
            max_distinct_values: cap,
            ..StatsOptions::default()
        };
        let acc = FeatureAccumulator::new(
            FeaturePath::from_name("token"),
            AccumLimits::from_options(&options),
        );
        (options, acc)
    }

    #[test]
    fn values_past_the_cap_keep_counting() {
        let mut late = vec!["a", "b"];
        late.extend(std::iter::repeat_n("hot", 100));
        let early: Vec<&str> = late.iter().rev().copied().collect();

        let mut results = Vec::new();
        for order in [late, early] {
            let (options, mut acc) = capped_accumulator(2);
            for value in order {
                acc.observe(&strings(&[value]), None);
            }
            let stats = acc
                .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
                .expect("finalize");
            let string = stats.string().expect("string").clone();
            assert_eq!(string.top_values[0].value, "hot");
            assert_eq!(string.top_values[0].frequency, 100.0);
            assert_eq!(string.top_values.len(), 2);
            assert_eq!(
                stats.custom_stat(UNIQUE_IS_ESTIMATE),
                Some(&CustomValue::Num(1.0))
            );
            results.push(string);
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn capped_tally_trims_to_the_heaviest_values() {
        let (options, mut acc) = capped_accumulator(2);
        for _ in 0..3 {
            acc.observe(&strings(&["x"]), None);
        }
        for i in 0..20 {
            acc.observe(&strings(&[&format!("rare{i:02}")]), None);
        }
        acc.observe(&strings(&["x"]), None);
        assert!(acc.strings.values.distinct() <= 4);
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let string = stats.string().expect("string");
        assert_eq!(string.top_values[0].value, "x");
        assert_eq!(string.top_values[0].frequency, 4.0);
        assert_eq!(string.unique, 21);
    }

    #[test]
    fn distinct_weights_keep_tallies_small() {
        let options = StatsOptions {
            quantile_mode: QuantileMode::Bounded { max_centroids: 8 },
            ..StatsOptions::default()
        };
        let mut acc = FeatureAccumulator::new(
            FeaturePath::from_name("x"),
            AccumLimits::from_options(&options),
        );
        let mut all = ExactMass::new();
        for i in 0..5_000_u32 {
            let weight = 1.0 + f64::from(i) / 8_192.0;
            all.add(weight);
            if i % 10 == 0 {
                continue;
            }
            acc.observe(&floats(&[f64::from(i)]), Some(weight));
        }
        assert_eq!(acc.common().entry_count(), 1);
        assert!(acc.numeric.histogram.values().distinct() <= 16);

        let scope = FinalizeScope::new(&options)
            .with_example_weights(&all)
            .with_weighted(true);
        let stats = acc.finalize(scope, &mut IssueLedger::new()).expect("finalize");
        let common = stats.common();
        assert_eq!(common.num_non_missing, 4_500);
        assert_eq!(common.num_missing, 500);
        let weighted = common.weighted_common_stats.as_ref().expect("weighted");
        let skipped: f64 = (0..5_000_u32)
            .step_by(10)
            .map(|i| 1.0 + f64::from(i) / 8_192.0)
            .sum();
        assert_relative_eq!(weighted.num_missing, skipped, max_relative = 1e-12);
    }

    #[test]
    fn bounded_mode_std_dev_matches_exact() {
        let bounded = StatsOptions {
            quantile_mode: QuantileMode::Bounded { max_centroids: 4 },
            ..StatsOptions::default()
        };
        let exact = StatsOptions::default();
        let mut results = Vec::new();
        for options in [&bounded, &exact] {
            let mut acc = FeatureAccumulator::new(
                FeaturePath::from_name("x"),
                AccumLimits::from_options(options),
            );
            for i in 0..1_000 {
                acc.observe(&floats(&[f64::from(i)]), None);
            }
            let stats = acc
                .finalize(FinalizeScope::new(options), &mut IssueLedger::new())
                .expect("finalize");
            results.push(stats.numeric().expect("numeric").clone());
        }
        let std_dev = (999_999.0_f64 / 12.0).sqrt();
        assert_relative_eq!(results[1].std_dev, std_dev, max_relative = 1e-12);
        assert_relative_eq!(results[0].std_dev, std_dev, max_relative = 1e-9);
        assert_relative_eq!(results[0].mean, results[1].mean, max_relative = 1e-12);
    }

    #[test]
    fn bytes_feature_tracks_lengths() {
        let options = StatsOptions::default();
        let mut acc = accumulator("blob");
        acc.observe(
            &FeatureInput::Values(ValueList::Bytes(vec![vec![1, 2, 3], vec![4]])),
            None,
        );
        acc.observe(&FeatureInput::Values(ValueList::Bytes(vec![vec![1, 2, 3]])), None);
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let bytes = stats.bytes().expect("bytes");
        assert_eq!(bytes.unique, 2);
        assert_eq!(bytes.min_num_bytes, 1.0);
        assert_eq!(bytes.max_num_bytes, 3.0);
        assert_relative_eq!(bytes.avg_num_bytes, 7.0_f32 / 3.0);
    }

    #[test]
    fn sequence_feature_reports_list_lengths() {
        let options = StatsOptions::default();
        let mut acc = accumulator("clicks");
        acc.observe(
            &FeatureInput::Sequence(vec![ValueList::Int(vec![1, 2]), ValueList::Int(vec![3])]),
            None,
        );
        acc.observe(&FeatureInput::Sequence(vec![]), None);
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let common = stats.common();
        assert_eq!(common.num_non_missing, 2);
        assert_eq!(common.tot_num_values, 3);
        let lengths = common
            .feature_list_length_histogram
            .as_ref()
            .expect("list length histogram");
        assert_relative_eq!(lengths.total_sample_count(), 2.0);
    }

    #[test]
    fn bounded_mode_reports_rank_error() {
        let options = StatsOptions {
            quantile_mode: QuantileMode::Bounded { max_centroids: 8 },
            ..StatsOptions::default()
        };
        let mut acc = FeatureAccumulator::new(
            FeaturePath::from_name("x"),
            AccumLimits::from_options(&options),
        );
        for i in 0..200 {
            acc.observe(&floats(&[f64::from(i)]), None);
        }
        let stats = acc
            .finalize(FinalizeScope::new(&options), &mut IssueLedger::new())
            .expect("finalize");
        let numeric = stats.numeric().expect("numeric");
        assert_eq!(numeric.min, 0.0);
        assert_eq!(numeric.max, 199.0);
        assert_relative_eq!(numeric.mean, 99.5, epsilon = 1e-9);
        assert_eq!(numeric.histograms[1].total_sample_count(), 200.0);
        assert!(stats.custom_stat(super::QUANTILE_RANK_ERROR).is_some());
    }
}
