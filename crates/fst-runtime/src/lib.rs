#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use fst_types::FeaturePath;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NUM_HISTOGRAM_BUCKETS: usize = 10;
pub const DEFAULT_NUM_QUANTILES_HISTOGRAM_BUCKETS: usize = 10;
pub const DEFAULT_NUM_VALUES_HISTOGRAM_BUCKETS: usize = 10;
pub const DEFAULT_NUM_TOP_VALUES: usize = 20;
pub const DEFAULT_NUM_RANK_HISTOGRAM_BUCKETS: usize = 1_000;
pub const DEFAULT_MAX_DISTINCT_VALUES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Type conflicts fail the feature.
    Strict,
    /// Type conflicts are recorded and resolved by majority.
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Reject,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MixedTypes,
    CardinalityCap,
    IncompatibleMerge,
    InvalidWeight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuantileMode {
    /// Keep every distinct (value, weight) pair; quantiles are exact.
    Exact,
    /// Compact value tallies to at most `max_centroids` equal-count centroids
    /// once they hold more than twice that many entries.
    Bounded { max_centroids: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureOrder {
    /// Order of first observation. Merging appends the other side's new features.
    FirstSeen,
    /// Lexicographic by path; independent of merge order.
    Sorted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsOptions {
    pub num_histogram_buckets: usize,
    pub num_quantiles_histogram_buckets: usize,
    pub num_values_histogram_buckets: usize,
    pub num_top_values: usize,
    pub num_rank_histogram_buckets: usize,
    pub rank_bucket_width: usize,
    /// Distinct string/bytes values tracked exactly per feature.
    pub max_distinct_values: usize,
    pub quantile_mode: QuantileMode,
    /// Dataset-wide weight column, given as path steps.
    pub weight_feature: Option<FeaturePath>,
    pub feature_order: FeatureOrder,
    pub runtime_mode: RuntimeMode,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            num_histogram_buckets: DEFAULT_NUM_HISTOGRAM_BUCKETS,
            num_quantiles_histogram_buckets: DEFAULT_NUM_QUANTILES_HISTOGRAM_BUCKETS,
            num_values_histogram_buckets: DEFAULT_NUM_VALUES_HISTOGRAM_BUCKETS,
            num_top_values: DEFAULT_NUM_TOP_VALUES,
            num_rank_histogram_buckets: DEFAULT_NUM_RANK_HISTOGRAM_BUCKETS,
            rank_bucket_width: 1,
            max_distinct_values: DEFAULT_MAX_DISTINCT_VALUES,
            quantile_mode: QuantileMode::Exact,
            weight_feature: None,
            feature_order: FeatureOrder::FirstSeen,
            runtime_mode: RuntimeMode::Hardened,
        }
    }
}

impl StatsOptions {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(input)?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("num_histogram_buckets", self.num_histogram_buckets),
            (
                "num_quantiles_histogram_buckets",
                self.num_quantiles_histogram_buckets,
            ),
            (
                "num_values_histogram_buckets",
                self.num_values_histogram_buckets,
            ),
            ("num_rank_histogram_buckets", self.num_rank_histogram_buckets),
            ("rank_bucket_width", self.rank_bucket_width),
            ("max_distinct_values", self.max_distinct_values),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if let QuantileMode::Bounded { max_centroids } = self.quantile_mode
            && max_centroids < 2
        {
            return Err(ConfigError::Invalid {
                field: "quantile_mode.max_centroids",
                reason: format!("must be at least 2, got {max_centroids}"),
            });
        }
        Ok(())
    }

    /// Nominal bound on the rank error of quantile boundaries, as a fraction
    /// of the total weight. `None` means exact.
    #[must_use]
    pub fn quantile_rank_error(&self) -> Option<f64> {
        match self.quantile_mode {
            QuantileMode::Exact => None,
            QuantileMode::Bounded { max_centroids } => Some(2.0 / max_centroids as f64),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RuntimePolicy {
        RuntimePolicy {
            mode: self.runtime_mode,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: AggregationIssue,
}

/// Append-only record of non-fatal problems met during aggregation.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLedger {
    records: Vec<DecisionRecord>,
}

impl IssueLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        tracing::warn!(
            kind = ?record.issue.kind,
            action = ?record.action,
            subject = %record.issue.subject,
            detail = %record.issue.detail,
            "aggregation issue recorded"
        );
        self.records.push(record);
    }

    pub fn extend(&mut self, other: IssueLedger) {
        self.records.extend(other.records);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn count(&self, kind: IssueKind) -> usize {
        self.records
            .iter()
            .filter(|record| record.issue.kind == kind)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
        }
    }

    #[must_use]
    pub fn hardened() -> Self {
        Self {
            mode: RuntimeMode::Hardened,
        }
    }

    /// Strict rejects the feature; hardened keeps the majority type.
    pub fn decide_type_conflict(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut IssueLedger,
    ) -> DecisionAction {
        let action = match self.mode {
            RuntimeMode::Strict => DecisionAction::Reject,
            RuntimeMode::Hardened => DecisionAction::Repair,
        };
        self.record(IssueKind::MixedTypes, subject, detail, action, ledger)
    }

    /// A cap breach always degrades to an estimate.
    pub fn decide_cardinality_cap(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut IssueLedger,
    ) -> DecisionAction {
        self.record(
            IssueKind::CardinalityCap,
            subject,
            detail,
            DecisionAction::Repair,
            ledger,
        )
    }

    /// Invalid weights are replaced by 1.
    pub fn decide_invalid_weight(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut IssueLedger,
    ) -> DecisionAction {
        self.record(
            IssueKind::InvalidWeight,
            subject,
            detail,
            DecisionAction::Repair,
            ledger,
        )
    }

    /// Partials with different declared types cannot be combined.
    pub fn decide_incompatible_merge(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut IssueLedger,
    ) -> DecisionAction {
        self.record(
            IssueKind::IncompatibleMerge,
            subject,
            detail,
            DecisionAction::Reject,
            ledger,
        )
    }

    fn record(
        &self,
        kind: IssueKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
        action: DecisionAction,
        ledger: &mut IssueLedger,
    ) -> DecisionAction {
        ledger.push(DecisionRecord {
            mode: self.mode,
            action,
            issue: AggregationIssue {
                kind,
                subject: subject.into(),
                detail: detail.into(),
            },
        });
        action
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::hardened()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use fst_types::FeaturePath;

    use super::{
        ConfigError, DecisionAction, FeatureOrder, IssueKind, IssueLedger, QuantileMode,
        RuntimeMode, RuntimePolicy, StatsOptions,
    };

    #[test]
    fn defaults_validate() {
        let options = StatsOptions::default();
        options.validate().expect("defaults are valid");
        assert_eq!(options.num_histogram_buckets, 10);
        assert_eq!(options.num_top_values, 20);
        assert_eq!(options.quantile_rank_error(), None);
        assert_eq!(options.policy(), RuntimePolicy::hardened());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let options = StatsOptions::from_toml_str(
            r#"
            num_histogram_buckets = 4
            weight_feature = ["w"]
            feature_order = "sorted"
            runtime_mode = "strict"

            [quantile_mode]
            kind = "bounded"
            max_centroids = 200
            "#,
        )
        .expect("parse");
        assert_eq!(options.num_histogram_buckets, 4);
        assert_eq!(options.num_quantiles_histogram_buckets, 10);
        assert_eq!(options.weight_feature, Some(FeaturePath::from("w")));
        assert_eq!(options.feature_order, FeatureOrder::Sorted);
        assert_eq!(options.runtime_mode, RuntimeMode::Strict);
        assert_eq!(
            options.quantile_mode,
            QuantileMode::Bounded { max_centroids: 200 }
        );
        assert_eq!(options.quantile_rank_error(), Some(0.01));
    }

    #[test]
    fn zero_buckets_are_rejected() {
        let err = StatsOptions::from_toml_str("num_values_histogram_buckets = 0").expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "num_values_histogram_buckets",
                ..
            }
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = StatsOptions::from_toml_str("num_bucketz = 3").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn tiny_centroid_budget_is_rejected() {
        let options = StatsOptions {
            quantile_mode: QuantileMode::Bounded { max_centroids: 1 },
            ..StatsOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_reports_missing_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "num_top_values = 5").expect("write");
        let options = StatsOptions::load(file.path()).expect("load");
        assert_eq!(options.num_top_values, 5);

        let err = StatsOptions::load("/nonexistent/featurestats.toml").expect_err("missing");
        assert!(err.to_string().contains("featurestats.toml"));
    }

    #[test]
    fn type_conflict_decision_depends_on_mode() {
        let mut ledger = IssueLedger::new();
        let strict = RuntimePolicy::strict().decide_type_conflict("f", "3 strings", &mut ledger);
        let hardened = RuntimePolicy::hardened().decide_type_conflict("f", "3 strings", &mut ledger);
        assert_eq!(strict, DecisionAction::Reject);
        assert_eq!(hardened, DecisionAction::Repair);
        assert_eq!(ledger.count(IssueKind::MixedTypes), 2);
    }

    #[test]
    fn cap_and_weight_issues_repair() {
        let mut ledger = IssueLedger::new();
        let policy = RuntimePolicy::strict();
        assert_eq!(
            policy.decide_cardinality_cap("s", "cap 10", &mut ledger),
            DecisionAction::Repair
        );
        assert_eq!(
            policy.decide_invalid_weight("train", "weight=-1", &mut ledger),
            DecisionAction::Repair
        );
        assert_eq!(
            policy.decide_incompatible_merge("x", "INT vs STRING", &mut ledger),
            DecisionAction::Reject
        );
        assert_eq!(ledger.records().len(), 3);
        assert_eq!(ledger.records()[2].issue.kind, IssueKind::IncompatibleMerge);
    }

    #[test]
    fn ledgers_extend_in_order() {
        let mut left = IssueLedger::new();
        let mut right = IssueLedger::new();
        RuntimePolicy::hardened().decide_invalid_weight("a", "nan", &mut left);
        RuntimePolicy::hardened().decide_invalid_weight("b", "nan", &mut right);
        left.extend(right);
        let subjects: Vec<&str> = left
            .records()
            .iter()
            .map(|r| r.issue.subject.as_str())
            .collect();
        assert_eq!(subjects, vec!["a", "b"]);
    }
}
