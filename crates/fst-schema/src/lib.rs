#![forbid(unsafe_code)]

//! Finalized statistics tree. Every structure here is produced once per
//! aggregation pass and is read-only afterwards.

use std::collections::HashSet;

use fst_types::{FeaturePath, FeatureType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetFeatureStatisticsList {
    pub datasets: Vec<DatasetFeatureStatistics>,
}

impl DatasetFeatureStatisticsList {
    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&DatasetFeatureStatistics> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetFeatureStatistics {
    pub name: String,
    pub num_examples: u64,
    /// A missing example weight counts as 1.
    pub weighted_num_examples: f64,
    pub features: Vec<FeatureNameStatistics>,
}

impl DatasetFeatureStatistics {
    #[must_use]
    pub fn feature(&self, path: &FeaturePath) -> Option<&FeatureNameStatistics> {
        self.features.iter().find(|f| f.id.path() == *path)
    }

    /// Identities must be unique and every payload must match its type.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::with_capacity(self.features.len());
        for feature in &self.features {
            let path = feature.id.path();
            if !seen.insert(path.clone()) {
                return Err(SchemaError::DuplicateFeature { path });
            }
            if !feature.stats.matches_type(feature.feature_type) {
                return Err(SchemaError::PayloadTypeMismatch {
                    path,
                    feature_type: feature.feature_type,
                });
            }
            for histogram in feature.histograms() {
                histogram.validate()?;
            }
        }
        Ok(())
    }
}

/// `name` and `path` are alternative spellings of the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureId {
    Name(String),
    Path(FeaturePath),
}

impl FeatureId {
    /// Flat paths become names, nested paths stay paths.
    #[must_use]
    pub fn from_path(path: &FeaturePath) -> Self {
        match path.steps() {
            [name] => Self::Name(name.clone()),
            _ => Self::Path(path.clone()),
        }
    }

    #[must_use]
    pub fn path(&self) -> FeaturePath {
        match self {
            Self::Name(name) => FeaturePath::from_name(name.clone()),
            Self::Path(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureNameStatistics {
    pub id: FeatureId,
    pub feature_type: FeatureType,
    pub stats: FeatureStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_stats: Vec<CustomStatistic>,
}

impl FeatureNameStatistics {
    #[must_use]
    pub fn common(&self) -> &CommonStatistics {
        self.stats.common()
    }

    #[must_use]
    pub fn numeric(&self) -> Option<&NumericStatistics> {
        match &self.stats {
            FeatureStats::Numeric(stats) => Some(stats),
            _ => None,
        }
    }

    #[must_use]
    pub fn string(&self) -> Option<&StringStatistics> {
        match &self.stats {
            FeatureStats::String(stats) => Some(stats),
            _ => None,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> Option<&BytesStatistics> {
        match &self.stats {
            FeatureStats::Bytes(stats) => Some(stats),
            _ => None,
        }
    }

    #[must_use]
    pub fn custom_stat(&self, name: &str) -> Option<&CustomValue> {
        self.custom_stats
            .iter()
            .find(|stat| stat.name == name)
            .map(|stat| &stat.value)
    }

    /// Every histogram reachable from this feature, custom ones included.
    #[must_use]
    pub fn histograms(&self) -> Vec<&Histogram> {
        let common = self.common();
        let mut out: Vec<&Histogram> = common
            .num_values_histogram
            .iter()
            .chain(common.feature_list_length_histogram.iter())
            .collect();
        if let FeatureStats::Numeric(numeric) = &self.stats {
            out.extend(numeric.histograms.iter());
            if let Some(weighted) = &numeric.weighted_numeric_stats {
                out.extend(weighted.histograms.iter());
            }
        }
        out.extend(self.custom_stats.iter().filter_map(|stat| match &stat.value {
            CustomValue::Histogram(h) => Some(h),
            _ => None,
        }));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureStats {
    Numeric(NumericStatistics),
    String(StringStatistics),
    Bytes(BytesStatistics),
    Struct(StructStatistics),
}

impl FeatureStats {
    #[must_use]
    pub fn common(&self) -> &CommonStatistics {
        match self {
            Self::Numeric(s) => &s.common_stats,
            Self::String(s) => &s.common_stats,
            Self::Bytes(s) => &s.common_stats,
            Self::Struct(s) => &s.common_stats,
        }
    }

    #[must_use]
    pub fn matches_type(&self, feature_type: FeatureType) -> bool {
        matches!(
            (self, feature_type),
            (Self::Numeric(_), FeatureType::Int | FeatureType::Float)
                | (Self::String(_), FeatureType::String)
                | (Self::Bytes(_), FeatureType::Bytes)
                | (Self::Struct(_), FeatureType::Struct)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomStatistic {
    pub name: String,
    pub value: CustomValue,
}

impl CustomStatistic {
    #[must_use]
    pub fn num(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: CustomValue::Num(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomValue {
    Num(f64),
    Str(String),
    Histogram(Histogram),
    RankHistogram(RankHistogram),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonStatistics {
    pub num_non_missing: u64,
    pub num_missing: u64,
    pub min_num_values: u64,
    pub max_num_values: u64,
    pub avg_num_values: f32,
    /// Summed independently of `avg_num_values`.
    pub tot_num_values: u64,
    pub num_values_histogram: Option<Histogram>,
    pub weighted_common_stats: Option<WeightedCommonStatistics>,
    /// Only for list-of-lists features.
    pub feature_list_length_histogram: Option<Histogram>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedCommonStatistics {
    pub num_non_missing: f64,
    pub num_missing: f64,
    pub avg_num_values: f64,
    pub tot_num_values: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericStatistics {
    pub common_stats: CommonStatistics,
    pub mean: f64,
    pub std_dev: f64,
    pub num_zeros: u64,
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub histograms: Vec<Histogram>,
    pub weighted_numeric_stats: Option<WeightedNumericStatistics>,
}

impl NumericStatistics {
    #[must_use]
    pub fn histogram(&self, histogram_type: HistogramType) -> Option<&Histogram> {
        self.histograms
            .iter()
            .find(|h| h.histogram_type == histogram_type)
    }
}

/// Min, max and zero counts are deliberately absent: weighting does not change them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedNumericStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub histograms: Vec<Histogram>,
}

impl WeightedNumericStatistics {
    #[must_use]
    pub fn histogram(&self, histogram_type: HistogramType) -> Option<&Histogram> {
        self.histograms
            .iter()
            .find(|h| h.histogram_type == histogram_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringStatistics {
    pub common_stats: CommonStatistics,
    pub unique: u64,
    pub top_values: Vec<FreqAndValue>,
    pub avg_length: f32,
    pub rank_histogram: Option<RankHistogram>,
    pub weighted_string_stats: Option<WeightedStringStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreqAndValue {
    pub value: String,
    pub frequency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedStringStatistics {
    pub top_values: Vec<FreqAndValue>,
    pub rank_histogram: Option<RankHistogram>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BytesStatistics {
    pub common_stats: CommonStatistics,
    pub unique: u64,
    pub avg_num_bytes: f32,
    pub min_num_bytes: f32,
    pub max_num_bytes: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructStatistics {
    pub common_stats: CommonStatistics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistogramType {
    /// Equal-width buckets.
    #[default]
    Standard = 0,
    /// Equal-count buckets of variable width.
    Quantiles = 1,
}

impl HistogramType {
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Standard),
            1 => Some(Self::Quantiles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub num_nan: u64,
    pub num_undefined: u64,
    pub buckets: Vec<HistogramBucket>,
    pub histogram_type: HistogramType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Histogram {
    #[must_use]
    pub fn total_sample_count(&self) -> f64 {
        self.buckets.iter().map(|b| b.sample_count).sum()
    }

    /// Buckets must be ordered, non-inverted and contiguous.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.low_value > bucket.high_value {
                return Err(SchemaError::InvertedBucket { index: idx });
            }
            if let Some(next) = self.buckets.get(idx + 1)
                && next.low_value != bucket.high_value
            {
                return Err(SchemaError::GapBetweenBuckets { index: idx });
            }
        }
        Ok(())
    }
}

/// `low_value` is inclusive and `high_value` exclusive, except for the last
/// bucket whose high bound is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub low_value: f64,
    pub high_value: f64,
    pub sample_count: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankHistogram {
    pub buckets: Vec<RankHistogramBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Ranks start at 1 for the most frequent value; `high_rank` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankHistogramBucket {
    pub low_rank: u64,
    pub high_rank: u64,
    pub label: String,
    pub sample_count: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("feature {path} appears more than once")]
    DuplicateFeature { path: FeaturePath },
    #[error("feature {path} declares {feature_type} but carries another payload")]
    PayloadTypeMismatch {
        path: FeaturePath,
        feature_type: FeatureType,
    },
    #[error("histogram bucket {index} has low bound above high bound")]
    InvertedBucket { index: usize },
    #[error("histogram bucket {index} is not contiguous with its successor")]
    GapBetweenBuckets { index: usize },
}
