#![forbid(unsafe_code)]

//! Protobuf and JSON boundary for finalized statistics.
//!
//! The prost messages in [`proto`] are declared with derive macros and keep
//! the field numbers of `feature_statistics.proto`. Deprecated count fields
//! exist only here: they are never written, and on decode they are read only
//! when the current field is zero.

use fst_schema::{
    BytesStatistics, CommonStatistics, CustomStatistic, CustomValue, DatasetFeatureStatistics,
    DatasetFeatureStatisticsList, FeatureId, FeatureNameStatistics, FeatureStats, FreqAndValue,
    Histogram, HistogramBucket, HistogramType, NumericStatistics, RankHistogram,
    RankHistogramBucket, StringStatistics, StructStatistics, WeightedCommonStatistics,
    WeightedNumericStatistics, WeightedStringStatistics,
};
use fst_types::{FeaturePath, FeatureType};
use prost::Message;
use thiserror::Error;

pub mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct DatasetFeatureStatisticsList {
        #[prost(message, repeated, tag = "1")]
        pub datasets: Vec<DatasetFeatureStatistics>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct DatasetFeatureStatistics {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(uint64, tag = "2")]
        pub num_examples: u64,
        #[prost(message, repeated, tag = "3")]
        pub features: Vec<FeatureNameStatistics>,
        #[prost(double, tag = "4")]
        pub weighted_num_examples: f64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Path {
        #[prost(string, repeated, tag = "1")]
        pub step: Vec<String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct FeatureNameStatistics {
        #[prost(oneof = "feature_name_statistics::FieldId", tags = "1, 8")]
        pub field_id: Option<feature_name_statistics::FieldId>,
        #[prost(enumeration = "feature_name_statistics::Type", tag = "2")]
        pub r#type: i32,
        #[prost(oneof = "feature_name_statistics::Stats", tags = "3, 4, 5, 7")]
        pub stats: Option<feature_name_statistics::Stats>,
        #[prost(message, repeated, tag = "6")]
        pub custom_stats: Vec<CustomStatistic>,
    }

    pub mod feature_name_statistics {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum Type {
            Int = 0,
            Float = 1,
            String = 2,
            Bytes = 3,
            Struct = 4,
        }

        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum FieldId {
            #[prost(string, tag = "1")]
            Name(String),
            #[prost(message, tag = "8")]
            Path(super::Path),
        }

        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Stats {
            #[prost(message, tag = "3")]
            NumStats(super::NumericStatistics),
            #[prost(message, tag = "4")]
            StringStats(super::StringStatistics),
            #[prost(message, tag = "5")]
            BytesStats(super::BytesStatistics),
            #[prost(message, tag = "7")]
            StructStats(super::StructStatistics),
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CustomStatistic {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(oneof = "custom_statistic::Val", tags = "2, 3, 4, 5")]
        pub val: Option<custom_statistic::Val>,
    }

    pub mod custom_statistic {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Val {
            #[prost(double, tag = "2")]
            Num(f64),
            #[prost(string, tag = "3")]
            Str(String),
            #[prost(message, tag = "4")]
            Histogram(super::Histogram),
            #[prost(message, tag = "5")]
            RankHistogram(super::RankHistogram),
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct WeightedCommonStatistics {
        #[prost(double, tag = "1")]
        pub num_non_missing: f64,
        #[prost(double, tag = "2")]
        pub num_missing: f64,
        #[prost(double, tag = "3")]
        pub avg_num_values: f64,
        #[prost(double, tag = "4")]
        pub tot_num_values: f64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CommonStatistics {
        #[prost(uint64, tag = "1")]
        pub num_non_missing: u64,
        #[prost(uint64, tag = "2")]
        pub num_missing: u64,
        #[prost(uint64, tag = "3")]
        pub min_num_values: u64,
        #[prost(uint64, tag = "4")]
        pub max_num_values: u64,
        #[prost(float, tag = "5")]
        pub avg_num_values: f32,
        #[prost(message, optional, tag = "6")]
        pub num_values_histogram: Option<Histogram>,
        #[prost(message, optional, tag = "7")]
        pub weighted_common_stats: Option<WeightedCommonStatistics>,
        #[prost(uint64, tag = "8")]
        pub tot_num_values: u64,
        #[prost(message, optional, tag = "9")]
        pub feature_list_length_histogram: Option<Histogram>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NumericStatistics {
        #[prost(message, optional, tag = "1")]
        pub common_stats: Option<CommonStatistics>,
        #[prost(double, tag = "2")]
        pub mean: f64,
        #[prost(double, tag = "3")]
        pub std_dev: f64,
        #[prost(uint64, tag = "4")]
        pub num_zeros: u64,
        #[prost(double, tag = "5")]
        pub min: f64,
        #[prost(double, tag = "6")]
        pub median: f64,
        #[prost(double, tag = "7")]
        pub max: f64,
        #[prost(message, repeated, tag = "8")]
        pub histograms: Vec<Histogram>,
        #[prost(message, optional, tag = "9")]
        pub weighted_numeric_stats: Option<WeightedNumericStatistics>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct WeightedNumericStatistics {
        #[prost(double, tag = "1")]
        pub mean: f64,
        #[prost(double, tag = "2")]
        pub std_dev: f64,
        #[prost(double, tag = "3")]
        pub median: f64,
        #[prost(message, repeated, tag = "4")]
        pub histograms: Vec<Histogram>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct StringStatistics {
        #[prost(message, optional, tag = "1")]
        pub common_stats: Option<CommonStatistics>,
        #[prost(uint64, tag = "2")]
        pub unique: u64,
        #[prost(message, repeated, tag = "3")]
        pub top_values: Vec<string_statistics::FreqAndValue>,
        #[prost(float, tag = "4")]
        pub avg_length: f32,
        #[prost(message, optional, tag = "5")]
        pub rank_histogram: Option<RankHistogram>,
        #[prost(message, optional, tag = "6")]
        pub weighted_string_stats: Option<WeightedStringStatistics>,
    }

    pub mod string_statistics {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct FreqAndValue {
            #[prost(uint64, tag = "1")]
            pub deprecated_freq: u64,
            #[prost(string, tag = "2")]
            pub value: String,
            #[prost(double, tag = "3")]
            pub frequency: f64,
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct WeightedStringStatistics {
        #[prost(message, repeated, tag = "1")]
        pub top_values: Vec<string_statistics::FreqAndValue>,
        #[prost(message, optional, tag = "2")]
        pub rank_histogram: Option<RankHistogram>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct BytesStatistics {
        #[prost(message, optional, tag = "1")]
        pub common_stats: Option<CommonStatistics>,
        #[prost(uint64, tag = "2")]
        pub unique: u64,
        #[prost(float, tag = "3")]
        pub avg_num_bytes: f32,
        #[prost(float, tag = "4")]
        pub min_num_bytes: f32,
        #[prost(float, tag = "5")]
        pub max_num_bytes: f32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct StructStatistics {
        #[prost(message, optional, tag = "1")]
        pub common_stats: Option<CommonStatistics>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Histogram {
        #[prost(uint64, tag = "1")]
        pub num_nan: u64,
        #[prost(uint64, tag = "2")]
        pub num_undefined: u64,
        #[prost(message, repeated, tag = "3")]
        pub buckets: Vec<histogram::Bucket>,
        #[prost(enumeration = "histogram::HistogramType", tag = "4")]
        pub r#type: i32,
        #[prost(string, optional, tag = "5")]
        pub name: Option<String>,
    }

    pub mod histogram {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Bucket {
            #[prost(double, tag = "1")]
            pub low_value: f64,
            #[prost(double, tag = "2")]
            pub high_value: f64,
            #[prost(uint64, tag = "3")]
            pub deprecated_count: u64,
            #[prost(double, tag = "4")]
            pub sample_count: f64,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum HistogramType {
            Standard = 0,
            Quantiles = 1,
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct RankHistogram {
        #[prost(message, repeated, tag = "1")]
        pub buckets: Vec<rank_histogram::Bucket>,
        #[prost(string, optional, tag = "2")]
        pub name: Option<String>,
    }

    pub mod rank_histogram {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Bucket {
            #[prost(uint64, tag = "1")]
            pub low_rank: u64,
            #[prost(uint64, tag = "2")]
            pub high_rank: u64,
            #[prost(uint64, tag = "3")]
            pub deprecated_count: u64,
            #[prost(string, tag = "4")]
            pub label: String,
            #[prost(double, tag = "5")]
            pub sample_count: f64,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unknown feature type {0}")]
    UnknownFeatureType(i32),
    #[error("unknown histogram type {0}")]
    UnknownHistogramType(i32),
    #[error("dataset {dataset}: feature #{index} has neither name nor path")]
    MissingFeatureId { dataset: String, index: usize },
    #[error("custom statistic {name} has no value")]
    EmptyCustomStatistic { name: String },
}

pub fn encode(list: &DatasetFeatureStatisticsList) -> Vec<u8> {
    to_proto(list).encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<DatasetFeatureStatisticsList, WireError> {
    let message = proto::DatasetFeatureStatisticsList::decode(bytes)?;
    from_proto(message)
}

pub fn to_json_string(list: &DatasetFeatureStatisticsList) -> Result<String, WireError> {
    Ok(serde_json::to_string_pretty(list)?)
}

pub fn from_json_str(input: &str) -> Result<DatasetFeatureStatisticsList, WireError> {
    Ok(serde_json::from_str(input)?)
}

#[must_use]
pub fn to_proto(list: &DatasetFeatureStatisticsList) -> proto::DatasetFeatureStatisticsList {
    proto::DatasetFeatureStatisticsList {
        datasets: list.datasets.iter().map(dataset_to_proto).collect(),
    }
}

pub fn from_proto(
    message: proto::DatasetFeatureStatisticsList,
) -> Result<DatasetFeatureStatisticsList, WireError> {
    let datasets = message
        .datasets
        .into_iter()
        .map(dataset_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DatasetFeatureStatisticsList { datasets })
}

fn dataset_to_proto(dataset: &DatasetFeatureStatistics) -> proto::DatasetFeatureStatistics {
    proto::DatasetFeatureStatistics {
        name: dataset.name.clone(),
        num_examples: dataset.num_examples,
        features: dataset.features.iter().map(feature_to_proto).collect(),
        weighted_num_examples: dataset.weighted_num_examples,
    }
}

fn dataset_from_proto(
    message: proto::DatasetFeatureStatistics,
) -> Result<DatasetFeatureStatistics, WireError> {
    let features = message
        .features
        .into_iter()
        .enumerate()
        .map(|(index, feature)| {
            feature_from_proto(feature).map_err(|err| match err {
                WireError::MissingFeatureId { .. } => WireError::MissingFeatureId {
                    dataset: message.name.clone(),
                    index,
                },
                other => other,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DatasetFeatureStatistics {
        name: message.name,
        num_examples: message.num_examples,
        weighted_num_examples: message.weighted_num_examples,
        features,
    })
}

fn feature_type_to_proto(feature_type: FeatureType) -> proto::feature_name_statistics::Type {
    use proto::feature_name_statistics::Type;
    match feature_type {
        FeatureType::Int => Type::Int,
        FeatureType::Float => Type::Float,
        FeatureType::String => Type::String,
        FeatureType::Bytes => Type::Bytes,
        FeatureType::Struct => Type::Struct,
    }
}

fn feature_to_proto(feature: &FeatureNameStatistics) -> proto::FeatureNameStatistics {
    use proto::feature_name_statistics::{FieldId, Stats};
    let field_id = match &feature.id {
        FeatureId::Name(name) => FieldId::Name(name.clone()),
        FeatureId::Path(path) => FieldId::Path(proto::Path {
            step: path.steps().to_vec(),
        }),
    };
    let stats = match &feature.stats {
        FeatureStats::Numeric(s) => Stats::NumStats(numeric_to_proto(s)),
        FeatureStats::String(s) => Stats::StringStats(string_to_proto(s)),
        FeatureStats::Bytes(s) => Stats::BytesStats(proto::BytesStatistics {
            common_stats: Some(common_to_proto(&s.common_stats)),
            unique: s.unique,
            avg_num_bytes: s.avg_num_bytes,
            min_num_bytes: s.min_num_bytes,
            max_num_bytes: s.max_num_bytes,
        }),
        FeatureStats::Struct(s) => Stats::StructStats(proto::StructStatistics {
            common_stats: Some(common_to_proto(&s.common_stats)),
        }),
    };
    proto::FeatureNameStatistics {
        field_id: Some(field_id),
        r#type: feature_type_to_proto(feature.feature_type) as i32,
        stats: Some(stats),
        custom_stats: feature.custom_stats.iter().map(custom_to_proto).collect(),
    }
}

fn feature_from_proto(
    message: proto::FeatureNameStatistics,
) -> Result<FeatureNameStatistics, WireError> {
    use proto::feature_name_statistics::{FieldId, Stats};
    let id = match message.field_id {
        Some(FieldId::Name(name)) => FeatureId::Name(name),
        Some(FieldId::Path(path)) => FeatureId::Path(FeaturePath::new(path.step)),
        None => {
            return Err(WireError::MissingFeatureId {
                dataset: String::new(),
                index: 0,
            });
        }
    };
    let feature_type = FeatureType::from_i32(message.r#type)
        .ok_or(WireError::UnknownFeatureType(message.r#type))?;
    let stats = match message.stats {
        Some(Stats::NumStats(s)) => FeatureStats::Numeric(numeric_from_proto(s)?),
        Some(Stats::StringStats(s)) => FeatureStats::String(string_from_proto(s)?),
        Some(Stats::BytesStats(s)) => FeatureStats::Bytes(BytesStatistics {
            common_stats: common_from_proto(s.common_stats)?,
            unique: s.unique,
            avg_num_bytes: s.avg_num_bytes,
            min_num_bytes: s.min_num_bytes,
            max_num_bytes: s.max_num_bytes,
        }),
        Some(Stats::StructStats(s)) => FeatureStats::Struct(StructStatistics {
            common_stats: common_from_proto(s.common_stats)?,
        }),
        None => empty_stats(feature_type),
    };
    let custom_stats = message
        .custom_stats
        .into_iter()
        .map(custom_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FeatureNameStatistics {
        id,
        feature_type,
        stats,
        custom_stats,
    })
}

fn empty_stats(feature_type: FeatureType) -> FeatureStats {
    match feature_type {
        FeatureType::Int | FeatureType::Float => FeatureStats::Numeric(NumericStatistics::default()),
        FeatureType::String => FeatureStats::String(StringStatistics::default()),
        FeatureType::Bytes => FeatureStats::Bytes(BytesStatistics::default()),
        FeatureType::Struct => FeatureStats::Struct(StructStatistics::default()),
    }
}

fn custom_to_proto(stat: &CustomStatistic) -> proto::CustomStatistic {
    use proto::custom_statistic::Val;
    let val = match &stat.value {
        CustomValue::Num(v) => Val::Num(*v),
        CustomValue::Str(v) => Val::Str(v.clone()),
        CustomValue::Histogram(h) => Val::Histogram(histogram_to_proto(h)),
        CustomValue::RankHistogram(h) => Val::RankHistogram(rank_histogram_to_proto(h)),
    };
    proto::CustomStatistic {
        name: stat.name.clone(),
        val: Some(val),
    }
}

fn custom_from_proto(message: proto::CustomStatistic) -> Result<CustomStatistic, WireError> {
    use proto::custom_statistic::Val;
    let value = match message.val {
        Some(Val::Num(v)) => CustomValue::Num(v),
        Some(Val::Str(v)) => CustomValue::Str(v),
        Some(Val::Histogram(h)) => CustomValue::Histogram(histogram_from_proto(h)?),
        Some(Val::RankHistogram(h)) => CustomValue::RankHistogram(rank_histogram_from_proto(h)),
        None => return Err(WireError::EmptyCustomStatistic { name: message.name }),
    };
    Ok(CustomStatistic {
        name: message.name,
        value,
    })
}

fn common_to_proto(common: &CommonStatistics) -> proto::CommonStatistics {
    proto::CommonStatistics {
        num_non_missing: common.num_non_missing,
        num_missing: common.num_missing,
        min_num_values: common.min_num_values,
        max_num_values: common.max_num_values,
        avg_num_values: common.avg_num_values,
        num_values_histogram: common.num_values_histogram.as_ref().map(histogram_to_proto),
        weighted_common_stats: common.weighted_common_stats.as_ref().map(|w| {
            proto::WeightedCommonStatistics {
                num_non_missing: w.num_non_missing,
                num_missing: w.num_missing,
                avg_num_values: w.avg_num_values,
                tot_num_values: w.tot_num_values,
            }
        }),
        tot_num_values: common.tot_num_values,
        feature_list_length_histogram: common
            .feature_list_length_histogram
            .as_ref()
            .map(histogram_to_proto),
    }
}

fn common_from_proto(
    message: Option<proto::CommonStatistics>,
) -> Result<CommonStatistics, WireError> {
    let Some(message) = message else {
        return Ok(CommonStatistics::default());
    };
    Ok(CommonStatistics {
        num_non_missing: message.num_non_missing,
        num_missing: message.num_missing,
        min_num_values: message.min_num_values,
        max_num_values: message.max_num_values,
        avg_num_values: message.avg_num_values,
        tot_num_values: message.tot_num_values,
        num_values_histogram: message
            .num_values_histogram
            .map(histogram_from_proto)
            .transpose()?,
        weighted_common_stats: message.weighted_common_stats.map(|w| WeightedCommonStatistics {
            num_non_missing: w.num_non_missing,
            num_missing: w.num_missing,
            avg_num_values: w.avg_num_values,
            tot_num_values: w.tot_num_values,
        }),
        feature_list_length_histogram: message
            .feature_list_length_histogram
            .map(histogram_from_proto)
            .transpose()?,
    })
}

fn numeric_to_proto(numeric: &NumericStatistics) -> proto::NumericStatistics {
    proto::NumericStatistics {
        common_stats: Some(common_to_proto(&numeric.common_stats)),
        mean: numeric.mean,
        std_dev: numeric.std_dev,
        num_zeros: numeric.num_zeros,
        min: numeric.min,
        median: numeric.median,
        max: numeric.max,
        histograms: numeric.histograms.iter().map(histogram_to_proto).collect(),
        weighted_numeric_stats: numeric.weighted_numeric_stats.as_ref().map(|w| {
            proto::WeightedNumericStatistics {
                mean: w.mean,
                std_dev: w.std_dev,
                median: w.median,
                histograms: w.histograms.iter().map(histogram_to_proto).collect(),
            }
        }),
    }
}

fn numeric_from_proto(message: proto::NumericStatistics) -> Result<NumericStatistics, WireError> {
    let weighted_numeric_stats = match message.weighted_numeric_stats {
        Some(w) => Some(WeightedNumericStatistics {
            mean: w.mean,
            std_dev: w.std_dev,
            median: w.median,
            histograms: histograms_from_proto(w.histograms)?,
        }),
        None => None,
    };
    Ok(NumericStatistics {
        common_stats: common_from_proto(message.common_stats)?,
        mean: message.mean,
        std_dev: message.std_dev,
        num_zeros: message.num_zeros,
        min: message.min,
        median: message.median,
        max: message.max,
        histograms: histograms_from_proto(message.histograms)?,
        weighted_numeric_stats,
    })
}

fn freq_to_proto(freq: &FreqAndValue) -> proto::string_statistics::FreqAndValue {
    proto::string_statistics::FreqAndValue {
        deprecated_freq: 0,
        value: freq.value.clone(),
        frequency: freq.frequency,
    }
}

fn freq_from_proto(message: proto::string_statistics::FreqAndValue) -> FreqAndValue {
    FreqAndValue {
        frequency: current_or_deprecated(message.frequency, message.deprecated_freq),
        value: message.value,
    }
}

fn string_to_proto(strings: &StringStatistics) -> proto::StringStatistics {
    proto::StringStatistics {
        common_stats: Some(common_to_proto(&strings.common_stats)),
        unique: strings.unique,
        top_values: strings.top_values.iter().map(freq_to_proto).collect(),
        avg_length: strings.avg_length,
        rank_histogram: strings.rank_histogram.as_ref().map(rank_histogram_to_proto),
        weighted_string_stats: strings.weighted_string_stats.as_ref().map(|w| {
            proto::WeightedStringStatistics {
                top_values: w.top_values.iter().map(freq_to_proto).collect(),
                rank_histogram: w.rank_histogram.as_ref().map(rank_histogram_to_proto),
            }
        }),
    }
}

fn string_from_proto(message: proto::StringStatistics) -> Result<StringStatistics, WireError> {
    Ok(StringStatistics {
        common_stats: common_from_proto(message.common_stats)?,
        unique: message.unique,
        top_values: message.top_values.into_iter().map(freq_from_proto).collect(),
        avg_length: message.avg_length,
        rank_histogram: message.rank_histogram.map(rank_histogram_from_proto),
        weighted_string_stats: message.weighted_string_stats.map(|w| WeightedStringStatistics {
            top_values: w.top_values.into_iter().map(freq_from_proto).collect(),
            rank_histogram: w.rank_histogram.map(rank_histogram_from_proto),
        }),
    })
}

fn histogram_to_proto(histogram: &Histogram) -> proto::Histogram {
    let histogram_type = match histogram.histogram_type {
        HistogramType::Standard => proto::histogram::HistogramType::Standard,
        HistogramType::Quantiles => proto::histogram::HistogramType::Quantiles,
    };
    proto::Histogram {
        num_nan: histogram.num_nan,
        num_undefined: histogram.num_undefined,
        buckets: histogram
            .buckets
            .iter()
            .map(|b| proto::histogram::Bucket {
                low_value: b.low_value,
                high_value: b.high_value,
                deprecated_count: 0,
                sample_count: b.sample_count,
            })
            .collect(),
        r#type: histogram_type as i32,
        name: histogram.name.clone(),
    }
}

fn histogram_from_proto(message: proto::Histogram) -> Result<Histogram, WireError> {
    let histogram_type = HistogramType::from_i32(message.r#type)
        .ok_or(WireError::UnknownHistogramType(message.r#type))?;
    Ok(Histogram {
        num_nan: message.num_nan,
        num_undefined: message.num_undefined,
        buckets: message
            .buckets
            .into_iter()
            .map(|b| HistogramBucket {
                low_value: b.low_value,
                high_value: b.high_value,
                sample_count: current_or_deprecated(b.sample_count, b.deprecated_count),
            })
            .collect(),
        histogram_type,
        name: message.name,
    })
}

fn histograms_from_proto(messages: Vec<proto::Histogram>) -> Result<Vec<Histogram>, WireError> {
    messages.into_iter().map(histogram_from_proto).collect()
}

fn rank_histogram_to_proto(histogram: &RankHistogram) -> proto::RankHistogram {
    proto::RankHistogram {
        buckets: histogram
            .buckets
            .iter()
            .map(|b| proto::rank_histogram::Bucket {
                low_rank: b.low_rank,
                high_rank: b.high_rank,
                deprecated_count: 0,
                label: b.label.clone(),
                sample_count: b.sample_count,
            })
            .collect(),
        name: histogram.name.clone(),
    }
}

fn rank_histogram_from_proto(message: proto::RankHistogram) -> RankHistogram {
    RankHistogram {
        buckets: message
            .buckets
            .into_iter()
            .map(|b| RankHistogramBucket {
                low_rank: b.low_rank,
                high_rank: b.high_rank,
                sample_count: current_or_deprecated(b.sample_count, b.deprecated_count),
                label: b.label,
            })
            .collect(),
        name: message.name,
    }
}

fn current_or_deprecated(current: f64, deprecated: u64) -> f64 {
    if current != 0.0 {
        current
    } else {
        deprecated as f64
    }
}

#[cfg(test)]
mod tests {
    use fst_schema::{
        CommonStatistics, CustomStatistic, CustomValue, DatasetFeatureStatistics,
        DatasetFeatureStatisticsList, FeatureId, FeatureNameStatistics, FeatureStats,
        FreqAndValue, Histogram, HistogramBucket, HistogramType, NumericStatistics,
        RankHistogram, RankHistogramBucket, StringStatistics,
    };
    use fst_types::{FeaturePath, FeatureType};
    use prost::Message;

    use super::{WireError, decode, encode, from_json_str, proto, to_json_string, to_proto};

    fn sample() -> DatasetFeatureStatisticsList {
        let histogram = Histogram {
            num_nan: 1,
            num_undefined: 0,
            buckets: vec![
                HistogramBucket {
                    low_value: 10.0,
                    high_value: 15.0,
                    sample_count: 1.0,
                },
                HistogramBucket {
                    low_value: 15.0,
                    high_value: 20.0,
                    sample_count: 1.0,
                },
            ],
            histogram_type: HistogramType::Quantiles,
            name: None,
        };
        let common = CommonStatistics {
            num_non_missing: 2,
            num_missing: 1,
            min_num_values: 1,
            max_num_values: 1,
            avg_num_values: 1.0,
            tot_num_values: 2,
            ..CommonStatistics::default()
        };
        let age = FeatureNameStatistics {
            id: FeatureId::Name("age".to_owned()),
            feature_type: FeatureType::Float,
            stats: FeatureStats::Numeric(NumericStatistics {
                common_stats: common.clone(),
                mean: 15.0,
                std_dev: 5.0,
                min: 10.0,
                median: 15.0,
                max: 20.0,
                histograms: vec![histogram.clone()],
                ..NumericStatistics::default()
            }),
            custom_stats: vec![CustomStatistic::num("num_type_conflicts", 1.0)],
        };
        let color = FeatureNameStatistics {
            id: FeatureId::Path(FeaturePath::new(["user", "color"])),
            feature_type: FeatureType::String,
            stats: FeatureStats::String(StringStatistics {
                common_stats: common,
                unique: 2,
                top_values: vec![FreqAndValue {
                    value: "red".to_owned(),
                    frequency: 2.0,
                }],
                avg_length: 3.5,
                rank_histogram: Some(RankHistogram {
                    buckets: vec![RankHistogramBucket {
                        low_rank: 1,
                        high_rank: 2,
                        label: "red".to_owned(),
                        sample_count: 2.0,
                    }],
                    name: Some("ranks".to_owned()),
                }),
                weighted_string_stats: None,
            }),
            custom_stats: vec![CustomStatistic {
                name: "lengths".to_owned(),
                value: CustomValue::Histogram(histogram),
            }],
        };
        DatasetFeatureStatisticsList {
            datasets: vec![DatasetFeatureStatistics {
                name: "train".to_owned(),
                num_examples: 3,
                weighted_num_examples: 3.0,
                features: vec![age, color],
            }],
        }
    }

    #[test]
    fn protobuf_round_trip_preserves_tree() {
        let list = sample();
        let decoded = decode(&encode(&list)).expect("decode");
        assert_eq!(decoded, list);
    }

    #[test]
    fn json_round_trip_preserves_tree() {
        let list = sample();
        let json = to_json_string(&list).expect("json");
        assert_eq!(from_json_str(&json).expect("parse"), list);
    }

    #[test]
    fn deprecated_counts_are_never_written() {
        let message = to_proto(&sample());
        let feature = &message.datasets[0].features[1];
        let Some(proto::feature_name_statistics::Stats::StringStats(strings)) = &feature.stats
        else {
            panic!("expected string stats");
        };
        assert!(strings.top_values.iter().all(|f| f.deprecated_freq == 0));
        let rank = strings.rank_histogram.as_ref().expect("rank histogram");
        assert!(rank.buckets.iter().all(|b| b.deprecated_count == 0));
    }

    #[test]
    fn empty_histogram_names_survive_round_trips() {
        let mut list = sample();
        let FeatureStats::String(strings) = &mut list.datasets[0].features[1].stats else {
            panic!("expected string stats");
        };
        if let Some(rank) = strings.rank_histogram.as_mut() {
            rank.name = Some(String::new());
        }
        let FeatureStats::Numeric(numeric) = &mut list.datasets[0].features[0].stats else {
            panic!("expected numeric stats");
        };
        numeric.histograms[0].name = Some(String::new());

        let decoded = decode(&encode(&list)).expect("decode");
        assert_eq!(decoded, list);
        let FeatureStats::Numeric(numeric) = &decoded.datasets[0].features[0].stats else {
            panic!("expected numeric stats");
        };
        assert_eq!(numeric.histograms[0].name.as_deref(), Some(""));

        let unnamed = decode(&encode(&sample())).expect("decode");
        let FeatureStats::Numeric(numeric) = &unnamed.datasets[0].features[0].stats else {
            panic!("expected numeric stats");
        };
        assert_eq!(numeric.histograms[0].name, None);
    }

    #[test]
    fn deprecated_counts_fill_in_when_current_is_zero() {
        let bucket = proto::histogram::Bucket {
            low_value: 0.0,
            high_value: 1.0,
            deprecated_count: 7,
            sample_count: 0.0,
        };
        let newer = proto::histogram::Bucket {
            deprecated_count: 7,
            sample_count: 2.5,
            ..bucket.clone()
        };
        let histogram = proto::Histogram {
            buckets: vec![bucket, newer],
            ..proto::Histogram::default()
        };
        let feature = proto::FeatureNameStatistics {
            field_id: Some(proto::feature_name_statistics::FieldId::Name("x".to_owned())),
            r#type: proto::feature_name_statistics::Type::Int as i32,
            stats: Some(proto::feature_name_statistics::Stats::NumStats(
                proto::NumericStatistics {
                    histograms: vec![histogram],
                    ..proto::NumericStatistics::default()
                },
            )),
            custom_stats: vec![],
        };
        let list = proto::DatasetFeatureStatisticsList {
            datasets: vec![proto::DatasetFeatureStatistics {
                name: "d".to_owned(),
                features: vec![feature],
                ..proto::DatasetFeatureStatistics::default()
            }],
        };
        let decoded = decode(&list.encode_to_vec()).expect("decode");
        let numeric = decoded.datasets[0].features[0].numeric().expect("numeric");
        let counts: Vec<f64> = numeric.histograms[0]
            .buckets
            .iter()
            .map(|b| b.sample_count)
            .collect();
        assert_eq!(counts, vec![7.0, 2.5]);
    }

    #[test]
    fn field_numbers_match_the_published_schema() {
        let freq = proto::string_statistics::FreqAndValue {
            deprecated_freq: 0,
            value: "a".to_owned(),
            frequency: 1.0,
        };
        // tag 2, wire type 2 (length-delimited) then tag 3, wire type 1 (64-bit)
        let bytes = freq.encode_to_vec();
        assert_eq!(bytes[0], (2 << 3) | 2);
        assert_eq!(bytes[3], (3 << 3) | 1);

        let feature = proto::FeatureNameStatistics {
            field_id: Some(proto::feature_name_statistics::FieldId::Path(proto::Path {
                step: vec!["a".to_owned()],
            })),
            r#type: 0,
            stats: Some(proto::feature_name_statistics::Stats::StructStats(
                proto::StructStatistics::default(),
            )),
            custom_stats: vec![],
        };
        let bytes = feature.encode_to_vec();
        assert_eq!(bytes[0], (8 << 3) | 2);
        assert!(bytes.contains(&((7 << 3) | 2)));

        let stats = proto::DatasetFeatureStatistics {
            weighted_num_examples: 1.0,
            ..proto::DatasetFeatureStatistics::default()
        };
        assert_eq!(stats.encode_to_vec()[0], (4 << 3) | 1);
    }

    #[test]
    fn unknown_enums_are_rejected() {
        let list = proto::DatasetFeatureStatisticsList {
            datasets: vec![proto::DatasetFeatureStatistics {
                name: "d".to_owned(),
                features: vec![proto::FeatureNameStatistics {
                    field_id: Some(proto::feature_name_statistics::FieldId::Name("x".to_owned())),
                    r#type: 42,
                    stats: None,
                    custom_stats: vec![],
                }],
                ..proto::DatasetFeatureStatistics::default()
            }],
        };
        assert!(matches!(
            decode(&list.encode_to_vec()),
            Err(WireError::UnknownFeatureType(42))
        ));
    }

    #[test]
    fn features_without_identity_are_rejected() {
        let list = proto::DatasetFeatureStatisticsList {
            datasets: vec![proto::DatasetFeatureStatistics {
                name: "d".to_owned(),
                features: vec![
                    proto::FeatureNameStatistics {
                        field_id: Some(proto::feature_name_statistics::FieldId::Name(
                            "ok".to_owned(),
                        )),
                        ..proto::FeatureNameStatistics::default()
                    },
                    proto::FeatureNameStatistics::default(),
                ],
                ..proto::DatasetFeatureStatistics::default()
            }],
        };
        let err = decode(&list.encode_to_vec()).expect_err("missing id");
        assert!(matches!(
            err,
            WireError::MissingFeatureId { ref dataset, index: 1 } if dataset == "d"
        ));
    }

    #[test]
    fn missing_payload_decodes_to_empty_stats_of_the_type() {
        let feature = proto::FeatureNameStatistics {
            field_id: Some(proto::feature_name_statistics::FieldId::Name("s".to_owned())),
            r#type: proto::feature_name_statistics::Type::String as i32,
            ..proto::FeatureNameStatistics::default()
        };
        let decoded = super::feature_from_proto(feature).expect("decode");
        assert_eq!(decoded.string().expect("string").unique, 0);
    }
}
