#![forbid(unsafe_code)]

//! Fixture harness: replays recorded examples through the aggregator and
//! checks the finalized statistics against expected values.

use std::{
    fs,
    path::{Path, PathBuf},
};

use fst_aggregate::{AggregateError, BatchResult, DatasetStatus, StatsAggregator};
use fst_runtime::StatsOptions;
use fst_schema::{
    DatasetFeatureStatistics, FeatureNameStatistics, FreqAndValue, HistogramBucket, HistogramType,
};
use fst_types::{Example, FeaturePath, FeatureType};
use fst_wire::WireError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub repo_root: PathBuf,
    pub fixture_root: PathBuf,
    /// Also require every case to survive a protobuf round trip unchanged.
    pub check_wire: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            repo_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../.."),
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            check_wire: true,
        }
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.repo_root.join("artifacts/conformance/report.json")
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredFeature {
    pub path: FeaturePath,
    pub feature_type: FeatureType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureExample {
    pub dataset: String,
    pub example: Example,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    Mean,
    StdDev,
    Min,
    Max,
    Median,
    NumZeros,
    WeightedMean,
    WeightedStdDev,
    WeightedMedian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Expectation {
    NumExamples {
        dataset: String,
        value: u64,
    },
    Status {
        dataset: String,
        status: DatasetStatus,
    },
    FeatureOrder {
        dataset: String,
        features: Vec<FeaturePath>,
    },
    FeatureType {
        dataset: String,
        feature: FeaturePath,
        feature_type: FeatureType,
    },
    Common {
        dataset: String,
        feature: FeaturePath,
        #[serde(default)]
        num_non_missing: Option<u64>,
        #[serde(default)]
        num_missing: Option<u64>,
        #[serde(default)]
        tot_num_values: Option<u64>,
    },
    Numeric {
        dataset: String,
        feature: FeaturePath,
        field: NumericField,
        value: f64,
    },
    TopValues {
        dataset: String,
        feature: FeaturePath,
        values: Vec<FreqAndValue>,
    },
    Unique {
        dataset: String,
        feature: FeaturePath,
        value: u64,
    },
    Histogram {
        dataset: String,
        feature: FeaturePath,
        histogram_type: HistogramType,
        buckets: Vec<HistogramBucket>,
    },
    CustomStat {
        dataset: String,
        feature: FeaturePath,
        name: String,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub case_id: String,
    #[serde(default)]
    pub options: StatsOptions,
    #[serde(default)]
    pub declared: Vec<DeclaredFeature>,
    pub examples: Vec<FixtureExample>,
    pub expected: Vec<Expectation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub status: CaseStatus,
    pub mismatches: Vec<String>,
    pub issue_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

pub fn aggregate_fixture(fixture: &Fixture) -> Result<BatchResult, HarnessError> {
    let mut aggregator = StatsAggregator::new(fixture.options.clone())?;
    for declared in &fixture.declared {
        aggregator.declare_feature(declared.path.clone(), declared.feature_type);
    }
    for item in &fixture.examples {
        aggregator.add_example(&item.dataset, &item.example);
    }
    Ok(aggregator.finalize())
}

pub fn run_fixture(config: &HarnessConfig, fixture: &Fixture) -> Result<CaseResult, HarnessError> {
    let result = aggregate_fixture(fixture)?;
    let mut mismatches = Vec::new();

    for expectation in &fixture.expected {
        if let Err(mismatch) = check(&result, expectation) {
            mismatches.push(mismatch);
        }
    }
    for dataset in &result.statistics.datasets {
        if let Err(err) = dataset.validate() {
            mismatches.push(format!("dataset {}: {err}", dataset.name));
        }
    }
    if config.check_wire {
        let decoded = fst_wire::decode(&fst_wire::encode(&result.statistics))?;
        if decoded != result.statistics {
            mismatches.push("protobuf round trip changed the statistics".to_owned());
        }
    }

    let status = if mismatches.is_empty() {
        CaseStatus::Pass
    } else {
        CaseStatus::Fail
    };
    tracing::debug!(case_id = %fixture.case_id, ?status, "fixture checked");
    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        status,
        mismatches,
        issue_count: result.ledger.records().len(),
    })
}

pub fn run_suite(config: &HarnessConfig, case_filter: Option<&str>) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, case_filter)?;
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in &fixtures {
        results.push(run_fixture(config, fixture)?);
    }
    let failed = results
        .iter()
        .filter(|result| result.status == CaseStatus::Fail)
        .count();
    Ok(SuiteReport {
        fixture_count: results.len(),
        passed: results.len() - failed,
        failed,
        results,
    })
}

pub fn load_fixtures(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<Fixture>, HarnessError> {
    let mut fixtures = Vec::new();
    for path in list_fixture_files(&config.fixture_root)? {
        let fixture = load_fixture(&path)?;
        if case_filter.is_none_or(|case_id| fixture.case_id == case_id) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

pub fn load_fixture(path: &Path) -> Result<Fixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    let fixture: Fixture = serde_json::from_str(&body)?;
    if fixture.examples.is_empty() {
        return Err(HarnessError::FixtureFormat(format!(
            "{}: fixture has no examples",
            path.display()
        )));
    }
    Ok(fixture)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn write_report(path: &Path, report: &SuiteReport) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

fn dataset<'a>(result: &'a BatchResult, name: &str) -> Result<&'a DatasetFeatureStatistics, String> {
    result
        .statistics
        .dataset(name)
        .ok_or_else(|| format!("dataset {name} not found"))
}

fn feature<'a>(
    result: &'a BatchResult,
    dataset_name: &str,
    path: &FeaturePath,
) -> Result<&'a FeatureNameStatistics, String> {
    dataset(result, dataset_name)?
        .feature(path)
        .ok_or_else(|| format!("{dataset_name}/{path}: feature not found"))
}

fn close(actual: f64, expected: f64) -> bool {
    approx::relative_eq!(
        actual,
        expected,
        epsilon = DEFAULT_TOLERANCE,
        max_relative = DEFAULT_TOLERANCE
    )
}

fn expect_eq<T: PartialEq + std::fmt::Debug>(what: &str, actual: T, expected: T) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{what}: expected {expected:?}, got {actual:?}"))
    }
}

fn expect_close(what: &str, actual: f64, expected: f64) -> Result<(), String> {
    if close(actual, expected) {
        Ok(())
    } else {
        Err(format!("{what}: expected {expected}, got {actual}"))
    }
}

fn check(result: &BatchResult, expectation: &Expectation) -> Result<(), String> {
    match expectation {
        Expectation::NumExamples { dataset: name, value } => {
            expect_eq(&format!("{name}.num_examples"), dataset(result, name)?.num_examples, *value)
        }
        Expectation::Status { dataset: name, status } => {
            let outcome = result
                .outcomes
                .iter()
                .find(|outcome| outcome.name == *name)
                .ok_or_else(|| format!("dataset {name} has no outcome"))?;
            expect_eq(&format!("{name}.status"), outcome.status, *status)
        }
        Expectation::FeatureOrder { dataset: name, features } => {
            let actual: Vec<FeaturePath> = dataset(result, name)?
                .features
                .iter()
                .map(|f| f.id.path())
                .collect();
            expect_eq(&format!("{name}.features"), &actual, features)
        }
        Expectation::FeatureType {
            dataset: name,
            feature: path,
            feature_type,
        } => expect_eq(
            &format!("{name}/{path}.type"),
            feature(result, name, path)?.feature_type,
            *feature_type,
        ),
        Expectation::Common {
            dataset: name,
            feature: path,
            num_non_missing,
            num_missing,
            tot_num_values,
        } => {
            let common = feature(result, name, path)?.common();
            let fields = [
                ("num_non_missing", common.num_non_missing, num_non_missing),
                ("num_missing", common.num_missing, num_missing),
                ("tot_num_values", common.tot_num_values, tot_num_values),
            ];
            for (field, actual, expected) in fields {
                if let Some(expected) = expected {
                    expect_eq(&format!("{name}/{path}.{field}"), actual, *expected)?;
                }
            }
            Ok(())
        }
        Expectation::Numeric {
            dataset: name,
            feature: path,
            field,
            value,
        } => {
            let numeric = feature(result, name, path)?
                .numeric()
                .ok_or_else(|| format!("{name}/{path}: not numeric"))?;
            let weighted = || {
                numeric
                    .weighted_numeric_stats
                    .as_ref()
                    .ok_or_else(|| format!("{name}/{path}: no weighted stats"))
            };
            let actual = match field {
                NumericField::Mean => numeric.mean,
                NumericField::StdDev => numeric.std_dev,
                NumericField::Min => numeric.min,
                NumericField::Max => numeric.max,
                NumericField::Median => numeric.median,
                NumericField::NumZeros => numeric.num_zeros as f64,
                NumericField::WeightedMean => weighted()?.mean,
                NumericField::WeightedStdDev => weighted()?.std_dev,
                NumericField::WeightedMedian => weighted()?.median,
            };
            expect_close(&format!("{name}/{path}.{field:?}"), actual, *value)
        }
        Expectation::TopValues {
            dataset: name,
            feature: path,
            values,
        } => {
            let strings = feature(result, name, path)?
                .string()
                .ok_or_else(|| format!("{name}/{path}: not a string feature"))?;
            expect_eq(&format!("{name}/{path}.top_values"), &strings.top_values, values)
        }
        Expectation::Unique {
            dataset: name,
            feature: path,
            value,
        } => {
            let stats = feature(result, name, path)?;
            let unique = stats
                .string()
                .map(|s| s.unique)
                .or_else(|| stats.bytes().map(|b| b.unique))
                .ok_or_else(|| format!("{name}/{path}: no unique count"))?;
            expect_eq(&format!("{name}/{path}.unique"), unique, *value)
        }
        Expectation::Histogram {
            dataset: name,
            feature: path,
            histogram_type,
            buckets,
        } => {
            let numeric = feature(result, name, path)?
                .numeric()
                .ok_or_else(|| format!("{name}/{path}: not numeric"))?;
            let histogram = numeric
                .histogram(*histogram_type)
                .ok_or_else(|| format!("{name}/{path}: no {histogram_type:?} histogram"))?;
            expect_eq(
                &format!("{name}/{path}.{histogram_type:?}.buckets"),
                histogram.buckets.len(),
                buckets.len(),
            )?;
            for (idx, (actual, expected)) in histogram.buckets.iter().zip(buckets).enumerate() {
                let what = format!("{name}/{path}.{histogram_type:?}[{idx}]");
                expect_close(&format!("{what}.low"), actual.low_value, expected.low_value)?;
                expect_close(&format!("{what}.high"), actual.high_value, expected.high_value)?;
                expect_close(&format!("{what}.count"), actual.sample_count, expected.sample_count)?;
            }
            Ok(())
        }
        Expectation::CustomStat {
            dataset: name,
            feature: path,
            name: stat,
            value,
        } => match feature(result, name, path)?.custom_stat(stat) {
            Some(fst_schema::CustomValue::Num(actual)) => {
                expect_close(&format!("{name}/{path}.{stat}"), *actual, *value)
            }
            other => Err(format!("{name}/{path}.{stat}: expected number {value}, got {other:?}")),
        },
    }
}
