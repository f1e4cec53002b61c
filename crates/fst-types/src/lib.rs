#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Statistics type of a feature. Discriminants match the wire enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Int = 0,
    Float = 1,
    String = 2,
    Bytes = 3,
    Struct = 4,
}

impl FeatureType {
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Int),
            1 => Some(Self::Float),
            2 => Some(Self::String),
            3 => Some(Self::Bytes),
            4 => Some(Self::Struct),
            _ => None,
        }
    }

    /// Coarse family used for majority classification: INT and FLOAT vote together.
    #[must_use]
    pub fn family(self) -> TypeFamily {
        match self {
            Self::Int | Self::Float => TypeFamily::Numeric,
            Self::String => TypeFamily::String,
            Self::Bytes => TypeFamily::Bytes,
            Self::Struct => TypeFamily::Struct,
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "INT",
            Self::Float => "FLOAT",
            Self::String => "STRING",
            Self::Bytes => "BYTES",
            Self::Struct => "STRUCT",
        };
        f.write_str(name)
    }
}

/// Ordering of the variants is the tie-break order for majority votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeFamily {
    Numeric,
    String,
    Bytes,
    Struct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Str,
    Bytes,
    Struct,
}

impl ValueKind {
    #[must_use]
    pub fn feature_type(self) -> FeatureType {
        match self {
            Self::Int => FeatureType::Int,
            Self::Float => FeatureType::Float,
            Self::Str => FeatureType::String,
            Self::Bytes => FeatureType::Bytes,
            Self::Struct => FeatureType::Struct,
        }
    }

    #[must_use]
    pub fn family(self) -> TypeFamily {
        self.feature_type().family()
    }
}

/// Values supplied for one feature of one example. An empty list is present
/// (non-missing) and contributes zero values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum ValueList {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
    Bytes(Vec<Vec<u8>>),
    /// Opaque struct elements; only their number is observed.
    Struct(u64),
}

impl ValueList {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Struct(_) => ValueKind::Struct,
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Int(v) => v.len() as u64,
            Self::Float(v) => v.len() as u64,
            Self::Str(v) => v.len() as u64,
            Self::Bytes(v) => v.len() as u64,
            Self::Struct(n) => *n,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First value as a float, used to read per-example weights.
    pub fn first_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int(v) => v.first().map(|x| *x as f64).ok_or(TypeError::EmptyValueList),
            Self::Float(v) => v.first().copied().ok_or(TypeError::EmptyValueList),
            other => Err(TypeError::NonNumericValue { kind: other.kind() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "input", content = "data", rename_all = "snake_case")]
pub enum FeatureInput {
    Values(ValueList),
    /// List of lists. The per-example value count is the total over the inner
    /// lists; the number of inner lists is the feature-list length.
    Sequence(Vec<ValueList>),
    Missing,
}

impl FeatureInput {
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    #[must_use]
    pub fn lists(&self) -> &[ValueList] {
        match self {
            Self::Values(list) => std::slice::from_ref(list),
            Self::Sequence(lists) => lists,
            Self::Missing => &[],
        }
    }

    #[must_use]
    pub fn num_values(&self) -> u64 {
        self.lists().iter().map(ValueList::len).sum()
    }

    #[must_use]
    pub fn list_length(&self) -> Option<u64> {
        match self {
            Self::Sequence(lists) => Some(lists.len() as u64),
            _ => None,
        }
    }

    pub fn first_f64(&self) -> Result<f64, TypeError> {
        self.lists()
            .first()
            .ok_or(TypeError::EmptyValueList)
            .and_then(ValueList::first_f64)
    }
}

impl From<ValueList> for FeatureInput {
    fn from(list: ValueList) -> Self {
        Self::Values(list)
    }
}

/// Structured feature identity. A flat name is a single-step path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeaturePath {
    steps: Vec<String>,
}

impl FeaturePath {
    #[must_use]
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            steps: vec![name.into()],
        }
    }

    #[must_use]
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.steps.len() == 1
    }

    #[must_use]
    pub fn child(&self, step: impl Into<String>) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step.into());
        Self { steps }
    }
}

impl fmt::Display for FeaturePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.steps.join("."))
    }
}

impl From<&str> for FeaturePath {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl From<String> for FeaturePath {
    fn from(name: String) -> Self {
        Self::from_name(name)
    }
}

/// One record of a dataset. Paths are unique: pushing an existing path
/// replaces its input, and deserialized duplicates resolve the same way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ExampleRecord")]
pub struct Example {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    features: Vec<(FeaturePath, FeatureInput)>,
}

/// Serialized shape of an [`Example`], before duplicate paths are collapsed.
#[derive(Deserialize)]
struct ExampleRecord {
    #[serde(default)]
    weight: Option<f64>,
    features: Vec<(FeaturePath, FeatureInput)>,
}

impl From<ExampleRecord> for Example {
    fn from(record: ExampleRecord) -> Self {
        let mut example = Self {
            weight: record.weight,
            features: Vec::with_capacity(record.features.len()),
        };
        for (path, input) in record.features {
            example.push(path, input);
        }
        example
    }
}

impl Example {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    #[must_use]
    pub fn with_feature(mut self, path: impl Into<FeaturePath>, input: impl Into<FeatureInput>) -> Self {
        self.push(path, input);
        self
    }

    pub fn push(&mut self, path: impl Into<FeaturePath>, input: impl Into<FeatureInput>) {
        let path = path.into();
        let input = input.into();
        if let Some(slot) = self.features.iter_mut().find(|(p, _)| *p == path) {
            slot.1 = input;
        } else {
            self.features.push((path, input));
        }
    }

    #[must_use]
    pub fn get(&self, path: &FeaturePath) -> Option<&FeatureInput> {
        self.features
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, input)| input)
    }

    #[must_use]
    pub fn features(&self) -> &[(FeaturePath, FeatureInput)] {
        &self.features
    }
}

/// Float with a total order, usable as a map key. `-0.0` collapses to `0.0`
/// and every NaN to one canonical NaN.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedF64(f64);

impl OrderedF64 {
    #[must_use]
    pub fn new(value: f64) -> Self {
        if value == 0.0 {
            Self(0.0)
        } else if value.is_nan() {
            Self(f64::NAN)
        } else {
            Self(value)
        }
    }

    #[must_use]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl From<f64> for OrderedF64 {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for OrderedF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("feature types {left} and {right} have no compatible common type")]
    IncompatibleTypes { left: FeatureType, right: FeatureType },
    #[error("value list of kind {kind:?} is not numeric")]
    NonNumericValue { kind: ValueKind },
    #[error("value list is empty")]
    EmptyValueList,
    #[error("weight {value} is not a finite non-negative number")]
    InvalidWeight { value: f64 },
}

/// Common type of two observed feature types. INT widens to FLOAT; any other
/// mix is incompatible.
pub fn common_feature_type(left: FeatureType, right: FeatureType) -> Result<FeatureType, TypeError> {
    use FeatureType::{Float, Int};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Int, Float) | (Float, Int) => Float,
        _ => return Err(TypeError::IncompatibleTypes { left, right }),
    };
    Ok(out)
}

pub fn validate_weight(value: f64) -> Result<f64, TypeError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(TypeError::InvalidWeight { value })
    }
}

/// Values that take part in moments, min/max and histograms. NaN and the
/// infinities are counted as `num_nan` instead.
#[must_use]
pub fn is_countable(value: f64) -> bool {
    value.is_finite()
}

#[cfg(test)]
mod tests {
    use super::{
        Example, FeatureInput, FeaturePath, FeatureType, OrderedF64, TypeError, TypeFamily,
        ValueKind, ValueList, common_feature_type, validate_weight,
    };

    #[test]
    fn int_and_float_widen_to_float() {
        assert_eq!(
            common_feature_type(FeatureType::Int, FeatureType::Float).expect("widen"),
            FeatureType::Float
        );
        assert_eq!(
            common_feature_type(FeatureType::Bytes, FeatureType::Bytes).expect("same"),
            FeatureType::Bytes
        );
    }

    #[test]
    fn string_and_int_are_incompatible() {
        let err = common_feature_type(FeatureType::String, FeatureType::Int).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "feature types STRING and INT have no compatible common type"
        );
    }

    #[test]
    fn numeric_kinds_share_a_family() {
        assert_eq!(ValueKind::Int.family(), TypeFamily::Numeric);
        assert_eq!(ValueKind::Float.family(), TypeFamily::Numeric);
        assert_eq!(ValueKind::Str.family(), TypeFamily::String);
        assert!(TypeFamily::Numeric < TypeFamily::Struct);
    }

    #[test]
    fn feature_type_round_trips_wire_discriminant() {
        for ty in [
            FeatureType::Int,
            FeatureType::Float,
            FeatureType::String,
            FeatureType::Bytes,
            FeatureType::Struct,
        ] {
            assert_eq!(FeatureType::from_i32(ty as i32), Some(ty));
        }
        assert_eq!(FeatureType::from_i32(9), None);
    }

    #[test]
    fn sequence_counts_values_across_inner_lists() {
        let input = FeatureInput::Sequence(vec![
            ValueList::Int(vec![1, 2]),
            ValueList::Int(vec![]),
            ValueList::Int(vec![3]),
        ]);
        assert_eq!(input.num_values(), 3);
        assert_eq!(input.list_length(), Some(3));
        assert_eq!(FeatureInput::Values(ValueList::Struct(4)).num_values(), 4);
        assert_eq!(FeatureInput::Missing.num_values(), 0);
    }

    #[test]
    fn first_f64_reads_numeric_weights() {
        let input = FeatureInput::Values(ValueList::Float(vec![2.5, 9.0]));
        assert_eq!(input.first_f64().expect("weight"), 2.5);
        let err = FeatureInput::Values(ValueList::Str(vec!["x".into()]))
            .first_f64()
            .expect_err("not numeric");
        assert_eq!(err, TypeError::NonNumericValue { kind: ValueKind::Str });
        assert_eq!(
            FeatureInput::Missing.first_f64().expect_err("missing"),
            TypeError::EmptyValueList
        );
    }

    #[test]
    fn flat_name_equals_single_step_path() {
        assert_eq!(FeaturePath::from("age"), FeaturePath::new(["age"]));
        let nested = FeaturePath::from("user").child("age");
        assert_eq!(nested.steps(), &["user".to_owned(), "age".to_owned()]);
        assert_eq!(nested.to_string(), "user.age");
        assert!(!nested.is_flat());
    }

    #[test]
    fn pushing_same_path_replaces_input() {
        let example = Example::new()
            .with_feature("a", ValueList::Int(vec![1]))
            .with_feature("a", ValueList::Int(vec![2]));
        assert_eq!(example.features().len(), 1);
        assert_eq!(
            example.get(&FeaturePath::from("a")),
            Some(&FeatureInput::Values(ValueList::Int(vec![2])))
        );
    }

    #[test]
    fn deserialized_duplicate_paths_keep_the_last_input() {
        let json = r#"{
            "weight": 2.0,
            "features": [
                [["a"], {"input": "values", "data": {"kind": "int", "values": [1]}}],
                [["b"], {"input": "missing"}],
                [["a"], {"input": "values", "data": {"kind": "int", "values": [2]}}]
            ]
        }"#;
        let example: Example = serde_json::from_str(json).expect("parse");
        assert_eq!(example.weight, Some(2.0));
        assert_eq!(example.features().len(), 2);
        assert_eq!(example.features()[0].0, FeaturePath::from("a"));
        assert_eq!(
            example.get(&FeaturePath::from("a")),
            Some(&FeatureInput::Values(ValueList::Int(vec![2])))
        );

        let reparsed: Example =
            serde_json::from_str(&serde_json::to_string(&example).expect("json")).expect("parse");
        assert_eq!(reparsed, example);
    }

    #[test]
    fn ordered_f64_collapses_signed_zero() {
        assert_eq!(OrderedF64::new(-0.0), OrderedF64::new(0.0));
        assert!(OrderedF64::new(-1.0) < OrderedF64::new(0.0));
        assert!(OrderedF64::new(f64::INFINITY) < OrderedF64::new(f64::NAN));
    }

    #[test]
    fn weights_must_be_finite_and_non_negative() {
        assert_eq!(validate_weight(0.0).expect("zero ok"), 0.0);
        assert!(validate_weight(-1.0).is_err());
        assert!(validate_weight(f64::NAN).is_err());
        assert!(validate_weight(f64::INFINITY).is_err());
    }
}
