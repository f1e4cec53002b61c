#![forbid(unsafe_code)]

//! Histogram and rank-histogram builders over canonical weighted multisets.
//!
//! A [`Tally`] keeps one integer count and one exact weight sum per key, so
//! its state depends only on the multiset it was fed. Floating sums across
//! keys are evaluated at finalization by walking the tally in key order. A
//! builder's output therefore never depends on insertion or merge order.
//! The one exception is a compacted [`HistogramBuilder`], whose moments come
//! from a streaming accumulator.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use fst_schema::{
    FreqAndValue, Histogram, HistogramBucket, HistogramType, RankHistogram, RankHistogramBucket,
};
use fst_types::OrderedF64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Weighting {
    /// Every observation counts as 1.
    Unweighted,
    /// Every observation counts as its example weight.
    Weighted,
}

/// Unweighted count and weighted mass of a group of observations.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mass {
    pub count: u64,
    pub weight: f64,
}

impl Mass {
    #[must_use]
    pub fn get(self, weighting: Weighting) -> f64 {
        match weighting {
            Weighting::Unweighted => self.count as f64,
            Weighting::Weighted => self.weight,
        }
    }
}

/// Units of the fixed-point representation: the smallest subnormal, 2^-1074.
const FIXED_POINT_BIAS: i32 = 1_074;

/// Exact sum of finite non-negative floats.
///
/// The sum is a fixed-point integer in units of 2^-1074, stored as sparse
/// little-endian 64-bit words with no zero words. Adding is integer addition,
/// so the representation is canonical and independent of term order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExactSum {
    words: BTreeMap<u32, u64>,
}

impl ExactSum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.words.is_empty()
    }

    pub fn add(&mut self, value: f64) {
        self.add_n(value, 1);
    }

    /// Adds `value` `n` times. Zero, negative and non-finite terms are ignored.
    pub fn add_n(&mut self, value: f64, n: u64) {
        if n == 0 || !value.is_finite() || value <= 0.0 {
            return;
        }
        let bits = value.to_bits();
        let biased = ((bits >> 52) & 0x7ff) as u32;
        let fraction = bits & ((1_u64 << 52) - 1);
        let (mantissa, shift) = if biased == 0 {
            (fraction, 0)
        } else {
            (fraction | (1_u64 << 52), biased - 1)
        };
        // At most 117 significant bits, spread over three words once shifted.
        let product = u128::from(mantissa) * u128::from(n);
        let word = shift / 64;
        let offset = shift % 64;
        let low = product << offset;
        let high = if offset == 0 {
            0
        } else {
            (product >> (128 - offset)) as u64
        };
        self.add_word(word, low as u64);
        self.add_word(word + 1, (low >> 64) as u64);
        self.add_word(word + 2, high);
    }

    pub fn merge(&mut self, other: &Self) {
        for (idx, word) in &other.words {
            self.add_word(*idx, *word);
        }
    }

    /// Subtracts `other`, clamping at zero.
    pub fn saturating_sub(&mut self, other: &Self) {
        if self.cmp_value(other) != Ordering::Greater {
            self.words.clear();
            return;
        }
        for (idx, word) in &other.words {
            self.sub_word(*idx, *word);
        }
    }

    /// Nearest `f64` to the sum, computed from the canonical words.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.words.iter().rev().fold(0.0, |total, (idx, word)| {
            total + scale(*word as f64, 64 * *idx as i32 - FIXED_POINT_BIAS)
        })
    }

    fn cmp_value(&self, other: &Self) -> Ordering {
        let mut mine = self.words.iter().rev();
        let mut theirs = other.words.iter().rev();
        loop {
            match (mine.next(), theirs.next()) {
                (None, None) => return Ordering::Equal,
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (Some(a), Some(b)) => {
                    let ord = a.0.cmp(b.0).then_with(|| a.1.cmp(b.1));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }

    fn add_word(&mut self, mut idx: u32, mut word: u64) {
        while word != 0 {
            let slot = self.words.entry(idx).or_insert(0);
            let (sum, carry) = slot.overflowing_add(word);
            *slot = sum;
            if sum == 0 {
                self.words.remove(&idx);
            }
            word = u64::from(carry);
            idx += 1;
        }
    }

    fn sub_word(&mut self, mut idx: u32, mut word: u64) {
        while word != 0 {
            let slot = self.words.entry(idx).or_insert(0);
            let (diff, borrow) = slot.overflowing_sub(word);
            *slot = diff;
            if diff == 0 {
                self.words.remove(&idx);
            }
            word = u64::from(borrow);
            idx += 1;
        }
    }
}

/// `2^exponent` for exponents in the normal range.
fn pow2(exponent: i32) -> f64 {
    f64::from_bits(((exponent + 1_023) as u64) << 52)
}

/// `value * 2^exponent` in steps that stay within the normal range.
fn scale(mut value: f64, mut exponent: i32) -> f64 {
    while exponent > 1_023 {
        value *= pow2(1_023);
        exponent -= 1_023;
    }
    while exponent < -1_022 {
        value *= pow2(-1_022);
        exponent += 1_022;
    }
    value * pow2(exponent)
}

/// Exact count and weight of a group of observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExactMass {
    count: u64,
    weight: ExactSum,
}

impl ExactMass {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn add(&mut self, weight: f64) {
        self.add_n(weight, 1);
    }

    pub fn add_n(&mut self, weight: f64, count: u64) {
        self.count += count;
        self.weight.add_n(weight, count);
    }

    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.weight.merge(&other.weight);
    }

    /// Removes `other`, clamping count and weight at zero.
    pub fn saturating_sub(&mut self, other: &Self) {
        self.count = self.count.saturating_sub(other.count);
        self.weight.saturating_sub(&other.weight);
    }

    #[must_use]
    pub fn mass(&self) -> Mass {
        Mass {
            count: self.count,
            weight: self.weight.value(),
        }
    }
}

/// Canonical `key -> (count, weight)` multiset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally<K: Ord> {
    entries: BTreeMap<K, ExactMass>,
    total_count: u64,
}

impl<K: Ord> Default for Tally<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            total_count: 0,
        }
    }
}

impl<K: Ord + Clone> Tally<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }

    /// Number of distinct keys, which is also the number of stored entries.
    #[must_use]
    pub fn distinct(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn add(&mut self, key: K, weight: f64) {
        self.add_n(key, weight, 1);
    }

    pub fn add_n(&mut self, key: K, weight: f64, count: u64) {
        if count == 0 {
            return;
        }
        self.entries.entry(key).or_default().add_n(weight, count);
        self.total_count += count;
    }

    pub fn add_mass(&mut self, key: K, mass: &ExactMass) {
        if mass.is_empty() {
            return;
        }
        self.entries.entry(key).or_default().merge(mass);
        self.total_count += mass.count;
    }

    pub fn merge(&mut self, other: &Self) {
        for (key, mass) in &other.entries {
            self.add_mass(key.clone(), mass);
        }
    }

    /// Removes `key` and returns the mass it held.
    pub fn remove_key(&mut self, key: &K) -> Mass {
        match self.entries.remove(key) {
            Some(mass) => {
                self.total_count -= mass.count;
                mass.mass()
            }
            None => Mass::default(),
        }
    }

    /// Distinct keys in ascending order with their mass.
    #[must_use]
    pub fn groups(&self) -> Vec<(&K, Mass)> {
        self.entries.iter().map(|(key, mass)| (key, mass.mass())).collect()
    }

    /// Distinct keys in ascending order with their exact mass.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &ExactMass)> + '_ {
        self.entries.iter()
    }

    #[must_use]
    pub fn total(&self) -> Mass {
        self.total_exact().mass()
    }

    #[must_use]
    pub fn total_exact(&self) -> ExactMass {
        let mut total = ExactMass::new();
        for mass in self.entries.values() {
            total.merge(mass);
        }
        total
    }
}

impl Tally<OrderedF64> {
    /// Collapses the tally into at most `max_centroids` equal-count centroids.
    /// Counts and weights are preserved exactly; each centroid sits at the
    /// count-weighted mean value of its members.
    pub fn compact(&mut self, max_centroids: usize) {
        if max_centroids == 0 || self.entries.len() <= max_centroids {
            return;
        }
        let target = self.total_count.div_ceil(max_centroids as u64);
        let mut compacted = Self::new();
        let mut group = ExactMass::new();
        let mut value_sum = 0.0_f64;
        for (value, mass) in &self.entries {
            group.merge(mass);
            value_sum += value.get() * mass.count as f64;
            if group.count >= target {
                compacted.add_mass(OrderedF64::new(value_sum / group.count as f64), &group);
                group = ExactMass::new();
                value_sum = 0.0;
            }
        }
        if !group.is_empty() {
            compacted.add_mass(OrderedF64::new(value_sum / group.count as f64), &group);
        }
        *self = compacted;
    }
}

/// Weighted mean and population variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub total: f64,
    pub mean: f64,
    pub variance: f64,
}

impl Moments {
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Weighted Welford accumulator. Partitions combine with Chan's update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningMoments {
    total: f64,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    fn push(&mut self, value: f64, mass: f64) {
        if mass <= 0.0 {
            return;
        }
        self.total += mass;
        let delta = value - self.mean;
        self.mean += delta * mass / self.total;
        self.m2 += mass * delta * (value - self.mean);
    }

    fn merge(&mut self, other: &Self) {
        if other.total <= 0.0 {
            return;
        }
        if self.total <= 0.0 {
            *self = *other;
            return;
        }
        let total = self.total + other.total;
        let delta = other.mean - self.mean;
        self.mean += delta * other.total / total;
        self.m2 += other.m2 + delta * delta * self.total * other.total / total;
        self.total = total;
    }

    fn finish(&self) -> Moments {
        let variance = if self.total > 0.0 {
            (self.m2 / self.total).max(0.0)
        } else {
            0.0
        };
        Moments {
            total: self.total,
            mean: self.mean,
            variance,
        }
    }
}

/// Moments carried alongside a compacted tally, whose centroids no longer
/// hold the spread of the values they replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StreamingMoments {
    unweighted: RunningMoments,
    weighted: RunningMoments,
}

impl StreamingMoments {
    fn push(&mut self, value: f64, mass: Mass) {
        self.unweighted.push(value, mass.count as f64);
        self.weighted.push(value, mass.weight);
    }

    fn merge(&mut self, other: &Self) {
        self.unweighted.merge(&other.unweighted);
        self.weighted.merge(&other.weighted);
    }

    fn get(&self, weighting: Weighting) -> &RunningMoments {
        match weighting {
            Weighting::Unweighted => &self.unweighted,
            Weighting::Weighted => &self.weighted,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramBuilder {
    values: Tally<OrderedF64>,
    min: Option<f64>,
    max: Option<f64>,
    num_nan: u64,
    num_undefined: u64,
    /// Set once the tally has been compacted.
    streaming: Option<StreamingMoments>,
}

impl HistogramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-finite values are counted as NaN and otherwise ignored.
    pub fn add(&mut self, value: f64, weight: f64) {
        self.add_n(value, weight, 1);
    }

    pub fn add_n(&mut self, value: f64, weight: f64, count: u64) {
        let mut mass = ExactMass::new();
        mass.add_n(weight, count);
        self.add_mass(value, &mass);
    }

    pub fn add_mass(&mut self, value: f64, mass: &ExactMass) {
        if !fst_types::is_countable(value) {
            self.num_nan += mass.count;
            return;
        }
        if mass.is_empty() {
            return;
        }
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        if let Some(streaming) = &mut self.streaming {
            streaming.push(value, mass.mass());
        }
        self.values.add_mass(OrderedF64::new(value), mass);
    }

    pub fn add_nan(&mut self) {
        self.num_nan += 1;
    }

    pub fn add_undefined(&mut self) {
        self.add_undefined_n(1);
    }

    pub fn add_undefined_n(&mut self, count: u64) {
        self.num_undefined += count;
    }

    pub fn merge(&mut self, other: &Self) {
        if self.streaming.is_some() || other.streaming.is_some() {
            let mut streaming = self.streaming.unwrap_or_else(|| self.exact_moments());
            streaming.merge(&other.streaming.unwrap_or_else(|| other.exact_moments()));
            self.streaming = Some(streaming);
        }
        self.values.merge(&other.values);
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.num_nan += other.num_nan;
        self.num_undefined += other.num_undefined;
    }

    /// Compacts once the tally holds more than twice `max_centroids` values.
    /// From then on moments are tracked by streaming accumulators.
    pub fn compact(&mut self, max_centroids: usize) {
        if self.values.distinct() > max_centroids.saturating_mul(2) {
            tracing::debug!(
                entries = self.values.distinct(),
                max_centroids,
                "compacting value tally"
            );
            if self.streaming.is_none() {
                self.streaming = Some(self.exact_moments());
            }
            self.values.compact(max_centroids);
        }
    }

    #[must_use]
    pub fn is_compacted(&self) -> bool {
        self.streaming.is_some()
    }

    #[must_use]
    pub fn values(&self) -> &Tally<OrderedF64> {
        &self.values
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.values.total_count()
    }

    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    #[must_use]
    pub fn num_nan(&self) -> u64 {
        self.num_nan
    }

    #[must_use]
    pub fn num_undefined(&self) -> u64 {
        self.num_undefined
    }

    fn masses(&self, weighting: Weighting) -> Vec<(f64, f64)> {
        self.values
            .groups()
            .into_iter()
            .map(|(value, mass)| (value.get(), mass.get(weighting)))
            .collect()
    }

    fn exact_moments(&self) -> StreamingMoments {
        let mut moments = StreamingMoments::default();
        for (value, mass) in self.values.groups() {
            moments.push(value.get(), mass);
        }
        moments
    }

    /// Exact moments walk the tally in ascending value order; a compacted
    /// builder reports its streaming moments instead.
    #[must_use]
    pub fn moments(&self, weighting: Weighting) -> Moments {
        if let Some(streaming) = &self.streaming {
            return streaming.get(weighting).finish();
        }
        let mut running = RunningMoments::default();
        for (value, mass) in self.masses(weighting) {
            running.push(value, mass);
        }
        running.finish()
    }

    /// Weighted median. When the cumulative mass lands exactly on half the
    /// total, the midpoint of the two neighbouring values is returned.
    #[must_use]
    pub fn median(&self, weighting: Weighting) -> Option<f64> {
        let masses = self.masses(weighting);
        let total: f64 = masses.iter().map(|(_, m)| m).sum();
        if total <= 0.0 {
            return None;
        }
        let half = total / 2.0;
        let mut cumulative = 0.0;
        for (idx, (value, mass)) in masses.iter().enumerate() {
            cumulative += mass;
            if cumulative > half {
                return Some(*value);
            }
            if cumulative == half {
                let next = masses[idx + 1..]
                    .iter()
                    .find(|(_, m)| *m > 0.0)
                    .map_or(*value, |(v, _)| *v);
                return Some((value + next) / 2.0);
            }
        }
        masses.last().map(|(v, _)| *v)
    }

    #[must_use]
    pub fn finalize(
        &self,
        histogram_type: HistogramType,
        num_buckets: usize,
        weighting: Weighting,
    ) -> Histogram {
        let buckets = match (self.min, self.max) {
            (Some(min), Some(max)) if num_buckets > 0 => {
                let masses = self.masses(weighting);
                match histogram_type {
                    HistogramType::Standard => standard_buckets(&masses, min, max, num_buckets),
                    HistogramType::Quantiles => quantile_buckets(&masses, min, max, num_buckets),
                }
            }
            _ => Vec::new(),
        };
        Histogram {
            num_nan: self.num_nan,
            num_undefined: self.num_undefined,
            buckets,
            histogram_type,
            name: None,
        }
    }
}

fn standard_buckets(masses: &[(f64, f64)], min: f64, max: f64, num_buckets: usize) -> Vec<HistogramBucket> {
    let total: f64 = masses.iter().map(|(_, m)| m).sum();
    if min == max {
        return vec![HistogramBucket {
            low_value: min,
            high_value: max,
            sample_count: total,
        }];
    }

    let bounds = standard_bounds(min, max, num_buckets);
    let cuts = &bounds[1..num_buckets];
    let mut counts = vec![0.0_f64; num_buckets];
    for (value, mass) in masses {
        counts[cuts.partition_point(|cut| cut <= value)] += mass;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(idx, sample_count)| HistogramBucket {
            low_value: bounds[idx],
            high_value: bounds[idx + 1],
            sample_count,
        })
        .collect()
}

/// Equal-width boundaries from `min` to `max`, interpolated as
/// `min * (1 - t) + max * t` so that `max - min` is never formed. That
/// difference overflows once the range is wider than `f64::MAX`.
fn standard_bounds(min: f64, max: f64, num_buckets: usize) -> Vec<f64> {
    let mut bounds = Vec::with_capacity(num_buckets + 1);
    bounds.push(min);
    for idx in 1..num_buckets {
        let t = idx as f64 / num_buckets as f64;
        let bound = (min * (1.0 - t) + max * t).clamp(min, max);
        let floor = bounds[bounds.len() - 1];
        bounds.push(bound.max(floor));
    }
    bounds.push(max);
    bounds
}

/// Cuts the ascending value sequence where the cumulative mass is closest to
/// each `k / num_buckets` quantile. Equal values never straddle a cut.
fn quantile_buckets(masses: &[(f64, f64)], min: f64, max: f64, num_buckets: usize) -> Vec<HistogramBucket> {
    let m = masses.len();
    let mut prefix = Vec::with_capacity(m + 1);
    prefix.push(0.0_f64);
    for (_, mass) in masses {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + mass);
    }
    let total = prefix[m];

    let mut cuts = Vec::with_capacity(num_buckets + 1);
    cuts.push(0_usize);
    for k in 1..num_buckets {
        let target = total * k as f64 / num_buckets as f64;
        let above = prefix.partition_point(|p| *p < target).min(m);
        let cut = if above == 0 || prefix[above] - target < target - prefix[above - 1] {
            above
        } else {
            above - 1
        };
        let floor = cuts[cuts.len() - 1];
        cuts.push(cut.max(floor));
    }
    cuts.push(m);

    let lows: Vec<f64> = (0..num_buckets)
        .map(|k| match cuts[k] {
            0 => min,
            idx if idx < m => masses[idx].0,
            _ => max,
        })
        .collect();

    (0..num_buckets)
        .map(|k| HistogramBucket {
            low_value: lows[k],
            high_value: if k + 1 == num_buckets { max } else { lows[k + 1] },
            sample_count: masses[cuts[k]..cuts[k + 1]].iter().map(|(_, mass)| mass).sum(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankOptions {
    pub top_k: usize,
    pub bucket_width: usize,
    pub max_buckets: usize,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            top_k: 20,
            bucket_width: 1,
            max_buckets: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankHistogramBuilder {
    values: Tally<String>,
}

impl RankHistogramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: impl Into<String>, weight: f64) {
        self.values.add(value.into(), weight);
    }

    pub fn merge(&mut self, other: &Self) {
        self.values.merge(&other.values);
    }

    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(&value.to_owned())
    }

    #[must_use]
    pub fn distinct(&self) -> usize {
        self.values.distinct()
    }

    #[must_use]
    pub fn values(&self) -> &Tally<String> {
        &self.values
    }

    /// Keeps the `cap` most frequent values (ties lexicographic) and returns
    /// the mass of everything dropped.
    pub fn truncate(&mut self, cap: usize) -> Mass {
        if self.values.distinct() <= cap {
            return Mass::default();
        }
        let ranked = self.ranked(Weighting::Unweighted);
        let dropped: Vec<String> = ranked[cap..].iter().map(|(v, _)| v.clone()).collect();
        let mut mass = Mass::default();
        for value in dropped {
            let removed = self.values.remove_key(&value);
            mass.count += removed.count;
            mass.weight += removed.weight;
        }
        mass
    }

    /// Values by descending mass, ties broken lexicographically.
    #[must_use]
    pub fn ranked(&self, weighting: Weighting) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .values
            .groups()
            .into_iter()
            .map(|(value, mass)| (value.clone(), mass.get(weighting)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    #[must_use]
    pub fn finalize(&self, options: RankOptions, weighting: Weighting) -> (Vec<FreqAndValue>, RankHistogram) {
        let ranked = self.ranked(weighting);
        let top_values = ranked
            .iter()
            .take(options.top_k)
            .map(|(value, frequency)| FreqAndValue {
                value: value.clone(),
                frequency: *frequency,
            })
            .collect();

        let width = options.bucket_width.max(1);
        let buckets = ranked
            .chunks(width)
            .take(options.max_buckets)
            .enumerate()
            .map(|(idx, chunk)| {
                let low_rank = (idx * width) as u64 + 1;
                RankHistogramBucket {
                    low_rank,
                    high_rank: low_rank + chunk.len() as u64,
                    label: chunk[0].0.clone(),
                    sample_count: chunk.iter().map(|(_, mass)| mass).sum(),
                }
            })
            .collect();

        (top_values, RankHistogram { buckets, name: None })
    }
}

pub const DEFAULT_SKETCH_SIZE: usize = 1_024;

/// Bottom-k distinct-count sketch. Merging keeps the k smallest hashes of the
/// union, so it is exactly associative and commutative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinctSketch {
    k: usize,
    hashes: BTreeSet<u64>,
}

impl Default for DistinctSketch {
    fn default() -> Self {
        Self::new(DEFAULT_SKETCH_SIZE)
    }
}

impl DistinctSketch {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(2),
            hashes: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, bytes: &[u8]) {
        self.insert_hash(hash64(bytes));
    }

    fn insert_hash(&mut self, hash: u64) {
        if self.hashes.len() < self.k {
            self.hashes.insert(hash);
        } else if self.hashes.last().is_some_and(|max| hash < *max) && self.hashes.insert(hash) {
            self.hashes.pop_last();
        }
    }

    pub fn merge(&mut self, other: &Self) {
        for hash in &other.hashes {
            self.insert_hash(*hash);
        }
    }

    /// Exact below `k` distinct hashes, `(k - 1) / kth_smallest` above.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        match self.hashes.last() {
            Some(kth) if self.hashes.len() >= self.k => {
                let fraction = (*kth as f64 + 1.0) / (u64::MAX as f64 + 1.0);
                (self.k - 1) as f64 / fraction
            }
            _ => self.hashes.len() as f64,
        }
    }
}

/// FNV-1a followed by a splitmix64 finalizer for uniform high bits.
#[must_use]
pub fn hash64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^= hash >> 30;
    hash = hash.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash ^= hash >> 27;
    hash = hash.wrapping_mul(0x94d0_49bb_1331_11eb);
    hash ^ (hash >> 31)
}
