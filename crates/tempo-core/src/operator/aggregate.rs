//! Incremental aggregate functions.
//!
//! An [`Aggregate`] keeps an exact, invertible accumulator: every
//! contribution can be retracted again with [`Aggregate::deaccumulate`].
//! This lets [`GroupAggregate`](super::GroupAggregate) maintain a running
//! snapshot across Start/End edges without re-scanning history.
//!
//! ## Built-in aggregates
//!
//! | Aggregate | State | Output |
//! |-----------|-------|--------|
//! | [`CountAggregate`] | `u64` | `u64` |
//! | [`SumAggregate`] | `N` | `N` |
//! | [`MinAggregate`] / [`MaxAggregate`] | sorted multiset | `Option<N>` |
//! | [`AverageAggregate`] | `(sum, count)` | `f64` |
//!
//! Average keeps sum and count separately and divides only when a result is
//! computed, so repeated retractions never compound rounding error.
//!
//! Several aggregates sharing one grouping are combined with
//! [`Composite2`] / [`Composite3`], whose projection runs only at emission.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::Payload;

/// An invertible incremental aggregate.
pub trait Aggregate: Send + Sync + 'static {
    /// Payload consumed by the aggregate.
    type Input;
    /// Accumulator state, serialized into checkpoints.
    type State: Clone + fmt::Debug + Send + Serialize + DeserializeOwned + 'static;
    /// Value emitted for a snapshot.
    type Output: Payload;

    /// State of a group with no contributions.
    fn initial_state(&self) -> Self::State;

    /// Adds one contribution.
    fn accumulate(&self, state: &mut Self::State, input: &Self::Input);

    /// Removes a contribution previously added with [`accumulate`](Self::accumulate).
    fn deaccumulate(&self, state: &mut Self::State, input: &Self::Input);

    /// Computes the snapshot value from the state.
    fn compute_result(&self, state: &Self::State) -> Self::Output;
}

/// Numeric types usable by the arithmetic aggregates.
///
/// Integer sums wrap on overflow. Wrapping arithmetic is exactly
/// invertible, so a running sum that overflows part way returns to the true
/// value once the contributions that pushed it out of range are retracted.
/// Only a snapshot whose true sum lies outside the type's range wraps.
pub trait Numeric: Copy + Default + PartialOrd + Payload {
    /// Adds a contribution.
    #[must_use]
    fn accumulate(self, other: Self) -> Self;

    /// Removes a contribution added with [`accumulate`](Self::accumulate).
    #[must_use]
    fn retract(self, other: Self) -> Self;

    /// Converts to `f64` for averaging.
    fn to_f64(self) -> f64;
}

macro_rules! impl_numeric_int {
    ($($t:ty),*) => {
        $(
            impl Numeric for $t {
                #[inline]
                fn accumulate(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }

                #[inline]
                fn retract(self, other: Self) -> Self {
                    self.wrapping_sub(other)
                }

                #[inline]
                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_numeric_int!(i32, i64, u32, u64);

impl Numeric for f64 {
    #[inline]
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    #[inline]
    fn retract(self, other: Self) -> Self {
        self - other
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

type Extractor<I, N> = Arc<dyn Fn(&I) -> N + Send + Sync>;

/// Counts contributions.
pub struct CountAggregate<I> {
    _input: std::marker::PhantomData<fn(&I)>,
}

impl<I> CountAggregate<I> {
    /// Creates a count aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _input: std::marker::PhantomData,
        }
    }
}

impl<I> Default for CountAggregate<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> fmt::Debug for CountAggregate<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CountAggregate")
    }
}

impl<I: 'static> Aggregate for CountAggregate<I> {
    type Input = I;
    type State = u64;
    type Output = u64;

    fn initial_state(&self) -> u64 {
        0
    }

    fn accumulate(&self, state: &mut u64, _input: &I) {
        *state += 1;
    }

    fn deaccumulate(&self, state: &mut u64, _input: &I) {
        *state = state.saturating_sub(1);
    }

    fn compute_result(&self, state: &u64) -> u64 {
        *state
    }
}

/// Sums a numeric column.
pub struct SumAggregate<I, N> {
    extract: Extractor<I, N>,
}

impl<I, N> SumAggregate<I, N> {
    /// Creates a sum over the values produced by `extract`.
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&I) -> N + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
        }
    }
}

impl<I, N> fmt::Debug for SumAggregate<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SumAggregate")
    }
}

impl<I: 'static, N: Numeric> Aggregate for SumAggregate<I, N> {
    type Input = I;
    type State = N;
    type Output = N;

    fn initial_state(&self) -> N {
        N::default()
    }

    fn accumulate(&self, state: &mut N, input: &I) {
        *state = state.accumulate((self.extract)(input));
    }

    fn deaccumulate(&self, state: &mut N, input: &I) {
        *state = state.retract((self.extract)(input));
    }

    fn compute_result(&self, state: &N) -> N {
        *state
    }
}

/// Averages a numeric column.
pub struct AverageAggregate<I, N> {
    extract: Extractor<I, N>,
}

impl<I, N> AverageAggregate<I, N> {
    /// Creates an average over the values produced by `extract`.
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&I) -> N + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
        }
    }
}

impl<I, N> fmt::Debug for AverageAggregate<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AverageAggregate")
    }
}

impl<I: 'static, N: Numeric> Aggregate for AverageAggregate<I, N> {
    type Input = I;
    type State = (N, u64);
    type Output = f64;

    fn initial_state(&self) -> (N, u64) {
        (N::default(), 0)
    }

    fn accumulate(&self, state: &mut (N, u64), input: &I) {
        state.0 = state.0.accumulate((self.extract)(input));
        state.1 += 1;
    }

    fn deaccumulate(&self, state: &mut (N, u64), input: &I) {
        state.0 = state.0.retract((self.extract)(input));
        state.1 = state.1.saturating_sub(1);
    }

    /// Returns `0.0` for an empty group.
    #[allow(clippy::cast_precision_loss)]
    fn compute_result(&self, state: &(N, u64)) -> f64 {
        if state.1 == 0 {
            0.0
        } else {
            state.0.to_f64() / state.1 as f64
        }
    }
}

/// Sorted multiset of values with multiplicities, so retractions are exact.
fn multiset_insert<N: Numeric>(set: &mut Vec<(N, u64)>, value: N) {
    match set.binary_search_by(|(v, _)| compare(*v, value)) {
        Ok(i) => set[i].1 += 1,
        Err(i) => set.insert(i, (value, 1)),
    }
}

fn multiset_remove<N: Numeric>(set: &mut Vec<(N, u64)>, value: N) {
    if let Ok(i) = set.binary_search_by(|(v, _)| compare(*v, value)) {
        if set[i].1 > 1 {
            set[i].1 -= 1;
        } else {
            set.remove(i);
        }
    }
}

fn compare<N: PartialOrd>(a: N, b: N) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Minimum of a numeric column. `None` for an empty group.
pub struct MinAggregate<I, N> {
    extract: Extractor<I, N>,
}

impl<I, N> MinAggregate<I, N> {
    /// Creates a minimum over the values produced by `extract`.
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&I) -> N + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
        }
    }
}

impl<I, N> fmt::Debug for MinAggregate<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MinAggregate")
    }
}

impl<I: 'static, N: Numeric> Aggregate for MinAggregate<I, N> {
    type Input = I;
    type State = Vec<(N, u64)>;
    type Output = Option<N>;

    fn initial_state(&self) -> Self::State {
        Vec::new()
    }

    fn accumulate(&self, state: &mut Self::State, input: &I) {
        multiset_insert(state, (self.extract)(input));
    }

    fn deaccumulate(&self, state: &mut Self::State, input: &I) {
        multiset_remove(state, (self.extract)(input));
    }

    fn compute_result(&self, state: &Self::State) -> Option<N> {
        state.first().map(|(v, _)| *v)
    }
}

/// Maximum of a numeric column. `None` for an empty group.
pub struct MaxAggregate<I, N> {
    extract: Extractor<I, N>,
}

impl<I, N> MaxAggregate<I, N> {
    /// Creates a maximum over the values produced by `extract`.
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&I) -> N + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
        }
    }
}

impl<I, N> fmt::Debug for MaxAggregate<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MaxAggregate")
    }
}

impl<I: 'static, N: Numeric> Aggregate for MaxAggregate<I, N> {
    type Input = I;
    type State = Vec<(N, u64)>;
    type Output = Option<N>;

    fn initial_state(&self) -> Self::State {
        Vec::new()
    }

    fn accumulate(&self, state: &mut Self::State, input: &I) {
        multiset_insert(state, (self.extract)(input));
    }

    fn deaccumulate(&self, state: &mut Self::State, input: &I) {
        multiset_remove(state, (self.extract)(input));
    }

    fn compute_result(&self, state: &Self::State) -> Option<N> {
        state.last().map(|(v, _)| *v)
    }
}

/// Two aggregates over the same input, combined by a projection.
pub struct Composite2<A, B, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
{
    first: A,
    second: B,
    project: Box<dyn Fn(A::Output, B::Output) -> O + Send + Sync>,
}

impl<A, B, O> Composite2<A, B, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
{
    /// Combines `first` and `second`; `project` runs only at emission.
    pub fn new<F>(first: A, second: B, project: F) -> Self
    where
        F: Fn(A::Output, B::Output) -> O + Send + Sync + 'static,
    {
        Self {
            first,
            second,
            project: Box::new(project),
        }
    }
}

impl<A, B, O> Aggregate for Composite2<A, B, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
    O: Payload,
{
    type Input = A::Input;
    type State = (A::State, B::State);
    type Output = O;

    fn initial_state(&self) -> Self::State {
        (self.first.initial_state(), self.second.initial_state())
    }

    fn accumulate(&self, state: &mut Self::State, input: &Self::Input) {
        self.first.accumulate(&mut state.0, input);
        self.second.accumulate(&mut state.1, input);
    }

    fn deaccumulate(&self, state: &mut Self::State, input: &Self::Input) {
        self.first.deaccumulate(&mut state.0, input);
        self.second.deaccumulate(&mut state.1, input);
    }

    fn compute_result(&self, state: &Self::State) -> O {
        (self.project)(
            self.first.compute_result(&state.0),
            self.second.compute_result(&state.1),
        )
    }
}

/// Three aggregates over the same input, combined by a projection.
pub struct Composite3<A, B, C, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
    C: Aggregate<Input = A::Input>,
{
    first: A,
    second: B,
    third: C,
    project: Box<dyn Fn(A::Output, B::Output, C::Output) -> O + Send + Sync>,
}

impl<A, B, C, O> Composite3<A, B, C, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
    C: Aggregate<Input = A::Input>,
{
    /// Combines three aggregates; `project` runs only at emission.
    pub fn new<F>(first: A, second: B, third: C, project: F) -> Self
    where
        F: Fn(A::Output, B::Output, C::Output) -> O + Send + Sync + 'static,
    {
        Self {
            first,
            second,
            third,
            project: Box::new(project),
        }
    }
}

impl<A, B, C, O> Aggregate for Composite3<A, B, C, O>
where
    A: Aggregate,
    B: Aggregate<Input = A::Input>,
    C: Aggregate<Input = A::Input>,
    O: Payload,
{
    type Input = A::Input;
    type State = (A::State, B::State, C::State);
    type Output = O;

    fn initial_state(&self) -> Self::State {
        (
            self.first.initial_state(),
            self.second.initial_state(),
            self.third.initial_state(),
        )
    }

    fn accumulate(&self, state: &mut Self::State, input: &Self::Input) {
        self.first.accumulate(&mut state.0, input);
        self.second.accumulate(&mut state.1, input);
        self.third.accumulate(&mut state.2, input);
    }

    fn deaccumulate(&self, state: &mut Self::State, input: &Self::Input) {
        self.first.deaccumulate(&mut state.0, input);
        self.second.deaccumulate(&mut state.1, input);
        self.third.deaccumulate(&mut state.2, input);
    }

    fn compute_result(&self, state: &Self::State) -> O {
        (self.project)(
            self.first.compute_result(&state.0),
            self.second.compute_result(&state.1),
            self.third.compute_result(&state.2),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<A: Aggregate>(agg: &A, add: &[A::Input], remove: &[A::Input]) -> A::Output {
        let mut state = agg.initial_state();
        for v in add {
            agg.accumulate(&mut state, v);
        }
        for v in remove {
            agg.deaccumulate(&mut state, v);
        }
        agg.compute_result(&state)
    }

    #[test]
    fn test_count_and_sum_retract_exactly() {
        let count = CountAggregate::<i64>::new();
        assert_eq!(run(&count, &[1, 2, 3], &[2]), 2);

        let sum = SumAggregate::new(|v: &i64| *v);
        assert_eq!(run(&sum, &[1, 2, 3], &[2]), 4);
    }

    #[test]
    fn test_sum_overflow_recovers_after_retraction() {
        let sum = SumAggregate::new(|v: &i64| *v);
        assert_eq!(run(&sum, &[i64::MAX, 10, -5], &[10]), i64::MAX - 5);
        assert_eq!(run(&sum, &[i64::MAX, i64::MAX], &[i64::MAX]), i64::MAX);

        let unsigned = SumAggregate::new(|v: &u32| *v);
        assert_eq!(run(&unsigned, &[3], &[5, 1]), u32::MAX - 2);

        let avg = AverageAggregate::new(|v: &i64| *v);
        let mean = run(&avg, &[i64::MAX, 2, 4], &[i64::MAX]);
        assert!((mean - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_divides_only_at_emission() {
        let avg = AverageAggregate::new(|v: &i64| *v);
        assert!((run(&avg, &[97, 98, 99], &[]) - 98.0).abs() < f64::EPSILON);
        assert!((run(&avg, &[97, 98, 99, 100], &[97]) - 99.0).abs() < f64::EPSILON);
        assert!(run(&avg, &[5], &[5]).abs() < f64::EPSILON);
    }

    #[test]
    fn test_min_max_survive_retraction_of_extreme() {
        let min = MinAggregate::new(|v: &i64| *v);
        let max = MaxAggregate::new(|v: &i64| *v);
        assert_eq!(run(&min, &[4, 1, 1, 9], &[1]), Some(1));
        assert_eq!(run(&min, &[4, 1, 9], &[1]), Some(4));
        assert_eq!(run(&max, &[4, 1, 9], &[9]), Some(4));
        assert_eq!(run(&max, &[4], &[4]), None);
    }

    #[test]
    fn test_composite_projects_at_emission() {
        let agg = Composite3::new(
            CountAggregate::<f64>::new(),
            SumAggregate::new(|v: &f64| *v),
            MaxAggregate::new(|v: &f64| *v),
            |count, sum, max| (count, sum, max.unwrap_or(f64::NAN)),
        );
        assert_eq!(run(&agg, &[1.5, 2.5, 4.0], &[2.5]), (2, 5.5, 4.0));

        let pair = Composite2::new(
            CountAggregate::<i64>::new(),
            SumAggregate::new(|v: &i64| *v),
            |c, s| format!("{s}/{c}"),
        );
        assert_eq!(run(&pair, &[3, 4], &[]), "7/2");
    }
}
