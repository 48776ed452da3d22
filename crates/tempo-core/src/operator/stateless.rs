//! Stateless per-event operators.
//!
//! [`Where`], [`Select`], [`SelectMany`] and [`SelectKey`] transform or
//! filter the payload of each data event independently of the events around
//! it. Kind and timing fields are never touched and punctuations pass
//! through unchanged.
//!
//! Each operator has two evaluation strategies picked once through
//! [`ExecutionMode`]: `Row` evaluates and emits one event at a time,
//! `Columnar` evaluates the whole batch into a selection vector (or a
//! projected column) first and then compacts it into the output. Both
//! produce identical streams.
//!
//! User functions come in two flavours: `new` takes an infallible closure,
//! `try_new` a closure returning `Result<_, TransformError>`. A transform
//! error aborts the batch as [`OperatorError::Transform`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{transform_error, Operator, OperatorError, OutputBuffer, TransformError};
use crate::config::{EngineConfig, ExecutionMode};
use crate::event::{EventBatch, InvalidEventError, Payload, StreamEvent};

type Predicate<P> = Box<dyn Fn(&P) -> Result<bool, TransformError> + Send + Sync>;
type Projection<I, O> = Box<dyn Fn(&I) -> Result<O, TransformError> + Send + Sync>;
type Expansion<I, O> = Box<dyn Fn(&I) -> Result<Vec<O>, TransformError> + Send + Sync>;

/// Filters data events by a predicate over the payload.
pub struct Where<P> {
    predicate: Predicate<P>,
    mode: ExecutionMode,
}

impl<P> Where<P> {
    /// Creates a filter from an infallible predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        Self::try_new(move |p| Ok(predicate(p)))
    }

    /// Creates a filter from a fallible predicate.
    pub fn try_new<F>(predicate: F) -> Self
    where
        F: Fn(&P) -> Result<bool, TransformError> + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            mode: ExecutionMode::default(),
        }
    }

    fn keep(&self, event: &StreamEvent<P>) -> Result<bool, OperatorError> {
        match event.payload() {
            Some(p) => (self.predicate)(p).map_err(transform_error("where")),
            None => Ok(true),
        }
    }
}

impl<P> fmt::Debug for Where<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Where").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl<P: Payload> Operator<P, P> for Where<P> {
    fn name(&self) -> &'static str {
        "where"
    }

    fn configure(&mut self, config: &EngineConfig) {
        self.mode = config.execution_mode;
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<P>,
    ) -> Result<(), OperatorError> {
        match self.mode {
            ExecutionMode::Row => {
                for event in batch {
                    if self.keep(event)? {
                        output.push(event.clone());
                    }
                }
            }
            ExecutionMode::Columnar => {
                let selection = batch
                    .iter()
                    .map(|event| self.keep(event))
                    .collect::<Result<Vec<bool>, _>>()?;
                for (event, _) in batch.iter().zip(selection).filter(|(_, keep)| *keep) {
                    output.push(event.clone());
                }
            }
        }
        Ok(())
    }
}

/// Projects each payload to a new value.
pub struct Select<I, O> {
    projection: Projection<I, O>,
    mode: ExecutionMode,
}

impl<I, O> Select<I, O> {
    /// Creates a projection from an infallible function.
    pub fn new<F>(projection: F) -> Self
    where
        F: Fn(&I) -> O + Send + Sync + 'static,
    {
        Self::try_new(move |p| Ok(projection(p)))
    }

    /// Creates a projection from a fallible function.
    pub fn try_new<F>(projection: F) -> Self
    where
        F: Fn(&I) -> Result<O, TransformError> + Send + Sync + 'static,
    {
        Self {
            projection: Box::new(projection),
            mode: ExecutionMode::default(),
        }
    }

    fn project(&self, event: &StreamEvent<I>) -> Result<StreamEvent<O>, OperatorError> {
        if let Some(punctuation) = event.cast_punctuation() {
            return Ok(punctuation);
        }
        let p = event
            .payload()
            .ok_or(InvalidEventError::MissingPayload(event.kind()))?;
        let value = (self.projection)(p).map_err(transform_error("select"))?;
        Ok(event.with_payload(value))
    }
}

impl<I, O> fmt::Debug for Select<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl<I: Payload, O: Payload> Operator<I, O> for Select<I, O> {
    fn name(&self) -> &'static str {
        "select"
    }

    fn configure(&mut self, config: &EngineConfig) {
        self.mode = config.execution_mode;
    }

    fn process(
        &mut self,
        batch: &EventBatch<I>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError> {
        match self.mode {
            ExecutionMode::Row => {
                for event in batch {
                    output.push(self.project(event)?);
                }
            }
            ExecutionMode::Columnar => {
                let column = batch
                    .iter()
                    .map(|event| self.project(event))
                    .collect::<Result<Vec<_>, _>>()?;
                for event in column {
                    output.push(event);
                }
            }
        }
        Ok(())
    }
}

/// Expands each payload into zero or more payloads sharing the source timing.
///
/// An End is expanded with the same function as its Start. The function must
/// therefore be deterministic: a Start and its End have to expand to the same
/// payloads, otherwise downstream Ends will not pair with their Starts. This
/// is not checked at runtime.
pub struct SelectMany<I, O> {
    expansion: Expansion<I, O>,
    mode: ExecutionMode,
}

impl<I, O> SelectMany<I, O> {
    /// Creates an expansion from an infallible function.
    pub fn new<F>(expansion: F) -> Self
    where
        F: Fn(&I) -> Vec<O> + Send + Sync + 'static,
    {
        Self::try_new(move |p| Ok(expansion(p)))
    }

    /// Creates an expansion from a fallible function.
    pub fn try_new<F>(expansion: F) -> Self
    where
        F: Fn(&I) -> Result<Vec<O>, TransformError> + Send + Sync + 'static,
    {
        Self {
            expansion: Box::new(expansion),
            mode: ExecutionMode::default(),
        }
    }

    fn expand(&self, event: &StreamEvent<I>) -> Result<Vec<StreamEvent<O>>, OperatorError> {
        if let Some(punctuation) = event.cast_punctuation() {
            return Ok(vec![punctuation]);
        }
        let Some(p) = event.payload() else {
            return Ok(Vec::new());
        };
        let values = (self.expansion)(p).map_err(transform_error("select_many"))?;
        Ok(values.into_iter().map(|v| event.with_payload(v)).collect())
    }
}

impl<I, O> fmt::Debug for SelectMany<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectMany")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<I: Payload, O: Payload> Operator<I, O> for SelectMany<I, O> {
    fn name(&self) -> &'static str {
        "select_many"
    }

    fn configure(&mut self, config: &EngineConfig) {
        self.mode = config.execution_mode;
    }

    fn process(
        &mut self,
        batch: &EventBatch<I>,
        output: &mut OutputBuffer<O>,
    ) -> Result<(), OperatorError> {
        match self.mode {
            ExecutionMode::Row => {
                for event in batch {
                    for expanded in self.expand(event)? {
                        output.push(expanded);
                    }
                }
            }
            ExecutionMode::Columnar => {
                let expanded = batch
                    .iter()
                    .map(|event| self.expand(event))
                    .collect::<Result<Vec<_>, _>>()?;
                for event in expanded.into_iter().flatten() {
                    output.push(event);
                }
            }
        }
        Ok(())
    }
}

/// A payload tagged with its grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, P: Serialize",
    deserialize = "K: DeserializeOwned, P: DeserializeOwned"
))]
pub struct Keyed<K, P> {
    /// Grouping key.
    pub key: K,
    /// Original payload.
    pub payload: P,
}

/// Attaches a key to each payload, producing [`Keyed`] events.
pub struct SelectKey<P, K> {
    inner: Select<P, Keyed<K, P>>,
}

impl<P: Clone + 'static, K: 'static> SelectKey<P, K> {
    /// Creates a key selector from an infallible function.
    pub fn new<F>(key: F) -> Self
    where
        F: Fn(&P) -> K + Send + Sync + 'static,
    {
        Self::try_new(move |p| Ok(key(p)))
    }

    /// Creates a key selector from a fallible function.
    pub fn try_new<F>(key: F) -> Self
    where
        F: Fn(&P) -> Result<K, TransformError> + Send + Sync + 'static,
    {
        Self {
            inner: Select::try_new(move |p: &P| {
                Ok(Keyed {
                    key: key(p)?,
                    payload: p.clone(),
                })
            }),
        }
    }
}

impl<P, K> fmt::Debug for SelectKey<P, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectKey")
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

impl<P: Payload, K: Payload> Operator<P, Keyed<K, P>> for SelectKey<P, K> {
    fn name(&self) -> &'static str {
        "select_key"
    }

    fn configure(&mut self, config: &EngineConfig) {
        self.inner.mode = config.execution_mode;
    }

    fn process(
        &mut self,
        batch: &EventBatch<P>,
        output: &mut OutputBuffer<Keyed<K, P>>,
    ) -> Result<(), OperatorError> {
        self.inner.process(batch, output)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::event::EventKind;

    fn sample() -> EventBatch<i64> {
        batch(vec![
            StreamEvent::start(1, 10).unwrap(),
            StreamEvent::interval(1, 5, 3).unwrap(),
            StreamEvent::punctuation(2),
            StreamEvent::end(4, 1, 10).unwrap(),
        ])
    }

    fn config(mode: ExecutionMode) -> EngineConfig {
        EngineConfig::builder().execution_mode(mode).build()
    }

    #[test]
    fn test_where_filters_data_and_keeps_punctuation() {
        for mode in [ExecutionMode::Row, ExecutionMode::Columnar] {
            let mut op = Where::new(|p: &i64| *p > 5);
            op.configure(&config(mode));
            let mut out = output();
            op.process(&sample(), &mut out).unwrap();
            assert_eq!(
                render(&out.drain_events()),
                vec!["Start(1, 10)", "Punctuation(2)", "End(4, 1, 10)"]
            );
        }
    }

    #[test]
    fn test_select_preserves_timing() {
        let mut op = Select::new(|p: &i64| p * 2);
        op.configure(&config(ExecutionMode::Row));
        let mut out = output();
        op.process(&sample(), &mut out).unwrap();
        let events = out.drain_events();
        assert_eq!(events[1].kind(), EventKind::Interval);
        assert_eq!(events[1].other_time(), 5);
        assert_eq!(events[1].payload(), Some(&6));
        assert_eq!(events[3].other_time(), 1);
    }

    #[test]
    fn test_select_many_expands_with_source_timing() {
        for mode in [ExecutionMode::Row, ExecutionMode::Columnar] {
            let mut op = SelectMany::new(|p: &i64| (0..*p % 3).collect::<Vec<i64>>());
            op.configure(&config(mode));
            let mut out = output();
            op.process(&sample(), &mut out).unwrap();
            // 10 % 3 == 1 expansion, 3 % 3 == 0 expansions
            assert_eq!(
                render(&out.drain_events()),
                vec!["Start(1, 0)", "Punctuation(2)", "End(4, 1, 0)"]
            );
        }
    }

    #[test]
    fn test_select_key_wraps_payload() {
        let mut op = SelectKey::new(|p: &i64| p % 2 == 0);
        op.configure(&config(ExecutionMode::Columnar));
        let mut out = output();
        op.process(&sample(), &mut out).unwrap();
        let events = out.drain_events();
        assert_eq!(
            events[0].payload(),
            Some(&Keyed {
                key: true,
                payload: 10
            })
        );
        assert_eq!(events[1].payload().map(|k| k.key), Some(false));
    }

    #[test]
    fn test_transform_failure_is_fatal() {
        let mut op = Select::try_new(|p: &i64| {
            if *p == 3 {
                Err("three is not allowed".into())
            } else {
                Ok(*p)
            }
        });
        let mut out = output();
        let err = op.process(&sample(), &mut out).unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Transform {
                operator: "select",
                ..
            }
        ));
    }
}
