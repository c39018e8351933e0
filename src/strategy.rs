//! Strategies: per-key Jacobian slabs → per-key update tensors.
//!
//! A strategy decides how the keys of a stacked dict are grouped before
//! aggregation.  [`UnifyingStrategy`] treats all keys as one joint problem
//! (one aggregator call, weights shared by every parameter);
//! [`SeparatingStrategy`] aggregates each key on its own.

use crate::aggregation::Aggregator;
use crate::transform::{assign_columns, flatten_rows, unflatten, Transform};
use crate::types::{JdError, KeyedTensorDict, ParameterKey, Tensor};
use ndarray::{s, Array2};

/// Stateless reduction of Jacobian slabs keyed by parameter.
pub trait Strategy {
    fn reduce(&self, jacobians: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError>;
}

/// Look up every key of `key_order` and check the slabs agree on the number
/// of tasks.  Returns the task count and the slabs in `key_order`.
fn ordered_slabs<'a>(
    jacobians: &'a KeyedTensorDict,
    key_order: &[ParameterKey],
) -> Result<(usize, Vec<&'a Tensor>), JdError> {
    if let Some(extra) = jacobians.keys().find(|k| !key_order.contains(k)) {
        return Err(JdError::UnexpectedKey(extra));
    }

    let mut rows: Option<usize> = None;
    let mut slabs = Vec::with_capacity(key_order.len());
    for key in key_order {
        let slab = jacobians.get(key).ok_or(JdError::MissingKey(*key))?;
        if slab.ndim() == 0 {
            return Err(JdError::ShapeMismatch(format!(
                "slab for key {key} has no task axis"
            )));
        }
        let m = slab.shape()[0];
        match rows {
            Some(expected) if expected != m => {
                return Err(JdError::InconsistentShape {
                    key: *key,
                    expected: vec![expected],
                    found: vec![m],
                });
            }
            _ => rows = Some(m),
        }
        slabs.push(slab);
    }
    Ok((rows.unwrap_or(0), slabs))
}

// ─────────────────────────────────────────────────────────────
//  Unifying strategy
// ─────────────────────────────────────────────────────────────

/// Concatenates every slab, flattened, into one (m, n_total) matrix in
/// `key_order`, aggregates it with a single call, and splits the result
/// back into one tensor per key with that key's parameter shape.
#[derive(Debug, Clone)]
pub struct UnifyingStrategy<A> {
    aggregator: A,
    key_order: Vec<ParameterKey>,
}

impl<A: Aggregator> UnifyingStrategy<A> {
    pub fn new(aggregator: A, key_order: Vec<ParameterKey>) -> Self {
        Self { aggregator, key_order }
    }

    pub fn key_order(&self) -> &[ParameterKey] {
        &self.key_order
    }
}

impl<A: Aggregator> Strategy for UnifyingStrategy<A> {
    fn reduce(&self, jacobians: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let (m, slabs) = ordered_slabs(jacobians, &self.key_order)?;

        let blocks = slabs
            .iter()
            .map(|slab| flatten_rows(slab))
            .collect::<Result<Vec<_>, _>>()?;
        let n_total: usize = blocks.iter().map(|b| b.ncols()).sum();

        let mut matrix = Array2::<f64>::zeros((m, n_total));
        let mut offset = 0;
        for block in &blocks {
            assign_columns(&mut matrix, offset, block);
            offset += block.ncols();
        }

        log::debug!(
            "aggregating {} keys as one {}x{} jacobian",
            self.key_order.len(),
            m,
            n_total
        );
        let aggregated = self.aggregator.reduce(matrix.view())?;
        if aggregated.len() != n_total {
            return Err(JdError::ShapeMismatch(format!(
                "aggregator returned {} values for {} columns",
                aggregated.len(),
                n_total
            )));
        }

        let mut output = KeyedTensorDict::with_capacity(self.key_order.len());
        let mut offset = 0;
        for ((key, slab), block) in self.key_order.iter().zip(&slabs).zip(&blocks) {
            let width = block.ncols();
            let chunk = aggregated.slice(s![offset..offset + width]).to_owned();
            output.insert(*key, unflatten(chunk, &slab.shape()[1..])?);
            offset += width;
        }
        Ok(output)
    }
}

impl<A: Aggregator> Transform for UnifyingStrategy<A> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        self.reduce(input)
    }
}

// ─────────────────────────────────────────────────────────────
//  Separating strategy
// ─────────────────────────────────────────────────────────────

/// One aggregator call per key: every parameter gets its own weights.
#[derive(Debug, Clone)]
pub struct SeparatingStrategy<A> {
    aggregator: A,
    key_order: Vec<ParameterKey>,
}

impl<A: Aggregator> SeparatingStrategy<A> {
    pub fn new(aggregator: A, key_order: Vec<ParameterKey>) -> Self {
        Self { aggregator, key_order }
    }

    pub fn key_order(&self) -> &[ParameterKey] {
        &self.key_order
    }
}

impl<A: Aggregator> Strategy for SeparatingStrategy<A> {
    fn reduce(&self, jacobians: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let (_, slabs) = ordered_slabs(jacobians, &self.key_order)?;

        let mut output = KeyedTensorDict::with_capacity(self.key_order.len());
        for (key, slab) in self.key_order.iter().zip(slabs) {
            let matrix = flatten_rows(slab)?;
            let aggregated = self.aggregator.reduce(matrix.view())?;
            output.insert(*key, unflatten(aggregated, &slab.shape()[1..])?);
        }
        Ok(output)
    }
}

impl<A: Aggregator> Transform for SeparatingStrategy<A> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        self.reduce(input)
    }
}
