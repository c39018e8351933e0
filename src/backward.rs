//! Backward driver: per-task losses → aggregated gradient in every
//! parameter's gradient slot.
//!
//! Steps:
//!   1. Split the losses into chunks of at most `parallel_chunk_size`
//!   2. Per chunk: differentiate each loss and stack into per-key slabs
//!   3. Concatenate the chunk slabs in task order
//!   4. Zero-fill parameters no loss depends on, check shapes
//!   5. Aggregate all keys jointly (`UnifyingStrategy`)
//!   6. Overwrite each parameter's `grad`
//!
//! Every fallible step runs before the first gradient slot is written, so
//! an error leaves all parameters untouched.

use crate::aggregation::Aggregator;
use crate::differentiable::Differentiable;
use crate::strategy::{Strategy, UnifyingStrategy};
use crate::transform::{concat_slabs, Gradients, Stack, Transform};
use crate::types::{BackwardOptions, JdError, KeyedTensorDict, Parameter, ParameterKey, Tensor};
use ndarray::IxDyn;
use std::collections::HashSet;

/// Jacobian descent step: differentiate every loss, aggregate the Jacobian
/// with `aggregator`, and write the result into each parameter's `grad`.
///
/// `parallel_chunk_size` bounds how many losses are differentiated and
/// stacked together; `None` handles them all in one chunk.  The result does
/// not depend on the chunk size.
pub fn backward<'p, L, A, P>(
    losses: &[L],
    parameters: P,
    aggregator: &A,
    parallel_chunk_size: Option<usize>,
) -> Result<(), JdError>
where
    L: Differentiable,
    A: Aggregator + ?Sized,
    P: IntoIterator<Item = &'p mut Parameter>,
{
    backward_with_options(
        losses,
        parameters,
        aggregator,
        &BackwardOptions { parallel_chunk_size },
    )
}

/// [`backward`] with its knobs gathered in a [`BackwardOptions`].
pub fn backward_with_options<'p, L, A, P>(
    losses: &[L],
    parameters: P,
    aggregator: &A,
    options: &BackwardOptions,
) -> Result<(), JdError>
where
    L: Differentiable,
    A: Aggregator + ?Sized,
    P: IntoIterator<Item = &'p mut Parameter>,
{
    let mut parameters: Vec<&mut Parameter> = parameters.into_iter().collect();

    if losses.is_empty() {
        return Err(JdError::EmptyJacobian);
    }
    let chunk_size = match options.parallel_chunk_size {
        Some(0) => return Err(JdError::InvalidChunkSize),
        Some(size) => size,
        None => losses.len(),
    };

    let keys: Vec<ParameterKey> = parameters.iter().map(|p| p.key()).collect();
    if keys.is_empty() {
        return Err(JdError::ShapeMismatch("no parameters to differentiate".to_string()));
    }
    let mut unique = HashSet::with_capacity(keys.len());
    if let Some(&dup) = keys.iter().find(|k| !unique.insert(**k)) {
        return Err(JdError::DuplicateKey(dup));
    }

    log::debug!(
        "backward: {} losses, {} parameters, chunks of {}",
        losses.len(),
        keys.len(),
        chunk_size
    );

    // ── 1–3. Per-chunk differentiation and stacking ──
    let empty = KeyedTensorDict::new();
    let mut blocks = Vec::with_capacity(losses.len().div_ceil(chunk_size));
    for (index, chunk) in losses.chunks(chunk_size).enumerate() {
        let stack = Stack::new(
            chunk
                .iter()
                .map(|loss| Gradients::new(loss, keys.clone()))
                .collect(),
        );
        let slabs = stack.apply(&empty)?;
        log::trace!("chunk {index}: {} losses touched {} parameters", chunk.len(), slabs.len());
        blocks.push((chunk.len(), slabs));
    }
    let mut jacobians = concat_slabs(&blocks)?;
    drop(blocks);

    // ── 4. Zero-fill and shape check ──
    let m = losses.len();
    for param in &parameters {
        let key = param.key();
        let found = jacobians.get(&key).map(|slab| slab.shape()[1..].to_vec());
        match found {
            Some(trailing) if trailing != param.shape() => {
                return Err(JdError::InconsistentShape {
                    key,
                    expected: param.shape().to_vec(),
                    found: trailing,
                });
            }
            Some(_) => {}
            None => {
                let mut shape = vec![m];
                shape.extend_from_slice(param.shape());
                jacobians.insert(key, Tensor::zeros(IxDyn(&shape)));
            }
        }
    }

    // ── 5. Joint aggregation ──
    let strategy = UnifyingStrategy::new(aggregator, keys.clone());
    let updates = strategy.reduce(&jacobians)?;
    let grads = keys
        .iter()
        .map(|key| updates.get(key).cloned().ok_or(JdError::MissingKey(*key)))
        .collect::<Result<Vec<_>, _>>()?;

    // ── 6. Write back ──
    for (param, grad) in parameters.iter_mut().zip(grads) {
        param.grad = Some(grad);
    }
    Ok(())
}
