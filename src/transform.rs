//! Transforms over [`KeyedTensorDict`]s.
//!
//! A transform maps one keyed dict to another.  Transforms compose
//! ([`Composition`], [`Transform::then`]) and combine ([`Stack`],
//! [`Conjunction`]) into the pipeline that turns per-task losses into per-key
//! Jacobian slabs:
//!
//!   Gradients(loss₁) ┐
//!   Gradients(loss₂) ├─ Stack ─→ { key: (m, *shape) }
//!   Gradients(lossₘ) ┘
//!
//! Ordering rules: every transform emits keys in a deterministic order
//! derived from its inputs (first-seen order for `Stack`, input order for
//! `Select`, configured order for `Diagonalize`).

use crate::differentiable::Differentiable;
use crate::types::{JdError, KeyedTensorDict, ParameterKey, Tensor};
use ndarray::{s, Array1, Array2, Axis, IxDyn};
use std::collections::{HashMap, HashSet};

// ─────────────────────────────────────────────────────────────
//  Transform trait
// ─────────────────────────────────────────────────────────────

/// A function `KeyedTensorDict → KeyedTensorDict`.
pub trait Transform {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError>;

    /// `outer ∘ self`: apply `self`, then `outer`.
    fn then<T: Transform>(self, outer: T) -> Composition<T, Self>
    where
        Self: Sized,
    {
        Composition::new(outer, self)
    }
}

impl<T: Transform + ?Sized> Transform for &T {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        (**self).apply(input)
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        (**self).apply(input)
    }
}

// ─────────────────────────────────────────────────────────────
//  Composition
// ─────────────────────────────────────────────────────────────

/// `outer(inner(x))`
#[derive(Debug, Clone)]
pub struct Composition<O, I> {
    outer: O,
    inner: I,
}

impl<O: Transform, I: Transform> Composition<O, I> {
    pub fn new(outer: O, inner: I) -> Self {
        Self { outer, inner }
    }
}

impl<O: Transform, I: Transform> Transform for Composition<O, I> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let intermediate = self.inner.apply(input)?;
        self.outer.apply(&intermediate)
    }
}

// ─────────────────────────────────────────────────────────────
//  Gradients  (differentiation boundary)
// ─────────────────────────────────────────────────────────────

/// Differentiates one scalar loss w.r.t. a fixed set of parameters.
///
/// The input dict is not read: this transform is a pipeline root and is
/// normally applied to the empty dict.  Keys the loss does not depend on are
/// left out of the output rather than materialised as zeros.
#[derive(Debug, Clone)]
pub struct Gradients<L> {
    loss: L,
    targets: Vec<ParameterKey>,
}

impl<L: Differentiable> Gradients<L> {
    pub fn new(loss: L, targets: Vec<ParameterKey>) -> Self {
        Self { loss, targets }
    }
}

impl<L: Differentiable> Transform for Gradients<L> {
    fn apply(&self, _input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let grads = self.loss.gradients(&self.targets)?;
        if let Some(key) = grads.keys().find(|k| !self.targets.contains(k)) {
            return Err(JdError::UnexpectedKey(key));
        }
        Ok(grads)
    }
}

// ─────────────────────────────────────────────────────────────
//  Stack
// ─────────────────────────────────────────────────────────────

/// Runs k transforms on the same input and stacks their outputs into
/// per-key slabs of shape (k, *shape); see [`stack_dicts`].
#[derive(Debug, Clone)]
pub struct Stack<T> {
    transforms: Vec<T>,
}

impl<T: Transform> Stack<T> {
    pub fn new(transforms: Vec<T>) -> Self {
        Self { transforms }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl<T: Transform> Transform for Stack<T> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let dicts = self
            .transforms
            .iter()
            .map(|t| t.apply(input))
            .collect::<Result<Vec<_>, _>>()?;
        stack_dicts(&dicts)
    }
}

/// Stack k dicts along a new leading axis.
///
/// The output has one entry per key in the union of the inputs, in
/// first-seen order.  Row i of a key's slab is input i's tensor for that
/// key, or zeros if input i lacks it.  A key seen with two different shapes
/// fails with [`JdError::InconsistentShape`].
pub fn stack_dicts(dicts: &[KeyedTensorDict]) -> Result<KeyedTensorDict, JdError> {
    let shapes = union_shapes(
        dicts.iter().map(|d| d.iter().map(|(key, tensor)| (key, tensor.shape()))),
    )?;
    let k = dicts.len();

    let mut output = KeyedTensorDict::with_capacity(shapes.len());
    for (key, shape) in shapes {
        let mut slab = Tensor::zeros(IxDyn(&leading(k, &shape)));
        for (i, dict) in dicts.iter().enumerate() {
            if let Some(tensor) = dict.get(&key) {
                slab.index_axis_mut(Axis(0), i).assign(tensor);
            }
        }
        output.insert(key, slab);
    }
    Ok(output)
}

/// Join stacked blocks along their leading axis.
///
/// Each block is `(rows, slabs)` where every slab in `slabs` has `rows`
/// leading entries.  Keys a block lacks are zero-filled over that block's
/// rows, so the result is what a single [`stack_dicts`] over all the
/// underlying dicts would have produced.
pub fn concat_slabs(blocks: &[(usize, KeyedTensorDict)]) -> Result<KeyedTensorDict, JdError> {
    for (rows, slabs) in blocks {
        for (key, slab) in slabs.iter() {
            if slab.ndim() == 0 || slab.shape()[0] != *rows {
                return Err(JdError::InconsistentShape {
                    key,
                    expected: leading(*rows, slab.shape().get(1..).unwrap_or(&[])),
                    found: slab.shape().to_vec(),
                });
            }
        }
    }

    let shapes = union_shapes(blocks.iter().map(|(_, slabs)| {
        slabs.iter().map(|(key, slab)| (key, trailing(slab)))
    }))?;
    let total: usize = blocks.iter().map(|(rows, _)| rows).sum();

    let mut output = KeyedTensorDict::with_capacity(shapes.len());
    for (key, shape) in shapes {
        let mut slab = Tensor::zeros(IxDyn(&leading(total, &shape)));
        let mut offset = 0;
        for (rows, slabs) in blocks {
            if let Some(block) = slabs.get(&key) {
                slab.slice_axis_mut(Axis(0), (offset..offset + rows).into())
                    .assign(block);
            }
            offset += rows;
        }
        output.insert(key, slab);
    }
    Ok(output)
}

/// Union of keys in first-seen order, with the shape each key must have.
fn union_shapes<'s, O, I>(sources: O) -> Result<Vec<(ParameterKey, Vec<usize>)>, JdError>
where
    O: IntoIterator<Item = I>,
    I: IntoIterator<Item = (ParameterKey, &'s [usize])>,
{
    let mut order: Vec<(ParameterKey, Vec<usize>)> = Vec::new();
    let mut seen: HashMap<ParameterKey, usize> = HashMap::new();

    for source in sources {
        for (key, shape) in source {
            match seen.get(&key) {
                Some(&pos) => {
                    if order[pos].1 != shape {
                        return Err(JdError::InconsistentShape {
                            key,
                            expected: order[pos].1.clone(),
                            found: shape.to_vec(),
                        });
                    }
                }
                None => {
                    seen.insert(key, order.len());
                    order.push((key, shape.to_vec()));
                }
            }
        }
    }
    Ok(order)
}

fn leading(rows: usize, shape: &[usize]) -> Vec<usize> {
    let mut full = Vec::with_capacity(shape.len() + 1);
    full.push(rows);
    full.extend_from_slice(shape);
    full
}

fn trailing(slab: &Tensor) -> &[usize] {
    &slab.shape()[1..]
}

// ─────────────────────────────────────────────────────────────
//  Select / Reorder
// ─────────────────────────────────────────────────────────────

/// Keep only `keys`, in the order they appear in the input.
#[derive(Debug, Clone)]
pub struct Select {
    keys: Vec<ParameterKey>,
}

impl Select {
    pub fn new(keys: Vec<ParameterKey>) -> Self {
        Self { keys }
    }
}

impl Transform for Select {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        if let Some(&missing) = self.keys.iter().find(|k| !input.contains_key(k)) {
            return Err(JdError::MissingKey(missing));
        }
        let wanted: HashSet<ParameterKey> = self.keys.iter().copied().collect();
        Ok(input
            .iter()
            .filter(|(key, _)| wanted.contains(key))
            .map(|(key, tensor)| (key, tensor.clone()))
            .collect())
    }
}

/// Emit the listed keys first, in the listed order, then every other input
/// key in input order.
#[derive(Debug, Clone)]
pub struct Reorder {
    key_order: Vec<ParameterKey>,
}

impl Reorder {
    pub fn new(key_order: Vec<ParameterKey>) -> Self {
        Self { key_order }
    }
}

impl Transform for Reorder {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let mut output = KeyedTensorDict::with_capacity(input.len());
        for key in &self.key_order {
            let tensor = input.get(key).ok_or(JdError::MissingKey(*key))?;
            output.insert(*key, tensor.clone());
        }
        for (key, tensor) in input.iter() {
            if !output.contains_key(&key) {
                output.insert(key, tensor.clone());
            }
        }
        Ok(output)
    }
}

// ─────────────────────────────────────────────────────────────
//  Conjunction
// ─────────────────────────────────────────────────────────────

/// Runs several transforms on the same input and merges their outputs in
/// transform order.  The output key sets must be disjoint.
#[derive(Debug, Clone)]
pub struct Conjunction<T> {
    transforms: Vec<T>,
}

impl<T: Transform> Conjunction<T> {
    pub fn new(transforms: Vec<T>) -> Self {
        Self { transforms }
    }
}

impl<T: Transform> Transform for Conjunction<T> {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        let mut output = KeyedTensorDict::new();
        for transform in &self.transforms {
            for (key, tensor) in transform.apply(input)? {
                if output.insert(key, tensor).is_some() {
                    return Err(JdError::DuplicateKey(key));
                }
            }
        }
        Ok(output)
    }
}

// ─────────────────────────────────────────────────────────────
//  Diagonalize
// ─────────────────────────────────────────────────────────────

/// Spread the entries of the input tensors onto the diagonal of an
/// N × N matrix, N being their total size, and hand each key its block of
/// columns reshaped to (N, *shape).
///
/// Row r of the output holds a single nonzero value, the r-th input scalar,
/// at its own position: applied to a vector of cotangents this yields one
/// cotangent per output component.
#[derive(Debug, Clone)]
pub struct Diagonalize {
    key_order: Vec<ParameterKey>,
}

impl Diagonalize {
    pub fn new(key_order: Vec<ParameterKey>) -> Self {
        Self { key_order }
    }
}

impl Transform for Diagonalize {
    fn apply(&self, input: &KeyedTensorDict) -> Result<KeyedTensorDict, JdError> {
        if let Some(extra) = input.keys().find(|k| !self.key_order.contains(k)) {
            return Err(JdError::UnexpectedKey(extra));
        }
        let tensors = self
            .key_order
            .iter()
            .map(|key| input.get(key).ok_or(JdError::MissingKey(*key)))
            .collect::<Result<Vec<_>, _>>()?;

        let total: usize = tensors.iter().map(|t| t.len()).sum();

        let mut output = KeyedTensorDict::with_capacity(tensors.len());
        let mut offset = 0;
        for (key, tensor) in self.key_order.iter().zip(tensors) {
            let size = tensor.len();
            let mut block = Array2::<f64>::zeros((total, size));
            for (j, &value) in tensor.iter().enumerate() {
                block[[offset + j, j]] = value;
            }
            output.insert(*key, unflatten_rows(block, tensor.shape())?);
            offset += size;
        }
        Ok(output)
    }
}

// ─────────────────────────────────────────────────────────────
//  Flattening helpers  (shared with strategies)
// ─────────────────────────────────────────────────────────────

/// Row-major flattening of a tensor of any rank.
pub fn flatten(tensor: &Tensor) -> Array1<f64> {
    tensor.iter().copied().collect()
}

/// Inverse of [`flatten`] for a given target shape.
pub fn unflatten(vector: Array1<f64>, shape: &[usize]) -> Result<Tensor, JdError> {
    vector
        .into_shape_with_order(IxDyn(shape))
        .map_err(|e| JdError::ShapeMismatch(format!("cannot reshape to {shape:?}: {e}")))
}

/// View a slab (m, *shape) as an (m, size) matrix, copying only when the
/// slab is not contiguous.
pub fn flatten_rows(slab: &Tensor) -> Result<Array2<f64>, JdError> {
    if slab.ndim() == 0 {
        return Err(JdError::ShapeMismatch(
            "a jacobian slab needs a leading task axis".to_string(),
        ));
    }
    let rows = slab.shape()[0];
    let size: usize = trailing(slab).iter().product();
    let matrix = slab
        .to_shape((rows, size))
        .map_err(|e| JdError::ShapeMismatch(e.to_string()))?;
    Ok(matrix.into_owned())
}

/// Inverse of [`flatten_rows`].
pub fn unflatten_rows(matrix: Array2<f64>, shape: &[usize]) -> Result<Tensor, JdError> {
    let full = leading(matrix.nrows(), shape);
    let matrix = if matrix.is_standard_layout() {
        matrix
    } else {
        matrix.as_standard_layout().into_owned()
    };
    matrix
        .into_shape_with_order(IxDyn(&full))
        .map_err(|e| JdError::ShapeMismatch(format!("cannot reshape to {full:?}: {e}")))
}

/// Copy `block` into the columns of `matrix` starting at `offset`.
pub(crate) fn assign_columns(matrix: &mut Array2<f64>, offset: usize, block: &Array2<f64>) {
    let width = block.ncols();
    matrix.slice_mut(s![.., offset..offset + width]).assign(block);
}
