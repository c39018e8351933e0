//! Boundary with the differentiation engine.
//!
//! Gradients of individual scalar losses are not computed by this crate.
//! A loss is anything implementing [`Differentiable`]: a hand-coded adjoint,
//! a binding to an external autodiff engine, or a closure wrapped with
//! [`loss_fn`].  [`LinearMap`] is the one concrete implementation shipped
//! here; its component losses have exact, closed-form gradients.

use crate::types::{JdError, KeyedTensorDict, Parameter, ParameterKey};
use ndarray::{Array1, Array2, Ix1};

/// A scalar loss that can report its gradient w.r.t. a set of parameters.
pub trait Differentiable {
    /// Gradient of the loss w.r.t. each key in `targets`.
    ///
    /// Keys the loss does not depend on may be omitted; an omitted key means
    /// a zero gradient.  Keys outside `targets` must not appear.
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError>;
}

impl<T: Differentiable + ?Sized> Differentiable for &T {
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError> {
        (**self).gradients(targets)
    }
}

impl<T: Differentiable + ?Sized> Differentiable for Box<T> {
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError> {
        (**self).gradients(targets)
    }
}

// ─────────────────────────────────────────────────────────────
//  Closure adaptor
// ─────────────────────────────────────────────────────────────

/// A loss whose gradients come from a closure.
pub struct FnLoss<F>(F);

/// Wrap `f` as a [`Differentiable`] loss.
pub fn loss_fn<F>(f: F) -> FnLoss<F>
where
    F: Fn(&[ParameterKey]) -> Result<KeyedTensorDict, JdError>,
{
    FnLoss(f)
}

impl<F> Differentiable for FnLoss<F>
where
    F: Fn(&[ParameterKey]) -> Result<KeyedTensorDict, JdError>,
{
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError> {
        (self.0)(targets)
    }
}

// ─────────────────────────────────────────────────────────────
//  Linear map  output = J · input
// ─────────────────────────────────────────────────────────────

/// `output = J · input` for a 1-D parameter `input`.
///
/// Output component i is a scalar loss whose gradient w.r.t. `input` is
/// row i of J, so differentiating every component reproduces J exactly.
#[derive(Debug, Clone)]
pub struct LinearMap {
    jacobian: Array2<f64>,
    input: ParameterKey,
}

impl LinearMap {
    /// Fails with [`JdError::ShapeMismatch`] unless `input` is a vector with
    /// one entry per column of `jacobian`.
    pub fn new(jacobian: Array2<f64>, input: &Parameter) -> Result<Self, JdError> {
        if input.shape() != [jacobian.ncols()] {
            return Err(JdError::ShapeMismatch(format!(
                "input of shape {:?} does not match a jacobian with {} columns",
                input.shape(),
                jacobian.ncols()
            )));
        }
        Ok(Self { jacobian, input: input.key() })
    }

    /// Evaluate J · input.
    pub fn forward(&self, input: &Parameter) -> Result<Array1<f64>, JdError> {
        if input.key() != self.input {
            return Err(JdError::UnexpectedKey(input.key()));
        }
        let x = input
            .value
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| JdError::ShapeMismatch(e.to_string()))?;
        Ok(self.jacobian.dot(&x))
    }

    /// One scalar loss per output component, in row order.
    pub fn outputs(&self) -> Vec<LinearOutput<'_>> {
        (0..self.jacobian.nrows())
            .map(|row| LinearOutput { map: self, row })
            .collect()
    }
}

/// Component `row` of a [`LinearMap`]'s output.
#[derive(Debug, Clone, Copy)]
pub struct LinearOutput<'a> {
    map: &'a LinearMap,
    row: usize,
}

impl Differentiable for LinearOutput<'_> {
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError> {
        let mut grads = KeyedTensorDict::new();
        if targets.contains(&self.map.input) {
            grads.insert(self.map.input, self.map.jacobian.row(self.row).to_owned().into_dyn());
        }
        Ok(grads)
    }
}
