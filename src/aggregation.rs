//! Aggregators: Jacobian (m × n) → update direction (n).
//!
//! The only aggregator shipped here is [`WeightedAggregator`], which pairs a
//! [`Weighting`] with the contraction wᵀ J.  The trait is kept separate so
//! that non-linear aggregators can plug into the same strategies.

use crate::types::{check_jacobian, JdError, SolveStatus, Tensor};
use crate::weighting::{check_weights, Weighting};
use ndarray::{Array1, ArrayView2, Ix2};
use std::fmt::Debug;

// ─────────────────────────────────────────────────────────────
//  Aggregator trait
// ─────────────────────────────────────────────────────────────

/// Reduces a Jacobian to a single vector with one entry per column.
pub trait Aggregator: Debug + Send + Sync {
    /// Aggregated vector plus the status of any iterative sub-solve.
    fn reduce_with_status(&self, jacobian: ArrayView2<f64>) -> Result<(Array1<f64>, SolveStatus), JdError>;

    fn reduce(&self, jacobian: ArrayView2<f64>) -> Result<Array1<f64>, JdError> {
        Ok(self.reduce_with_status(jacobian)?.0)
    }

    /// Dynamic-rank entry point: fails with [`JdError::ShapeMismatch`] unless
    /// `jacobian` is 2-D.
    fn reduce_tensor(&self, jacobian: &Tensor) -> Result<Array1<f64>, JdError> {
        let matrix = jacobian.view().into_dimensionality::<Ix2>().map_err(|_| {
            JdError::ShapeMismatch(format!(
                "expected a 2-D jacobian, got shape {:?}",
                jacobian.shape()
            ))
        })?;
        self.reduce(matrix)
    }
}

impl<A: Aggregator + ?Sized> Aggregator for Box<A> {
    fn reduce_with_status(&self, jacobian: ArrayView2<f64>) -> Result<(Array1<f64>, SolveStatus), JdError> {
        (**self).reduce_with_status(jacobian)
    }
}

impl<A: Aggregator + ?Sized> Aggregator for &A {
    fn reduce_with_status(&self, jacobian: ArrayView2<f64>) -> Result<(Array1<f64>, SolveStatus), JdError> {
        (**self).reduce_with_status(jacobian)
    }
}

// ─────────────────────────────────────────────────────────────
//  Weighted aggregator
// ─────────────────────────────────────────────────────────────

/// `reduce(J) = weighting(J)ᵀ · J`
#[derive(Debug, Clone, Default)]
pub struct WeightedAggregator<W> {
    weighting: W,
}

impl<W: Weighting> WeightedAggregator<W> {
    pub fn new(weighting: W) -> Self {
        Self { weighting }
    }

    pub fn weighting(&self) -> &W {
        &self.weighting
    }
}

impl<W: Weighting> Aggregator for WeightedAggregator<W> {
    fn reduce_with_status(&self, jacobian: ArrayView2<f64>) -> Result<(Array1<f64>, SolveStatus), JdError> {
        check_jacobian(&jacobian)?;
        let output = self.weighting.compute_with_status(jacobian)?;
        check_weights(&output.weights, jacobian.nrows())?;

        if !output.status.converged() {
            log::debug!("{:?} returned a best-effort result: {:?}", self.weighting, output.status);
        }

        Ok((output.weights.dot(&jacobian), output.status))
    }
}
