//! Weighting strategies: Jacobian (m × n) → weight vector (m).
//!
//! Each weighting is a pure function of its input matrix (the random one is
//! pure given its generator state).  Weights are positionally aligned with
//! the Jacobian rows.

use crate::solvers::{
    gramian, min_norm_frank_wolfe, normalize_gramian, project_dual_cone, regularize_gramian,
};
use crate::types::{check_jacobian, JdError, MgdaOptions, ProjectionOptions, SolveStatus};
use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fmt::{self, Debug};
use std::sync::Mutex;

// ─────────────────────────────────────────────────────────────
//  Weighting trait
// ─────────────────────────────────────────────────────────────

/// Weights together with how they were obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightingOutput {
    pub weights: Array1<f64>,
    pub status: SolveStatus,
}

impl WeightingOutput {
    pub fn exact(weights: Array1<f64>) -> Self {
        Self { weights, status: SolveStatus::Exact }
    }
}

/// Maps a Jacobian to one weight per row.
///
/// Implementations must reject an empty Jacobian with
/// [`JdError::EmptyJacobian`] and a Jacobian without columns with
/// [`JdError::ShapeMismatch`].  Iterative implementations never fail for
/// non-convergence; they report it through [`WeightingOutput::status`].
pub trait Weighting: Debug + Send + Sync {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError>;

    fn compute(&self, jacobian: ArrayView2<f64>) -> Result<Array1<f64>, JdError> {
        Ok(self.compute_with_status(jacobian)?.weights)
    }
}

impl<W: Weighting + ?Sized> Weighting for Box<W> {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        (**self).compute_with_status(jacobian)
    }
}

/// Fail unless `weights` has exactly one entry per Jacobian row.
pub(crate) fn check_weights(weights: &Array1<f64>, num_rows: usize) -> Result<(), JdError> {
    if weights.len() != num_rows {
        return Err(JdError::ShapeMismatch(format!(
            "expected {num_rows} weights, got {}",
            weights.len()
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Closed-form weightings
// ─────────────────────────────────────────────────────────────

/// 1/m for every task.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanWeighting;

impl Weighting for MeanWeighting {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        let m = jacobian.nrows();
        Ok(WeightingOutput::exact(Array1::from_elem(m, 1.0 / m as f64)))
    }
}

/// 1 for every task.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumWeighting;

impl Weighting for SumWeighting {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        Ok(WeightingOutput::exact(Array1::ones(jacobian.nrows())))
    }
}

/// A fixed weight vector, independent of the Jacobian's values.
#[derive(Debug, Clone)]
pub struct ConstantWeighting {
    weights: Array1<f64>,
}

impl ConstantWeighting {
    pub fn new(weights: Array1<f64>) -> Self {
        Self { weights }
    }
}

impl Weighting for ConstantWeighting {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        check_weights(&self.weights, jacobian.nrows())?;
        Ok(WeightingOutput::exact(self.weights.clone()))
    }
}

// ─────────────────────────────────────────────────────────────
//  Random weighting
// ─────────────────────────────────────────────────────────────

/// Softmax of m independent standard normal draws: a random point in the
/// interior of the probability simplex, redrawn on every call.
pub struct RandomWeighting {
    rng: Mutex<StdRng>,
}

impl RandomWeighting {
    pub fn new(rng: StdRng) -> Self {
        Self { rng: Mutex::new(rng) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl Default for RandomWeighting {
    fn default() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl Debug for RandomWeighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomWeighting").finish_non_exhaustive()
    }
}

impl Weighting for RandomWeighting {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        let m = jacobian.nrows();

        let logits: Array1<f64> = {
            // A panic while holding the lock cannot leave the generator in
            // an invalid state, so a poisoned lock is still usable.
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (0..m).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
        };

        Ok(WeightingOutput::exact(softmax(&logits)))
    }
}

fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max = logits.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x));
    let exp = logits.mapv(|x| (x - max).exp());
    let total = exp.sum();
    exp / total
}

// ─────────────────────────────────────────────────────────────
//  MGDA  (min-norm point of the convex hull of the rows)
// ─────────────────────────────────────────────────────────────

/// Multiple-gradient descent weighting: the convex combination of the rows
/// with the smallest norm.
#[derive(Debug, Clone, Default)]
pub struct MgdaWeighting {
    pub options: MgdaOptions,
}

impl MgdaWeighting {
    pub fn new(options: MgdaOptions) -> Self {
        Self { options }
    }
}

impl Weighting for MgdaWeighting {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        let g = gramian(&jacobian);
        let (weights, status) = min_norm_frank_wolfe(&g.view(), &self.options);
        log::trace!("mgda weights {weights} ({status:?})");
        Ok(WeightingOutput { weights, status })
    }
}

// ─────────────────────────────────────────────────────────────
//  UPGrad  (per-task projection onto the dual cone)
// ─────────────────────────────────────────────────────────────

/// Unconflicting projection of gradients.
///
/// The inner weighting gives u.  For each task i the weighted gradient
/// uᵢ gᵢ is projected onto the dual cone of the rows of J, which in weight
/// space is the QP  min vᵀGv  s.t. v ≥ uᵢ eᵢ.  The returned weights are the
/// sum of the m projected weight vectors, so the aggregated direction has a
/// non-negative inner product with every task gradient.
#[derive(Debug, Clone)]
pub struct UpgradWeighting<W = MeanWeighting> {
    inner: W,
    pub options: ProjectionOptions,
}

impl<W: Weighting> UpgradWeighting<W> {
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, ProjectionOptions::default())
    }

    pub fn with_options(inner: W, options: ProjectionOptions) -> Self {
        Self { inner, options }
    }
}

impl Default for UpgradWeighting<MeanWeighting> {
    fn default() -> Self {
        Self::new(MeanWeighting)
    }
}

impl<W: Weighting> Weighting for UpgradWeighting<W> {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;
        let m = jacobian.nrows();

        let inner = self.inner.compute_with_status(jacobian)?;
        check_weights(&inner.weights, m)?;

        let g = projection_gramian(&jacobian, &self.options);

        let mut weights = Array1::zeros(m);
        let mut status = inner.status;
        let mut lower = Array1::zeros(m);
        for i in 0..m {
            lower.fill(0.0);
            lower[i] = inner.weights[i];
            let (projected, s) = project_dual_cone(&g.view(), &lower.view(), &self.options);
            weights += &projected;
            status = status.merge(s);
        }

        log::trace!("upgrad weights {weights} ({status:?})");
        Ok(WeightingOutput { weights, status })
    }
}

// ─────────────────────────────────────────────────────────────
//  DualProj  (single projection of the weighted direction)
// ─────────────────────────────────────────────────────────────

/// Projects the direction produced by the inner weighting onto the dual cone
/// of the rows: min vᵀGv  s.t. v ≥ u.
#[derive(Debug, Clone)]
pub struct DualProjWeighting<W = MeanWeighting> {
    inner: W,
    pub options: ProjectionOptions,
}

impl<W: Weighting> DualProjWeighting<W> {
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, ProjectionOptions::default())
    }

    pub fn with_options(inner: W, options: ProjectionOptions) -> Self {
        Self { inner, options }
    }
}

impl Default for DualProjWeighting<MeanWeighting> {
    fn default() -> Self {
        Self::new(MeanWeighting)
    }
}

impl<W: Weighting> Weighting for DualProjWeighting<W> {
    fn compute_with_status(&self, jacobian: ArrayView2<f64>) -> Result<WeightingOutput, JdError> {
        check_jacobian(&jacobian)?;

        let inner = self.inner.compute_with_status(jacobian)?;
        check_weights(&inner.weights, jacobian.nrows())?;

        let g = projection_gramian(&jacobian, &self.options);
        let (weights, s) = project_dual_cone(&g.view(), &inner.weights.view(), &self.options);
        Ok(WeightingOutput { weights, status: inner.status.merge(s) })
    }
}

/// Normalised and regularised Gramian fed to the projection QP.
fn projection_gramian(
    jacobian: &ArrayView2<f64>,
    options: &ProjectionOptions,
) -> ndarray::Array2<f64> {
    let mut g = normalize_gramian(&gramian(jacobian), options.norm_eps);
    regularize_gramian(&mut g, options.reg_eps);
    g
}
