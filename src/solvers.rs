//! Numeric kernels shared by the weightings: Gramian helpers, the
//! Frank-Wolfe min-norm solve and the dual-cone projection QP.
//!
//! Everything here works on the m × m Gramian G = J Jᵀ rather than on the
//! Jacobian itself, so the cost is independent of the parameter count n
//! once G has been formed.

use crate::types::{MgdaOptions, ProjectionOptions, SolveStatus};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

// ─────────────────────────────────────────────────────────────
//  Gramian
// ─────────────────────────────────────────────────────────────

/// G = J Jᵀ  (m × m, symmetric positive semi-definite).
pub fn gramian(jacobian: &ArrayView2<f64>) -> Array2<f64> {
    jacobian.dot(&jacobian.t())
}

/// Scale G to unit trace.  Returns the zero matrix when the trace is below
/// `eps`, which happens when every row of J is (numerically) zero.
pub fn normalize_gramian(gramian: &Array2<f64>, eps: f64) -> Array2<f64> {
    let trace = gramian.diag().sum();
    if trace < eps {
        Array2::zeros(gramian.raw_dim())
    } else {
        gramian / trace
    }
}

/// G ← G + eps·I
pub fn regularize_gramian(gramian: &mut Array2<f64>, eps: f64) {
    gramian.diag_mut().mapv_inplace(|d| d + eps);
}

// ─────────────────────────────────────────────────────────────
//  Min-norm point of the convex hull  (Frank-Wolfe)
// ─────────────────────────────────────────────────────────────

/// Find α on the simplex minimising αᵀ G α.
///
/// Frank-Wolfe with away steps, starting from the uniform point.  With
/// g = Gα and b = αᵀg, each iteration compares
///
///   toward step:  t = argmin g,               gap b − g_t
///   away step:    s = argmax {g_i : α_i > 0},  gap g_s − b
///
/// and takes the larger one with an exact line search.  The toward step with
/// a = g_t, c = G_tt is the classic one:
///
///   γ = 1 if c ≤ a,  0 if b ≤ a,  else (b − a) / (b + c − 2a)
///
/// An away step that hits its bound drops s from the support.
///
/// Stops once g_s − g_t ≤ `epsilon`·b: every g_i is at least (1 − ε)·b and
/// every g_i on the support is at most (1 + ε)·b.  Both sides scale with
/// ‖J‖², so the weights do not depend on the gradient scale.  When
/// `max_iters` is exhausted the last iterate is returned.
pub fn min_norm_frank_wolfe(
    gramian: &ArrayView2<f64>,
    options: &MgdaOptions,
) -> (Array1<f64>, SolveStatus) {
    let m = gramian.nrows();
    let mut alpha = Array1::from_elem(m, 1.0 / m as f64);

    for iteration in 0..options.max_iters {
        let g_alpha = gramian.dot(&alpha);
        let b = alpha.dot(&g_alpha);
        let t = argmin(&g_alpha.view());
        let s = argmax_on_support(&g_alpha.view(), &alpha.view());

        let toward = b - g_alpha[t];
        let away = g_alpha[s] - b;
        if g_alpha[s] - g_alpha[t] <= options.epsilon * b {
            return (alpha, SolveStatus::Converged { iterations: iteration });
        }

        if toward >= away {
            let (a, c) = (g_alpha[t], gramian[[t, t]]);
            let gamma = if c <= a {
                1.0
            } else if b <= a {
                0.0
            } else {
                (b - a) / (b + c - 2.0 * a)
            };
            alpha *= 1.0 - gamma;
            alpha[t] += gamma;
        } else {
            // Direction α − e_s, feasible up to α_s / (1 − α_s).
            let bound = alpha[s] / (1.0 - alpha[s]);
            let curvature = b - 2.0 * g_alpha[s] + gramian[[s, s]];
            let gamma = if curvature > 0.0 {
                (away / curvature).min(bound)
            } else {
                bound
            };
            alpha *= 1.0 + gamma;
            alpha[s] -= gamma;
            if gamma >= bound || alpha[s] < 0.0 {
                alpha[s] = 0.0;
            }
        }
    }

    log::debug!(
        "min-norm solve stopped after {} iterations without reaching epsilon = {:e}",
        options.max_iters,
        options.epsilon,
    );
    (alpha, SolveStatus::MaxIterationsReached { iterations: options.max_iters })
}

/// Index of the smallest entry; the first one wins on ties.
fn argmin(v: &ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &x) in v.iter().enumerate() {
        if x < v[best] {
            best = i;
        }
    }
    best
}

/// Index of the largest entry among those with positive weight.
fn argmax_on_support(v: &ArrayView1<f64>, weights: &ArrayView1<f64>) -> usize {
    let mut best = None;
    for (i, (&x, &w)) in v.iter().zip(weights.iter()).enumerate() {
        if w > 0.0 && best.map_or(true, |j: usize| x > v[j]) {
            best = Some(i);
        }
    }
    best.unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────
//  Dual-cone projection  (box-constrained QP)
// ─────────────────────────────────────────────────────────────

/// Solve   min_v  ½ vᵀ G v   s.t.  v ≥ lower
///
/// by projected Gauss-Seidel.  Each coordinate step is the exact minimiser
/// along that coordinate, clamped to its bound:
///
///   v_k ← max(lower_k, v_k − (G v)_k / G_kk)
///
/// The residual r = G v is updated incrementally, so a sweep costs O(m²)
/// and coordinates sitting on their bound cost nothing.  A coordinate with
/// G_kk ≤ 0 has no influence on the objective and stays on its bound.
///
/// At the optimum G v ≥ 0, i.e. Jᵀv has a non-negative inner product with
/// every row of J.
pub fn project_dual_cone(
    gramian: &ArrayView2<f64>,
    lower: &ArrayView1<f64>,
    options: &ProjectionOptions,
) -> (Array1<f64>, SolveStatus) {
    let m = gramian.nrows();
    let mut v = lower.to_owned();
    let mut residual = gramian.dot(&v);

    for sweep in 1..=options.max_iterations {
        let mut max_step = 0.0_f64;

        for k in 0..m {
            let gkk = gramian[[k, k]];
            let target = if gkk > 0.0 {
                (v[k] - residual[k] / gkk).max(lower[k])
            } else {
                lower[k]
            };

            let step = target - v[k];
            if step != 0.0 {
                v[k] = target;
                residual.scaled_add(step, &gramian.row(k));
                max_step = max_step.max(step.abs());
            }
        }

        if max_step <= options.tolerance {
            return (v, SolveStatus::Converged { iterations: sweep });
        }
    }

    log::debug!(
        "dual-cone projection stopped after {} sweeps without reaching tolerance = {:e}",
        options.max_iterations,
        options.tolerance,
    );
    (v, SolveStatus::MaxIterationsReached { iterations: options.max_iterations })
}
