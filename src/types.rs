use ndarray::{ArrayD, ArrayView2};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, JdError>`
/// instead of panicking.  The FFI layer translates these into integer
/// return codes + a thread-local error message.
#[derive(Debug, Clone, PartialEq)]
pub enum JdError {
    /// The Jacobian has no rows (no tasks / no losses).
    EmptyJacobian,
    /// Matrix is not 2-D, has no columns, or a vector has the wrong length.
    ShapeMismatch(String),
    /// The same key was seen with two different tensor shapes.
    InconsistentShape {
        key: ParameterKey,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// A key required by a transform or strategy is absent from its input.
    MissingKey(ParameterKey),
    /// A key appeared where the configured key set does not allow it.
    UnexpectedKey(ParameterKey),
    /// Two transforms of a conjunction produced the same key.
    DuplicateKey(ParameterKey),
    /// `parallel_chunk_size` was `Some(0)`.
    InvalidChunkSize,
    /// The differentiation black box reported a failure.
    Differentiation(String),
}

impl fmt::Display for JdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyJacobian => write!(f, "empty jacobian: at least one task is required"),
            Self::ShapeMismatch(msg) => write!(f, "shape mismatch: {msg}"),
            Self::InconsistentShape { key, expected, found } => write!(
                f,
                "inconsistent shape for key {key}: expected {expected:?}, found {found:?}"
            ),
            Self::MissingKey(key) => write!(f, "key {key} is missing from the input"),
            Self::UnexpectedKey(key) => write!(f, "key {key} is not part of the configured key set"),
            Self::DuplicateKey(key) => write!(f, "key {key} was produced more than once"),
            Self::InvalidChunkSize => write!(f, "parallel_chunk_size must be at least 1"),
            Self::Differentiation(msg) => write!(f, "differentiation failed: {msg}"),
        }
    }
}

impl std::error::Error for JdError {}

/// Check that `jacobian` has at least one row and one column.
///
/// Zero rows is `EmptyJacobian`; zero columns is a shape error.
pub fn check_jacobian(jacobian: &ArrayView2<f64>) -> Result<(), JdError> {
    let (m, n) = jacobian.dim();
    if m == 0 {
        return Err(JdError::EmptyJacobian);
    }
    if n == 0 {
        return Err(JdError::ShapeMismatch(format!("jacobian has {m} rows but no columns")));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Tensors and keys
// ─────────────────────────────────────────────────────────────

/// Dense tensor of any rank.  Parameters, per-task gradients and Jacobian
/// slabs all use this representation.
pub type Tensor = ArrayD<f64>;

static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// Opaque identity of one parameter tensor.
///
/// Keys are never reused within a process, so the same key seen in two
/// per-task gradient dicts always refers to the same parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey(u64);

impl ParameterKey {
    /// Allocate a fresh key.
    pub fn fresh() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────
//  Parameters
// ─────────────────────────────────────────────────────────────

/// A trainable tensor together with its gradient slot.
#[derive(Debug, Clone)]
pub struct Parameter {
    key: ParameterKey,
    name: Option<String>,
    pub value: Tensor,
    /// Written by [`crate::backward::backward`]; `None` until the first call.
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self {
            key: ParameterKey::fresh(),
            name: None,
            value,
            grad: None,
        }
    }

    pub fn named(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(value)
        }
    }

    pub fn key(&self) -> ParameterKey {
        self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
}

// ─────────────────────────────────────────────────────────────
//  Keyed tensor dict  (insertion-ordered)
// ─────────────────────────────────────────────────────────────

/// Ordered mapping `ParameterKey → Tensor`, the data format passed between
/// transforms.
///
/// Iteration follows insertion order; re-inserting an existing key replaces
/// its tensor in place without moving it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedTensorDict {
    entries: Vec<(ParameterKey, Tensor)>,
    index: HashMap<ParameterKey, usize>,
}

impl KeyedTensorDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Insert `tensor` under `key`, returning the previous tensor if any.
    pub fn insert(&mut self, key: ParameterKey, tensor: Tensor) -> Option<Tensor> {
        match self.index.get(&key) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos].1, tensor)),
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push((key, tensor));
                None
            }
        }
    }

    pub fn get(&self, key: &ParameterKey) -> Option<&Tensor> {
        self.index.get(key).map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, key: &ParameterKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ParameterKey> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterKey, &Tensor)> {
        self.entries.iter().map(|(k, t)| (*k, t))
    }
}

impl FromIterator<(ParameterKey, Tensor)> for KeyedTensorDict {
    fn from_iter<I: IntoIterator<Item = (ParameterKey, Tensor)>>(iter: I) -> Self {
        let mut dict = Self::new();
        for (key, tensor) in iter {
            dict.insert(key, tensor);
        }
        dict
    }
}

impl IntoIterator for KeyedTensorDict {
    type Item = (ParameterKey, Tensor);
    type IntoIter = std::vec::IntoIter<(ParameterKey, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// ─────────────────────────────────────────────────────────────
//  Solve status  (iterative weightings)
// ─────────────────────────────────────────────────────────────

/// How a weighting arrived at its result.
///
/// Iterative weightings never fail for running out of iterations; they
/// return their last iterate and report `MaxIterationsReached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Closed form, no iteration involved.
    Exact,
    Converged { iterations: usize },
    MaxIterationsReached { iterations: usize },
}

impl SolveStatus {
    pub fn converged(&self) -> bool {
        !matches!(self, Self::MaxIterationsReached { .. })
    }

    /// Combine the statuses of several sub-solves: the result is only
    /// converged if every part converged.
    pub fn merge(self, other: SolveStatus) -> SolveStatus {
        use SolveStatus::*;
        match (self, other) {
            (Exact, s) | (s, Exact) => s,
            (MaxIterationsReached { iterations: a }, MaxIterationsReached { iterations: b })
            | (MaxIterationsReached { iterations: a }, Converged { iterations: b })
            | (Converged { iterations: a }, MaxIterationsReached { iterations: b }) => {
                MaxIterationsReached { iterations: a.max(b) }
            }
            (Converged { iterations: a }, Converged { iterations: b }) => {
                Converged { iterations: a.max(b) }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver options
// ─────────────────────────────────────────────────────────────

/// Frank-Wolfe settings for the min-norm (MGDA) weighting.
#[derive(Debug, Clone)]
pub struct MgdaOptions {
    /// Stop once the spread of Gα over the support falls below this
    /// fraction of αᵀGα.
    pub epsilon: f64,
    pub max_iters: usize,
}

impl Default for MgdaOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            max_iters: 100,
        }
    }
}

/// Settings for the dual-cone projection used by UPGrad and DualProj.
#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// The Gramian is divided by its trace; below this trace it is zeroed.
    pub norm_eps: f64,
    /// Added to the Gramian diagonal after normalisation.
    pub reg_eps: f64,
    /// Stop when no coordinate moves by more than this in a full sweep.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            norm_eps: 1e-4,
            reg_eps: 1e-4,
            tolerance: 1e-10,
            max_iterations: 1000,
        }
    }
}

/// Options for [`crate::backward::backward_with_options`].
#[derive(Debug, Clone, Default)]
pub struct BackwardOptions {
    /// Maximum number of losses differentiated and stacked together.
    /// `None` processes every loss in a single chunk.
    pub parallel_chunk_size: Option<usize>,
}
