//! **Jacobian descent** — aggregate per-task gradients into one update.
//!
//! Instead of backpropagating a single scalar loss, every task loss is
//! differentiated separately.  The resulting Jacobian (one row per task) is
//! reduced to a single direction by a pluggable aggregator, some of which
//! guarantee that no task's loss locally increases.
//!
//! 1. **Types** (`types`): keys, parameters, the ordered keyed dict, errors, options.
//! 2. **Solvers** (`solvers`): Gramian helpers, Frank-Wolfe, dual-cone projection QP.
//! 3. **Weightings** (`weighting`): Mean, Sum, Constant, Random, MGDA, UPGrad, DualProj.
//! 4. **Aggregators** (`aggregation`): weighting + contraction wᵀJ.
//! 5. **Differentiation boundary** (`differentiable`): the per-loss gradient trait.
//! 6. **Transforms** (`transform`): Gradients, Stack, Select, Reorder, Conjunction, Diagonalize.
//! 7. **Strategies** (`strategy`): unifying / separating reduction over keyed slabs.
//! 8. **Backward** (`backward`): the end-to-end driver.
//! 9. **FFI** (`ffi`): C-compatible aggregation API.

pub mod types;
pub mod solvers;
pub mod weighting;
pub mod aggregation;
pub mod differentiable;
pub mod transform;
pub mod strategy;
pub mod backward;
pub mod ffi;

pub use aggregation::{Aggregator, WeightedAggregator};
pub use backward::{backward, backward_with_options};
pub use differentiable::{loss_fn, Differentiable, LinearMap};
pub use strategy::{SeparatingStrategy, Strategy, UnifyingStrategy};
pub use transform::{stack_dicts, Stack, Transform};
pub use types::{JdError, KeyedTensorDict, Parameter, ParameterKey, SolveStatus, Tensor};
pub use weighting::{
    ConstantWeighting, DualProjWeighting, MeanWeighting, MgdaWeighting, RandomWeighting,
    SumWeighting, UpgradWeighting, Weighting,
};
