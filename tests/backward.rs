//! End-to-end tests for `backward`: per-example losses of a small ReLU
//! network, chunked differentiation, and exact checks against linear maps
//! whose Jacobian is known.

use approx::assert_abs_diff_eq;
use jacobian_descent::aggregation::*;
use jacobian_descent::backward::*;
use jacobian_descent::differentiable::*;
use jacobian_descent::types::*;
use jacobian_descent::weighting::*;
use ndarray::{Array1, Array2, ArrayD, Axis, Ix1, Ix2, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

// ─────────────────────────────────────────────────────────────
//  Helpers: Linear(10, 5) → ReLU → Linear(5, 1), squared error
// ─────────────────────────────────────────────────────────────

const IN: usize = 10;
const HIDDEN: usize = 5;
const BATCH: usize = 16;

fn normal_tensor(rng: &mut StdRng, shape: &[usize]) -> Tensor {
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.sample::<f64, _>(StandardNormal) * 0.5)
}

struct Network {
    w1: Parameter,
    b1: Parameter,
    w2: Parameter,
    b2: Parameter,
}

impl Network {
    fn new(rng: &mut StdRng) -> Self {
        Self {
            w1: Parameter::named("w1", normal_tensor(rng, &[HIDDEN, IN])),
            b1: Parameter::named("b1", normal_tensor(rng, &[HIDDEN])),
            w2: Parameter::named("w2", normal_tensor(rng, &[1, HIDDEN])),
            b2: Parameter::named("b2", normal_tensor(rng, &[1])),
        }
    }

    fn parameters_mut(&mut self) -> [&mut Parameter; 4] {
        [&mut self.w1, &mut self.b1, &mut self.w2, &mut self.b2]
    }

    /// One loss per example, each holding a snapshot of the weights it was
    /// evaluated with.
    fn losses(&self, inputs: &Array2<f64>, targets: &Array1<f64>) -> Vec<ExampleLoss> {
        let w1 = self.w1.value.view().into_dimensionality::<Ix2>().unwrap().to_owned();
        let b1 = self.b1.value.view().into_dimensionality::<Ix1>().unwrap().to_owned();
        let w2 = self.w2.value.view().into_dimensionality::<Ix2>().unwrap().to_owned();
        let b2 = self.b2.value[[0]];
        inputs
            .axis_iter(Axis(0))
            .zip(targets.iter())
            .map(|(x, &target)| ExampleLoss {
                x: x.to_owned(),
                target,
                w1: w1.clone(),
                b1: b1.clone(),
                w2: w2.clone(),
                b2,
                keys: [self.w1.key(), self.b1.key(), self.w2.key(), self.b2.key()],
            })
            .collect()
    }
}

/// (f(x) − target)² with hand-written backprop.
struct ExampleLoss {
    x: Array1<f64>,
    target: f64,
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: f64,
    keys: [ParameterKey; 4],
}

impl Differentiable for ExampleLoss {
    fn gradients(&self, targets: &[ParameterKey]) -> Result<KeyedTensorDict, JdError> {
        let pre = self.w1.dot(&self.x) + &self.b1;
        let hidden = pre.mapv(|v| v.max(0.0));
        let y = self.w2.row(0).dot(&hidden) + self.b2;

        let dy = 2.0 * (y - self.target);
        let dw2 = hidden.mapv(|h| dy * h).insert_axis(Axis(0));
        let db2 = Array1::from_elem(1, dy);
        let dpre = Array1::from_shape_fn(HIDDEN, |j| {
            if pre[j] > 0.0 {
                dy * self.w2[[0, j]]
            } else {
                0.0
            }
        });
        let dw1 = Array2::from_shape_fn((HIDDEN, IN), |(j, i)| dpre[j] * self.x[i]);

        let all = [
            dw1.into_dyn(),
            dpre.into_dyn(),
            dw2.into_dyn(),
            db2.into_dyn(),
        ];
        Ok(self
            .keys
            .iter()
            .zip(all)
            .filter(|(key, _)| targets.contains(key))
            .map(|(key, grad)| (*key, grad))
            .collect())
    }
}

fn batch(rng: &mut StdRng) -> (Array2<f64>, Array1<f64>) {
    let inputs = Array2::from_shape_fn((BATCH, IN), |_| rng.sample(StandardNormal));
    let targets = Array1::from_shape_fn(BATCH, |_| rng.sample(StandardNormal));
    (inputs, targets)
}

fn boxed<A: Aggregator + 'static>(agg: A) -> Box<dyn Aggregator> {
    Box::new(agg)
}

fn aggregators() -> Vec<(&'static str, Box<dyn Aggregator>)> {
    vec![
        ("mean", boxed(WeightedAggregator::new(MeanWeighting))),
        ("upgrad", boxed(WeightedAggregator::new(UpgradWeighting::default()))),
        ("mgda", boxed(WeightedAggregator::new(MgdaWeighting::default()))),
        ("random", boxed(WeightedAggregator::new(RandomWeighting::seeded(9)))),
    ]
}

fn grads(net: &Network) -> Vec<Tensor> {
    [&net.w1, &net.b1, &net.w2, &net.b2]
        .iter()
        .map(|p| p.grad.clone().unwrap())
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Network
// ─────────────────────────────────────────────────────────────

#[test_log::test]
fn every_parameter_gets_a_gradient_of_its_shape() {
    let mut rng = StdRng::seed_from_u64(100);
    let (inputs, targets) = batch(&mut rng);

    for (name, agg) in aggregators() {
        let mut net = Network::new(&mut rng);
        let losses = net.losses(&inputs, &targets);
        backward(&losses, net.parameters_mut(), &agg, None).unwrap();

        for p in net.parameters_mut() {
            let grad = p.grad.as_ref().unwrap_or_else(|| panic!("{name}: no grad"));
            assert_eq!(grad.shape(), p.shape(), "{name}: {:?}", p.name());
            assert!(grad.iter().all(|g| g.is_finite()), "{name}");
        }
    }
}

#[test]
fn result_does_not_depend_on_chunk_size() {
    let mut rng = StdRng::seed_from_u64(101);
    let (inputs, targets) = batch(&mut rng);
    let mut net = Network::new(&mut rng);
    let losses = net.losses(&inputs, &targets);

    let deterministic: Vec<(&str, Box<dyn Aggregator>)> = vec![
        ("mean", boxed(WeightedAggregator::new(MeanWeighting))),
        ("upgrad", boxed(WeightedAggregator::new(UpgradWeighting::default()))),
        ("mgda", boxed(WeightedAggregator::new(MgdaWeighting::default()))),
    ];
    for (name, agg) in deterministic {
        backward(&losses, net.parameters_mut(), &agg, None).unwrap();
        let reference = grads(&net);

        for chunk in [1, 2, 4, 5, BATCH, 100] {
            backward(&losses, net.parameters_mut(), &agg, Some(chunk)).unwrap();
            for (got, want) in grads(&net).iter().zip(&reference) {
                for (a, b) in got.iter().zip(want.iter()) {
                    assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
                }
            }
            log::debug!("{name}: chunk {chunk} ok");
        }
    }
}

#[test]
fn mean_equals_the_average_of_per_example_gradients() {
    let mut rng = StdRng::seed_from_u64(102);
    let (inputs, targets) = batch(&mut rng);
    let mut net = Network::new(&mut rng);
    let losses = net.losses(&inputs, &targets);
    let keys: Vec<ParameterKey> = net.parameters_mut().iter().map(|p| p.key()).collect();

    let agg = WeightedAggregator::new(MeanWeighting);
    backward(&losses, net.parameters_mut(), &agg, Some(3)).unwrap();

    for (key, grad) in keys.iter().zip(grads(&net)) {
        let mut average = ArrayD::<f64>::zeros(grad.raw_dim());
        for loss in &losses {
            average += loss.gradients(&[*key]).unwrap().get(key).unwrap();
        }
        average /= BATCH as f64;
        for (a, b) in grad.iter().zip(average.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}

#[test]
fn gradients_are_overwritten_not_accumulated() {
    let mut rng = StdRng::seed_from_u64(103);
    let (inputs, targets) = batch(&mut rng);
    let mut net = Network::new(&mut rng);
    let losses = net.losses(&inputs, &targets);
    let agg = WeightedAggregator::new(MeanWeighting);

    backward(&losses, net.parameters_mut(), &agg, None).unwrap();
    let first = grads(&net);
    backward(&losses, net.parameters_mut(), &agg, None).unwrap();
    assert_eq!(grads(&net), first);
}

#[test]
fn upgrad_update_does_not_conflict_with_any_output() {
    let mut input = Parameter::new(ArrayD::zeros(IxDyn(&[3])));
    let jacobian = ndarray::array![[1.0, 0.0, 0.0], [-0.9, 1.0, 0.0], [-0.5, -0.5, 1.0]];
    let map = LinearMap::new(jacobian.clone(), &input).unwrap();

    let options = ProjectionOptions { reg_eps: 0.0, ..ProjectionOptions::default() };
    let agg = WeightedAggregator::new(UpgradWeighting::with_options(MeanWeighting, options));
    backward(&map.outputs(), [&mut input], &agg, Some(1)).unwrap();

    let update = input.grad.unwrap().into_dimensionality::<Ix1>().unwrap();
    for row in jacobian.rows() {
        assert!(row.dot(&update) >= -1e-8, "update {update} conflicts with {row}");
    }
}

// ─────────────────────────────────────────────────────────────
//  Linear maps:  input.grad == A(J)
// ─────────────────────────────────────────────────────────────

#[test]
fn linear_map_gradient_is_the_aggregated_jacobian() {
    let mut rng = StdRng::seed_from_u64(105);
    for &(m, n) in &[(2, 3), (2, 6), (5, 8), (20, 25), (60, 55), (120, 143)] {
        let jacobian = Array2::from_shape_fn((m, n), |_| rng.sample(StandardNormal));
        let mut input = Parameter::new(Array1::from_shape_fn(n, |_| rng.sample(StandardNormal)).into_dyn());
        let map = LinearMap::new(jacobian.clone(), &input).unwrap();
        assert_eq!(map.forward(&input).unwrap().len(), m);

        for (name, agg) in aggregators() {
            if name == "random" {
                continue;
            }
            backward(&map.outputs(), [&mut input], &agg, None).unwrap();
            let expected = agg.reduce(jacobian.view()).unwrap();
            let got = input.grad.as_ref().unwrap();
            assert_eq!(got.shape(), &[n]);
            for (a, b) in got.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
            }
        }
    }
}

#[test]
fn random_aggregation_matches_with_the_same_seed() {
    let mut rng = StdRng::seed_from_u64(106);
    let jacobian = Array2::from_shape_fn((4, 6), |_| rng.sample(StandardNormal));
    let mut input = Parameter::new(ArrayD::zeros(IxDyn(&[6])));
    let map = LinearMap::new(jacobian.clone(), &input).unwrap();

    backward(&map.outputs(), [&mut input], &WeightedAggregator::new(RandomWeighting::seeded(5)), None).unwrap();
    let expected = WeightedAggregator::new(RandomWeighting::seeded(5)).reduce(jacobian.view()).unwrap();
    for (a, b) in input.grad.as_ref().unwrap().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn linear_map_checks_the_input_shape() {
    let input = Parameter::new(ArrayD::zeros(IxDyn(&[4])));
    let err = LinearMap::new(Array2::zeros((2, 3)), &input).unwrap_err();
    assert!(matches!(err, JdError::ShapeMismatch(_)));
}

#[test]
fn parameter_untouched_by_every_loss_gets_zeros() {
    let mut used = Parameter::new(ArrayD::zeros(IxDyn(&[3])));
    let mut unused = Parameter::named("unused", ArrayD::ones(IxDyn(&[2, 2])));
    let map = LinearMap::new(Array2::eye(3), &used).unwrap();

    let agg = WeightedAggregator::new(UpgradWeighting::default());
    backward(&map.outputs(), [&mut used, &mut unused], &agg, Some(2)).unwrap();

    assert_eq!(unused.grad, Some(ArrayD::zeros(IxDyn(&[2, 2]))));
    assert_eq!(used.grad.as_ref().unwrap().shape(), &[3]);
}

// ─────────────────────────────────────────────────────────────
//  Errors
// ─────────────────────────────────────────────────────────────

#[test]
fn no_losses_is_an_empty_jacobian() {
    let mut p = Parameter::new(ArrayD::zeros(IxDyn(&[2])));
    let losses: Vec<LinearOutput<'_>> = Vec::new();
    let err = backward(&losses, [&mut p], &WeightedAggregator::new(MeanWeighting), None).unwrap_err();
    assert_eq!(err, JdError::EmptyJacobian);
    assert!(p.grad.is_none());
}

#[test]
fn zero_chunk_size_is_rejected() {
    let mut p = Parameter::new(ArrayD::zeros(IxDyn(&[2])));
    let map = LinearMap::new(Array2::eye(2), &p).unwrap();
    let outputs = map.outputs();
    let err = backward(&outputs, [&mut p], &WeightedAggregator::new(MeanWeighting), Some(0)).unwrap_err();
    assert_eq!(err, JdError::InvalidChunkSize);
    assert!(p.grad.is_none());
}

#[test]
fn duplicate_parameters_are_rejected() {
    let mut a = Parameter::new(ArrayD::zeros(IxDyn(&[2])));
    let mut b = a.clone();
    let map = LinearMap::new(Array2::eye(2), &a).unwrap();
    let err = backward(&map.outputs(), [&mut a, &mut b], &WeightedAggregator::new(MeanWeighting), None)
        .unwrap_err();
    assert_eq!(err, JdError::DuplicateKey(b.key()));
}

#[test]
fn wrong_gradient_shape_leaves_every_parameter_untouched() {
    let mut good = Parameter::new(ArrayD::zeros(IxDyn(&[2])));
    let mut bad = Parameter::new(ArrayD::zeros(IxDyn(&[3])));
    good.grad = Some(ArrayD::from_elem(IxDyn(&[2]), 7.0));

    let (gk, bk) = (good.key(), bad.key());
    let loss = loss_fn(move |_: &[ParameterKey]| {
        Ok([
            (gk, ArrayD::ones(IxDyn(&[2]))),
            (bk, ArrayD::ones(IxDyn(&[4]))),
        ]
        .into_iter()
        .collect())
    });

    let err = backward(&[loss], [&mut good, &mut bad], &WeightedAggregator::new(MeanWeighting), None)
        .unwrap_err();
    assert_eq!(err, JdError::InconsistentShape { key: bk, expected: vec![3], found: vec![4] });
    assert_eq!(good.grad, Some(ArrayD::from_elem(IxDyn(&[2]), 7.0)));
    assert!(bad.grad.is_none());
}

#[test]
fn differentiation_failure_is_propagated() {
    let mut p = Parameter::new(ArrayD::zeros(IxDyn(&[1])));
    let loss = loss_fn(|_: &[ParameterKey]| Err(JdError::Differentiation("no graph".into())));
    let err = backward(&[loss], [&mut p], &WeightedAggregator::new(MeanWeighting), None).unwrap_err();
    assert_eq!(err, JdError::Differentiation("no graph".into()));
}

#[test]
fn options_struct_matches_positional_form() {
    let mut rng = StdRng::seed_from_u64(107);
    let jacobian = Array2::from_shape_fn((3, 4), |_| rng.sample(StandardNormal));
    let mut input = Parameter::new(ArrayD::zeros(IxDyn(&[4])));
    let map = LinearMap::new(jacobian, &input).unwrap();
    let agg = WeightedAggregator::new(MgdaWeighting::default());

    backward(&map.outputs(), [&mut input], &agg, Some(2)).unwrap();
    let positional = input.grad.clone();

    let options = BackwardOptions { parallel_chunk_size: Some(2) };
    backward_with_options(&map.outputs(), [&mut input], &agg, &options).unwrap();
    assert_eq!(input.grad, positional);
}
