use burn::backend::Autodiff;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use consistency::{LossSnapshot, PgcLossConfig, PgcMode, ViewOutputs};
use data_contracts::{CropRect, PairGeometry, ViewGeometry};

type B = NdArray<f32>;

const CLASSES: usize = 3;

fn random_map(shape: [usize; 4]) -> Tensor<B, 4> {
    Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

fn random_outputs(batch: usize) -> ViewOutputs<B> {
    ViewOutputs::new(
        vec![
            random_map([batch, 4, 4, 4]),
            random_map([batch, 6, 2, 2]),
            random_map([batch, 5, 2, 2]),
        ],
        random_map([batch, CLASSES, 4, 4]),
    )
}

fn flipped(outputs: &ViewOutputs<B>) -> ViewOutputs<B> {
    ViewOutputs::new(
        outputs.features.iter().map(|f| f.clone().flip([3])).collect(),
        outputs.logits.clone().flip([3]),
    )
}

fn labels(batch: usize, h: usize, w: usize) -> Tensor<B, 3, Int> {
    let values: Vec<i64> = (0..batch * h * w).map(|i| (i % CLASSES) as i64).collect();
    Tensor::from_data(TensorData::new(values, [batch, h, w]), &Default::default())
}

fn view(x: u32, y: u32, flipped: bool) -> ViewGeometry {
    ViewGeometry::new(CropRect::new(x, y, 16, 16), flipped)
}

fn run(
    first: &ViewOutputs<B>,
    second: &ViewOutputs<B>,
    geometry: &[PairGeometry],
    l1: &Tensor<B, 3, Int>,
    l2: &Tensor<B, 3, Int>,
) -> (LossSnapshot, usize) {
    let loss = PgcLossConfig::new().init();
    let terms = loss.forward(first, second, geometry, [l1, l2]);
    (terms.snapshot(loss.alpha, loss.beta).unwrap(), terms.aux_mse.len())
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-5 * (1.0 + a.abs().max(b.abs()))
}

#[test]
fn identical_full_overlap_has_zero_consistency() {
    let outputs = random_outputs(2);
    let geometry = vec![PairGeometry::new(view(3, 5, false), view(3, 5, false)); 2];
    let lbl = labels(2, 16, 16);
    let loss = PgcLossConfig::new().init();
    let terms = loss.forward(&outputs, &outputs, &geometry, [&lbl, &lbl]);
    let snap = terms.snapshot(loss.alpha, loss.beta).unwrap();
    assert!(snap.mse.abs() < 1e-7, "mse {}", snap.mse);
    assert!(snap.symmetric_ce.abs() < 1e-7, "sym_ce {}", snap.symmetric_ce);
    assert!(snap.pgc.abs() < 1e-7);
    assert!(snap.aux_l1.abs() < 1e-7);
    assert_eq!(terms.aux_mse.len(), 3);
    for term in terms.aux_ce {
        assert!(term.into_data().to_vec::<f32>().unwrap()[0].abs() < 1e-7);
    }
    assert!(snap.ce > 0.0);
}

#[test]
fn disjoint_crops_have_zero_consistency() {
    let first = random_outputs(1);
    let second = random_outputs(1);
    let geometry = [PairGeometry::new(view(0, 0, false), view(16, 0, true))];
    let lbl = labels(1, 16, 16);
    let (snap, levels) = run(&first, &second, &geometry, &lbl, &lbl);
    assert_eq!(levels, 3);
    assert_eq!(snap.mse, 0.0);
    assert_eq!(snap.symmetric_ce, 0.0);
    assert_eq!(snap.pgc, 0.0);
    assert_eq!(snap.aux_l1, 0.0);
    assert!(snap.ce > 0.0);
    assert!(close(snap.total, snap.ce));
}

#[test]
fn degenerate_geometry_degrades_to_zero() {
    let first = random_outputs(1);
    let second = random_outputs(1);
    let geometry = [PairGeometry::new(
        ViewGeometry::new(CropRect::new(0, 0, 0, 16), false),
        view(0, 0, false),
    )];
    let lbl = labels(1, 16, 16);
    let (snap, _) = run(&first, &second, &geometry, &lbl, &lbl);
    assert_eq!(snap.mse, 0.0);
    assert_eq!(snap.symmetric_ce, 0.0);
}

#[test]
fn flipping_second_view_gives_same_loss() {
    let first = random_outputs(2);
    let second = random_outputs(2);
    let lbl1 = labels(2, 16, 16);
    let lbl2 = labels(2, 16, 16);

    let plain = vec![
        PairGeometry::new(view(0, 0, false), view(4, 2, false)),
        PairGeometry::new(view(8, 8, true), view(0, 4, false)),
    ];
    let mirrored: Vec<PairGeometry> = plain
        .iter()
        .map(|g| PairGeometry::new(g.first, ViewGeometry::new(g.second.crop, !g.second.flipped)))
        .collect();

    let (expected, _) = run(&first, &second, &plain, &lbl1, &lbl2);
    let (actual, _) = run(&first, &flipped(&second), &mirrored, &lbl1, &lbl2.clone().flip([2]));

    assert!(expected.mse > 0.0);
    assert!(close(expected.mse, actual.mse), "{expected:?} vs {actual:?}");
    assert!(close(expected.symmetric_ce, actual.symmetric_ce));
    assert!(close(expected.pgc, actual.pgc));
    assert!(close(expected.aux_l1, actual.aux_l1));
    assert!(close(expected.ce, actual.ce));
    assert!(close(expected.total, actual.total));
}

#[test]
fn ignored_pixels_do_not_affect_cross_entropy() {
    let device = Default::default();
    let (h, w) = (4, 4);
    let mut label_values: Vec<i64> = (0..h * w).map(|i| (i % CLASSES) as i64).collect();
    for x in 0..w {
        label_values[x] = 255;
    }
    let lbl = Tensor::<B, 3, Int>::from_data(TensorData::new(label_values, [1, h, w]), &device);

    let base: Vec<f32> = (0..CLASSES * h * w).map(|i| (i as f32 * 0.37).sin()).collect();
    let mut noisy = base.clone();
    for c in 0..CLASSES {
        for x in 0..w {
            noisy[c * h * w + x] += 50.0 * (c as f32 + 1.0);
        }
    }
    let logits = Tensor::<B, 4>::from_data(TensorData::new(base, [1, CLASSES, h, w]), &device);
    let noisy_logits =
        Tensor::<B, 4>::from_data(TensorData::new(noisy, [1, CLASSES, h, w]), &device);

    let geometry = [PairGeometry::new(
        ViewGeometry::new(CropRect::new(0, 0, 4, 4), false),
        ViewGeometry::new(CropRect::new(0, 0, 4, 4), false),
    )];
    let a = ViewOutputs::new(Vec::new(), logits.clone());
    let b = ViewOutputs::new(Vec::new(), noisy_logits);
    let (clean, _) = run(&a, &a, &geometry, &lbl, &lbl);
    let (mixed, _) = run(&a, &b, &geometry, &lbl, &lbl);
    assert!(close(clean.ce, mixed.ce));
    // The noisy row still disagrees between views.
    assert!(mixed.symmetric_ce > 0.0);
}

#[test]
fn all_ignore_labels_give_zero_cross_entropy() {
    let outputs = random_outputs(1);
    let ignore = Tensor::<B, 3, Int>::from_data(
        TensorData::new(vec![255i64; 16 * 16], [1, 16, 16]),
        &Default::default(),
    );
    let geometry = [PairGeometry::new(view(0, 0, false), view(0, 0, false))];
    let (snap, _) = run(&outputs, &outputs, &geometry, &ignore, &ignore);
    assert_eq!(snap.ce, 0.0);
    assert_eq!(snap.total, 0.0);
}

#[test]
fn mismatched_resolutions_are_normalised() {
    let first = random_outputs(1);
    let second = ViewOutputs::new(
        vec![
            random_map([1, 4, 8, 8]),
            random_map([1, 6, 4, 4]),
            random_map([1, 5, 1, 1]),
        ],
        random_map([1, CLASSES, 8, 8]),
    );
    let geometry = [PairGeometry::new(view(0, 0, false), view(5, 3, true))];
    let lbl = labels(1, 16, 16);
    let (snap, _) = run(&first, &second, &geometry, &lbl, &lbl);
    for v in [snap.mse, snap.symmetric_ce, snap.pgc, snap.aux_l1, snap.ce, snap.total] {
        assert!(v.is_finite() && v >= 0.0);
    }
    assert!(snap.mse > 0.0);
}

#[test]
fn single_level_mode_emits_one_aux_term() {
    let outputs = random_outputs(1);
    let geometry = [PairGeometry::new(view(0, 0, false), view(2, 2, false))];
    let lbl = labels(1, 16, 16);
    let loss = PgcLossConfig::new().with_mode(PgcMode::Level1).init();
    let terms = loss.forward(&outputs, &random_outputs(1), &geometry, [&lbl, &lbl]);
    assert_eq!(terms.aux_mse.len(), 1);
    assert_eq!(terms.aux_ce.len(), 1);
}

#[test]
#[should_panic(expected = "channel mismatch")]
fn channel_mismatch_is_fatal() {
    let first = random_outputs(1);
    let mut second = random_outputs(1);
    second.features[0] = random_map([1, 7, 4, 4]);
    let geometry = [PairGeometry::new(view(0, 0, false), view(0, 0, false))];
    let lbl = labels(1, 16, 16);
    run(&first, &second, &geometry, &lbl, &lbl);
}

#[test]
fn gradients_reach_both_views() {
    type AD = Autodiff<NdArray<f32>>;
    let device = Default::default();
    let logits1 =
        Tensor::<AD, 4>::random([1, CLASSES, 4, 4], Distribution::Normal(0.0, 1.0), &device)
            .require_grad();
    let logits2 =
        Tensor::<AD, 4>::random([1, CLASSES, 4, 4], Distribution::Normal(0.0, 1.0), &device)
            .require_grad();
    let feat1 =
        Tensor::<AD, 4>::random([1, 4, 2, 2], Distribution::Normal(0.0, 1.0), &device).require_grad();
    let feat2 =
        Tensor::<AD, 4>::random([1, 4, 2, 2], Distribution::Normal(0.0, 1.0), &device).require_grad();
    let lbl = Tensor::<AD, 3, Int>::zeros([1, 16, 16], &device);

    let first = ViewOutputs::new(vec![feat1.clone()], logits1.clone());
    let second = ViewOutputs::new(vec![feat2.clone()], logits2.clone());
    let geometry = [PairGeometry::new(view(0, 0, false), view(4, 0, true))];

    let loss = PgcLossConfig::new().with_mode(PgcMode::Level0).init();
    let terms = loss.forward(&first, &second, &geometry, [&lbl, &lbl]);
    let grads = loss.total(&terms).backward();

    assert!(logits1.grad(&grads).is_some());
    assert!(logits2.grad(&grads).is_some());
    assert!(feat1.grad(&grads).is_some());
    assert!(feat2.grad(&grads).is_some());
}
