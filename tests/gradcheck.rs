//! Analytic gradients against central differences of the whole graph.

use gradpipe::approx::{assert_slices_close, finite_diff_grad, F32_MAX_ERROR};
use gradpipe::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Device::cpu().unwrap()
}

fn random(rng: &mut StdRng, n: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..n).map(|_| rng.random_range(lo..hi)).collect()
}

fn leaf(device: &Device, rng: &mut StdRng, shape: Shape) -> Tensor {
    let values = random(rng, shape.len(), -1.0, 1.0);
    device.new_data_with_values(shape, &values).unwrap()
}

/// `mean(x · c)` for a fixed random `c`, so no output is weighted equally.
fn weighted_mean(device: &Device, rng: &mut StdRng, x: &Tensor) -> Tensor {
    let c = leaf(device, rng, x.shape());
    device.mean(&device.mul_equal(x, &c).unwrap()).unwrap()
}

/// Compares the backward pass of `loss` with finite differences for every
/// tensor in `wrt`.
fn check(device: &Device, loss: &Tensor, wrt: &[&Tensor]) {
    let pipeline = device.compile(loss);
    pipeline.train_iteration(|_| {}).unwrap();
    let analytic: Vec<Vec<f32>> = wrt.iter().map(|t| t.gradients()).collect();

    for (t, analytic) in wrt.iter().zip(&analytic) {
        let mut values = t.values();
        let numeric = finite_diff_grad(&mut values, |v| {
            t.set_values(v);
            pipeline.evaluate().unwrap()[0]
        });
        t.set_values(&values);
        assert_slices_close(analytic, &numeric, F32_MAX_ERROR);
    }
}

#[test]
fn test_dense_layer() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(1);
    let x = leaf(&device, &mut rng, Shape::matrix(3, 4));
    let w = leaf(&device, &mut rng, Shape::matrix(2, 3));
    let b = leaf(&device, &mut rng, Shape::vector(2));
    let h = device.matrix_multiply(&x, &w, 0.7).unwrap();
    let h = device.gelu(&device.add_row(&h, &b).unwrap()).unwrap();
    let loss = weighted_mean(&device, &mut rng, &h);
    check(&device, &loss, &[&x, &w, &b]);
}

#[test]
fn test_batched_matmul_with_shared_weights() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(2);
    let x = leaf(&device, &mut rng, Shape::new(3, 2, 3));
    let w = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let y = device.matrix_multiply(&x, &w, 1.0).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&x, &w]);
}

#[test]
fn test_cross_entropy() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(3);
    let logits = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let targets = device
        .new_data_with_values(Shape::new(1, 3, 1), &[0.0, 3.0, 1.0])
        .unwrap();
    let loss = device
        .mean(&device.cross_entropy_pos(&logits, &targets).unwrap())
        .unwrap();
    check(&device, &loss, &[&logits]);
}

#[test]
fn test_sigmoid_binary_cross_entropy() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(4);
    let x = leaf(&device, &mut rng, Shape::matrix(3, 2));
    let targets = device
        .new_data_with_values(Shape::matrix(3, 2), &[1.0, 0.0, 1.0, 1.0, 0.0, 0.0])
        .unwrap();
    let p = device.sigmoid(&x).unwrap();
    let loss = device
        .mean(&device.binary_cross_entropy(&p, &targets).unwrap())
        .unwrap();
    check(&device, &loss, &[&x]);
}

#[test]
fn test_layer_norm() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(5);
    let x = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let y = device.layer_norm(&x, 4, 1e-5).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&x]);
}

#[test]
fn test_rms_norm() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(6);
    let x = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let y = device.rms_norm(&x, 4).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&x]);
}

#[test]
fn test_causal_attention_scores() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(7);
    let q = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let k = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let v = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let q_rot = device.rope_cols(&q, 4).unwrap();
    let k_rot = device.rope_cols(&k, 2).unwrap();
    let kt = device.transpose(&k_rot).unwrap();
    let scores = device.matrix_multiply(&q_rot, &kt, 0.5).unwrap();
    let attn = device.triangle_lower_softmax(&scores).unwrap();
    let out = device.matrix_multiply(&attn, &v, 1.0).unwrap();
    let loss = weighted_mean(&device, &mut rng, &out);
    check(&device, &loss, &[&q, &k, &v]);
}

#[test]
fn test_conv_with_padding_and_stride() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(8);
    let input = leaf(&device, &mut rng, Shape::new(5, 5, 4));
    let weights = leaf(&device, &mut rng, Shape::new(3, 3, 6));
    let biases = leaf(&device, &mut rng, Shape::vector(3));
    let y = device.conv(&input, &weights, &biases, 3, 2, 1, 2).unwrap();
    assert_eq!(y.shape(), Shape::new(3, 3, 6));
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&input, &weights, &biases]);
}

#[test]
fn test_max_pool_away_from_ties() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(9);
    let mut values: Vec<f32> = (0..32).map(|v| v as f32 * 0.1).collect();
    for i in (1..values.len()).rev() {
        values.swap(i, rng.random_range(0..=i));
    }
    let x = device
        .new_data_with_values(Shape::new(4, 4, 2), &values)
        .unwrap();
    let y = device.max_pool_2d(&x, 2, 0, 2).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&x]);
}

#[test]
fn test_upsample_and_row_scaling() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(10);
    let x = leaf(&device, &mut rng, Shape::new(2, 3, 2));
    let s = leaf(&device, &mut rng, Shape::new(1, 6, 1));
    let up = device.upsample_2d(&x, 2).unwrap();
    let y = device.mul_col(&device.silu(&up).unwrap(), &s).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&x, &s]);
}

#[test]
fn test_embeddings_and_positions() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(11);
    let tokens = device
        .new_data_with_values(Shape::matrix(3, 2), &[1.0, 0.0, 1.0, 4.0, 2.0, 1.0])
        .unwrap();
    let table = device
        .new_token_embedding_table("tokens", 4, 5, 0.5, &mut rng)
        .unwrap();
    let positions = leaf(&device, &mut rng, Shape::matrix(4, 3));
    let x = device.embeddings(&tokens, &table).unwrap();
    let y = device.positional_add(&x, &positions).unwrap();
    let y = device.gelu_new(&y).unwrap();
    let loss = weighted_mean(&device, &mut rng, &y);
    check(&device, &loss, &[&table, &positions]);
}

#[test]
fn test_vae_kl_divergence() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(12);
    let x = leaf(&device, &mut rng, Shape::new(6, 2, 2));
    let loss = device.mean(&device.vae_kl_divergence(&x).unwrap()).unwrap();
    check(&device, &loss, &[&x]);
}
