use std::collections::HashSet;

use gradpipe::approx::assert_slices_close;
use gradpipe::optim::Optimizer;
use gradpipe::{Device, DeviceConfig, Error, NodeKind, Shape, Tensor};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    Device::cpu().unwrap()
}

#[test]
fn test_nodes_follow_their_dependencies() {
    let device = device();
    let a = device.new_data_with_values(Shape::vector(2), &[1.0, 2.0]).unwrap();
    let b = device.new_parameter("b", Shape::vector(2), &[3.0, 4.0]).unwrap();
    let c = device.add_equal(&a, &b).unwrap();
    let d = device.mul_equal(&c, &a).unwrap();
    let e = device.mul_equal(&d, &c).unwrap();
    let loss = device.mean(&e).unwrap();
    let pipeline = device.compile(&loss);

    let nodes = pipeline.nodes();
    assert_eq!(nodes.len(), 6);
    assert!(nodes.last().unwrap().ptr_eq(&loss));

    let ids: HashSet<_> = nodes.iter().map(Tensor::id).collect();
    assert_eq!(ids.len(), nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        for dep in node.deps() {
            let j = nodes.iter().position(|n| n.ptr_eq(dep)).unwrap();
            assert!(j < i, "{} runs before its dependency", node.op_name());
        }
    }
}

#[test]
fn test_parameters_are_collected_once() {
    let device = device();
    let x = device.new_data_with_values(Shape::vector(2), &[1.0, 2.0]).unwrap();
    let w = device.new_parameter("w", Shape::vector(2), &[0.5, 0.5]).unwrap();
    let y = device.mul_equal(&x, &w).unwrap();
    let z = device.add_equal(&y, &w).unwrap();
    let loss = device.mean(&z).unwrap();
    let params = device.compile(&loss).parameters();
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].name(), Some("w"));
    assert_eq!(params[0].kind(), NodeKind::Parameter);
}

#[test]
fn test_reshape_aliases_storage() {
    let device = device();
    let x = device.new_data_with_values(Shape::matrix(2, 2), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let v = device.reshape(&x, Shape::vector(4));
    assert!(v.is_view());
    assert_eq!(v.owner(), x.owner());
    assert!(v.value().ptr_eq(x.value()));

    x.set_values(&[5.0, 6.0, 7.0, 8.0]);
    assert_eq!(v.values(), vec![5.0, 6.0, 7.0, 8.0]);
}

#[test]
fn test_gradient_flows_through_view() {
    let device = device();
    let x = device.new_data_with_values(Shape::matrix(2, 2), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let v = device.reshape(&x, Shape::vector(4));
    let loss = device.mean(&device.mul_equal(&v, &v).unwrap()).unwrap();
    let pipeline = device.compile(&loss);
    pipeline.train_iteration(|_| {}).unwrap();
    assert_eq!(x.gradients(), vec![0.5, 1.0, 1.5, 2.0]);
}

#[test]
fn test_gradients_do_not_leak_between_iterations() {
    let device = device();
    let x = device.new_data_with_values(Shape::vector(2), &[1.0, -1.0]).unwrap();
    let y = device.mul_equal(&x, &x).unwrap();
    let loss = device.mean(&y).unwrap();
    let pipeline = device.compile(&loss);

    pipeline.train_iteration(|_| {}).unwrap();
    let first = x.gradients();
    pipeline.train_iteration(|_| {}).unwrap();
    assert_eq!(x.gradients(), first);
    assert_eq!(y.gradients(), vec![0.5, 0.5]);
}

#[test]
fn test_backward_keeps_terminal_seed() {
    let device = device();
    let x = device.new_data_with_values(Shape::vector(2), &[1.0, 2.0]).unwrap();
    let y = device.mul_equal(&x, &x).unwrap();
    let pipeline = device.compile(&y);
    pipeline.forward().unwrap();

    y.set_gradients(&[3.0, 0.0]);
    x.set_gradients(&[100.0, 100.0]);
    pipeline.backward().unwrap();
    assert_eq!(x.gradients(), vec![6.0, 0.0]);
    assert_eq!(y.gradients(), vec![3.0, 0.0]);
}

#[test]
fn test_forward_is_repeatable() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(11);
    let values: Vec<f32> = (0..24).map(|_| rng.random_range(-1.0..1.0)).collect();
    let x = device.new_data_with_values(Shape::new(4, 3, 2), &values).unwrap();
    let w = device
        .new_data_rand_normal_weighted(Shape::matrix(5, 4), 0.5, &mut rng)
        .unwrap();
    let h = device.matrix_multiply(&x, &w, 1.0).unwrap();
    let h = device.gelu(&device.layer_norm(&h, 5, 1e-5).unwrap()).unwrap();
    let y = device.softmax(&h).unwrap();
    let pipeline = device.compile(&y);

    let first = pipeline.evaluate().unwrap();
    let second = pipeline.evaluate().unwrap();
    assert_eq!(
        first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        second.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    );
}

#[test]
fn test_batching_does_not_change_results() {
    let build = |commands_per_buffer: usize| {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = DeviceConfig::default().with_commands_per_buffer(commands_per_buffer);
        let device = Device::new(config).unwrap();
        let x = device
            .new_data_with_values(Shape::matrix(3, 2), &[0.1, -0.4, 0.9, 1.5, -2.0, 0.3])
            .unwrap();
        let mut y = x.clone();
        for _ in 0..8 {
            y = device.silu(&device.add_equal(&y, &x).unwrap()).unwrap();
        }
        let loss = device.mean(&y).unwrap();
        let pipeline = device.compile(&loss);
        pipeline.train_iteration(|_| {}).unwrap();
        (loss.values(), x.gradients())
    };
    let (loss_one, grad_one) = build(1);
    let (loss_many, grad_many) = build(1024);
    assert_eq!(loss_one, loss_many);
    assert_eq!(grad_one, grad_many);
}

#[test]
fn test_failed_run_leaves_pipeline_usable() {
    let device = device();
    let tokens = device.new_data_with_values(Shape::vector(2), &[0.0, 9.0]).unwrap();
    let table = device
        .new_data_with_values(Shape::matrix(1, 3), &[1.0, 2.0, 3.0])
        .unwrap();
    let y = device.embeddings(&tokens, &table).unwrap();
    let pipeline = device.compile(&y);

    assert!(matches!(pipeline.forward(), Err(Error::Submission(_))));
    tokens.set_values(&[0.0, 2.0]);
    assert_eq!(pipeline.evaluate().unwrap(), vec![1.0, 3.0]);
}

#[test]
fn test_linear_regression_converges() {
    let device = device();
    let mut rng = StdRng::seed_from_u64(5);
    let rows = 16;
    let inputs: Vec<f32> = (0..rows * 2).map(|_| rng.random_range(-1.0..1.0)).collect();
    let negated_targets: Vec<f32> = inputs
        .chunks(2)
        .map(|x| -(2.0 * x[0] - 3.0 * x[1] + 0.5))
        .collect();

    let x = device.new_data_with_values(Shape::matrix(2, rows), &inputs).unwrap();
    let t = device
        .new_data_with_values(Shape::matrix(1, rows), &negated_targets)
        .unwrap();
    let w = device.new_parameter("w", Shape::matrix(1, 2), &[0.0, 0.0]).unwrap();
    let b = device.new_parameter("b", Shape::vector(1), &[0.0]).unwrap();

    let prediction = device
        .add_row(&device.matrix_multiply(&x, &w, 1.0).unwrap(), &b)
        .unwrap();
    let err = device.add_equal(&prediction, &t).unwrap();
    let loss = device.mean(&device.mul_equal(&err, &err).unwrap()).unwrap();
    let pipeline = device.compile(&loss);

    let iterations = 600;
    let mut adam = device
        .optimizer_adam(iterations, 0.9, 0.999, 0.05, 1e-8)
        .bind(&pipeline.parameters())
        .unwrap();
    let initial = pipeline.evaluate().unwrap()[0];
    for i in 0..iterations {
        pipeline.train_step(&mut adam, i).unwrap();
    }
    let last = pipeline.evaluate().unwrap()[0];

    assert!(last < 1e-2, "loss {initial} -> {last}");
    assert_slices_close(&w.values(), &[2.0, -3.0], 0.1);
    assert_slices_close(&b.values(), &[0.5], 0.1);
}
