//! Trains a 2-4-1 sigmoid network on XOR.
//!
//! The parameters are restored from, and saved back to, a snapshot in the
//! temp directory, so consecutive runs pick up where the last one stopped.
//! Ctrl-C stops training after the current iteration and still saves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gradpipe::checkpoint::{load_parameters, save_parameters};
use gradpipe::init::{GAIN_SIGMOID, XavierUniform};
use gradpipe::optim::Optimizer;
use gradpipe::{Device, DeviceConfig, Shape};
use rand::SeedableRng;
use rand::rngs::StdRng;

const ITERATIONS: usize = 2000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    let device = Device::new(DeviceConfig::from_env())?;
    let mut rng = StdRng::seed_from_u64(42);
    let init = XavierUniform::new(GAIN_SIGMOID);

    let x = device.new_data_with_values(
        Shape::matrix(2, 4),
        &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
    )?;
    let targets = device.new_data_with_values(Shape::matrix(1, 4), &[0.0, 1.0, 1.0, 0.0])?;

    let w1 = device.init_parameter("w1", Shape::matrix(4, 2), &init, 2, 4, &mut rng)?;
    let b1 = device.new_parameter("b1", Shape::vector(4), &[0.0; 4])?;
    let w2 = device.init_parameter("w2", Shape::matrix(1, 4), &init, 4, 1, &mut rng)?;
    let b2 = device.new_parameter("b2", Shape::vector(1), &[0.0])?;

    let hidden = device.sigmoid(&device.add_row(&device.matrix_multiply(&x, &w1, 1.0)?, &b1)?)?;
    let output = device.sigmoid(&device.add_row(&device.matrix_multiply(&hidden, &w2, 1.0)?, &b2)?)?;
    let loss = device.mean(&device.binary_cross_entropy(&output, &targets)?)?;

    let params = [w1, b1, w2, b2];
    let snapshot = std::env::temp_dir().join("gradpipe-xor.gpck");
    match load_parameters(&snapshot, &params) {
        Ok(()) => log::info!("resuming from {}", snapshot.display()),
        Err(err) => log::info!("starting fresh ({err})"),
    }

    let pipeline = device.compile(&loss);
    let mut adam = device
        .optimizer_adam(ITERATIONS, 0.9, 0.999, 0.05, 1e-8)
        .bind(&pipeline.parameters())?;

    for i in 0..ITERATIONS {
        if !running.load(Ordering::SeqCst) {
            log::warn!("interrupted at iteration {i}");
            break;
        }
        pipeline.train_step(&mut adam, i)?;
        if i % 200 == 0 {
            log::info!("iteration {i}: loss {:.5}", loss.values()[0]);
        }
    }

    let predictions = device.compile(&output).evaluate()?;
    for (input, p) in [[0, 0], [0, 1], [1, 0], [1, 1]].iter().zip(&predictions) {
        log::info!("{} xor {} -> {p:.3}", input[0], input[1]);
    }

    save_parameters(&snapshot, &params)?;
    log::info!("saved to {}", snapshot.display());
    Ok(())
}
