//! A single causal self-attention block learning to continue `abcdabcd…`.
//!
//! Tokens are embedded, offset by a learned positional table, normalised,
//! and projected to queries, keys and values. Queries and keys are rotated
//! per position before the masked softmax, and the attended values feed a
//! residual connection and an output projection scored with cross-entropy
//! against the next token.

use gradpipe::init::{GAIN_LINEAR, XavierNormal};
use gradpipe::optim::Optimizer;
use gradpipe::{Device, DeviceConfig, Shape};
use rand::SeedableRng;
use rand::rngs::StdRng;

const ALPHABET: usize = 4;
const CONTEXT: usize = 8;
const FEATURES: usize = 8;
const HEAD: usize = 4;
const ITERATIONS: usize = 400;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = Device::new(DeviceConfig::from_env())?;
    let mut rng = StdRng::seed_from_u64(7);
    let init = XavierNormal::new(GAIN_LINEAR);

    let sequence: Vec<f32> = (0..=CONTEXT).map(|i| (i % ALPHABET) as f32).collect();
    let tokens = device.new_data_with_values(Shape::vector(CONTEXT), &sequence[..CONTEXT])?;
    let targets = device.new_data_with_values(Shape::new(1, CONTEXT, 1), &sequence[1..])?;

    let table = device.new_token_embedding_table("embed", FEATURES, ALPHABET, 0.5, &mut rng)?;
    let positions = device.init_parameter(
        "positions",
        Shape::matrix(FEATURES, CONTEXT),
        &init,
        FEATURES,
        FEATURES,
        &mut rng,
    )?;
    let projection = |name: &str, out: usize, rng: &mut StdRng| {
        device.init_parameter(name, Shape::matrix(out, FEATURES), &init, FEATURES, out, rng)
    };
    let wq = projection("wq", FEATURES, &mut rng)?;
    let wk = projection("wk", FEATURES, &mut rng)?;
    let wv = projection("wv", FEATURES, &mut rng)?;
    let wo = projection("wo", ALPHABET, &mut rng)?;

    let x = device.positional_add(&device.embeddings(&tokens, &table)?, &positions)?;
    let h = device.rms_norm(&x, FEATURES)?;
    let q = device.rope_cols(&device.matrix_multiply(&h, &wq, 1.0)?, HEAD)?;
    let k = device.rope_cols(&device.matrix_multiply(&h, &wk, 1.0)?, HEAD)?;
    let v = device.matrix_multiply(&h, &wv, 1.0)?;

    let scale = 1.0 / (FEATURES as f32).sqrt();
    let scores = device.matrix_multiply(&q, &device.transpose(&k)?, scale)?;
    let attention = device.triangle_lower_softmax(&scores)?;
    let attended = device.matrix_multiply(&attention, &v, 1.0)?;
    let residual = device.add_equal(&x, &attended)?;
    let logits = device.matrix_multiply(&residual, &wo, 1.0)?;
    let loss = device.mean(&device.cross_entropy_pos(&logits, &targets)?)?;

    let pipeline = device.compile(&loss);
    log::info!(
        "{} nodes, {} parameters",
        pipeline.nodes().len(),
        pipeline.parameters().len()
    );
    let mut adam = device
        .optimizer_adam(ITERATIONS, 0.9, 0.98, 0.01, 1e-8)
        .bind(&pipeline.parameters())?;

    for i in 0..ITERATIONS {
        pipeline.train_step(&mut adam, i)?;
        if i % 50 == 0 {
            log::info!("iteration {i}: loss {:.4}", loss.values()[0]);
        }
    }

    let logits = device.compile(&logits).evaluate()?;
    let predicted: String = logits
        .chunks(ALPHABET)
        .map(|row| {
            let best = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
            char::from(b'a' + best.0 as u8)
        })
        .collect();
    log::info!("next tokens: {predicted}");
    Ok(())
}
