//! Token lookup and learned positional offsets.

use rayon::prelude::*;

use crate::command::CommandBuffer;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::node::Storage;

fn token_index(raw: f32, alphabet: usize) -> Result<usize> {
    if raw.is_finite() && raw >= 0.0 && (raw as usize) < alphabet {
        Ok(raw as usize)
    } else {
        Err(Error::Submission(format!(
            "token {raw} is outside an alphabet of {alphabet}"
        )))
    }
}

/// Gathers one `features`-wide table row per token.
///
/// Tokens are stored as floats holding integral indices; they receive no
/// gradient.
pub(crate) struct Embeddings {
    features: usize,
    alphabet: usize,
    tokens: Storage,
    table: Storage,
    output: Storage,
}

impl Embeddings {
    pub(crate) fn new(
        features: usize,
        alphabet: usize,
        tokens: Storage,
        table: Storage,
        output: Storage,
    ) -> Self {
        Self {
            features,
            alphabet,
            tokens,
            table,
            output,
        }
    }
}

impl Kernel for Embeddings {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (features, alphabet) = (self.features, self.alphabet);
        let (tokens, table, y) = (
            self.tokens.value.clone(),
            self.table.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let tokens = tokens.read();
            let table = table.read();
            let mut y = y.write();
            y.par_chunks_mut(features)
                .zip(tokens.par_iter())
                .try_for_each(|(row, &tok)| {
                    let t = token_index(tok, alphabet)?;
                    row.copy_from_slice(&table[t * features..][..features]);
                    Ok(())
                })
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (features, alphabet) = (self.features, self.alphabet);
        let (tokens, dtable, dy) = (
            self.tokens.value.clone(),
            self.table.grad.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let tokens = tokens.read();
            let dy = dy.read();
            let mut dtable = dtable.write();
            // repeated tokens hit the same row, so this stays sequential
            for (g, &tok) in dy.chunks(features).zip(tokens.iter()) {
                let t = token_index(tok, alphabet)?;
                for (dx, &g) in dtable[t * features..][..features].iter_mut().zip(g) {
                    *dx += g;
                }
            }
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "embeddings"
    }
}

/// Adds a `w × h` table to every depth slice of the input.
pub(crate) struct PositionalAdd {
    input: Storage,
    table: Storage,
    output: Storage,
}

impl PositionalAdd {
    pub(crate) fn new(input: Storage, table: Storage, output: Storage) -> Self {
        Self {
            input,
            table,
            output,
        }
    }
}

impl Kernel for PositionalAdd {
    fn forward(&self, cmd: &mut CommandBuffer) {
        let (x, table, y) = (
            self.input.value.clone(),
            self.table.value.clone(),
            self.output.value.clone(),
        );
        cmd.encode(move || {
            let x = x.read();
            let table = table.read();
            let mut y = y.write();
            let slice = table.len();
            y.par_chunks_mut(slice)
                .zip(x.par_chunks(slice))
                .for_each(|(y, x)| {
                    for ((y, &x), &p) in y.iter_mut().zip(x).zip(table.iter()) {
                        *y = x + p;
                    }
                });
            Ok(())
        });
    }

    fn backward(&self, cmd: &mut CommandBuffer) {
        let (dx, dtable, dy) = (
            self.input.grad.clone(),
            self.table.grad.clone(),
            self.output.grad.clone(),
        );
        cmd.encode(move || {
            let dy = dy.read();
            {
                let mut dx = dx.write();
                dx.par_iter_mut()
                    .zip(dy.par_iter())
                    .for_each(|(dx, &g)| *dx += g);
            }
            let mut dtable = dtable.write();
            let slice = dtable.len();
            dtable.par_iter_mut().enumerate().for_each(|(i, dp)| {
                *dp += dy.iter().skip(i).step_by(slice).sum::<f32>();
            });
            Ok(())
        });
    }

    fn name(&self) -> &'static str {
        "positional_add"
    }
}
