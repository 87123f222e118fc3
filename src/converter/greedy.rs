//! Greedy (best path) CTC decoding.
//!
//! The most likely class is picked independently at every timestep, so the
//! result is the best *path* rather than the most likely *labelling*. Beam
//! search would be more accurate but is much slower; greedy decoding is used
//! for evaluation and inspection only.

use burn::tensor::{backend::Backend, Tensor};

use super::Converter;
use crate::error::{CrnnError, Result};

/// Applies the CTC many-to-one map to a class path: consecutive repeats are
/// merged first, then blanks are removed. A blank between two equal symbols
/// therefore keeps both of them.
pub fn collapse_path(path: &[usize], blank: usize) -> Vec<usize> {
    path.iter()
        .enumerate()
        .filter(|&(t, &class)| t == 0 || class != path[t - 1])
        .map(|(_, &class)| class)
        .filter(|&class| class != blank)
        .collect()
}

/// Decodes log-probabilities of shape `[seq_length, batch_size, num_classes]`
/// into one string per sample, in batch order.
///
/// `input_lengths` restricts each sample to its first `input_lengths[n]`
/// timesteps; `None` decodes the full sequence.
pub fn decode_greedy<B: Backend>(
    converter: &Converter,
    log_probs: Tensor<B, 3>,
    input_lengths: Option<&[usize]>,
) -> Result<Vec<String>> {
    let [seq_length, batch_size, _] = log_probs.dims();
    if let Some(lengths) = input_lengths {
        if lengths.len() != batch_size {
            return Err(CrnnError::shape_mismatch(format!(
                "{} input lengths given for a batch of {batch_size}",
                lengths.len()
            )));
        }
    }

    // [seq_length, batch_size, 1], row major
    let best = log_probs.argmax(2).into_data().convert::<i64>().value;

    (0..batch_size)
        .map(|n| {
            let length = input_lengths.map_or(seq_length, |lengths| lengths[n].min(seq_length));
            let path: Vec<usize> = (0..length)
                .map(|t| best[t * batch_size + n] as usize)
                .collect();
            converter.decode_path(&path)
        })
        .collect()
}
