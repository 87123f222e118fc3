use burn::{
    nn::loss::Reduction,
    tensor::{backend::Backend, Data, ElementConversion, Int, Shape, Tensor},
};

use crate::{
    error::{CrnnError, Result},
    utils::tensor_ext::shift_right,
};

// Log-alphas are clamped here. A target that no alignment can produce (more
// labels than timesteps) therefore yields a large finite loss instead of
// infinity, and contributes no gradient.
const NEG_INF: f32 = -1e5;

/// The Connectionist Temporal Classification loss.
#[derive(Clone, Debug)]
pub struct CTCLoss {
    blank: usize,
}

impl Default for CTCLoss {
    fn default() -> Self {
        CTCLoss::new(0)
    }
}

impl CTCLoss {
    /// Create the criterion.
    pub fn new(blank: usize) -> Self {
        Self { blank }
    }

    /// Compute the criterion on the input tensor.
    ///
    /// # Parameters:
    ///
    /// - log_probs: The logarithmized probabilities of the outputs. Shape:
    ///   `[input_length, batch_size, num_classes]`
    /// - targets: The concatenated target sequences. Each element is a class
    ///   index other than blank. Shape: `[target_lengths_sum]`
    /// - input_lengths: The number of valid timesteps of each sample.
    ///   Shape: `[batch_size]`
    /// - target_lengths: The lengths of the targets. Shape: `[batch_size]`
    /// - reduction: None: the per-sample losses are returned;
    ///   Some(Reduction::Mean) or Some(Reduction::Auto): each loss is divided
    ///   by its target length, then the mean over the batch is taken;
    ///   Some(Reduction::Sum): the losses are summed.
    ///
    /// # Reference
    ///
    /// - [Connectionist Temporal Classification: Labelling Unsegmented Sequence Data with Recurrent Neural Networks](https://www.cs.toronto.edu/~graves/icml_2006.pdf)
    pub fn forward<B: Backend>(
        &self,
        log_probs: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
        input_lengths: Tensor<B, 1, Int>,
        target_lengths: Tensor<B, 1, Int>,
        reduction: Option<Reduction>,
    ) -> Result<Tensor<B, 1>> {
        let lengths = self.check(&log_probs, targets, input_lengths, target_lengths)?;
        let device = log_probs.device();

        let neg_log_likelihood = self.neg_log_likelihood(log_probs, &lengths);

        let loss = match reduction {
            Some(Reduction::Mean) | Some(Reduction::Auto) => {
                let divisor: Vec<f32> = lengths
                    .target_lengths
                    .iter()
                    .map(|&len| len.max(1) as f32)
                    .collect();
                let divisor = Tensor::<B, 1>::from_floats(divisor.as_slice(), &device);
                (neg_log_likelihood / divisor).mean()
            }
            Some(Reduction::Sum) => neg_log_likelihood.sum(),
            None => neg_log_likelihood,
        };

        Ok(loss)
    }

    fn check<B: Backend>(
        &self,
        log_probs: &Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
        input_lengths: Tensor<B, 1, Int>,
        target_lengths: Tensor<B, 1, Int>,
    ) -> Result<Lengths> {
        let [seq_length, batch_size, num_classes] = log_probs.dims();
        let [targets_size] = targets.dims();
        let [input_lengths_size] = input_lengths.dims();
        let [target_lengths_size] = target_lengths.dims();

        if batch_size == 0 || seq_length == 0 {
            return Err(CrnnError::shape_mismatch(format!(
                "log_probs must not be empty, got {:?}",
                log_probs.dims()
            )));
        }
        if self.blank >= num_classes {
            return Err(CrnnError::shape_mismatch(format!(
                "blank index {} is outside the {num_classes} classes of log_probs",
                self.blank
            )));
        }
        if input_lengths_size != batch_size {
            return Err(CrnnError::shape_mismatch(format!(
                "batch size of log_probs ({batch_size}) should correspond to size of input_lengths ({input_lengths_size})"
            )));
        }
        if target_lengths_size != batch_size {
            return Err(CrnnError::shape_mismatch(format!(
                "batch size of log_probs ({batch_size}) should correspond to size of target_lengths ({target_lengths_size})"
            )));
        }

        let input_lengths = to_host(input_lengths);
        let target_lengths = to_host(target_lengths);
        let targets = to_host(targets);

        if let Some(&len) = input_lengths
            .iter()
            .find(|&&len| len < 1 || len as usize > seq_length)
        {
            return Err(CrnnError::shape_mismatch(format!(
                "input length {len} must be within 1..={seq_length}"
            )));
        }
        if target_lengths.iter().any(|&len| len < 0) {
            return Err(CrnnError::shape_mismatch("target lengths must not be negative"));
        }
        let target_lengths_sum: i64 = target_lengths.iter().sum();
        if target_lengths_sum as usize != targets_size {
            return Err(CrnnError::shape_mismatch(format!(
                "size of targets ({targets_size}) should correspond to sum of target_lengths ({target_lengths_sum})"
            )));
        }
        if let Some(&class) = targets
            .iter()
            .find(|&&class| class < 0 || class as usize >= num_classes || class as usize == self.blank)
        {
            return Err(CrnnError::shape_mismatch(format!(
                "target class {class} is blank or outside the {num_classes} classes"
            )));
        }

        Ok(Lengths {
            targets,
            input_lengths: input_lengths.into_iter().map(|len| len as usize).collect(),
            target_lengths: target_lengths.into_iter().map(|len| len as usize).collect(),
        })
    }

    /// Forward (alpha) recursion over the blank-extended targets, batched over
    /// samples and states, looped over time.
    fn neg_log_likelihood<B: Backend>(&self, log_probs: Tensor<B, 3>, lengths: &Lengths) -> Tensor<B, 1> {
        let device = log_probs.device();
        let [seq_length, batch_size, _] = log_probs.dims();
        let max_target_length = lengths.target_lengths.iter().copied().max().unwrap_or(0);
        let num_states = 2 * max_target_length + 1;

        let extended = lengths.extended_targets(self.blank, max_target_length);
        let mut skip_mask = vec![NEG_INF; batch_size * num_states];
        let mut init_mask = vec![NEG_INF; batch_size * num_states];
        for n in 0..batch_size {
            let row = &extended[n * num_states..(n + 1) * num_states];
            // s -> s + 2 is allowed onto a label that differs from the previous label
            for s in (3..num_states).step_by(2) {
                if row[s] != row[s - 2] {
                    skip_mask[n * num_states + s] = 0.0;
                }
            }
            init_mask[n * num_states] = 0.0;
            if lengths.target_lengths[n] > 0 {
                init_mask[n * num_states + 1] = 0.0;
            }
        }
        let skip_mask = float_tensor::<B, 2>(skip_mask, [batch_size, num_states], &device);
        let init_mask = float_tensor::<B, 2>(init_mask, [batch_size, num_states], &device);

        // [batch_size, seq_length, num_states]
        let emissions = {
            let indices = int_tensor::<B, 3>(extended, [batch_size, 1, num_states], &device)
                .repeat(1, seq_length);
            log_probs.swap_dims(0, 1).gather(2, indices)
        };
        let emission_at = |t: usize| {
            emissions
                .clone()
                .slice([0..batch_size, t..(t + 1), 0..num_states])
                .reshape([batch_size, num_states])
        };

        let mut log_alpha = (emission_at(0) + init_mask).clamp_min(NEG_INF);
        let mut log_alphas = Vec::with_capacity(seq_length);
        log_alphas.push(log_alpha.clone());

        for t in 1..seq_length {
            // \alpha_{t-1}(s), \alpha_{t-1}(s-1), \alpha_{t-1}(s-2)
            let la1 = log_alpha.clone();
            let la2 = shift_right(log_alpha.clone(), 1, NEG_INF);
            let la3 = shift_right(log_alpha, 2, NEG_INF) + skip_mask.clone();

            let la_sum = log_sum_exp(Tensor::stack::<3>(vec![la1, la2, la3], 2), 2)
                .reshape([batch_size, num_states]);
            log_alpha = (la_sum + emission_at(t)).clamp_min(NEG_INF);
            log_alphas.push(log_alpha.clone());
        }

        // pick \alpha_{T_n - 1} of each sample
        let log_alphas = Tensor::stack::<3>(log_alphas, 1);
        let last_step: Vec<i64> = lengths
            .input_lengths
            .iter()
            .flat_map(|&len| std::iter::repeat((len - 1) as i64).take(num_states))
            .collect();
        let last_alpha = log_alphas
            .gather(1, int_tensor::<B, 3>(last_step, [batch_size, 1, num_states], &device))
            .reshape([batch_size, num_states]);

        // the path ends on the last label or on the trailing blank
        let mut end_states = Vec::with_capacity(2 * batch_size);
        let mut end_mask = Vec::with_capacity(2 * batch_size);
        for &len in &lengths.target_lengths {
            end_states.extend([(2 * len) as i64, (2 * len).saturating_sub(1) as i64]);
            end_mask.extend([0.0, if len > 0 { 0.0 } else { NEG_INF }]);
        }
        let ends = last_alpha.gather(1, int_tensor::<B, 2>(end_states, [batch_size, 2], &device))
            + float_tensor::<B, 2>(end_mask, [batch_size, 2], &device);

        log_sum_exp(ends, 1).reshape([batch_size]).neg()
    }
}

struct Lengths {
    targets: Vec<i64>,
    input_lengths: Vec<usize>,
    target_lengths: Vec<usize>,
}

impl Lengths {
    /// Targets interleaved with blanks: `_ l1 _ l2 _ ... _`, padded with blanks
    /// to `2 * max_target_length + 1` states. Shape: `[batch_size, num_states]`.
    fn extended_targets(&self, blank: usize, max_target_length: usize) -> Vec<i64> {
        let num_states = 2 * max_target_length + 1;
        let mut extended = vec![blank as i64; self.target_lengths.len() * num_states];
        let mut start = 0;
        for (n, &len) in self.target_lengths.iter().enumerate() {
            for (k, &class) in self.targets[start..start + len].iter().enumerate() {
                extended[n * num_states + 2 * k + 1] = class;
            }
            start += len;
        }

        extended
    }
}

/// Numerically stable `log(sum(exp(x)))` along `dim`, keeping the dimension.
fn log_sum_exp<B: Backend, const D: usize>(tensor: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max = tensor.clone().max_dim(dim);
    (tensor - max.clone()).exp().sum_dim(dim).log() + max
}

fn to_host<B: Backend>(tensor: Tensor<B, 1, Int>) -> Vec<i64> {
    tensor
        .into_data()
        .value
        .into_iter()
        .map(|value| value.elem::<i64>())
        .collect()
}

fn int_tensor<B: Backend, const D: usize>(
    values: Vec<i64>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    Tensor::from_data(Data::new(values, Shape::new(shape)).convert(), device)
}

fn float_tensor<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(Data::new(values, Shape::new(shape)).convert(), device)
}
