use std::{path::PathBuf, sync::Arc, time::Instant};

use burn::{
    module::AutodiffModule,
    nn::loss::Reduction,
    optim::{AdamConfig, GradientsParams, Optimizer, RmsPropConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Data, ElementConversion, Int, Shape, Tensor,
    },
};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::{
    burn_ext::ctc::CTCLoss,
    checkpoint,
    converter::{decode_greedy, Converter},
    dataloader::{OrderedDataLoader, OrderedDataLoaderBuilder},
    dataset::{TextLineBatch, TextLineBatcher, TextLineDataset, TextLineItem},
    error::{CrnnError, Result},
    metrics::{cer, wer},
    model::{CRNNConfig, CRNN},
    parse_config::{CrnnTrainingConfig, OptimizerKind},
    tracker::{FileTracker, NoopTracker, Tracker},
};

pub type BatchLoader<B> = OrderedDataLoader<TextLineItem, TextLineBatch<B>>;

/// State shared by every pass of one run. Created at the start of the run and
/// torn down with [`RunContext::finish`].
pub struct RunContext<B: Backend> {
    pub device: B::Device,
    pub converter: Arc<Converter>,
    pub tracker: Box<dyn Tracker>,
}

impl<B: Backend> RunContext<B> {
    pub fn new(device: B::Device, converter: Converter, tracker: Box<dyn Tracker>) -> Self {
        Self {
            device,
            converter: Arc::new(converter),
            tracker,
        }
    }

    /// Tracking goes to `save_dir` when saving is enabled, nowhere otherwise.
    pub fn create(device: B::Device, config: &CrnnTrainingConfig) -> Result<Self> {
        let tracker: Box<dyn Tracker> = if config.save {
            Box::new(FileTracker::create(&config.save_dir)?)
        } else {
            Box::new(NoopTracker)
        };

        Ok(Self::new(device, config.converter()?, tracker))
    }

    pub fn finish(mut self) {
        self.tracker.flush();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestReport {
    pub loss: f64,
    pub cer: f64,
    pub wer: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub epochs: Vec<EpochSummary>,
    pub test: Option<TestReport>,
    pub checkpoint: Option<PathBuf>,
}

/// Mean over samples, each batch weighted by its size.
#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub fn run<B: AutodiffBackend>(device: B::Device, config: &CrnnTrainingConfig) -> Result<RunReport> {
    let start = Instant::now();
    let mut ctx = RunContext::<B>::create(device.clone(), config)?;
    let model_config = config.model_config();

    B::seed(config.seed);

    let model = match &config.pretrained_model_path {
        Some(path) => {
            let model = model_config.init::<B>(&device)?;
            checkpoint::load(model, path, &device)?
        }
        None => model_config.init::<B>(&device)?,
    };

    let img_height = config.img_height as u32;
    let split = |name: &str| {
        TextLineDataset::split(&config.data_root, name, img_height, config.max_width)
    };

    let train_loader = loader_builder(
        TextLineBatcher::<B>::new(device.clone(), config.pad_value),
        config,
    )
    .shuffle(config.seed)
    .build(split(&config.train_split)?);
    let valid_loader = loader_builder(
        TextLineBatcher::<B::InnerBackend>::new(device.clone(), config.pad_value),
        config,
    )
    .shuffle(config.seed)
    .build(split(&config.valid_split)?);

    info!(
        seconds = start.elapsed().as_secs_f64(),
        train = train_loader.num_items(),
        valid = valid_loader.num_items(),
        "loading completed"
    );

    let (model, epochs) = match config.optimizer {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new()
                .with_beta_1(config.beta1 as f32)
                .with_beta_2(0.999)
                .with_epsilon(1e-8)
                .init::<B, CRNN<B>>();
            train(&mut ctx, model, optim, &train_loader, &valid_loader, config)?
        }
        OptimizerKind::RmsProp => {
            let optim = RmsPropConfig::new()
                .with_epsilon(1e-8)
                .init::<B, CRNN<B>>();
            train(&mut ctx, model, optim, &train_loader, &valid_loader, config)?
        }
    };

    let checkpoint = if config.save {
        Some(checkpoint::save(&model, &config.save_dir)?)
    } else {
        None
    };

    let test = if config.run_test {
        let test_loader = loader_builder(
            TextLineBatcher::<B::InnerBackend>::new(device, config.pad_value),
            config,
        )
        .build(split(&config.test_split)?);
        Some(test(&mut ctx, &model.valid(), &test_loader, config, &model_config)?)
    } else {
        None
    };

    ctx.finish();
    info!(seconds = start.elapsed().as_secs_f64(), "run finished");

    Ok(RunReport {
        epochs,
        test,
        checkpoint,
    })
}

fn loader_builder<B: Backend>(
    batcher: TextLineBatcher<B>,
    config: &CrnnTrainingConfig,
) -> OrderedDataLoaderBuilder<TextLineItem, TextLineBatch<B>> {
    let builder = OrderedDataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers);

    match config.prefetch {
        Some(prefetch) => builder.prefetch(prefetch),
        None => builder,
    }
}

/// Runs `config.epochs` epochs of training, each followed by a validation pass.
pub fn train<B, O>(
    ctx: &mut RunContext<B>,
    mut model: CRNN<B>,
    mut optim: O,
    train_loader: &BatchLoader<B>,
    valid_loader: &BatchLoader<B::InnerBackend>,
    config: &CrnnTrainingConfig,
) -> Result<(CRNN<B>, Vec<EpochSummary>)>
where
    B: AutodiffBackend,
    O: Optimizer<CRNN<B>, B>,
{
    let model_config = config.model_config();
    let num_batches = train_loader.num_batches();
    let mut summaries = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        let _span = info_span!("epoch", epoch).entered();
        let mut train_loss = RunningMean::default();

        for (iteration, batch) in train_loader.iter(epoch).enumerate() {
            let batch = batch?;
            let log_probs = forward_batch(&model, batch.images.clone(), &model_config)?;
            let (loss, input_lengths) = ctc_objective(
                &ctx.converter,
                &model_config,
                config.variable_input_lengths,
                log_probs.clone(),
                &batch,
            )?;
            let loss_value = loss.clone().into_scalar().elem::<f64>();
            debug!(iteration, loss = loss_value, "train");

            if iteration + 1 == num_batches {
                let prediction = decode_greedy(&ctx.converter, log_probs, Some(&input_lengths))?;
                if let (Some(text), Some(image)) = (prediction.first(), to_gray_image(&batch, 0)) {
                    ctx.tracker.add_image(
                        &format!("Train epoch {epoch:04} Prediction {text}"),
                        &image,
                        epoch,
                    );
                }
            }

            // Gradients for the current backward pass
            let grads = loss.backward();
            // Gradients linked to each parameter of the model.
            let grads = GradientsParams::from_grads(grads, &model);
            // Update the model using the optimizer.
            model = optim.step(config.learning_rate, model, grads);

            train_loss.update(loss_value, batch.len());
        }

        // Get the model without autodiff.
        let valid_loss = validate(ctx, &model.valid(), valid_loader, config, epoch)?;
        let summary = EpochSummary {
            epoch,
            train_loss: train_loss.mean(),
            valid_loss,
        };

        ctx.tracker.add_scalar("train loss", summary.train_loss, epoch);
        ctx.tracker.add_scalar("val loss", summary.valid_loss, epoch);
        info!(
            train_loss = summary.train_loss,
            valid_loss = summary.valid_loss,
            "epoch finished"
        );
        summaries.push(summary);
    }

    Ok((model, summaries))
}

/// Average CTC loss over the validation samples. Gradients are not tracked.
pub fn validate<B: AutodiffBackend>(
    ctx: &RunContext<B>,
    model: &CRNN<B::InnerBackend>,
    loader: &BatchLoader<B::InnerBackend>,
    config: &CrnnTrainingConfig,
    epoch: usize,
) -> Result<f64> {
    let model_config = config.model_config();
    let mut valid_loss = RunningMean::default();

    for (iteration, batch) in loader.iter(epoch).enumerate() {
        let batch = batch?;
        let log_probs = forward_batch(model, batch.images.clone(), &model_config)?;
        let (loss, _) = ctc_objective(
            &ctx.converter,
            &model_config,
            config.variable_input_lengths,
            log_probs,
            &batch,
        )?;
        let loss_value = loss.into_scalar().elem::<f64>();
        debug!(iteration, loss = loss_value, "valid");

        valid_loss.update(loss_value, batch.len());
    }

    Ok(valid_loss.mean())
}

/// Decodes the test split and scores it. Every `inspect_interval`-th batch
/// reports every second sample in detail; its text entries are tagged by the
/// label and written at step 0.
pub fn test<B: Backend, M: Backend>(
    ctx: &mut RunContext<B>,
    model: &CRNN<M>,
    loader: &BatchLoader<M>,
    config: &CrnnTrainingConfig,
    model_config: &CRNNConfig,
) -> Result<TestReport> {
    let _span = info_span!("test").entered();
    let mut test_loss = RunningMean::default();
    let mut cer_sum = 0.0;
    let mut wer_sum = 0.0;
    let mut samples = 0;

    for (iteration, batch) in loader.iter(0).enumerate() {
        let batch = batch?;
        let log_probs = forward_batch(model, batch.images.clone(), model_config)?;
        let (loss, input_lengths) = ctc_objective(
            &ctx.converter,
            model_config,
            config.variable_input_lengths,
            log_probs.clone(),
            &batch,
        )?;
        test_loss.update(loss.into_scalar().elem::<f64>(), batch.len());

        let predictions = decode_greedy(&ctx.converter, log_probs, Some(&input_lengths))?;
        let inspect = config.inspect_interval > 0 && iteration % config.inspect_interval == 0;

        for (idx, (label, prediction)) in batch.transcriptions.iter().zip(&predictions).enumerate() {
            let char_error = cer(label, prediction);
            let word_error = wer(label, prediction);
            cer_sum += char_error;
            wer_sum += word_error;
            samples += 1;

            if inspect && idx % 2 == 0 {
                info!(
                    iteration,
                    label = label.as_str(),
                    prediction = prediction.as_str(),
                    cer = char_error,
                    wer = word_error,
                    "inspect"
                );
                ctx.tracker.add_text(
                    label,
                    &format!("{prediction}  --[CER={char_error:.2}]"),
                    0,
                );
                ctx.tracker.add_text(
                    label,
                    &format!("{prediction}  --[WER={word_error:.2}]"),
                    0,
                );
            }
        }
    }

    let denominator = samples.max(1) as f64;
    let report = TestReport {
        loss: test_loss.mean(),
        cer: cer_sum / denominator,
        wer: wer_sum / denominator,
        samples,
    };
    info!(loss = report.loss, cer = report.cer, wer = report.wer, samples, "test finished");

    Ok(report)
}

fn forward_batch<B: Backend>(
    model: &CRNN<B>,
    images: Tensor<B, 4>,
    model_config: &CRNNConfig,
) -> Result<Tensor<B, 3>> {
    let [_, channels, height, _] = images.dims();
    if channels != 1 || height != model_config.img_height() {
        return Err(CrnnError::shape_mismatch(format!(
            "expected images of shape [N, 1, {}, W], got {:?}",
            model_config.img_height(),
            images.dims()
        )));
    }

    Ok(model.forward(images))
}

/// Mean CTC loss of a batch, and the input length used for every sample.
fn ctc_objective<B: Backend, I: Backend>(
    converter: &Converter,
    model_config: &CRNNConfig,
    variable_input_lengths: bool,
    log_probs: Tensor<B, 3>,
    batch: &TextLineBatch<I>,
) -> Result<(Tensor<B, 1>, Vec<usize>)> {
    let [seq_length, batch_size, _] = log_probs.dims();
    if batch_size != batch.len() {
        return Err(CrnnError::shape_mismatch(format!(
            "{batch_size} predictions for {} transcriptions",
            batch.len()
        )));
    }
    let device = log_probs.device();

    let input_lengths = if variable_input_lengths {
        batch
            .widths
            .iter()
            .map(|&width| {
                model_config
                    .sequence_length(width)
                    .map(|length| length.min(seq_length))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![seq_length; batch_size]
    };

    let (targets, target_lengths) = converter.encode_multi(&batch.transcriptions)?;
    let targets_len = targets.len();

    let loss = CTCLoss::new(converter.blank()).forward(
        log_probs,
        int_tensor(targets, targets_len, &device),
        int_tensor(
            input_lengths.iter().map(|&len| len as i64).collect(),
            batch_size,
            &device,
        ),
        int_tensor(target_lengths, batch_size, &device),
        Some(Reduction::Mean),
    )?;

    Ok((loss, input_lengths))
}

fn int_tensor<B: Backend>(values: Vec<i64>, len: usize, device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(Data::new(values, Shape::new([len])).convert(), device)
}

/// Sample `index` of a batch as an 8-bit image, cropped to its original width.
fn to_gray_image<B: Backend>(batch: &TextLineBatch<B>, index: usize) -> Option<GrayImage> {
    let [_, _, height, width] = batch.images.dims();
    let original_width = (*batch.widths.get(index)?).min(width);
    let pixels = batch
        .images
        .clone()
        .slice([index..index + 1])
        .into_data()
        .convert::<f32>()
        .value;

    let raw = pixels
        .chunks(width)
        .flat_map(|row| row[..original_width].iter())
        .map(|&value| ((value * 0.5 + 0.5) * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect();

    GrayImage::from_raw(original_width as u32, height as u32, raw)
}
