use std::path::Path;

use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::dataset::InMemDataset,
    module::AutodiffModule,
    optim::AdamConfig,
    tensor::backend::Backend,
};
use crnn_ctc::{
    dataloader::OrderedDataLoaderBuilder,
    dataset::{TextLineBatcher, TextLineItem},
    model::CRNN,
    parse_config::CrnnTrainingConfig,
    tracker::NoopTracker,
    training::{self, EpochSummary, RunContext, TestReport},
};

type TrainBackend = Autodiff<NdArray>;

const CONFIG: &str = r#"
MODEL:
  alphabet: "_ab"
  img_height: 16
  cnn_structure:
    - channels: 4
      kernel_size: [3, 3]
      padding: [1, 1]
      pooling: { kernel_size: [2, 2], stride: [2, 2] }
    - channels: 8
      kernel_size: [3, 3]
      padding: [1, 1]
      pooling: { kernel_size: [2, 1], stride: [2, 1] }
  rnn_layers: 1
  rnn_hidden_size: 8
TRAINING:
  data_root: ./unused
  batch_size: 1
  num_workers: 2
  epochs: 2
  seed: 7
  learning_rate: 0.001
"#;

fn sample(transcription: &str, width: usize, phase: usize) -> TextLineItem {
    let height = 16;
    let image_raw = (0..height * width)
        .map(|idx| (((idx + phase) * 37) % 256) as u8)
        .collect();

    TextLineItem {
        image_raw,
        image_height: height,
        image_width: width,
        transcription: transcription.to_string(),
    }
}

fn samples() -> Vec<TextLineItem> {
    vec![
        sample("ab", 40, 0),
        sample("ba", 32, 3),
        sample("a", 24, 5),
        sample("bb", 40, 11),
    ]
}

fn run_once(config: &CrnnTrainingConfig) -> (Vec<EpochSummary>, TestReport) {
    let device = NdArrayDevice::Cpu;
    let mut ctx = RunContext::<TrainBackend>::new(
        NdArrayDevice::Cpu,
        config.converter().unwrap(),
        Box::new(NoopTracker),
    );

    TrainBackend::seed(config.seed);
    let model: CRNN<TrainBackend> = config.model_config().init(&device).unwrap();
    let optim = AdamConfig::new().init::<TrainBackend, CRNN<TrainBackend>>();

    let train_loader = OrderedDataLoaderBuilder::new(TextLineBatcher::<TrainBackend>::new(
        NdArrayDevice::Cpu,
        config.pad_value,
    ))
    .batch_size(config.batch_size)
    .num_workers(config.num_workers)
    .shuffle(config.seed)
    .build(InMemDataset::new(samples()));
    let valid_loader = OrderedDataLoaderBuilder::new(TextLineBatcher::<NdArray>::new(
        NdArrayDevice::Cpu,
        config.pad_value,
    ))
    .batch_size(2)
    .shuffle(config.seed)
    .build(InMemDataset::new(samples()));

    let (model, summaries) =
        training::train(&mut ctx, model, optim, &train_loader, &valid_loader, config).unwrap();

    let model_config = config.model_config();
    let report = training::test(
        &mut ctx,
        &model.valid(),
        &valid_loader,
        config,
        &model_config,
    )
    .unwrap();
    ctx.finish();

    (summaries, report)
}

#[test]
fn test_same_seed_same_loss_trajectory() {
    let config = CrnnTrainingConfig::from_str_in(CONFIG, Path::new(".")).unwrap();

    let (first, first_report) = run_once(&config);
    let (second, second_report) = run_once(&config);

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(first_report, second_report);

    for summary in &first {
        assert!(summary.train_loss.is_finite() && summary.train_loss > 0.0);
        assert!(summary.valid_loss.is_finite() && summary.valid_loss > 0.0);
    }
    assert_eq!(first_report.samples, 4);
    assert!(first_report.cer >= 0.0);
}
