use std::env;

use anyhow::Context;
use crnn_ctc::{device::DevicePlacement, parse_config::CrnnTrainingConfig, training::RunReport};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

#[cfg(feature = "tch")]
fn launch(placement: DevicePlacement, config: &CrnnTrainingConfig) -> crnn_ctc::Result<RunReport> {
    use burn::backend::{libtorch::LibTorchDevice, Autodiff, LibTorch};
    use crnn_ctc::training::run;

    let device = match placement {
        DevicePlacement::Cpu => LibTorchDevice::Cpu,
        DevicePlacement::Cuda(index) => LibTorchDevice::Cuda(index),
    };
    run::<Autodiff<LibTorch>>(device, config)
}

#[cfg(not(feature = "tch"))]
fn launch(_placement: DevicePlacement, config: &CrnnTrainingConfig) -> crnn_ctc::Result<RunReport> {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use crnn_ctc::training::run;

    run::<Autodiff<NdArray>>(NdArrayDevice::Cpu, config)
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = env::args().nth(1).unwrap_or_else(|| "./config.yaml".to_string());
    let config = CrnnTrainingConfig::from_yaml(&config_path)
        .with_context(|| format!("invalid training config {config_path}"))?;

    let placement = DevicePlacement::resolve(config.cuda);
    let report = launch(placement, &config).context("training run aborted")?;

    for summary in &report.epochs {
        info!(
            epoch = summary.epoch,
            train_loss = summary.train_loss,
            valid_loss = summary.valid_loss,
            "summary"
        );
    }
    if let Some(test) = &report.test {
        info!(loss = test.loss, cer = test.cer, wer = test.wer, samples = test.samples, "test summary");
    }
    if let Some(path) = &report.checkpoint {
        info!(path = %path.display(), "checkpoint");
    }

    Ok(())
}
