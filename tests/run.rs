use std::{fs, path::Path};

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use crnn_ctc::{
    checkpoint::checkpoint_path,
    parse_config::{CrnnTrainingConfig, OptimizerKind},
    tracker::{Event, FileTracker},
    training::run,
    CrnnError,
};
use image::{GrayImage, Luma};

type TrainBackend = Autodiff<NdArray>;

fn write_split(root: &Path, name: &str, samples: &[(&str, u32)]) {
    let image_dir = root.join("images");
    fs::create_dir_all(&image_dir).unwrap();

    let mut labels = String::new();
    for (idx, (transcription, width)) in samples.iter().enumerate() {
        let image = GrayImage::from_fn(*width, 16, |x, y| {
            Luma([((x * 7 + y * 13 + idx as u32 * 29) % 256) as u8])
        });
        let relative = format!("images/{name}-{idx}.png");
        image.save(root.join(&relative)).unwrap();
        labels.push_str(&format!("{relative}\t{transcription}\n"));
    }

    fs::write(root.join(format!("{name}-labels.txt")), labels).unwrap();
}

fn config(data_root: &Path, save_dir: &Path, extra: &str) -> CrnnTrainingConfig {
    let content = format!(
        r#"
MODEL:
  alphabet: "_ab"
  img_height: 16
  cnn_structure:
    - channels: 4
      kernel_size: [3, 3]
      padding: [1, 1]
      batch_norm: true
      pooling: {{ kernel_size: [2, 2], stride: [2, 2] }}
    - channels: 8
      kernel_size: [3, 3]
      padding: [1, 1]
      pooling: {{ kernel_size: [2, 1], stride: [2, 1] }}
  rnn_layers: 1
  rnn_hidden_size: 8
TRAINING:
  data_root: '{}'
  save_dir: '{}'
  batch_size: 2
  num_workers: 2
  seed: 3
  learning_rate: 0.001
{extra}
"#,
        data_root.display(),
        save_dir.display(),
    );

    CrnnTrainingConfig::from_str_in(&content, data_root).unwrap()
}

fn read_events(save_dir: &Path) -> Vec<Event> {
    fs::read_to_string(save_dir.join(FileTracker::EVENTS_FILE))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_run_saves_tracks_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("data");
    let save_dir = dir.path().join("run");
    write_split(&data_root, "train", &[("ab", 40), ("ba", 32), ("a", 24), ("bb", 36)]);
    write_split(&data_root, "valid", &[("ab", 32), ("b", 28)]);
    write_split(&data_root, "test", &[("ba", 40), ("a", 24), ("ab", 32)]);

    let cfg = config(
        &data_root,
        &save_dir,
        "  epochs: 2
  optimizer: rms_prop
  save: true
  inspect_interval: 1
  variable_input_lengths: true",
    );
    assert_eq!(cfg.optimizer, OptimizerKind::RmsProp);

    let report = run::<TrainBackend>(NdArrayDevice::Cpu, &cfg).unwrap();

    assert_eq!(report.epochs.len(), 2);
    assert!(report
        .epochs
        .iter()
        .all(|summary| summary.train_loss.is_finite() && summary.valid_loss.is_finite()));
    let test = report.test.unwrap();
    assert_eq!(test.samples, 3);
    assert!(test.cer >= 0.0 && test.wer >= 0.0);

    let checkpoint = report.checkpoint.unwrap();
    assert_eq!(checkpoint, checkpoint_path(&save_dir));
    assert!(checkpoint.is_file());

    let events = read_events(&save_dir);
    for tag in ["train loss", "val loss"] {
        let steps: Vec<usize> = events
            .iter()
            .filter_map(|event| match event {
                Event::Scalar { tag: t, step, .. } if t == tag => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![1, 2], "{tag}");
    }

    let images: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Image { tag, path, step } => Some((tag, path, *step)),
            _ => None,
        })
        .collect();
    assert_eq!(images.len(), 2);
    assert!(images[0].0.starts_with("Train epoch 0001 Prediction"));
    assert!(images[1].0.starts_with("Train epoch 0002 Prediction"));
    assert!(save_dir.join(images[0].1).is_file());

    // two test batches, the first sample of each inspected
    let texts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Text { tag, text, step } => Some((tag.as_str(), text.as_str(), *step)),
            _ => None,
        })
        .collect();
    assert_eq!(texts.len(), 4);
    assert!(texts.iter().all(|(_, _, step)| *step == 0));
    assert!(texts[0].1.contains("  --[CER="));
    assert!(texts[1].1.contains("  --[WER="));
    assert_eq!(texts[0].0, texts[1].0);

    // resume from the checkpoint without saving again
    let resumed = config(
        &data_root,
        &dir.path().join("unused"),
        &format!(
            "  epochs: 1
  pretrained_model_path: '{}'
  run_test: false",
            checkpoint.display()
        ),
    );
    let report = run::<TrainBackend>(NdArrayDevice::Cpu, &resumed).unwrap();
    assert_eq!(report.epochs.len(), 1);
    assert!(report.test.is_none());
    assert!(report.checkpoint.is_none());
    assert!(!dir.path().join("unused").exists());
}

#[test]
fn test_run_fails_on_missing_pretrained_model() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("data");
    write_split(&data_root, "train", &[("ab", 32)]);
    write_split(&data_root, "valid", &[("ab", 32)]);

    let config = config(
        &data_root,
        &dir.path().join("run"),
        &format!(
            "  epochs: 1
  pretrained_model_path: '{}'",
            dir.path().join("missing.bin").display()
        ),
    );

    let err = run::<TrainBackend>(NdArrayDevice::Cpu, &config).unwrap_err();
    assert!(matches!(err, CrnnError::CheckpointIo { .. }));
}
