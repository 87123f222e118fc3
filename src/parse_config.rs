use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    converter::Converter,
    error::{CrnnError, Result},
    model::{CRNNConfig, ConvBlockSpec},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    RmsProp,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug)]
struct ModelYaml {
    #[serde(default)]
    alphabet: Option<String>,
    #[serde(default)]
    alphabet_path: Option<PathBuf>,
    #[serde(default)]
    blank_index: usize,
    img_height: usize,
    cnn_structure: Vec<ConvBlockSpec>,
    #[serde(default = "default_rnn_layers")]
    rnn_layers: usize,
    #[serde(default = "default_rnn_hidden_size")]
    rnn_hidden_size: usize,
    #[serde(default = "default_true")]
    bidirectional: bool,
    #[serde(default = "default_true")]
    weights_init: bool,
}

fn default_rnn_layers() -> usize {
    2
}

fn default_rnn_hidden_size() -> usize {
    256
}

#[derive(Serialize, Deserialize, Debug)]
struct TrainingYaml {
    data_root: PathBuf,
    #[serde(default = "default_train_split")]
    train_split: String,
    #[serde(default = "default_valid_split")]
    valid_split: String,
    #[serde(default = "default_test_split")]
    test_split: String,
    #[serde(default)]
    max_width: Option<u32>,
    #[serde(default = "default_pad_value")]
    pad_value: u8,
    batch_size: usize,
    #[serde(default)]
    num_workers: usize,
    #[serde(default)]
    prefetch: Option<usize>,
    epochs: usize,
    #[serde(default)]
    seed: u64,
    learning_rate: f64,
    #[serde(default)]
    optimizer: OptimizerKind,
    #[serde(default = "default_beta1")]
    beta1: f64,
    #[serde(default)]
    cuda: bool,
    #[serde(default)]
    pretrained_model_path: Option<PathBuf>,
    #[serde(default)]
    save: bool,
    #[serde(default = "default_save_dir")]
    save_dir: PathBuf,
    #[serde(default = "default_true")]
    run_test: bool,
    #[serde(default = "default_inspect_interval")]
    inspect_interval: usize,
    #[serde(default)]
    variable_input_lengths: bool,
}

fn default_train_split() -> String {
    "train".to_string()
}

fn default_valid_split() -> String {
    "valid".to_string()
}

fn default_test_split() -> String {
    "test".to_string()
}

fn default_pad_value() -> u8 {
    255
}

fn default_beta1() -> f64 {
    0.5
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("./runs")
}

fn default_inspect_interval() -> usize {
    10
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct CrnnTrainingConfigYaml {
    model: ModelYaml,
    training: TrainingYaml,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CrnnTrainingConfig {
    /// All classes, the blank symbol included.
    pub alphabet: String,
    pub blank_index: usize,
    pub img_height: usize,
    pub cnn_structure: Vec<ConvBlockSpec>,
    pub rnn_layers: usize,
    pub rnn_hidden_size: usize,
    pub bidirectional: bool,
    pub weights_init: bool,

    pub data_root: PathBuf,
    pub train_split: String,
    pub valid_split: String,
    pub test_split: String,
    pub max_width: Option<u32>,
    /// Fill value of the padded columns, in raw pixel units.
    pub pad_value: u8,
    pub batch_size: usize,
    pub num_workers: usize,
    pub prefetch: Option<usize>,
    pub epochs: usize,
    pub seed: u64,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub beta1: f64,
    pub cuda: bool,
    pub pretrained_model_path: Option<PathBuf>,
    pub save: bool,
    pub save_dir: PathBuf,
    pub run_test: bool,
    pub inspect_interval: usize,
    pub variable_input_lengths: bool,
}

impl CrnnTrainingConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            CrnnError::Config(format!("fail to read {}: {err}", path.display()))
        })?;

        Self::from_str_in(&content, path.parent().unwrap_or_else(|| Path::new(".")))
    }

    /// Parses a configuration. A relative `alphabet_path` is resolved against
    /// `base_dir`.
    pub fn from_str_in(content: &str, base_dir: &Path) -> Result<Self> {
        let yaml: CrnnTrainingConfigYaml = serde_yaml::from_str(content)?;
        let model = yaml.model;
        let training = yaml.training;

        let alphabet = match (model.alphabet, model.alphabet_path) {
            (Some(alphabet), _) => alphabet,
            (None, Some(alphabet_path)) => {
                let alphabet_path = base_dir.join(alphabet_path);
                let content = fs::read_to_string(&alphabet_path).map_err(|err| {
                    CrnnError::Config(format!(
                        "fail to read alphabet {}: {err}",
                        alphabet_path.display()
                    ))
                })?;
                // line breaks only separate symbols
                content.chars().filter(|&ch| ch != '\n' && ch != '\r').collect()
            }
            (None, None) => {
                return Err(CrnnError::Config(
                    "MODEL needs either `alphabet` or `alphabet_path`".to_string(),
                ))
            }
        };

        let config = Self {
            alphabet,
            blank_index: model.blank_index,
            img_height: model.img_height,
            cnn_structure: model.cnn_structure,
            rnn_layers: model.rnn_layers,
            rnn_hidden_size: model.rnn_hidden_size,
            bidirectional: model.bidirectional,
            weights_init: model.weights_init,
            data_root: training.data_root,
            train_split: training.train_split,
            valid_split: training.valid_split,
            test_split: training.test_split,
            max_width: training.max_width,
            pad_value: training.pad_value,
            batch_size: training.batch_size,
            num_workers: training.num_workers,
            prefetch: training.prefetch,
            epochs: training.epochs,
            seed: training.seed,
            learning_rate: training.learning_rate,
            optimizer: training.optimizer,
            beta1: training.beta1,
            cuda: training.cuda,
            pretrained_model_path: training.pretrained_model_path,
            save: training.save,
            save_dir: training.save_dir,
            run_test: training.run_test,
            inspect_interval: training.inspect_interval,
            variable_input_lengths: training.variable_input_lengths,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(CrnnError::Config(message.to_string()));

        if self.batch_size == 0 {
            return fail("batch_size must be positive");
        }
        if self.epochs == 0 {
            return fail("epochs must be positive");
        }
        if self.img_height == 0 {
            return fail("img_height must be positive");
        }
        if self.cnn_structure.is_empty() {
            return fail("cnn_structure must not be empty");
        }
        if self.rnn_layers == 0 {
            return fail("rnn_layers must be positive");
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return fail("learning_rate must be positive");
        }
        self.converter()?;
        self.model_config().feature_size()?;

        Ok(())
    }

    pub fn converter(&self) -> Result<Converter> {
        Converter::new(&self.alphabet, self.blank_index)
    }

    pub fn num_classes(&self) -> usize {
        self.alphabet.chars().count()
    }

    pub fn model_config(&self) -> CRNNConfig {
        CRNNConfig::new(
            self.num_classes(),
            self.img_height,
            self.cnn_structure.clone(),
        )
        .with_rnn_hidden_size(self.rnn_hidden_size)
        .with_rnn_layers(self.rnn_layers)
        .with_bidirectional(self.bidirectional)
        .with_weights_init(self.weights_init)
    }
}
