use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::{
    burn_ext::lstm::{BiLstm, BiLstmConfig},
    error::{CrnnError, Result},
};

/// The layer families of the network. Each one declares how its weights are
/// initialized when explicit initialization is requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Normalization,
    Recurrent,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InitRule {
    Normal { mean: f64, std: f64 },
    XavierUniform,
}

impl LayerKind {
    pub fn init_rule(self) -> InitRule {
        match self {
            LayerKind::Convolution => InitRule::Normal {
                mean: 0.0,
                std: 0.02,
            },
            // scale only, the shift starts at zero
            LayerKind::Normalization => InitRule::Normal {
                mean: 1.0,
                std: 0.02,
            },
            LayerKind::Recurrent => InitRule::XavierUniform,
            LayerKind::Linear => InitRule::Normal {
                mean: 0.0,
                std: 0.02,
            },
        }
    }
}

impl InitRule {
    pub fn initializer(self) -> Initializer {
        match self {
            InitRule::Normal { mean, std } => Initializer::Normal { mean, std },
            InitRule::XavierUniform => Initializer::XavierUniform { gain: 1.0 },
        }
    }
}

fn default_stride() -> [usize; 2] {
    [1, 1]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PoolingSpec {
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
    #[serde(default)]
    pub padding: [usize; 2],
}

/// One convolution, optionally followed by batch normalization, then ReLU,
/// then optionally max pooling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConvBlockSpec {
    pub channels: usize,
    pub kernel_size: [usize; 2],
    #[serde(default = "default_stride")]
    pub stride: [usize; 2],
    #[serde(default)]
    pub padding: [usize; 2],
    #[serde(default)]
    pub batch_norm: bool,
    #[serde(default)]
    pub pooling: Option<PoolingSpec>,
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: Option<BatchNorm<B, 2>>,
    pooling: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let conv = self.conv.forward(input);
        let conv = match &self.batch_norm {
            Some(batch_norm) => batch_norm.forward(conv),
            None => conv,
        };
        let conv = activation::relu(conv);

        match &self.pooling {
            Some(pooling) => pooling.forward(conv),
            None => conv,
        }
    }
}

#[derive(Module, Debug)]
pub struct CRNN<B: Backend> {
    // 1. cnn
    cnn: Vec<ConvBlock<B>>,
    // 2. rnn
    rnn: Vec<BiLstm<B>>,
    embedding: Linear<B>,
}

impl<B: Backend> CRNN<B> {
    /// # Shapes
    ///   - Images [batch_size, 1, height, width]
    ///   - Output [seq_length, batch_size, num_classes], log-probabilities
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let conv = self
            .cnn
            .iter()
            .fold(images, |conv, block| block.forward(conv));

        // columns of the feature map become timesteps
        let [batch_size, channels, height, width] = conv.dims();
        let features = conv
            .reshape([batch_size, channels * height, width])
            .swap_dims(1, 2);

        let features = self
            .rnn
            .iter()
            .fold(features, |features, layer| layer.forward(features));
        let output = self.embedding.forward(features);
        let output = activation::log_softmax(output, 2);

        output.swap_dims(0, 1)
    }
}

#[derive(Config, Debug)]
pub struct CRNNConfig {
    num_classes: usize,
    img_height: usize,
    cnn_structure: Vec<ConvBlockSpec>,
    #[config(default = 256)]
    rnn_hidden_size: usize,
    #[config(default = 2)]
    rnn_layers: usize,
    #[config(default = true)]
    bidirectional: bool,
    #[config(default = true)]
    weights_init: bool,
}

/// Output length of a convolution or pooling window along one dimension.
fn reduce(length: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = length + 2 * padding;
    (padded >= kernel && stride > 0).then(|| (padded - kernel) / stride + 1)
}

impl CRNNConfig {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn img_height(&self) -> usize {
        self.img_height
    }

    /// Size of one dimension (0: height, 1: width) after the convolutional stack.
    fn reduced(&self, dim: usize, length: usize) -> Result<usize> {
        self.cnn_structure
            .iter()
            .enumerate()
            .try_fold(length, |length, (idx, block)| {
                let length = reduce(
                    length,
                    block.kernel_size[dim],
                    block.stride[dim],
                    block.padding[dim],
                );
                let length = match (&block.pooling, length) {
                    (Some(pooling), Some(length)) => reduce(
                        length,
                        pooling.kernel_size[dim],
                        pooling.stride[dim],
                        pooling.padding[dim],
                    ),
                    (_, length) => length,
                };

                length.filter(|&len| len > 0).ok_or_else(|| {
                    CrnnError::shape_mismatch(format!(
                        "convolution block {idx} reduces the {} to nothing",
                        if dim == 0 { "height" } else { "width" },
                    ))
                })
            })
    }

    /// Number of timesteps the model produces for an image of this width.
    pub fn sequence_length(&self, width: usize) -> Result<usize> {
        self.reduced(1, width)
    }

    /// Feature size of each timestep entering the recurrent layers.
    pub fn feature_size(&self) -> Result<usize> {
        let height = self.reduced(0, self.img_height)?;
        let channels = self
            .cnn_structure
            .last()
            .map(|block| block.channels)
            .ok_or_else(|| CrnnError::Config("cnn_structure must not be empty".to_string()))?;

        Ok(channels * height)
    }

    fn initializer(&self, kind: LayerKind) -> Option<Initializer> {
        if self.weights_init {
            Some(kind.init_rule().initializer())
        } else {
            None
        }
    }

    fn batch_norm<B: Backend>(&self, channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
        let batch_norm = BatchNormConfig::new(channels).init(device);
        let Some(initializer) = self.initializer(LayerKind::Normalization) else {
            return batch_norm;
        };

        let mut record = batch_norm.clone().into_record();
        record.gamma = initializer.init([channels], device);
        record.beta = Initializer::Zeros.init([channels], device);
        batch_norm.load_record(record)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CRNN<B>> {
        let feature_size = self.feature_size()?;

        let mut in_channels = 1;
        let mut cnn = Vec::with_capacity(self.cnn_structure.len());
        for block in &self.cnn_structure {
            let mut conv = Conv2dConfig::new([in_channels, block.channels], block.kernel_size)
                .with_stride(block.stride)
                .with_padding(PaddingConfig2d::Explicit(block.padding[0], block.padding[1]));
            if let Some(initializer) = self.initializer(LayerKind::Convolution) {
                conv = conv.with_initializer(initializer);
            }
            let batch_norm = block
                .batch_norm
                .then(|| self.batch_norm(block.channels, device));
            let pooling = block.pooling.as_ref().map(|pooling| {
                MaxPool2dConfig::new(pooling.kernel_size)
                    .with_strides(pooling.stride)
                    .with_padding(PaddingConfig2d::Explicit(
                        pooling.padding[0],
                        pooling.padding[1],
                    ))
                    .init()
            });

            cnn.push(ConvBlock {
                conv: conv.init(device),
                batch_norm,
                pooling,
            });
            in_channels = block.channels;
        }

        let mut d_input = feature_size;
        let mut rnn = Vec::with_capacity(self.rnn_layers);
        for _ in 0..self.rnn_layers {
            let mut layer = BiLstmConfig::new(d_input, self.rnn_hidden_size, self.bidirectional);
            if let Some(initializer) = self.initializer(LayerKind::Recurrent) {
                layer = layer.with_initializer(initializer);
            }
            d_input = layer.d_output();
            rnn.push(layer.init(device));
        }

        let mut embedding = LinearConfig::new(d_input, self.num_classes);
        if let Some(initializer) = self.initializer(LayerKind::Linear) {
            embedding = embedding.with_initializer(initializer);
        }

        Ok(CRNN {
            cnn,
            rnn,
            embedding: embedding.init(device),
        })
    }
}
