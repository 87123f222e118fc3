use burn::{
    config::Config,
    module::Module,
    nn::{Initializer, Linear, LinearConfig},
    tensor::{activation, backend::Backend, Tensor},
};

/// A single-direction LSTM layer. The four gates (input, forget, cell, output)
/// share one input projection and one hidden projection.
#[derive(Module, Debug)]
pub struct Lstm<B: Backend> {
    input_transform: Linear<B>,
    hidden_transform: Linear<B>,
    d_hidden: usize,
}

#[derive(Config, Debug)]
pub struct LstmConfig {
    d_input: usize,
    d_hidden: usize,
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    initializer: Initializer,
}

impl LstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Lstm<B> {
        Lstm {
            input_transform: LinearConfig::new(self.d_input, 4 * self.d_hidden)
                .with_initializer(self.initializer.clone())
                .init(device),
            hidden_transform: LinearConfig::new(self.d_hidden, 4 * self.d_hidden)
                .with_bias(false)
                .with_initializer(self.initializer.clone())
                .init(device),
            d_hidden: self.d_hidden,
        }
    }
}

impl<B: Backend> Lstm<B> {
    /// # Shapes
    ///   - Input [batch_size, seq_length, d_input]
    ///   - Output [batch_size, seq_length, d_hidden]
    ///
    /// With `reverse` the sequence is consumed from the last timestep to the
    /// first; outputs stay aligned with their input positions.
    pub fn forward(&self, input: Tensor<B, 3>, reverse: bool) -> Tensor<B, 3> {
        let device = input.device();
        let [batch_size, seq_length, _] = input.dims();
        let d_gates = 4 * self.d_hidden;
        let hidden = self.d_hidden;

        let projected = self.input_transform.forward(input);
        let mut hidden_state = Tensor::<B, 2>::zeros([batch_size, hidden], &device);
        let mut cell_state = Tensor::<B, 2>::zeros([batch_size, hidden], &device);

        let steps: Vec<usize> = if reverse {
            (0..seq_length).rev().collect()
        } else {
            (0..seq_length).collect()
        };
        let mut outputs = Vec::with_capacity(seq_length);

        for t in steps {
            let gates = projected
                .clone()
                .slice([0..batch_size, t..(t + 1), 0..d_gates])
                .reshape([batch_size, d_gates])
                + self.hidden_transform.forward(hidden_state);
            let gate = |k: usize| gates.clone().slice([0..batch_size, (k * hidden)..((k + 1) * hidden)]);

            let input_gate = activation::sigmoid(gate(0));
            let forget_gate = activation::sigmoid(gate(1));
            let cell_candidate = activation::tanh(gate(2));
            let output_gate = activation::sigmoid(gate(3));

            cell_state = forget_gate * cell_state + input_gate * cell_candidate;
            hidden_state = output_gate * activation::tanh(cell_state.clone());
            outputs.push(hidden_state.clone());
        }

        if reverse {
            outputs.reverse();
        }

        Tensor::stack(outputs, 1)
    }
}

/// LSTM layer read in both directions; the two hidden sequences are
/// concatenated on the feature dimension.
#[derive(Module, Debug)]
pub struct BiLstm<B: Backend> {
    forward_layer: Lstm<B>,
    backward_layer: Option<Lstm<B>>,
}

#[derive(Config, Debug)]
pub struct BiLstmConfig {
    d_input: usize,
    d_hidden: usize,
    bidirectional: bool,
    #[config(default = "Initializer::XavierUniform{gain:1.0}")]
    initializer: Initializer,
}

impl BiLstmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BiLstm<B> {
        let lstm = LstmConfig::new(self.d_input, self.d_hidden)
            .with_initializer(self.initializer.clone());

        BiLstm {
            forward_layer: lstm.init(device),
            backward_layer: self.bidirectional.then(|| lstm.init(device)),
        }
    }

    /// Feature size of the output sequence.
    pub fn d_output(&self) -> usize {
        if self.bidirectional {
            2 * self.d_hidden
        } else {
            self.d_hidden
        }
    }
}

impl<B: Backend> BiLstm<B> {
    /// # Shapes
    ///   - Input [batch_size, seq_length, d_input]
    ///   - Output [batch_size, seq_length, d_hidden * directions]
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let forward = self.forward_layer.forward(input.clone(), false);

        match &self.backward_layer {
            Some(backward_layer) => {
                Tensor::cat(vec![forward, backward_layer.forward(input, true)], 2)
            }
            None => forward,
        }
    }
}
