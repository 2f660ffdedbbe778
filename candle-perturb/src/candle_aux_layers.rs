use candle_core::{Result, Tensor};
use candle_nn::{Activation, BatchNorm, Dropout, LayerNorm, Linear, Module, ModuleT, VarBuilder};

/// Per-layer normalization choice inside a fully-connected stack.
pub enum NormLayer {
    Batch(BatchNorm),
    Layer(LayerNorm),
}

impl NormLayer {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            NormLayer::Batch(bn) => bn.forward_t(x, train),
            NormLayer::Layer(ln) => ln.forward(x),
        }
    }
}

/// One fully-connected block: linear -> (norm) -> (activation) -> (dropout)
pub struct FcBlock {
    linear: Linear,
    norm: Option<NormLayer>,
    activation: Option<Activation>,
    dropout: Option<Dropout>,
}

/// build a stack of fully-connected blocks
pub struct FcStack {
    blocks: Vec<FcBlock>,
}

impl ModuleT for FcStack {
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for block in self.blocks.iter() {
            x = block.linear.forward(&x)?;
            if let Some(norm) = &block.norm {
                x = norm.forward_t(&x, train)?;
            }
            if let Some(activation) = &block.activation {
                x = activation.forward(&x)?;
            }
            if let Some(dropout) = &block.dropout {
                x = dropout.forward(&x, train)?;
            }
        }
        Ok(x)
    }
}

impl FcStack {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Appends a block after all the current blocks.
    pub fn push(&mut self, block: FcBlock) {
        self.blocks.push(block);
    }
}

impl Default for FcStack {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FcStackConfig {
    pub n_hidden: usize,
    pub n_layers: usize,
    pub use_batch_norm: bool,
    pub use_layer_norm: bool,
    pub dropout_rate: f32,
}

/// Will create a stack of `n_layers` hidden blocks with these variables:
///
/// * `{prefix}.fc.{}.weight` where {} is the layer index
/// * `{prefix}.fc.{}.bias`
/// * `{prefix}.bn.{}` / `{prefix}.ln.{}` when normalization is on
///
/// # Arguments
/// * `in_dim` - input dimension
/// * `config` - hidden width, depth, normalization and dropout
/// * `vs` - variable builder
pub fn fc_stack(in_dim: usize, config: &FcStackConfig, vs: VarBuilder) -> Result<FcStack> {
    let bn_config = candle_nn::BatchNormConfig {
        eps: 1e-4,
        remove_mean: true,
        affine: true,
        momentum: 0.1,
    };

    debug_assert!(config.n_layers > 0);

    let mut stack = FcStack::new();
    let mut prev_dim = in_dim;

    for j in 0..config.n_layers {
        let linear = candle_nn::linear(prev_dim, config.n_hidden, vs.pp(format!("fc.{}", j)))?;

        let norm = if config.use_batch_norm {
            Some(NormLayer::Batch(candle_nn::batch_norm(
                config.n_hidden,
                bn_config,
                vs.pp(format!("bn.{}", j)),
            )?))
        } else if config.use_layer_norm {
            Some(NormLayer::Layer(candle_nn::layer_norm(
                config.n_hidden,
                1e-4,
                vs.pp(format!("ln.{}", j)),
            )?))
        } else {
            None
        };

        let dropout = if config.dropout_rate > 0.0 {
            Some(Dropout::new(config.dropout_rate))
        } else {
            None
        };

        stack.push(FcBlock {
            linear,
            norm,
            activation: Some(Activation::Relu),
            dropout,
        });

        prev_dim = config.n_hidden;
    }

    Ok(stack)
}
