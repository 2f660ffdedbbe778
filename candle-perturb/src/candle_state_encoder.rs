use crate::candle_aux_layers::{fc_stack, FcStack, FcStackConfig};
use crate::candle_model_traits::GaussianPosterior;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, ModuleT, VarBuilder};

/// Basal latent state of a batch of cells, with the posterior attached
/// when the encoder is variational.
pub struct BasalState {
    pub z_basal: Tensor,
    pub posterior: Option<GaussianPosterior>,
}

/// Maps expression to the perturbation-independent basal latent state.
///
/// The deterministic/variational choice is fixed when the module is
/// built; which outputs exist never changes over the encoder's lifetime.
pub enum StateEncoder {
    Deterministic(DeterministicStateEncoder),
    Variational(VariationalStateEncoder),
}

impl StateEncoder {
    /// * `x_nd` - (optionally log1p-transformed) expression (n x d)
    /// * `train` - whether to use dropout/batchnorm or not
    /// * `n_samples` - posterior draws; only meaningful for the
    ///   variational variant, where `n_samples > 1` yields an
    ///   (s x n x k) latent
    pub fn forward_t(&self, x_nd: &Tensor, train: bool, n_samples: usize) -> Result<BasalState> {
        match self {
            StateEncoder::Deterministic(enc) => Ok(BasalState {
                z_basal: enc.forward_t(x_nd, train)?,
                posterior: None,
            }),
            StateEncoder::Variational(enc) => {
                let posterior = enc.latent_gaussian_params(x_nd, train)?;
                let z_basal = if n_samples > 1 {
                    posterior.rsample_n(n_samples)?
                } else if train {
                    posterior.rsample()?
                } else {
                    posterior.mean.clone()
                };
                Ok(BasalState {
                    z_basal,
                    posterior: Some(posterior),
                })
            }
        }
    }

    pub fn dim_obs(&self) -> usize {
        match self {
            StateEncoder::Deterministic(enc) => enc.n_genes,
            StateEncoder::Variational(enc) => enc.n_genes,
        }
    }

    pub fn dim_latent(&self) -> usize {
        match self {
            StateEncoder::Deterministic(enc) => enc.n_latent,
            StateEncoder::Variational(enc) => enc.n_latent,
        }
    }
}

/// Feed-forward point-estimate encoder
pub struct DeterministicStateEncoder {
    n_genes: usize,
    n_latent: usize,
    fc: FcStack,
    z_out: Linear,
}

impl DeterministicStateEncoder {
    /// Will create a new deterministic encoder with these variables:
    ///
    /// * `nn.enc.fc.{}.weight` where {} is the layer index
    /// * `nn.enc.z.out.weight`
    pub fn new(
        n_genes: usize,
        n_latent: usize,
        fc_config: &FcStackConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = fc_stack(n_genes, fc_config, vs.pp("nn.enc"))?;
        let z_out = candle_nn::linear(fc_config.n_hidden, n_latent, vs.pp("nn.enc.z.out"))?;

        Ok(Self {
            n_genes,
            n_latent,
            fc,
            z_out,
        })
    }

    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        let h_nl = self.fc.forward_t(x_nd, train)?;
        self.z_out.forward(&h_nl)
    }
}

/// Encoder with a Gaussian posterior over the basal latent
pub struct VariationalStateEncoder {
    n_genes: usize,
    n_latent: usize,
    fc: FcStack,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl VariationalStateEncoder {
    /// Will create a new variational encoder with these variables:
    ///
    /// * `nn.enc.fc.{}.weight` where {} is the layer index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    pub fn new(
        n_genes: usize,
        n_latent: usize,
        fc_config: &FcStackConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = fc_stack(n_genes, fc_config, vs.pp("nn.enc"))?;
        let z_mean = candle_nn::linear(fc_config.n_hidden, n_latent, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(fc_config.n_hidden, n_latent, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            n_genes,
            n_latent,
            fc,
            z_mean,
            z_lnvar,
        })
    }

    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    fn latent_gaussian_params(&self, x_nd: &Tensor, train: bool) -> Result<GaussianPosterior> {
        let min_mean = -(self.n_genes as f64).sqrt(); // stabilize
        let max_mean = (self.n_genes as f64).sqrt(); // mean
        let min_lv = -8.; // and log variance
        let max_lv = 8.; //

        let h_nl = self.fc.forward_t(x_nd, train)?;
        let mean = self.z_mean.forward(&h_nl)?.clamp(min_mean, max_mean)?;
        let lnvar = self.z_lnvar.forward(&h_nl)?.clamp(min_lv, max_lv)?;

        Ok(GaussianPosterior { mean, lnvar })
    }
}

/// One-hidden-layer variational encoder for the scalar log-library size
/// used by the count likelihoods.
pub struct LibraryEncoder {
    fc: FcStack,
    l_mean: Linear,
    l_lnvar: Linear,
}

impl LibraryEncoder {
    /// Will create a new library encoder with these variables:
    ///
    /// * `nn.lib.fc.0.weight`
    /// * `nn.lib.l.mean.weight`
    /// * `nn.lib.l.lnvar.weight`
    pub fn new(n_genes: usize, n_hidden: usize, dropout_rate: f32, vs: VarBuilder) -> Result<Self> {
        let fc_config = FcStackConfig {
            n_hidden,
            n_layers: 1,
            use_batch_norm: false,
            use_layer_norm: false,
            dropout_rate,
        };

        let fc = fc_stack(n_genes, &fc_config, vs.pp("nn.lib"))?;
        let l_mean = candle_nn::linear(n_hidden, 1, vs.pp("nn.lib.l.mean"))?;
        let l_lnvar = candle_nn::linear(n_hidden, 1, vs.pp("nn.lib.l.lnvar"))?;

        Ok(Self { fc, l_mean, l_lnvar })
    }

    /// Posterior over log-library size from log1p expression
    pub fn forward_t(&self, x_log_nd: &Tensor, train: bool) -> Result<GaussianPosterior> {
        let min_lv = -8.;
        let max_lv = 8.;

        let h_nl = self.fc.forward_t(x_log_nd, train)?;
        let mean = self.l_mean.forward(&h_nl)?;
        let lnvar = self.l_lnvar.forward(&h_nl)?.clamp(min_lv, max_lv)?;

        Ok(GaussianPosterior { mean, lnvar })
    }
}
