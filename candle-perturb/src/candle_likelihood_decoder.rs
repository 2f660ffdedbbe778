use crate::candle_aux_layers::{fc_stack, FcStack, FcStackConfig};
use crate::candle_loss_functions::{
    gaussian_log_likelihood, nb_log_likelihood, zinb_log_likelihood,
};
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, Module, ModuleT, VarBuilder};

/// Output likelihood family, fixed at construction. Parsing an unknown
/// name is a fatal configuration error, not a runtime branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconLossKind {
    Gauss,
    Nb,
    Zinb,
}

impl ReconLossKind {
    /// Count likelihoods log1p the encoder input and carry a library factor
    pub fn is_count(&self) -> bool {
        matches!(self, ReconLossKind::Nb | ReconLossKind::Zinb)
    }
}

impl std::str::FromStr for ReconLossKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "gauss" => Ok(Self::Gauss),
            "nb" => Ok(Self::Nb),
            "zinb" => Ok(Self::Zinb),
            _ => Err(anyhow::anyhow!("unknown reconstruction loss: {}", s)),
        }
    }
}

/// Parameters of the chosen output likelihood for one batch.
pub enum LikelihoodParams {
    Gauss {
        mean: Tensor,
        lnvar: Tensor,
    },
    Nb {
        mu: Tensor,
        theta: Tensor,
    },
    Zinb {
        mu: Tensor,
        theta: Tensor,
        zi_logits: Tensor,
    },
}

impl LikelihoodParams {
    /// log p(x | .) per cell, summed over genes
    pub fn log_prob(&self, x_nd: &Tensor) -> Result<Tensor> {
        match self {
            LikelihoodParams::Gauss { mean, lnvar } => {
                gaussian_log_likelihood(x_nd, mean, lnvar)
            }
            LikelihoodParams::Nb { mu, theta } => nb_log_likelihood(x_nd, mu, theta),
            LikelihoodParams::Zinb {
                mu,
                theta,
                zi_logits,
            } => zinb_log_likelihood(x_nd, mu, theta, zi_logits),
        }
    }

    /// Predicted mean expression (location for Gauss, rate for counts)
    pub fn mean(&self) -> &Tensor {
        match self {
            LikelihoodParams::Gauss { mean, .. } => mean,
            LikelihoodParams::Nb { mu, .. } => mu,
            LikelihoodParams::Zinb { mu, .. } => mu,
        }
    }

    /// Predicted per-gene variance
    pub fn variance(&self) -> Result<Tensor> {
        match self {
            LikelihoodParams::Gauss { lnvar, .. } => lnvar.exp(),
            LikelihoodParams::Nb { mu, theta } | LikelihoodParams::Zinb { mu, theta, .. } => {
                mu + mu.powf(2.)?.broadcast_div(theta)?
            }
        }
    }
}

/// Maps the composed latent code (plus library factor for counts) to the
/// parameters of the configured likelihood.
pub enum LikelihoodDecoder {
    Gauss(GaussDecoder),
    Count(CountDecoder),
}

impl LikelihoodDecoder {
    pub fn new(
        kind: ReconLossKind,
        n_latent: usize,
        n_genes: usize,
        fc_config: &FcStackConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        match kind {
            ReconLossKind::Gauss => Ok(Self::Gauss(GaussDecoder::new(
                n_latent, n_genes, fc_config, vs,
            )?)),
            ReconLossKind::Nb => Ok(Self::Count(CountDecoder::new(
                n_latent, n_genes, false, fc_config, vs,
            )?)),
            ReconLossKind::Zinb => Ok(Self::Count(CountDecoder::new(
                n_latent, n_genes, true, fc_config, vs,
            )?)),
        }
    }

    /// * `z_nk` - composed latent (n x k)
    /// * `library_n1` - log-library factor, required for count likelihoods
    pub fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: Option<&Tensor>,
        train: bool,
    ) -> Result<LikelihoodParams> {
        match self {
            LikelihoodDecoder::Gauss(dec) => dec.forward_t(z_nk, train),
            LikelihoodDecoder::Count(dec) => {
                let library_n1 = library_n1.ok_or_else(|| {
                    candle_core::Error::Msg("count decoder requires a library factor".into())
                })?;
                dec.forward_t(z_nk, library_n1, train)
            }
        }
    }

    pub fn dim_latent(&self) -> usize {
        match self {
            LikelihoodDecoder::Gauss(dec) => dec.n_latent,
            LikelihoodDecoder::Count(dec) => dec.n_latent,
        }
    }

    pub fn dim_obs(&self) -> usize {
        match self {
            LikelihoodDecoder::Gauss(dec) => dec.n_genes,
            LikelihoodDecoder::Count(dec) => dec.n_genes,
        }
    }
}

/// Gaussian decoder with mean and log-variance heads
pub struct GaussDecoder {
    n_latent: usize,
    n_genes: usize,
    fc: FcStack,
    mean_head: Linear,
    lnvar_head: Linear,
}

impl GaussDecoder {
    /// Will create a new Gaussian decoder with these variables:
    ///
    /// * `nn.dec.fc.{}.weight` where {} is the layer index
    /// * `nn.dec.px.mean.weight`
    /// * `nn.dec.px.lnvar.weight`
    pub fn new(
        n_latent: usize,
        n_genes: usize,
        fc_config: &FcStackConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = fc_stack(n_latent, fc_config, vs.pp("nn.dec"))?;
        let mean_head = candle_nn::linear(fc_config.n_hidden, n_genes, vs.pp("nn.dec.px.mean"))?;
        let lnvar_head = candle_nn::linear(fc_config.n_hidden, n_genes, vs.pp("nn.dec.px.lnvar"))?;

        Ok(Self {
            n_latent,
            n_genes,
            fc,
            mean_head,
            lnvar_head,
        })
    }

    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<LikelihoodParams> {
        let min_lv = -8.;
        let max_lv = 8.;

        let h_nl = self.fc.forward_t(z_nk, train)?;
        let mean = self.mean_head.forward(&h_nl)?;
        let lnvar = self.lnvar_head.forward(&h_nl)?.clamp(min_lv, max_lv)?;

        Ok(LikelihoodParams::Gauss { mean, lnvar })
    }
}

/// Count decoder: softmax gene proportions scaled by the library size,
/// a shared per-gene inverse-dispersion vector, and (for ZINB) a
/// per-gene dropout-logit head.
pub struct CountDecoder {
    n_latent: usize,
    n_genes: usize,
    fc: FcStack,
    scale_head: Linear,
    dropout_head: Option<Linear>,
    px_r: Tensor,
}

impl CountDecoder {
    /// Will create a new count decoder with these variables:
    ///
    /// * `nn.dec.fc.{}.weight` where {} is the layer index
    /// * `nn.dec.px.scale.weight`
    /// * `nn.dec.px.dropout.weight` (ZINB only)
    /// * `px_r` - per-gene log inverse dispersion (1 x n_genes)
    pub fn new(
        n_latent: usize,
        n_genes: usize,
        zero_inflated: bool,
        fc_config: &FcStackConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = fc_stack(n_latent, fc_config, vs.pp("nn.dec"))?;
        let scale_head = candle_nn::linear(fc_config.n_hidden, n_genes, vs.pp("nn.dec.px.scale"))?;

        let dropout_head = if zero_inflated {
            Some(candle_nn::linear(
                fc_config.n_hidden,
                n_genes,
                vs.pp("nn.dec.px.dropout"),
            )?)
        } else {
            None
        };

        let init_r = candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        };
        let px_r = vs.get_with_hints((1, n_genes), "px_r", init_r)?;

        Ok(Self {
            n_latent,
            n_genes,
            fc,
            scale_head,
            dropout_head,
            px_r,
        })
    }

    fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        train: bool,
    ) -> Result<LikelihoodParams> {
        let h_nl = self.fc.forward_t(z_nk, train)?;

        let scale_nd = ops::softmax(&self.scale_head.forward(&h_nl)?, 1)?;
        let mu_nd = scale_nd.broadcast_mul(&library_n1.exp()?)?;

        let theta_1d = self.px_r.clamp(-8., 8.)?.exp()?;

        match &self.dropout_head {
            Some(head) => Ok(LikelihoodParams::Zinb {
                mu: mu_nd,
                theta: theta_1d,
                zi_logits: head.forward(&h_nl)?,
            }),
            None => Ok(LikelihoodParams::Nb {
                mu: mu_nd,
                theta: theta_1d,
            }),
        }
    }
}
