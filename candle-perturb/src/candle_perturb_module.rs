use crate::candle_aux_layers::FcStackConfig;
use crate::candle_covariate_embedding::CovariateEmbedding;
use crate::candle_data_loader::{CovariateSpec, PerturbBatch};
use crate::candle_likelihood_decoder::{LikelihoodDecoder, LikelihoodParams, ReconLossKind};
use crate::candle_metrics::{knn_purity, nan_to_num, r2_score, METRIC_CLAMP};
use crate::candle_model_traits::GaussianPosterior;
use crate::candle_perturbation_encoder::{DoseResponseKind, PerturbationEncoder};
use crate::candle_state_encoder::{
    DeterministicStateEncoder, LibraryEncoder, StateEncoder, VariationalStateEncoder,
};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Beta, Distribution};
use std::collections::BTreeMap;

/// Architecture of the perturbation-response module. Everything here is
/// fixed at construction and immutable afterwards.
#[derive(Debug, Clone)]
pub struct PerturbModuleConfig {
    pub n_genes: usize,
    pub n_perts: usize,
    pub covars_encoder: CovariateSpec,
    pub n_latent: usize,
    pub recon_loss: ReconLossKind,
    pub doser_kind: DoseResponseKind,
    pub n_hidden_encoder: usize,
    pub n_layers_encoder: usize,
    pub n_hidden_decoder: usize,
    pub n_layers_decoder: usize,
    pub n_hidden_doser: usize,
    pub n_layers_doser: usize,
    pub n_hidden_library: usize,
    pub use_batch_norm_encoder: bool,
    pub use_layer_norm_encoder: bool,
    pub use_batch_norm_decoder: bool,
    pub use_layer_norm_decoder: bool,
    pub dropout_rate_encoder: f32,
    pub dropout_rate_decoder: f32,
    pub variational: bool,
    pub seed: u64,
}

impl PerturbModuleConfig {
    pub fn new(n_genes: usize, n_perts: usize, covars_encoder: CovariateSpec) -> Self {
        Self {
            n_genes,
            n_perts,
            covars_encoder,
            n_latent: 128,
            recon_loss: ReconLossKind::Nb,
            doser_kind: DoseResponseKind::LogSigm,
            n_hidden_encoder: 256,
            n_layers_encoder: 3,
            n_hidden_decoder: 256,
            n_layers_decoder: 3,
            n_hidden_doser: 128,
            n_layers_doser: 2,
            n_hidden_library: 128,
            use_batch_norm_encoder: true,
            use_layer_norm_encoder: false,
            use_batch_norm_decoder: true,
            use_layer_norm_decoder: false,
            dropout_rate_encoder: 0.0,
            dropout_rate_decoder: 0.0,
            variational: false,
            seed: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_genes > 0, "n_genes must be positive");
        anyhow::ensure!(self.n_perts > 0, "n_perts must be positive");
        anyhow::ensure!(self.n_latent > 0, "n_latent must be positive");
        anyhow::ensure!(self.n_layers_encoder > 0, "encoder needs at least one layer");
        anyhow::ensure!(self.n_layers_decoder > 0, "decoder needs at least one layer");
        for (name, &n_cats) in self.covars_encoder.iter() {
            anyhow::ensure!(n_cats > 0, "covariate {} has zero categories", name);
        }
        Ok(())
    }
}

/// A batch with its mixup companion view: blended expression plus the
/// recorded true/permuted treatment and covariate assignments.
pub struct MixedBatch {
    /// blended expression fed to the encoder
    pub x: Tensor,
    pub x_true: Tensor,
    pub x_mixup: Tensor,
    pub pert_ids_true: Tensor,
    pub pert_ids_mixup: Tensor,
    pub pert_doses_true: Tensor,
    pub pert_doses_mixup: Tensor,
    pub pert_label: Tensor,
    pub covar_ids_true: BTreeMap<String, Tensor>,
    pub covar_ids_mixup: BTreeMap<String, Tensor>,
    pub deg_mask: Option<Tensor>,
    pub mixup_lambda: f64,
}

/// Everything the inference step produces for one batch.
pub struct InferenceOutputs {
    /// composed latent: z_basal + z_pert + z_covs
    pub z: Tensor,
    pub z_basal: Tensor,
    pub z_covs: Tensor,
    pub z_pert: Tensor,
    /// log-library factor (count likelihoods only)
    pub library: Option<Tensor>,
    /// posterior over the basal latent (variational only)
    pub qz: Option<GaussianPosterior>,
    /// posterior over log-library size (count likelihoods only)
    pub ql: Option<GaussianPosterior>,
    pub mixup_lambda: f64,
}

/// Output likelihood of the generative step. The latent prior is the
/// standard normal by construction; the KL term is computed in closed
/// form against it.
pub struct GenerativeOutputs {
    pub px: LikelihoodParams,
}

/// Conditional autoencoder over perturbed single-cell expression.
///
/// The latent code of a cell is the elementwise sum of a basal state,
/// a perturbation effect, and summed covariate effects; nothing else
/// mixes the three components.
pub struct PerturbModule {
    n_genes: usize,
    n_latent: usize,
    recon_loss: ReconLossKind,
    variational: bool,
    covars_encoder: CovariateSpec,

    state_encoder: StateEncoder,
    library_encoder: Option<LibraryEncoder>,
    pert_encoder: PerturbationEncoder,
    covar_embedding: CovariateEmbedding,
    decoder: LikelihoodDecoder,
}

impl PerturbModule {
    /// Build the module under the `vs` namespace. Parameter paths:
    ///
    /// * `enc.*` - state encoder and library encoder
    /// * `dec.*` - likelihood decoder (incl. `dec.px_r`)
    /// * `pert.embedding.*` / `pert.dosers.*` - perturbation network
    /// * `covars.*` - covariate embedding tables
    pub fn new(config: &PerturbModuleConfig, vs: VarBuilder, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;
        // the CPU backend cannot be seeded
        if !device.is_cpu() {
            device.set_seed(config.seed)?;
        }

        let enc_fc = FcStackConfig {
            n_hidden: config.n_hidden_encoder,
            n_layers: config.n_layers_encoder,
            use_batch_norm: config.use_batch_norm_encoder,
            use_layer_norm: config.use_layer_norm_encoder,
            dropout_rate: config.dropout_rate_encoder,
        };
        let dec_fc = FcStackConfig {
            n_hidden: config.n_hidden_decoder,
            n_layers: config.n_layers_decoder,
            use_batch_norm: config.use_batch_norm_decoder,
            use_layer_norm: config.use_layer_norm_decoder,
            dropout_rate: config.dropout_rate_decoder,
        };

        let state_encoder = if config.variational {
            StateEncoder::Variational(VariationalStateEncoder::new(
                config.n_genes,
                config.n_latent,
                &enc_fc,
                vs.pp("enc"),
            )?)
        } else {
            StateEncoder::Deterministic(DeterministicStateEncoder::new(
                config.n_genes,
                config.n_latent,
                &enc_fc,
                vs.pp("enc"),
            )?)
        };

        let library_encoder = if config.recon_loss.is_count() {
            Some(LibraryEncoder::new(
                config.n_genes,
                config.n_hidden_library,
                config.dropout_rate_decoder,
                vs.pp("enc"),
            )?)
        } else {
            None
        };

        let decoder = LikelihoodDecoder::new(
            config.recon_loss,
            config.n_latent,
            config.n_genes,
            &dec_fc,
            vs.pp("dec"),
        )?;

        let pert_encoder = PerturbationEncoder::new(
            config.n_perts,
            config.n_latent,
            config.doser_kind,
            config.n_hidden_doser,
            config.n_layers_doser,
            vs.pp("pert"),
        )?;

        let covar_embedding =
            CovariateEmbedding::new(&config.covars_encoder, config.n_latent, vs.pp("covars"))?;

        Ok(Self {
            n_genes: config.n_genes,
            n_latent: config.n_latent,
            recon_loss: config.recon_loss,
            variational: config.variational,
            covars_encoder: config.covars_encoder.clone(),

            state_encoder,
            library_encoder,
            pert_encoder,
            covar_embedding,
            decoder,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn n_latent(&self) -> usize {
        self.n_latent
    }

    pub fn recon_loss(&self) -> ReconLossKind {
        self.recon_loss
    }

    pub fn covars_encoder(&self) -> &CovariateSpec {
        &self.covars_encoder
    }

    /// Build the mixup companion view of a batch.
    ///
    /// `alpha == 0` pins lambda to 1.0, which reproduces the original
    /// batch through the same code path; otherwise lambda ~ Beta(alpha,
    /// alpha) from the caller's random stream, and a fresh permutation
    /// of the cells provides the secondary view.
    pub fn mixup_batch(
        &self,
        batch: &PerturbBatch,
        alpha: f64,
        rng: &mut StdRng,
    ) -> Result<MixedBatch> {
        let alpha = alpha.max(0.0);

        let mixup_lambda = if alpha == 0.0 {
            1.0
        } else {
            let beta = Beta::new(alpha, alpha)
                .map_err(|e| candle_core::Error::Msg(format!("bad mixup alpha: {}", e)))?;
            beta.sample(rng)
        };

        let n = batch.n_cells()?;
        let mut perm: Vec<u32> = (0..n as u32).collect();
        perm.shuffle(rng);
        let index = Tensor::from_vec(perm, (n,), batch.x.device())?;

        let x_true = batch.x.clone();
        let x_mixup = batch.x.index_select(&index, 0)?;
        let x = ((&x_true * mixup_lambda)? + (&x_mixup * (1.0 - mixup_lambda))?)?;

        let mut covar_ids_mixup = BTreeMap::new();
        for (name, ids) in batch.covar_ids.iter() {
            covar_ids_mixup.insert(name.clone(), ids.index_select(&index, 0)?);
        }

        Ok(MixedBatch {
            x,
            x_true,
            x_mixup,
            pert_ids_true: batch.pert_ids.clone(),
            pert_ids_mixup: batch.pert_ids.index_select(&index, 0)?,
            pert_doses_true: batch.pert_doses.clone(),
            pert_doses_mixup: batch.pert_doses.index_select(&index, 0)?,
            pert_label: batch.pert_label.clone(),
            covar_ids_true: batch.covar_ids.clone(),
            covar_ids_mixup,
            deg_mask: batch.deg_mask.clone(),
            mixup_lambda,
        })
    }

    /// Inference: basal state, perturbation and covariate effects, and
    /// their strictly additive composition.
    pub fn inference(
        &self,
        mb: &MixedBatch,
        n_samples: usize,
        train: bool,
    ) -> Result<InferenceOutputs> {
        let lambda = mb.mixup_lambda;

        // stabilize the variational approximation on raw counts
        let x_enc = if self.recon_loss.is_count() {
            (&mb.x + 1.0)?.log()?
        } else {
            mb.x.clone()
        };

        let (library, ql) = match &self.library_encoder {
            Some(encoder) => {
                let ql = encoder.forward_t(&x_enc, train)?;
                let library = if self.variational && n_samples > 1 {
                    ql.rsample_n(n_samples)?
                } else if self.variational && train {
                    ql.rsample()?
                } else {
                    ql.mean.clone()
                };
                (Some(library), Some(ql))
            }
            None => (None, None),
        };

        let basal = self.state_encoder.forward_t(&x_enc, train, n_samples)?;

        let z_pert_true = self
            .pert_encoder
            .forward_t(&mb.pert_ids_true, &mb.pert_doses_true, train)?;
        let z_pert = if lambda < 1.0 {
            let z_pert_mixup = self
                .pert_encoder
                .forward_t(&mb.pert_ids_mixup, &mb.pert_doses_mixup, train)?;
            ((&z_pert_true * lambda)? + (&z_pert_mixup * (1.0 - lambda))?)?
        } else {
            z_pert_true
        };

        let n = mb.x.dims2()?.0;
        let mut z_covs = Tensor::zeros((n, self.n_latent), DType::F32, mb.x.device())?;
        for name in self.covars_encoder.keys() {
            let ids_true = &mb.covar_ids_true[name];
            let z_cov = self.covar_embedding.lookup(name, ids_true)?;

            let n_cats = self.covar_embedding.cardinality(name).unwrap_or(1);
            let z_cov = if n_cats > 1 && lambda < 1.0 {
                let ids_mixup = &mb.covar_ids_mixup[name];
                let z_cov_mixup = self.covar_embedding.lookup(name, ids_mixup)?;
                ((&z_cov * lambda)? + (&z_cov_mixup * (1.0 - lambda))?)?
            } else {
                z_cov
            };

            z_covs = (z_covs + z_cov)?;
        }

        let z = basal
            .z_basal
            .broadcast_add(&z_pert)?
            .broadcast_add(&z_covs)?;

        Ok(InferenceOutputs {
            z,
            z_basal: basal.z_basal,
            z_covs,
            z_pert,
            library,
            qz: basal.posterior,
            ql,
            mixup_lambda: lambda,
        })
    }

    /// Generative: composed latent (+ library factor) to likelihood
    /// parameters. The likelihood family was fixed at construction.
    pub fn generative(
        &self,
        z: &Tensor,
        library: Option<&Tensor>,
        train: bool,
    ) -> Result<GenerativeOutputs> {
        // multi-sample latents run through the decoder flattened
        let px = if z.rank() == 3 {
            let (s, n, k) = z.dims3()?;
            let z_flat = z.reshape((s * n, k))?;
            let lib_flat = match library {
                Some(l) => Some(l.reshape((s * n, 1))?),
                None => None,
            };
            let px = self.decoder.forward_t(&z_flat, lib_flat.as_ref(), train)?;
            unflatten_params(px, s, n)?
        } else {
            self.decoder.forward_t(z, library, train)?
        };

        Ok(GenerativeOutputs { px })
    }

    /// Convenience wrapper: inference followed by generative.
    pub fn forward(
        &self,
        mb: &MixedBatch,
        n_samples: usize,
        train: bool,
    ) -> Result<(InferenceOutputs, GenerativeOutputs)> {
        let inference_outputs = self.inference(mb, n_samples, train)?;
        let generative_outputs = self.generative(
            &inference_outputs.z,
            inference_outputs.library.as_ref(),
            train,
        )?;
        Ok((inference_outputs, generative_outputs))
    }

    /// Reconstruction and KL losses, returned separately so the training
    /// loop can weight them independently.
    pub fn loss(
        &self,
        mb: &MixedBatch,
        inference_outputs: &InferenceOutputs,
        generative_outputs: &GenerativeOutputs,
    ) -> Result<(Tensor, Tensor)> {
        let recon_loss = generative_outputs
            .px
            .log_prob(&mb.x)?
            .neg()?
            .mean_all()?;

        let kl_loss = match &inference_outputs.qz {
            Some(qz) => qz.kl_standard_normal()?.mean_all()?,
            None => Tensor::zeros((), DType::F32, mb.x.device())?,
        };

        Ok((recon_loss, kl_loss))
    }

    /// R^2 of predicted vs. observed per-gene mean and variance,
    /// restricted to the DEG mask when one is present. Count
    /// likelihoods compare in log1p space. Non-finite values are
    /// clamped before scoring so they cannot poison the aggregate.
    pub fn r2_metric(
        &self,
        mb: &MixedBatch,
        generative_outputs: &GenerativeOutputs,
    ) -> Result<(f32, f32)> {
        let px = &generative_outputs.px;

        let (mut x_host, mut pred_mean_host, mut pred_var_host) = match self.recon_loss {
            ReconLossKind::Gauss => {
                let pred_mean = flatten_samples(px.mean())?;
                let pred_var = flatten_samples(&px.variance()?)?;
                (
                    to_host(&mb.x)?,
                    to_host(&pred_mean)?,
                    Some(to_host(&pred_var)?),
                )
            }
            _ => {
                let x_log = (&mb.x + 1.0)?.log()?;
                let pred_log = (flatten_samples(px.mean())? + 1.0)?.log()?;
                (to_host(&x_log)?, to_host(&pred_log)?, None)
            }
        };

        for row in pred_mean_host.iter_mut() {
            nan_to_num(row, METRIC_CLAMP);
        }
        if let Some(rows) = pred_var_host.as_mut() {
            for row in rows.iter_mut() {
                nan_to_num(row, METRIC_CLAMP);
            }
        }

        if let Some(mask) = &mb.deg_mask {
            let mask_host = to_host(mask)?;
            apply_mask(&mut x_host, &mask_host);
            apply_mask(&mut pred_mean_host, &mask_host);
            if let Some(rows) = pred_var_host.as_mut() {
                apply_mask(rows, &mask_host);
            }
        }

        let (x_mean, x_var) = column_mean_var(&x_host);
        let (pred_mean, pred_mean_var) = column_mean_var(&pred_mean_host);

        let r2_mean = sanitize_score(r2_score(&pred_mean, &x_mean));

        let r2_var = match pred_var_host {
            // Gauss: mean predicted variance against observed variance
            Some(rows) => {
                let (pred_var_mean, _) = column_mean_var(&rows);
                sanitize_score(r2_score(&pred_var_mean, &x_var))
            }
            // counts: variance of the log1p predictions across cells
            None => sanitize_score(r2_score(&pred_mean_var, &x_var)),
        };

        Ok((r2_mean, r2_var))
    }

    /// k-NN label purity of the basal latent and of the composed latent
    /// against perturbation identity and each multi-category covariate.
    /// Undefined (None) for batches with fewer than two cells.
    pub fn disentanglement(
        &self,
        mb: &MixedBatch,
        inference_outputs: &InferenceOutputs,
    ) -> Result<Option<(f32, f32)>> {
        let z_basal = to_host(&flatten_samples(&inference_outputs.z_basal)?)?;
        let z = to_host(&flatten_samples(&inference_outputs.z)?)?;
        let labels: Vec<u32> = mb.pert_label.to_vec1()?;

        let n = labels.len();
        if n <= 1 {
            return Ok(None);
        }
        let k = n.saturating_sub(1).min(30);

        let mut knn_basal = match knn_purity(&z_basal, &labels, k) {
            Some(v) => v,
            None => return Ok(None),
        };
        let mut knn_after = match knn_purity(&z, &labels, k) {
            Some(v) => v,
            None => return Ok(None),
        };

        for (name, &n_cats) in self.covars_encoder.iter() {
            if n_cats > 1 {
                let covar_labels: Vec<u32> = mb.covar_ids_true[name].to_vec1()?;
                if let Some(v) = knn_purity(&z_basal, &covar_labels, k) {
                    knn_basal += v;
                }
                if let Some(v) = knn_purity(&z, &covar_labels, k) {
                    knn_after += v;
                }
            }
        }

        Ok(Some((knn_basal, knn_after)))
    }

    /// Predicted mean expression for a batch, with mixup disabled.
    pub fn get_expression(
        &self,
        batch: &PerturbBatch,
        n_samples: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let mb = self.mixup_batch(batch, 0.0, rng)?;
        let (_, generative_outputs) = self.forward(&mb, n_samples, false)?;
        Ok(generative_outputs.px.mean().clone())
    }

    /// Latent perturbation effect vectors for a batch.
    pub fn get_perturbation_embedding(&self, batch: &PerturbBatch) -> Result<Tensor> {
        self.pert_encoder
            .forward_t(&batch.pert_ids, &batch.pert_doses, false)
    }
}

/// Collapse a possible sample dimension by averaging: (s, n, g) -> (n, g)
fn flatten_samples(t: &Tensor) -> Result<Tensor> {
    if t.rank() == 3 {
        t.mean(0)
    } else {
        Ok(t.clone())
    }
}

fn unflatten_params(px: LikelihoodParams, s: usize, n: usize) -> Result<LikelihoodParams> {
    let reshape = |t: Tensor| -> Result<Tensor> {
        let g = t.dims2()?.1;
        t.reshape((s, n, g))
    };
    match px {
        LikelihoodParams::Gauss { mean, lnvar } => Ok(LikelihoodParams::Gauss {
            mean: reshape(mean)?,
            lnvar: reshape(lnvar)?,
        }),
        LikelihoodParams::Nb { mu, theta } => Ok(LikelihoodParams::Nb {
            mu: reshape(mu)?,
            theta,
        }),
        LikelihoodParams::Zinb {
            mu,
            theta,
            zi_logits,
        } => Ok(LikelihoodParams::Zinb {
            mu: reshape(mu)?,
            theta,
            zi_logits: reshape(zi_logits)?,
        }),
    }
}

fn to_host(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    t.to_dtype(DType::F32)?.to_vec2()
}

fn apply_mask(rows: &mut [Vec<f32>], mask: &[Vec<f32>]) {
    for (row, mask_row) in rows.iter_mut().zip(mask.iter()) {
        for (v, m) in row.iter_mut().zip(mask_row.iter()) {
            *v *= m;
        }
    }
}

/// Per-column mean and (population) variance over rows
fn column_mean_var(rows: &[Vec<f32>]) -> (Vec<f32>, Vec<f32>) {
    if rows.is_empty() {
        return (vec![], vec![]);
    }
    let n = rows.len() as f32;
    let n_cols = rows[0].len();

    let mut mean = vec![0.0f32; n_cols];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row.iter()) {
            *m += v;
        }
    }
    for m in mean.iter_mut() {
        *m /= n;
    }

    let mut var = vec![0.0f32; n_cols];
    for row in rows {
        for ((s, v), m) in var.iter_mut().zip(row.iter()).zip(mean.iter()) {
            *s += (v - m) * (v - m);
        }
    }
    for s in var.iter_mut() {
        *s /= n;
    }

    (mean, var)
}

fn sanitize_score(score: f32) -> f32 {
    if score.is_finite() {
        score
    } else {
        0.0
    }
}
