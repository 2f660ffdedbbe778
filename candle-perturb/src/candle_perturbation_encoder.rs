use crate::candle_aux_layers::{fc_stack, FcStack, FcStackConfig};
use candle_core::{DType, Result, Tensor};
use candle_nn::{ops, Embedding, Linear, Module, ModuleT, VarBuilder};

/// Monotone dose-response transform family, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseResponseKind {
    LogSigm,
    Sigm,
    Linear,
}

impl std::str::FromStr for DoseResponseKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "logsigm" => Ok(Self::LogSigm),
            "sigm" => Ok(Self::Sigm),
            "linear" => Ok(Self::Linear),
            _ => Err(anyhow::anyhow!("unknown dose-response kind: {}", s)),
        }
    }
}

/// Small feed-forward network mapping a dosage scalar to a scalar
/// response for one perturbation.
struct Doser {
    fc: FcStack,
    out: Linear,
}

impl Doser {
    fn forward_t(&self, dose_n1: &Tensor, train: bool) -> Result<Tensor> {
        self.out.forward(&self.fc.forward_t(dose_n1, train)?)
    }
}

/// Maps a set of perturbation identifiers and dosages per cell to one
/// latent vector: `z = sum_slots response(dose) * embedding(id)`.
///
/// Padding slots carry dose 0; every response family subtracts its own
/// zero-dose value so such slots contribute exactly nothing.
pub struct PerturbationEncoder {
    n_perts: usize,
    n_latent: usize,
    doser_kind: DoseResponseKind,
    embedding: Embedding,
    dosers: Vec<Doser>,
}

impl PerturbationEncoder {
    /// Will create a new perturbation encoder with these variables:
    ///
    /// * `embedding.weight` - n_perts x n_latent
    /// * `dosers.{}.fc.{}.weight` where {} are perturbation / layer index
    /// * `dosers.{}.out.weight`
    pub fn new(
        n_perts: usize,
        n_latent: usize,
        doser_kind: DoseResponseKind,
        n_hidden_doser: usize,
        n_layers_doser: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let embedding = candle_nn::embedding(n_perts, n_latent, vs.pp("embedding"))?;

        let doser_config = FcStackConfig {
            n_hidden: n_hidden_doser,
            n_layers: n_layers_doser.max(1),
            use_batch_norm: false,
            use_layer_norm: false,
            dropout_rate: 0.0,
        };

        let mut dosers = Vec::with_capacity(n_perts);
        for p in 0..n_perts {
            let vs_p = vs.pp(format!("dosers.{}", p));
            let fc = fc_stack(1, &doser_config, vs_p.clone())?;
            let out = candle_nn::linear(n_hidden_doser, 1, vs_p.pp("out"))?;
            dosers.push(Doser { fc, out });
        }

        Ok(Self {
            n_perts,
            n_latent,
            doser_kind,
            embedding,
            dosers,
        })
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }

    pub fn n_perts(&self) -> usize {
        self.n_perts
    }

    /// Scalar dose responses for one combination slot, gathered over the
    /// per-perturbation dosers by identifier mask.
    fn slot_response(&self, ids_n: &Tensor, dose_n1: &Tensor, train: bool) -> Result<Tensor> {
        let dose_in = match self.doser_kind {
            DoseResponseKind::LogSigm => (dose_n1 + 1.0)?.log()?,
            _ => dose_n1.clone(),
        };
        let zero_in = Tensor::zeros_like(&dose_in)?;

        let mut resp_n1 = Tensor::zeros_like(dose_n1)?;

        for (p, doser) in self.dosers.iter().enumerate() {
            let raw = doser.forward_t(&dose_in, train)?;
            let raw0 = doser.forward_t(&zero_in, train)?;

            let anchored = match self.doser_kind {
                DoseResponseKind::Linear => raw.sub(&raw0)?,
                _ => ops::sigmoid(&raw)?.sub(&ops::sigmoid(&raw0)?)?,
            };

            let mask_n1 = ids_n.eq(p as u32)?.unsqueeze(1)?.to_dtype(DType::F32)?;
            resp_n1 = (resp_n1 + mask_n1.mul(&anchored)?)?;
        }

        Ok(resp_n1)
    }

    /// * `ids_nc` - perturbation identifiers (n x c, u32)
    /// * `doses_nc` - matching dosages (n x c)
    ///
    /// # Returns `z_pert` (n x n_latent)
    pub fn forward_t(&self, ids_nc: &Tensor, doses_nc: &Tensor, train: bool) -> Result<Tensor> {
        let (_n, n_slots) = ids_nc.dims2()?;

        let emb_nck = self.embedding.forward(ids_nc)?;

        let mut resp_cols = Vec::with_capacity(n_slots);
        for slot in 0..n_slots {
            let ids_n = ids_nc.narrow(1, slot, 1)?.squeeze(1)?;
            let dose_n1 = doses_nc.narrow(1, slot, 1)?;
            resp_cols.push(self.slot_response(&ids_n, &dose_n1, train)?);
        }
        let resp_nc = Tensor::cat(&resp_cols, 1)?;

        emb_nck.broadcast_mul(&resp_nc.unsqueeze(2)?)?.sum(1)
    }
}
