use crate::candle_aux_layers::{fc_stack, FcStack, FcStackConfig};
use crate::candle_data_loader::CovariateSpec;
use crate::candle_model_traits::ClassifierModuleT;
use crate::candle_perturb_module::MixedBatch;

use candle_core::{Result, Tensor};
use candle_nn::{loss, Linear, Module, ModuleT, VarBuilder};
use std::collections::BTreeMap;

/// Width/depth of every adversarial head.
#[derive(Debug, Clone, Copy)]
pub struct AdversaryConfig {
    pub n_hidden: usize,
    pub n_layers: usize,
    pub dropout_rate: f32,
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            n_hidden: 128,
            n_layers: 2,
            dropout_rate: 0.0,
        }
    }
}

/// Feed-forward classifier from a latent vector to class logits.
pub struct LatentClassifier {
    n_latent: usize,
    n_classes: usize,
    fc: FcStack,
    head: Linear,
}

impl LatentClassifier {
    /// Will create a new latent classifier with these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `head.weight`
    pub fn new(
        n_latent: usize,
        n_classes: usize,
        config: &AdversaryConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc_config = FcStackConfig {
            n_hidden: config.n_hidden,
            n_layers: config.n_layers,
            use_batch_norm: false,
            use_layer_norm: false,
            dropout_rate: config.dropout_rate,
        };

        let fc = fc_stack(n_latent, &fc_config, vs.clone())?;
        let head = candle_nn::linear(config.n_hidden, n_classes, vs.pp("head"))?;

        Ok(Self {
            n_latent,
            n_classes,
            fc,
            head,
        })
    }
}

impl ClassifierModuleT for LatentClassifier {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        self.head.forward(&self.fc.forward_t(z_nk, train)?)
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }
}

/// Classification losses and Lipschitz penalties of one adversary pass.
/// The tensors stay in the graph for backprop; the scalar copies are
/// detached values for metric reporting.
pub struct AdversaryLosses {
    pub adv_loss: Tensor,
    pub penalty: Tensor,
    pub adv_pert: f32,
    pub penalty_pert: f32,
    pub adv_covars: BTreeMap<String, f32>,
    pub penalty_covars: BTreeMap<String, f32>,
}

/// Adversarial critics over the basal latent: one multi-label head for
/// perturbation identity plus one head per covariate with more than one
/// category. Their parameters form their own optimizer partition.
pub struct AdversaryModule {
    n_perts: usize,
    pert_classifier: LatentClassifier,
    covar_classifiers: BTreeMap<String, LatentClassifier>,
}

impl AdversaryModule {
    pub fn new(
        n_latent: usize,
        n_perts: usize,
        covars_encoder: &CovariateSpec,
        config: &AdversaryConfig,
        vs: VarBuilder,
    ) -> Result<Self> {
        let pert_classifier = LatentClassifier::new(n_latent, n_perts, config, vs.pp("pert"))?;

        let mut covar_classifiers = BTreeMap::new();
        for (name, &n_cats) in covars_encoder.iter() {
            // a single-category covariate carries nothing to classify
            if n_cats > 1 {
                let classifier = LatentClassifier::new(n_latent, n_cats, config, vs.pp(name))?;
                covar_classifiers.insert(name.clone(), classifier);
            }
        }

        Ok(Self {
            n_perts,
            pert_classifier,
            covar_classifiers,
        })
    }

    /// Multi-hot perturbation target: 1 wherever a perturbation was
    /// applied with a positive dose.
    fn perturbation_targets(&self, mb: &MixedBatch) -> Result<Tensor> {
        let ids: Vec<Vec<u32>> = mb.pert_ids_true.to_vec2()?;
        let doses: Vec<Vec<f32>> = mb.pert_doses_true.to_vec2()?;

        let n = ids.len();
        let mut hot = vec![0f32; n * self.n_perts];
        for (i, (row_ids, row_doses)) in ids.iter().zip(doses.iter()).enumerate() {
            for (&id, &dose) in row_ids.iter().zip(row_doses.iter()) {
                if dose > 0.0 {
                    hot[i * self.n_perts + id as usize] = 1.0;
                }
            }
        }

        Tensor::from_vec(hot, (n, self.n_perts), mb.pert_ids_true.device())
    }

    /// Classification losses plus gradient penalties of every head
    /// against the basal latent.
    pub fn losses(&self, z_basal: &Tensor, mb: &MixedBatch, train: bool) -> Result<AdversaryLosses> {
        let pert_logits = self.pert_classifier.forward_t(z_basal, train)?;
        let pert_targets = self.perturbation_targets(mb)?;
        let adv_pert = loss::binary_cross_entropy_with_logit(&pert_logits, &pert_targets)?;
        let penalty_pert = gradient_penalty(&self.pert_classifier, z_basal, train)?;

        let mut adv_loss = adv_pert.clone();
        let mut penalty = penalty_pert.clone();

        let mut adv_covars = BTreeMap::new();
        let mut penalty_covars = BTreeMap::new();

        for (name, classifier) in self.covar_classifiers.iter() {
            let logits = classifier.forward_t(z_basal, train)?;
            let targets = &mb.covar_ids_true[name];

            let adv_cov = loss::cross_entropy(&logits, targets)?;
            let penalty_cov = gradient_penalty(classifier, z_basal, train)?;

            adv_covars.insert(name.clone(), adv_cov.to_scalar::<f32>()?);
            penalty_covars.insert(name.clone(), penalty_cov.to_scalar::<f32>()?);

            adv_loss = (adv_loss + adv_cov)?;
            penalty = (penalty + penalty_cov)?;
        }

        Ok(AdversaryLosses {
            adv_pert: adv_pert.to_scalar::<f32>()?,
            penalty_pert: penalty_pert.to_scalar::<f32>()?,
            adv_loss,
            penalty,
            adv_covars,
            penalty_covars,
        })
    }

    /// Zero-valued report entries for epochs where the adversary is idle.
    pub fn zero_report(&self) -> (BTreeMap<String, f32>, BTreeMap<String, f32>) {
        let zeros: BTreeMap<String, f32> = self
            .covar_classifiers
            .keys()
            .map(|name| (name.clone(), 0.0))
            .collect();
        (zeros.clone(), zeros)
    }
}

/// Squared norm of the classifier-output gradient w.r.t. the latent,
/// estimated by a central difference along one random unit direction.
/// First-order autodiff keeps the estimate differentiable w.r.t. the
/// classifier parameters.
pub fn gradient_penalty<C: ClassifierModuleT>(
    classifier: &C,
    z_nk: &Tensor,
    train: bool,
) -> Result<Tensor> {
    let eps = 1e-2_f64;

    let u = Tensor::randn_like(z_nk, 0., 1.)?;
    let norm = (u.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-8)?;
    let u = u.broadcast_div(&norm)?;

    let step = (u * eps)?;
    let logits_plus = classifier.forward_t(&z_nk.add(&step)?, train)?;
    let logits_minus = classifier.forward_t(&z_nk.sub(&step)?, train)?;

    let dd = ((logits_plus - logits_minus)?.sum(1)? / (2.0 * eps))?;
    dd.powf(2.)?.mean_all()
}
