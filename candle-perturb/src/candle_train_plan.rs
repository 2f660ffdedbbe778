use crate::candle_adversary::{AdversaryLosses, AdversaryModule};
use crate::candle_data_loader::{InMemoryPerturbData, PerturbBatch};
use crate::candle_perturb_module::PerturbModule;

use candle_core::{Device, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use std::collections::BTreeMap;

/// Variable-name prefixes carving the shared `VarMap` into the three
/// optimizer partitions. The prefixes are mutually exclusive, so no
/// parameter is ever claimed by two optimizers.
const AUTOENCODER_PREFIXES: &[&str] = &["enc.", "dec.", "pert.embedding.", "covars."];
const ADVERSARY_PREFIXES: &[&str] = &["adv."];
const DOSER_PREFIXES: &[&str] = &["pert.dosers."];

/// Optimization hyperparameters of the adversarial training plan, fixed
/// at construction.
#[derive(Debug, Clone)]
pub struct TrainPlanConfig {
    pub autoencoder_lr: f64,
    pub autoencoder_wd: f64,
    pub adversary_lr: f64,
    pub adversary_wd: f64,
    pub dosers_lr: f64,
    pub dosers_wd: f64,
    /// alternation period: one adversary turn per this many steps
    pub adversary_steps: usize,
    /// weight of the (negated) adversarial loss in the model update
    pub reg_adversary: f64,
    /// weight of the gradient penalty in the adversary update
    pub penalty_adversary: f64,
    /// epochs with autoencoder-only updates before the adversarial game
    pub n_epochs_warmup: usize,
    /// epochs over which the KL weight ramps from 1/n to 1
    pub n_epochs_kl_warmup: Option<usize>,
    /// decay all learning rates every this many epochs (epoch > 1)
    pub step_size_lr: Option<usize>,
    pub lr_decay_factor: f64,
    /// Beta(alpha, alpha) mixup; 0 disables mixup
    pub mixup_alpha: f64,
    /// posterior draws per inference call
    pub n_samples: usize,
}

impl Default for TrainPlanConfig {
    fn default() -> Self {
        Self {
            autoencoder_lr: 1e-3,
            autoencoder_wd: 1e-6,
            adversary_lr: 3e-4,
            adversary_wd: 1e-2,
            dosers_lr: 1e-3,
            dosers_wd: 1e-7,
            adversary_steps: 3,
            reg_adversary: 5.,
            penalty_adversary: 3.,
            n_epochs_warmup: 0,
            n_epochs_kl_warmup: None,
            step_size_lr: Some(45),
            lr_decay_factor: 0.1,
            mixup_alpha: 0.2,
            n_samples: 1,
        }
    }
}

impl TrainPlanConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.adversary_steps > 0, "adversary_steps must be positive");
        anyhow::ensure!(
            self.step_size_lr != Some(0),
            "step_size_lr must be positive when set"
        );
        anyhow::ensure!(
            self.n_epochs_kl_warmup != Some(0),
            "n_epochs_kl_warmup must be positive when set"
        );
        anyhow::ensure!(
            self.lr_decay_factor > 0. && self.lr_decay_factor <= 1.,
            "lr_decay_factor must be in (0, 1]"
        );
        anyhow::ensure!(
            self.autoencoder_lr > 0. && self.adversary_lr > 0. && self.dosers_lr > 0.,
            "learning rates must be positive"
        );
        anyhow::ensure!(self.mixup_alpha >= 0., "mixup_alpha must be non-negative");
        anyhow::ensure!(self.n_samples > 0, "n_samples must be positive");
        Ok(())
    }
}

/// Which update a training step performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTurn {
    /// autoencoder-only objective during the warmup epochs
    Warmup,
    /// classifiers updated against the detached basal latent
    Adversary,
    /// autoencoder + dosers updated against the adversary
    Model,
}

/// Detached scalar metrics of one training step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub turn: StepTurn,
    pub recon_loss: f32,
    pub kl_loss: f32,
    pub adv_loss: f32,
    pub penalty_adv: f32,
}

/// Detached scalar metrics of one validation step. Disentanglement (and
/// the composite score built from it) is undefined for single-cell
/// batches.
#[derive(Debug, Clone, Copy)]
pub struct ValidationOutput {
    pub recon_loss: f32,
    pub reg_mean: f32,
    pub reg_var: f32,
    pub disent_basal: Option<f32>,
    pub disent_after: Option<f32>,
    pub cpa_metric: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Valid,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Valid => "valid",
        }
    }
}

/// Per-epoch averages of the step metrics for one mode.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub mode: Mode,
    pub epoch: usize,
    pub metrics: BTreeMap<String, f32>,
}

/// Append-only log of per-epoch metrics; entries are never mutated
/// after they are pushed.
#[derive(Debug, Clone, Default)]
pub struct EpochHistory {
    records: Vec<EpochRecord>,
}

impl EpochHistory {
    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }
}

/// Running per-epoch means over a key set fixed at construction.
struct MetricAccumulator {
    sums: BTreeMap<String, f32>,
    counts: BTreeMap<String, usize>,
}

impl MetricAccumulator {
    fn new<I: IntoIterator<Item = String>>(keys: I) -> Self {
        let sums: BTreeMap<String, f32> = keys.into_iter().map(|k| (k, 0.0)).collect();
        let counts = sums.keys().map(|k| (k.clone(), 0)).collect();
        Self { sums, counts }
    }

    fn add(&mut self, key: &str, value: f32) {
        debug_assert!(self.sums.contains_key(key), "unknown metric key: {}", key);
        if let Some(sum) = self.sums.get_mut(key) {
            *sum += value;
            *self.counts.get_mut(key).expect("metric count") += 1;
        }
    }

    /// Per-key means since the last call; resets the accumulator.
    fn take_means(&mut self) -> BTreeMap<String, f32> {
        let mut means = BTreeMap::new();
        for (key, sum) in self.sums.iter_mut() {
            let count = self.counts.get_mut(key).expect("metric count");
            let mean = if *count > 0 { *sum / *count as f32 } else { 0.0 };
            means.insert(key.clone(), mean);
            *sum = 0.0;
            *count = 0;
        }
        means
    }
}

/// Collect the variables whose names start with one of the prefixes,
/// in name order.
fn partition_vars(varmap: &VarMap, prefixes: &[&str]) -> Vec<Var> {
    let data = varmap.data().lock().expect("varmap lock");
    let mut named: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| prefixes.iter().any(|p| name.starts_with(p)))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.into_iter().map(|(_, var)| var).collect()
}

fn collapse_samples(t: &Tensor) -> Result<Tensor> {
    if t.rank() == 3 {
        t.mean(0)
    } else {
        Ok(t.clone())
    }
}

/// Alternating-optimizer training loop for the perturbation module and
/// its adversarial classifiers.
///
/// Three `AdamW` optimizers cover disjoint name-prefix partitions of the
/// shared variable map: the autoencoder (encoder, decoder, perturbation
/// embedding, covariate tables), the adversary heads, and the dosers.
/// Post-warmup steps alternate with period `adversary_steps`: one
/// adversary turn followed by `adversary_steps - 1` model turns.
pub struct AdversarialTrainingPlan {
    module: PerturbModule,
    adversary: AdversaryModule,
    config: TrainPlanConfig,

    opt_autoencoder: AdamW,
    opt_adversary: AdamW,
    opt_dosers: AdamW,

    rng: StdRng,
    epoch: usize,
    step_count: usize,

    train_accum: MetricAccumulator,
    valid_accum: MetricAccumulator,
    history: EpochHistory,
}

impl AdversarialTrainingPlan {
    /// Build the plan over a module and adversary whose variables live
    /// in the same `varmap`. Misconfigured optimizer/scheduler settings
    /// fail here, before any training step runs.
    pub fn new(
        module: PerturbModule,
        adversary: AdversaryModule,
        varmap: &VarMap,
        config: &TrainPlanConfig,
        rng: StdRng,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let ae_vars = partition_vars(varmap, AUTOENCODER_PREFIXES);
        let adv_vars = partition_vars(varmap, ADVERSARY_PREFIXES);
        let doser_vars = partition_vars(varmap, DOSER_PREFIXES);

        anyhow::ensure!(!ae_vars.is_empty(), "autoencoder partition is empty");
        anyhow::ensure!(!adv_vars.is_empty(), "adversary partition is empty");
        anyhow::ensure!(!doser_vars.is_empty(), "doser partition is empty");

        let opt_autoencoder = AdamW::new(
            ae_vars,
            ParamsAdamW {
                lr: config.autoencoder_lr,
                weight_decay: config.autoencoder_wd,
                ..Default::default()
            },
        )?;
        let opt_adversary = AdamW::new(
            adv_vars,
            ParamsAdamW {
                lr: config.adversary_lr,
                weight_decay: config.adversary_wd,
                ..Default::default()
            },
        )?;
        let opt_dosers = AdamW::new(
            doser_vars,
            ParamsAdamW {
                lr: config.dosers_lr,
                weight_decay: config.dosers_wd,
                ..Default::default()
            },
        )?;

        let multi_covars: Vec<String> = module
            .covars_encoder()
            .iter()
            .filter(|(_, &n_cats)| n_cats > 1)
            .map(|(name, _)| name.clone())
            .collect();

        let mut train_keys: Vec<String> = [
            "recon_loss",
            "kl_loss",
            "adv_loss",
            "penalty_adv",
            "adv_pert",
            "penalty_pert",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        for name in multi_covars.iter() {
            train_keys.push(format!("adv_{}", name));
            train_keys.push(format!("penalty_{}", name));
        }

        let valid_keys: Vec<String> = [
            "recon_loss",
            "reg_mean",
            "reg_var",
            "disent_basal",
            "disent_after",
            "cpa_metric",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();

        Ok(Self {
            module,
            adversary,
            config: config.clone(),
            opt_autoencoder,
            opt_adversary,
            opt_dosers,
            rng,
            epoch: 0,
            step_count: 0,
            train_accum: MetricAccumulator::new(train_keys),
            valid_accum: MetricAccumulator::new(valid_keys),
            history: EpochHistory::default(),
        })
    }

    pub fn module(&self) -> &PerturbModule {
        &self.module
    }

    pub fn history(&self) -> &EpochHistory {
        &self.history
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn learning_rates(&self) -> (f64, f64, f64) {
        (
            self.opt_autoencoder.learning_rate(),
            self.opt_adversary.learning_rate(),
            self.opt_dosers.learning_rate(),
        )
    }

    /// Which update the next training step will perform.
    pub fn turn(&self) -> StepTurn {
        if self.epoch < self.config.n_epochs_warmup {
            StepTurn::Warmup
        } else if self.step_count % self.config.adversary_steps == 0 {
            StepTurn::Adversary
        } else {
            StepTurn::Model
        }
    }

    fn kl_weight(&self) -> f64 {
        match self.config.n_epochs_kl_warmup {
            Some(n) => (((self.epoch + 1) as f64) / n as f64).min(1.0),
            None => 1.0,
        }
    }

    fn accumulate_adversary(&mut self, adv: &AdversaryLosses) -> Result<(f32, f32)> {
        self.train_accum.add("adv_pert", adv.adv_pert);
        self.train_accum.add("penalty_pert", adv.penalty_pert);
        for (name, v) in adv.adv_covars.iter() {
            self.train_accum.add(&format!("adv_{}", name), *v);
        }
        for (name, v) in adv.penalty_covars.iter() {
            self.train_accum.add(&format!("penalty_{}", name), *v);
        }
        Ok((
            adv.adv_loss.to_scalar::<f32>()?,
            adv.penalty.to_scalar::<f32>()?,
        ))
    }

    /// One optimizer update for one minibatch.
    pub fn training_step(&mut self, batch: &PerturbBatch) -> Result<StepOutput> {
        let mb = self
            .module
            .mixup_batch(batch, self.config.mixup_alpha, &mut self.rng)?;
        let (inf, gen) = self.module.forward(&mb, self.config.n_samples, true)?;
        let (recon, kl) = self.module.loss(&mb, &inf, &gen)?;

        let turn = self.turn();
        let kl_weight = self.kl_weight();

        let recon_val = recon.to_scalar::<f32>()?;
        let kl_val = kl.to_scalar::<f32>()?;

        let (adv_val, penalty_val) = match turn {
            StepTurn::Warmup => {
                let loss = (recon + (kl * kl_weight)?)?;
                let grads = loss.backward()?;
                self.opt_autoencoder.step(&grads)?;
                // no adversary in the graph yet; this step is a no-op
                // that keeps the optimizer state in lockstep
                self.opt_adversary.step(&grads)?;

                self.train_accum.add("adv_pert", 0.0);
                self.train_accum.add("penalty_pert", 0.0);
                let (adv_zeros, penalty_zeros) = self.adversary.zero_report();
                for (name, v) in adv_zeros {
                    self.train_accum.add(&format!("adv_{}", name), v);
                }
                for (name, v) in penalty_zeros {
                    self.train_accum.add(&format!("penalty_{}", name), v);
                }
                (0.0, 0.0)
            }
            StepTurn::Adversary => {
                let z_basal = collapse_samples(&inf.z_basal)?.detach();
                let adv = self.adversary.losses(&z_basal, &mb, true)?;
                let loss = (&adv.adv_loss + (&adv.penalty * self.config.penalty_adversary)?)?;
                self.opt_adversary.backward_step(&loss)?;
                self.accumulate_adversary(&adv)?
            }
            StepTurn::Model => {
                let z_basal = collapse_samples(&inf.z_basal)?;
                let adv = self.adversary.losses(&z_basal, &mb, true)?;
                let loss = ((recon + (kl * kl_weight)?)?
                    - (&adv.adv_loss * self.config.reg_adversary)?)?;
                let grads = loss.backward()?;
                self.opt_autoencoder.step(&grads)?;
                self.opt_dosers.step(&grads)?;
                self.accumulate_adversary(&adv)?
            }
        };

        if turn != StepTurn::Warmup {
            self.step_count += 1;
        }

        self.train_accum.add("recon_loss", recon_val);
        self.train_accum.add("kl_loss", kl_val);
        self.train_accum.add("adv_loss", adv_val);
        self.train_accum.add("penalty_adv", penalty_val);

        Ok(StepOutput {
            turn,
            recon_loss: recon_val,
            kl_loss: kl_val,
            adv_loss: adv_val,
            penalty_adv: penalty_val,
        })
    }

    /// Held-out diagnostics for one batch; no parameter updates.
    pub fn validation_step(&mut self, batch: &PerturbBatch) -> Result<ValidationOutput> {
        let mb = self.module.mixup_batch(batch, 0.0, &mut self.rng)?;
        let (inf, gen) = self.module.forward(&mb, self.config.n_samples, false)?;
        let (recon, _kl) = self.module.loss(&mb, &inf, &gen)?;
        let recon_val = recon.to_scalar::<f32>()?;

        let (reg_mean, reg_var) = self.module.r2_metric(&mb, &gen)?;
        let disent = self.module.disentanglement(&mb, &inf)?;

        self.valid_accum.add("recon_loss", recon_val);
        self.valid_accum.add("reg_mean", reg_mean);
        self.valid_accum.add("reg_var", reg_var);

        let (disent_basal, disent_after, cpa_metric) = match disent {
            Some((basal, after)) => {
                let cpa = reg_mean + 1.0 - basal + after;
                self.valid_accum.add("disent_basal", basal);
                self.valid_accum.add("disent_after", after);
                self.valid_accum.add("cpa_metric", cpa);
                (Some(basal), Some(after), Some(cpa))
            }
            None => (None, None, None),
        };

        Ok(ValidationOutput {
            recon_loss: recon_val,
            reg_mean,
            reg_var,
            disent_basal,
            disent_after,
            cpa_metric,
        })
    }

    /// Close the training epoch: append the averaged metrics to the
    /// history, decay the learning rates on schedule, and advance the
    /// epoch counter. Call after `end_validation_epoch` when validating.
    pub fn end_train_epoch(&mut self) -> BTreeMap<String, f32> {
        let metrics = self.train_accum.take_means();
        self.history.push(EpochRecord {
            mode: Mode::Train,
            epoch: self.epoch,
            metrics: metrics.clone(),
        });

        if let Some(period) = self.config.step_size_lr {
            if self.epoch > 1 && self.epoch % period == 0 {
                self.decay_learning_rates();
            }
        }
        self.epoch += 1;
        metrics
    }

    /// Close the validation epoch: append the averaged metrics to the
    /// history. Does not advance the epoch counter.
    pub fn end_validation_epoch(&mut self) -> BTreeMap<String, f32> {
        let metrics = self.valid_accum.take_means();
        self.history.push(EpochRecord {
            mode: Mode::Valid,
            epoch: self.epoch,
            metrics: metrics.clone(),
        });
        metrics
    }

    fn decay_learning_rates(&mut self) {
        let gamma = self.config.lr_decay_factor;
        let lr = self.opt_autoencoder.learning_rate();
        self.opt_autoencoder.set_learning_rate(lr * gamma);
        let lr = self.opt_adversary.learning_rate();
        self.opt_adversary.set_learning_rate(lr * gamma);
        let lr = self.opt_dosers.learning_rate();
        self.opt_dosers.set_learning_rate(lr * gamma);
    }

    /// Drive the full epoch loop over an in-memory data set, with an
    /// optional held-out split validated once per epoch.
    pub fn fit(
        &mut self,
        data: &mut InMemoryPerturbData,
        valid: Option<&InMemoryPerturbData>,
        config: &FitConfig,
    ) -> anyhow::Result<()> {
        let pb = ProgressBar::new(config.num_epochs as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for _epoch in 0..config.num_epochs {
            data.shuffle_minibatch(config.batch_size, &mut self.rng);
            for b in 0..data.num_minibatch() {
                let batch = data.minibatch_shuffled(b, &config.device)?;
                self.training_step(&batch)?;
            }

            if let Some(vdata) = valid {
                let vbatch = vdata.full_batch(&config.device)?;
                self.validation_step(&vbatch)?;
                self.end_validation_epoch();
            }

            let metrics = self.end_train_epoch();
            pb.inc(1);

            if config.verbose {
                info!(
                    "[{}] recon: {:.4}",
                    self.epoch,
                    metrics.get("recon_loss").copied().unwrap_or(0.0)
                );
            }
        }
        pb.finish_and_clear();
        Ok(())
    }
}

/// Epoch-loop settings for `AdversarialTrainingPlan::fit`.
pub struct FitConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub device: Device,
    pub show_progress: bool,
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_adversary_steps() {
        let config = TrainPlanConfig {
            adversary_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_zero_scheduler_period() {
        let config = TrainPlanConfig {
            step_size_lr: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accumulator_averages_and_resets() {
        let mut accum = MetricAccumulator::new(vec!["a".to_string(), "b".to_string()]);
        accum.add("a", 1.0);
        accum.add("a", 3.0);

        let means = accum.take_means();
        assert_eq!(means["a"], 2.0);
        assert_eq!(means["b"], 0.0);

        let means = accum.take_means();
        assert_eq!(means["a"], 0.0);
    }
}
