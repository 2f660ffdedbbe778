use candle_perturb::candle_data_loader::{CovariateSpec, PerturbBatch};
use candle_perturb::candle_likelihood_decoder::{LikelihoodParams, ReconLossKind};
use candle_perturb::candle_perturb_module::{
    GenerativeOutputs, MixedBatch, PerturbModule, PerturbModuleConfig,
};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

const N_GENES: usize = 50;
const N_PERTS: usize = 3;

fn small_config(recon_loss: ReconLossKind, variational: bool) -> PerturbModuleConfig {
    let mut covars = CovariateSpec::new();
    covars.insert("batch".to_string(), 2);

    let mut config = PerturbModuleConfig::new(N_GENES, N_PERTS, covars);
    config.n_latent = 8;
    config.recon_loss = recon_loss;
    config.variational = variational;
    config.n_hidden_encoder = 32;
    config.n_layers_encoder = 1;
    config.n_hidden_decoder = 32;
    config.n_layers_decoder = 1;
    config.n_hidden_doser = 16;
    config.n_layers_doser = 1;
    config.n_hidden_library = 16;
    config.use_batch_norm_encoder = false;
    config.use_batch_norm_decoder = false;
    config.seed = 42;
    config
}

fn build_module(
    recon_loss: ReconLossKind,
    variational: bool,
    device: &Device,
) -> anyhow::Result<PerturbModule> {
    let config = small_config(recon_loss, variational);
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
    PerturbModule::new(&config, vs, device)
}

/// Counts are a deterministic function of the perturbation id.
fn toy_batch(n: usize, device: &Device) -> anyhow::Result<PerturbBatch> {
    let mut x = Vec::with_capacity(n * N_GENES);
    let mut ids = Vec::with_capacity(n);
    let mut doses = Vec::with_capacity(n);
    let mut label = Vec::with_capacity(n);
    let mut covar = Vec::with_capacity(n);

    for i in 0..n {
        let p = (i % N_PERTS) as u32;
        for g in 0..N_GENES {
            let base = ((g % 7) + 1) as f32;
            x.push(base + p as f32 * ((g % 3) as f32));
        }
        ids.push(p);
        doses.push(1.0f32);
        label.push(p);
        covar.push((i % 2) as u32);
    }

    let mut covar_ids = BTreeMap::new();
    covar_ids.insert(
        "batch".to_string(),
        Tensor::from_vec(covar, (n,), device)?,
    );

    Ok(PerturbBatch {
        x: Tensor::from_vec(x, (n, N_GENES), device)?,
        pert_ids: Tensor::from_vec(ids, (n, 1), device)?,
        pert_doses: Tensor::from_vec(doses, (n, 1), device)?,
        pert_label: Tensor::from_vec(label, (n,), device)?,
        covar_ids,
        deg_mask: None,
    })
}

#[test]
fn mixup_with_zero_alpha_is_identity() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(1);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;

    assert_eq!(mb.mixup_lambda, 1.0);
    assert_eq!(mb.x.to_vec2::<f32>()?, batch.x.to_vec2::<f32>()?);
    assert_eq!(mb.x_true.to_vec2::<f32>()?, batch.x.to_vec2::<f32>()?);
    assert_eq!(
        mb.pert_ids_true.to_vec2::<u32>()?,
        batch.pert_ids.to_vec2::<u32>()?
    );
    Ok(())
}

#[test]
fn blended_perturbation_latent_is_convex_combination() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(12, &device)?;
    let lambda = 0.3;

    // secondary view: every perturbation id shifted by one
    let ids_true: Vec<Vec<u32>> = batch.pert_ids.to_vec2()?;
    let ids_mixup: Vec<u32> = ids_true
        .iter()
        .map(|row| (row[0] + 1) % N_PERTS as u32)
        .collect();
    let n = ids_mixup.len();
    let pert_ids_mixup = Tensor::from_vec(ids_mixup, (n, 1), &device)?;

    let mb = MixedBatch {
        x: batch.x.clone(),
        x_true: batch.x.clone(),
        x_mixup: batch.x.clone(),
        pert_ids_true: batch.pert_ids.clone(),
        pert_ids_mixup: pert_ids_mixup.clone(),
        pert_doses_true: batch.pert_doses.clone(),
        pert_doses_mixup: batch.pert_doses.clone(),
        pert_label: batch.pert_label.clone(),
        covar_ids_true: batch.covar_ids.clone(),
        covar_ids_mixup: batch.covar_ids.clone(),
        deg_mask: None,
        mixup_lambda: lambda,
    };

    let inf = module.inference(&mb, 1, false)?;

    let batch_mixup = PerturbBatch {
        x: batch.x.clone(),
        pert_ids: pert_ids_mixup,
        pert_doses: batch.pert_doses.clone(),
        pert_label: batch.pert_label.clone(),
        covar_ids: batch.covar_ids.clone(),
        deg_mask: None,
    };

    let f_true = module.get_perturbation_embedding(&batch)?;
    let f_mixup = module.get_perturbation_embedding(&batch_mixup)?;
    let expected = ((&f_true * lambda)? + (&f_mixup * (1.0 - lambda))?)?;

    let got = inf.z_pert.to_vec2::<f32>()?;
    let want = expected.to_vec2::<f32>()?;
    for (row_got, row_want) in got.iter().zip(want.iter()) {
        for (a, b) in row_got.iter().zip(row_want.iter()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }
    Ok(())
}

#[test]
fn composed_latent_is_sum_of_components() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(2);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;
    let inf = module.inference(&mb, 1, false)?;

    let recomposed = inf
        .z_basal
        .broadcast_add(&inf.z_pert)?
        .broadcast_add(&inf.z_covs)?;

    let got = inf.z.to_vec2::<f32>()?;
    let want = recomposed.to_vec2::<f32>()?;
    for (row_got, row_want) in got.iter().zip(want.iter()) {
        for (a, b) in row_got.iter().zip(row_want.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
    Ok(())
}

#[test]
fn deterministic_inference_is_repeatable() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(3);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;
    let first = module.inference(&mb, 1, false)?;
    let second = module.inference(&mb, 1, false)?;

    assert_eq!(first.z.to_vec2::<f32>()?, second.z.to_vec2::<f32>()?);
    assert_eq!(
        first.z_basal.to_vec2::<f32>()?,
        second.z_basal.to_vec2::<f32>()?
    );
    Ok(())
}

#[test]
fn variational_kl_is_non_negative() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, true, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(4);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;
    let inf = module.inference(&mb, 1, true)?;

    let qz = inf.qz.as_ref().expect("variational posterior");
    let kl: Vec<f32> = qz.kl_standard_normal()?.to_vec1()?;
    for v in kl {
        assert!(v >= -1e-6, "negative KL: {}", v);
    }
    Ok(())
}

#[test]
fn r2_metric_is_one_for_perfect_prediction() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Gauss, false, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(5);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;
    let gen = GenerativeOutputs {
        px: LikelihoodParams::Gauss {
            mean: mb.x.clone(),
            lnvar: Tensor::zeros((16, N_GENES), DType::F32, &device)?,
        },
    };

    let (r2_mean, _r2_var) = module.r2_metric(&mb, &gen)?;
    approx::assert_abs_diff_eq!(r2_mean, 1.0, epsilon = 1e-4);

    // masking to a gene subset keeps the perfect score
    let mask: Vec<f32> = (0..16 * N_GENES)
        .map(|j| if j % 2 == 0 { 1.0 } else { 0.0 })
        .collect();
    let mut masked = module.mixup_batch(&batch, 0.0, &mut rng)?;
    masked.deg_mask = Some(Tensor::from_vec(mask, (16, N_GENES), &device)?);

    let gen = GenerativeOutputs {
        px: LikelihoodParams::Gauss {
            mean: masked.x.clone(),
            lnvar: Tensor::zeros((16, N_GENES), DType::F32, &device)?,
        },
    };
    let (r2_masked, _) = module.r2_metric(&masked, &gen)?;
    approx::assert_abs_diff_eq!(r2_masked, 1.0, epsilon = 1e-4);
    Ok(())
}

#[test]
fn disentanglement_skips_single_cell_batches() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(1, &device)?;
    let mut rng = StdRng::seed_from_u64(6);

    let mb = module.mixup_batch(&batch, 0.0, &mut rng)?;
    let inf = module.inference(&mb, 1, false)?;

    assert!(module.disentanglement(&mb, &inf)?.is_none());
    Ok(())
}

#[test]
fn predicted_expression_matches_batch_shape() -> anyhow::Result<()> {
    let device = Device::Cpu;
    let module = build_module(ReconLossKind::Nb, false, &device)?;
    let batch = toy_batch(16, &device)?;
    let mut rng = StdRng::seed_from_u64(7);

    let pred = module.get_expression(&batch, 1, &mut rng)?;
    assert_eq!(pred.dims2()?, (16, N_GENES));

    let values: Vec<Vec<f32>> = pred.to_vec2()?;
    for row in values {
        for v in row {
            assert!(v.is_finite() && v >= 0.0);
        }
    }
    Ok(())
}
