use crate::common::{mkdir, read_lines_of_types, read_lines_with_header, write_lines};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_perturb::candle_adversary::{AdversaryConfig, AdversaryModule};
use candle_perturb::candle_data_loader::{CovariateSpec, InMemoryPerturbData, PerturbBatch};
use candle_perturb::candle_likelihood_decoder::ReconLossKind;
use candle_perturb::candle_perturb_module::{PerturbModule, PerturbModuleConfig};
use candle_perturb::candle_perturbation_encoder::DoseResponseKind;
use candle_perturb::candle_train_plan::{AdversarialTrainingPlan, FitConfig, TrainPlanConfig};

use clap::Parser;
use log::info;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

#[derive(Parser, Debug, Clone)]
pub struct FitArgs {
    /// expression matrix file (cells x genes, TSV)
    #[arg(short = 'x', long, required = true)]
    expression_file: Box<str>,

    /// perturbation file (one line per cell: id dose [id dose ...])
    #[arg(short = 'p', long, required = true)]
    perturbation_file: Box<str>,

    /// covariate file (header of covariate names, one line per cell)
    #[arg(short = 'c', long)]
    covariate_file: Option<Box<str>>,

    /// differential-expression gene mask file (cells x genes, TSV)
    #[arg(long)]
    deg_mask_file: Option<Box<str>>,

    /// latent dimensionality
    #[arg(short = 'k', long, default_value_t = 32)]
    n_latent: usize,

    /// reconstruction likelihood: gauss, nb, zinb
    #[arg(long, default_value = "nb")]
    recon_loss: Box<str>,

    /// dose-response family: logsigm, sigm, linear
    #[arg(long, default_value = "logsigm")]
    doser_kind: Box<str>,

    /// variational basal encoder
    #[arg(long, default_value_t = false)]
    variational: bool,

    /// hidden width of the encoder/decoder stacks
    #[arg(long, default_value_t = 128)]
    n_hidden: usize,

    /// hidden depth of the encoder/decoder stacks
    #[arg(long, default_value_t = 2)]
    n_layers: usize,

    /// hidden width of the dosage-response networks
    #[arg(long, default_value_t = 64)]
    n_hidden_doser: usize,

    /// hidden depth of the dosage-response networks
    #[arg(long, default_value_t = 2)]
    n_layers_doser: usize,

    /// dropout rate for encoder and decoder
    #[arg(long, default_value_t = 0.0)]
    dropout_rate: f32,

    /// layer normalization instead of batch normalization
    #[arg(long, default_value_t = false)]
    layer_norm: bool,

    /// number of training epochs
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// minibatch size
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// autoencoder learning rate
    #[arg(long, default_value_t = 1e-3)]
    autoencoder_lr: f64,

    /// autoencoder weight decay
    #[arg(long, default_value_t = 1e-6)]
    autoencoder_wd: f64,

    /// adversary learning rate
    #[arg(long, default_value_t = 3e-4)]
    adversary_lr: f64,

    /// adversary weight decay
    #[arg(long, default_value_t = 1e-2)]
    adversary_wd: f64,

    /// doser learning rate
    #[arg(long, default_value_t = 1e-3)]
    dosers_lr: f64,

    /// doser weight decay
    #[arg(long, default_value_t = 1e-7)]
    dosers_wd: f64,

    /// one adversary turn per this many steps
    #[arg(long, default_value_t = 3)]
    adversary_steps: usize,

    /// weight of the adversarial loss in the model update
    #[arg(long, default_value_t = 5.0)]
    reg_adversary: f64,

    /// weight of the adversary gradient penalty
    #[arg(long, default_value_t = 3.0)]
    penalty_adversary: f64,

    /// autoencoder-only epochs before the adversarial game
    #[arg(long, default_value_t = 0)]
    warmup_epochs: usize,

    /// epochs over which the KL weight ramps up
    #[arg(long)]
    kl_warmup_epochs: Option<usize>,

    /// decay learning rates every this many epochs
    #[arg(long, default_value_t = 45)]
    step_size_lr: usize,

    /// mixup Beta(alpha, alpha) parameter; 0 disables mixup
    #[arg(long, default_value_t = 0.2)]
    mixup_alpha: f64,

    /// held-out fraction of cells for validation
    #[arg(long, default_value_t = 0.1)]
    valid_ratio: f64,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// output header
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

struct FitData {
    x: Array2<f32>,
    pert_ids: Array2<u32>,
    pert_doses: Array2<f32>,
    pert_label: Vec<u32>,
    covar_ids: BTreeMap<String, Vec<u32>>,
    deg_mask: Option<Array2<f32>>,
    n_perts: usize,
    covars_encoder: CovariateSpec,
}

/// Fit the perturbation-response model on TSV input
pub fn run_fit(args: FitArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let recon_loss: ReconLossKind = args.recon_loss.parse()?;
    let doser_kind: DoseResponseKind = args.doser_kind.parse()?;

    let data = read_fit_data(&args)?;
    let (n_cells, n_genes) = (data.x.nrows(), data.x.ncols());

    info!(
        "{} cells x {} genes, {} perturbations, {} covariates",
        n_cells,
        n_genes,
        data.n_perts,
        data.covars_encoder.len()
    );

    let mut config = PerturbModuleConfig::new(n_genes, data.n_perts, data.covars_encoder.clone());
    config.n_latent = args.n_latent;
    config.recon_loss = recon_loss;
    config.doser_kind = doser_kind;
    config.variational = args.variational;
    config.n_hidden_encoder = args.n_hidden;
    config.n_layers_encoder = args.n_layers;
    config.n_hidden_decoder = args.n_hidden;
    config.n_layers_decoder = args.n_layers;
    config.n_hidden_doser = args.n_hidden_doser;
    config.n_layers_doser = args.n_layers_doser;
    config.n_hidden_library = args.n_hidden_doser;
    config.use_batch_norm_encoder = !args.layer_norm;
    config.use_layer_norm_encoder = args.layer_norm;
    config.use_batch_norm_decoder = !args.layer_norm;
    config.use_layer_norm_decoder = args.layer_norm;
    config.dropout_rate_encoder = args.dropout_rate;
    config.dropout_rate_decoder = args.dropout_rate;
    config.seed = args.rseed;

    let device = Device::cuda_if_available(0)?;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let module = PerturbModule::new(&config, vs.clone(), &device)?;
    let adversary = AdversaryModule::new(
        args.n_latent,
        data.n_perts,
        &data.covars_encoder,
        &AdversaryConfig::default(),
        vs.pp("adv"),
    )?;

    let plan_config = TrainPlanConfig {
        autoencoder_lr: args.autoencoder_lr,
        autoencoder_wd: args.autoencoder_wd,
        adversary_lr: args.adversary_lr,
        adversary_wd: args.adversary_wd,
        dosers_lr: args.dosers_lr,
        dosers_wd: args.dosers_wd,
        adversary_steps: args.adversary_steps,
        reg_adversary: args.reg_adversary,
        penalty_adversary: args.penalty_adversary,
        n_epochs_warmup: args.warmup_epochs,
        n_epochs_kl_warmup: args.kl_warmup_epochs,
        step_size_lr: Some(args.step_size_lr),
        mixup_alpha: args.mixup_alpha,
        ..Default::default()
    };

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let (mut train_data, valid_data) = split_data(&data, args.valid_ratio, &mut rng)?;

    let mut plan = AdversarialTrainingPlan::new(module, adversary, &varmap, &plan_config, rng)?;

    info!("training for {} epochs ...", args.epochs);

    let fit_config = FitConfig {
        num_epochs: args.epochs,
        batch_size: args.batch_size,
        device: device.clone(),
        show_progress: !args.verbose,
        verbose: args.verbose,
    };
    plan.fit(&mut train_data, valid_data.as_ref(), &fit_config)?;

    let out = args.out.as_ref();
    mkdir(out)?;

    write_history(&plan, &format!("{}.history.tsv.gz", out))?;
    write_perturbation_embedding(
        &plan,
        &data,
        n_genes,
        &device,
        &format!("{}.pert_embedding.tsv.gz", out),
    )?;

    info!("done");
    Ok(())
}

fn read_fit_data(args: &FitArgs) -> anyhow::Result<FitData> {
    let x_rows: Vec<Vec<f32>> = read_lines_of_types(&args.expression_file)?;
    anyhow::ensure!(!x_rows.is_empty(), "empty expression matrix");

    let n_cells = x_rows.len();
    let n_genes = x_rows[0].len();
    for (i, row) in x_rows.iter().enumerate() {
        anyhow::ensure!(
            row.len() == n_genes,
            "expression row {} has {} genes, expected {}",
            i,
            row.len(),
            n_genes
        );
    }
    let x = Array2::from_shape_vec((n_cells, n_genes), x_rows.into_iter().flatten().collect())?;

    let pert_rows: Vec<Vec<f32>> = read_lines_of_types(&args.perturbation_file)?;
    anyhow::ensure!(
        pert_rows.len() == n_cells,
        "perturbation file has {} cells, expected {}",
        pert_rows.len(),
        n_cells
    );

    let mut n_slots = 0;
    for (i, row) in pert_rows.iter().enumerate() {
        anyhow::ensure!(
            !row.is_empty() && row.len() % 2 == 0,
            "perturbation row {} must hold (id, dose) pairs",
            i
        );
        n_slots = n_slots.max(row.len() / 2);
    }

    // pad unused combination slots with dose zero
    let mut pert_ids = Array2::<u32>::zeros((n_cells, n_slots));
    let mut pert_doses = Array2::<f32>::zeros((n_cells, n_slots));
    let mut n_perts = 0;

    let mut label_dict: BTreeMap<Vec<u32>, u32> = BTreeMap::new();
    let mut pert_label = Vec::with_capacity(n_cells);

    for (i, row) in pert_rows.iter().enumerate() {
        let mut active = vec![];
        for (slot, pair) in row.chunks(2).enumerate() {
            let id = pair[0] as u32;
            let dose = pair[1];
            anyhow::ensure!(dose >= 0.0, "negative dose at cell {}", i);
            pert_ids[[i, slot]] = id;
            pert_doses[[i, slot]] = dose;
            n_perts = n_perts.max(id as usize + 1);
            if dose > 0.0 {
                active.push(id);
            }
        }
        active.sort_unstable();
        let next = label_dict.len() as u32;
        let label = *label_dict.entry(active).or_insert(next);
        pert_label.push(label);
    }

    let (covar_ids, covars_encoder) = match &args.covariate_file {
        Some(file) => {
            let (names, rows) = read_lines_with_header(file)?;
            anyhow::ensure!(
                rows.len() == n_cells,
                "covariate file has {} cells, expected {}",
                rows.len(),
                n_cells
            );

            let mut covar_ids: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            let mut covars_encoder = CovariateSpec::new();
            for (c, name) in names.iter().enumerate() {
                let column: Vec<u32> = rows.iter().map(|row| row[c]).collect();
                let n_cats = column.iter().max().map(|&m| m as usize + 1).unwrap_or(1);
                covars_encoder.insert(name.clone(), n_cats);
                covar_ids.insert(name.clone(), column);
            }
            (covar_ids, covars_encoder)
        }
        None => (BTreeMap::new(), CovariateSpec::new()),
    };

    let deg_mask = match &args.deg_mask_file {
        Some(file) => {
            let rows: Vec<Vec<f32>> = read_lines_of_types(file)?;
            anyhow::ensure!(
                rows.len() == n_cells && rows.iter().all(|r| r.len() == n_genes),
                "deg mask must match the expression matrix shape"
            );
            Some(Array2::from_shape_vec(
                (n_cells, n_genes),
                rows.into_iter().flatten().collect(),
            )?)
        }
        None => None,
    };

    Ok(FitData {
        x,
        pert_ids,
        pert_doses,
        pert_label,
        covar_ids,
        deg_mask,
        n_perts,
        covars_encoder,
    })
}

fn gather_rows(data: &FitData, rows: &[usize]) -> anyhow::Result<InMemoryPerturbData> {
    let covar_ids = data
        .covar_ids
        .iter()
        .map(|(name, ids)| {
            let gathered: Vec<u32> = rows.iter().map(|&i| ids[i]).collect();
            (name.clone(), gathered)
        })
        .collect();

    InMemoryPerturbData::new(
        data.x.select(Axis(0), rows),
        data.pert_ids.select(Axis(0), rows),
        data.pert_doses.select(Axis(0), rows),
        rows.iter().map(|&i| data.pert_label[i]).collect(),
        covar_ids,
        data.deg_mask.as_ref().map(|m| m.select(Axis(0), rows)),
    )
}

/// Split the cells into a training set and an optional held-out set
fn split_data(
    data: &FitData,
    valid_ratio: f64,
    rng: &mut StdRng,
) -> anyhow::Result<(InMemoryPerturbData, Option<InMemoryPerturbData>)> {
    anyhow::ensure!(
        (0.0..1.0).contains(&valid_ratio),
        "valid_ratio must be in [0, 1)"
    );

    let n_cells = data.x.nrows();
    let n_valid = (n_cells as f64 * valid_ratio) as usize;

    if n_valid == 0 {
        let rows: Vec<usize> = (0..n_cells).collect();
        return Ok((gather_rows(data, &rows)?, None));
    }

    let mut rows: Vec<usize> = (0..n_cells).collect();
    rows.shuffle(rng);

    let valid_rows = &rows[..n_valid];
    let train_rows = &rows[n_valid..];

    Ok((
        gather_rows(data, train_rows)?,
        Some(gather_rows(data, valid_rows)?),
    ))
}

fn write_history(plan: &AdversarialTrainingPlan, file: &str) -> anyhow::Result<()> {
    let mut lines = vec!["mode\tepoch\tmetric\tvalue".to_string()];
    for record in plan.history().records() {
        for (metric, value) in record.metrics.iter() {
            lines.push(format!(
                "{}\t{}\t{}\t{}",
                record.mode.as_str(),
                record.epoch,
                metric,
                value
            ));
        }
    }
    write_lines(&lines, file)
}

/// One embedding row per perturbation, evaluated at unit dose
fn write_perturbation_embedding(
    plan: &AdversarialTrainingPlan,
    data: &FitData,
    n_genes: usize,
    device: &Device,
    file: &str,
) -> anyhow::Result<()> {
    let n_perts = data.n_perts;

    let ids: Vec<u32> = (0..n_perts as u32).collect();
    let doses = vec![1.0f32; n_perts];

    let covar_ids = data
        .covars_encoder
        .keys()
        .map(|name| -> anyhow::Result<(String, Tensor)> {
            let zeros = Tensor::zeros((n_perts,), DType::U32, device)?;
            Ok((name.clone(), zeros))
        })
        .collect::<anyhow::Result<BTreeMap<String, Tensor>>>()?;

    let batch = PerturbBatch {
        x: Tensor::zeros((n_perts, n_genes), DType::F32, device)?,
        pert_ids: Tensor::from_vec(ids.clone(), (n_perts, 1), device)?,
        pert_doses: Tensor::from_vec(doses, (n_perts, 1), device)?,
        pert_label: Tensor::from_vec(ids, (n_perts,), device)?,
        covar_ids,
        deg_mask: None,
    };

    let embedding = plan.module().get_perturbation_embedding(&batch)?;
    let values: Vec<Vec<f32>> = embedding.to_vec2()?;

    let lines: Vec<String> = values
        .iter()
        .enumerate()
        .map(|(p, row)| {
            let fields: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            format!("{}\t{}", p, fields.join("\t"))
        })
        .collect();

    write_lines(&lines, file)
}
