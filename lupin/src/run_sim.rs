use crate::common::{mkdir, write_lines};

use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson, Uniform};

#[derive(Parser, Debug, Clone)]
pub struct SimArgs {
    /// number of cells
    #[arg(short = 'n', long, default_value_t = 500)]
    n_cells: usize,

    /// number of genes
    #[arg(short = 'g', long, default_value_t = 100)]
    n_genes: usize,

    /// number of perturbations
    #[arg(short = 'p', long, default_value_t = 5)]
    n_perts: usize,

    /// number of genes responding to each perturbation
    #[arg(short = 'a', long, default_value_t = 20)]
    n_causal_genes: usize,

    /// number of batches (one covariate)
    #[arg(short = 'b', long, default_value_t = 2)]
    n_batches: usize,

    /// random seed
    #[arg(long, default_value_t = 42)]
    rseed: u64,

    /// output header
    #[arg(long, short, required = true)]
    out: Box<str>,
}

/// Simulate counts whose expression is a dose-scaled function of the
/// perturbation assignment:
///
/// ```text
/// ln rate(j,g) = ln mu0(g) + d(j) * tau(P(j), g) + kappa(B(j), g)
/// Y(j,g) ~ Poisson{ rate(j,g) }
/// ```
pub fn run_simulate(args: SimArgs) -> anyhow::Result<()> {
    env_logger::init();

    let n_cells = args.n_cells;
    let n_genes = args.n_genes;
    let n_perts = args.n_perts;

    anyhow::ensure!(n_cells > 0 && n_genes > 0 && n_perts > 0 && args.n_batches > 0);

    let mut rng = StdRng::seed_from_u64(args.rseed);

    let runif_base = Uniform::new(1.0_f32, 8.0)?;
    let runif_gene = Uniform::new(0, n_genes)?;
    let runif_dose = Uniform::new(0.1_f32, 1.0)?;
    let rnorm_tau = Normal::new(0.0_f32, 1.0)?;
    let rnorm_batch = Normal::new(0.0_f32, 0.1)?;

    let baseline: Vec<f32> = (0..n_genes).map(|_| runif_base.sample(&mut rng)).collect();

    // perturbation effects on a sparse causal gene set
    let mut tau = vec![vec![0.0_f32; n_genes]; n_perts];
    for tau_p in tau.iter_mut() {
        for _ in 0..args.n_causal_genes {
            let g = runif_gene.sample(&mut rng);
            tau_p[g] = rnorm_tau.sample(&mut rng);
        }
    }

    let kappa: Vec<Vec<f32>> = (0..args.n_batches)
        .map(|_| (0..n_genes).map(|_| rnorm_batch.sample(&mut rng)).collect())
        .collect();

    info!("sampling {} x {} counts ...", n_cells, n_genes);

    let mut expression_lines = Vec::with_capacity(n_cells);
    let mut pert_lines = Vec::with_capacity(n_cells);
    let mut covar_lines = Vec::with_capacity(n_cells + 1);
    covar_lines.push("batch".to_string());

    for j in 0..n_cells {
        let p = j % n_perts;
        let b = j % args.n_batches;
        let dose = runif_dose.sample(&mut rng);

        let mut row = Vec::with_capacity(n_genes);
        for g in 0..n_genes {
            let log_rate = baseline[g].ln() + dose * tau[p][g] + kappa[b][g];
            let rate = log_rate.exp().clamp(1e-4, 1e4);
            let y: f32 = Poisson::new(rate)?.sample(&mut rng);
            row.push(format!("{}", y as u64));
        }

        expression_lines.push(row.join("\t"));
        pert_lines.push(format!("{}\t{}", p, dose));
        covar_lines.push(format!("{}", b));
    }

    let out = args.out.as_ref();
    mkdir(out)?;

    write_lines(&expression_lines, &format!("{}.expression.tsv.gz", out))?;
    write_lines(&pert_lines, &format!("{}.perturbations.tsv.gz", out))?;
    write_lines(&covar_lines, &format!("{}.covariates.tsv.gz", out))?;

    info!("done");
    Ok(())
}
