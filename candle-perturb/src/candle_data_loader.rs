use candle_core::{DType, Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

/// Covariate name to cardinality, fixed at construction
pub type CovariateSpec = BTreeMap<String, usize>;

/// One device-resident minibatch of cells.
///
/// All per-cell fields share the leading (cell) dimension.
pub struct PerturbBatch {
    /// expression (n x genes), non-negative counts or continuous values
    pub x: Tensor,
    /// perturbation identifiers (n x combo slots, u32)
    pub pert_ids: Tensor,
    /// matching dosages (n x combo slots); padding slots carry dose 0
    pub pert_doses: Tensor,
    /// identity of the whole perturbation combination (n, u32)
    pub pert_label: Tensor,
    /// per-covariate category indices (n, u32)
    pub covar_ids: BTreeMap<String, Tensor>,
    /// optional differential-expression gene mask (n x genes)
    pub deg_mask: Option<Tensor>,
}

impl PerturbBatch {
    pub fn n_cells(&self) -> candle_core::Result<usize> {
        Ok(self.x.dims2()?.0)
    }
}

/// In-memory minibatch loader for perturbation data. Owns the full
/// matrices on the host; rows are shuffled per epoch with the caller's
/// random stream and materialized on the target device per minibatch.
pub struct InMemoryPerturbData {
    x: Array2<f32>,
    pert_ids: Array2<u32>,
    pert_doses: Array2<f32>,
    pert_label: Vec<u32>,
    covar_ids: BTreeMap<String, Vec<u32>>,
    deg_mask: Option<Array2<f32>>,

    samples: Vec<usize>,
    chunks: Vec<Vec<usize>>,
}

impl InMemoryPerturbData {
    pub fn new(
        x: Array2<f32>,
        pert_ids: Array2<u32>,
        pert_doses: Array2<f32>,
        pert_label: Vec<u32>,
        covar_ids: BTreeMap<String, Vec<u32>>,
        deg_mask: Option<Array2<f32>>,
    ) -> anyhow::Result<Self> {
        let n = x.nrows();

        anyhow::ensure!(
            pert_ids.nrows() == n && pert_doses.nrows() == n && pert_label.len() == n,
            "perturbation fields must share the cell dimension ({})",
            n
        );
        anyhow::ensure!(
            pert_ids.ncols() == pert_doses.ncols(),
            "each perturbation slot needs a matching dosage column"
        );
        for (name, ids) in covar_ids.iter() {
            anyhow::ensure!(
                ids.len() == n,
                "covariate {} has {} cells, expected {}",
                name,
                ids.len(),
                n
            );
        }
        if let Some(mask) = &deg_mask {
            anyhow::ensure!(
                mask.nrows() == n && mask.ncols() == x.ncols(),
                "deg mask must match the expression matrix shape"
            );
        }

        let samples = (0..n).collect();

        Ok(Self {
            x,
            pert_ids,
            pert_doses,
            pert_label,
            covar_ids,
            deg_mask,
            samples,
            chunks: vec![],
        })
    }

    pub fn num_cells(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.x.ncols()
    }

    /// Re-chunk the cells into shuffled minibatches of `batch_size`
    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) {
        debug_assert!(batch_size > 0);

        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
    }

    pub fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    /// Materialize the `batch_idx`-th shuffled minibatch on `device`
    pub fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        device: &Device,
    ) -> anyhow::Result<PerturbBatch> {
        let chunk = self
            .chunks
            .get(batch_idx)
            .ok_or_else(|| anyhow::anyhow!("minibatch #{} was never chunked", batch_idx))?;

        self.gather_rows(chunk, device)
    }

    /// Materialize all cells, in stored order, as one batch
    pub fn full_batch(&self, device: &Device) -> anyhow::Result<PerturbBatch> {
        let rows: Vec<usize> = (0..self.num_cells()).collect();
        self.gather_rows(&rows, device)
    }

    fn gather_rows(&self, rows: &[usize], device: &Device) -> anyhow::Result<PerturbBatch> {
        let n = rows.len();
        let n_genes = self.x.ncols();
        let n_slots = self.pert_ids.ncols();

        let mut x = Vec::with_capacity(n * n_genes);
        let mut ids = Vec::with_capacity(n * n_slots);
        let mut doses = Vec::with_capacity(n * n_slots);
        let mut label = Vec::with_capacity(n);

        for &i in rows {
            x.extend(self.x.row(i).iter().cloned());
            ids.extend(self.pert_ids.row(i).iter().cloned());
            doses.extend(self.pert_doses.row(i).iter().cloned());
            label.push(self.pert_label[i]);
        }

        let mut covar_ids = BTreeMap::new();
        for (name, all_ids) in self.covar_ids.iter() {
            let gathered: Vec<u32> = rows.iter().map(|&i| all_ids[i]).collect();
            covar_ids.insert(
                name.clone(),
                Tensor::from_vec(gathered, (n,), device)?.to_dtype(DType::U32)?,
            );
        }

        let deg_mask = match &self.deg_mask {
            Some(mask) => {
                let mut values = Vec::with_capacity(n * n_genes);
                for &i in rows {
                    values.extend(mask.row(i).iter().cloned());
                }
                Some(Tensor::from_vec(values, (n, n_genes), device)?)
            }
            None => None,
        };

        Ok(PerturbBatch {
            x: Tensor::from_vec(x, (n, n_genes), device)?,
            pert_ids: Tensor::from_vec(ids, (n, n_slots), device)?.to_dtype(DType::U32)?,
            pert_doses: Tensor::from_vec(doses, (n, n_slots), device)?,
            pert_label: Tensor::from_vec(label, (n,), device)?.to_dtype(DType::U32)?,
            covar_ids,
            deg_mask,
        })
    }
}
