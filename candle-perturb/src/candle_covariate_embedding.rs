use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use std::collections::BTreeMap;

/// Per-covariate lookup embeddings. The covariate spec (name to
/// cardinality) is fixed at construction and never extended at runtime;
/// an out-of-range category index fails at the lookup.
pub struct CovariateEmbedding {
    n_latent: usize,
    cardinalities: BTreeMap<String, usize>,
    tables: BTreeMap<String, Embedding>,
}

impl CovariateEmbedding {
    /// Will create one embedding table per covariate with variables
    /// `{covar}.weight` of shape cardinality x n_latent.
    pub fn new(
        covars_encoder: &BTreeMap<String, usize>,
        n_latent: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (name, &n_cats) in covars_encoder.iter() {
            let table = candle_nn::embedding(n_cats, n_latent, vs.pp(name))?;
            tables.insert(name.clone(), table);
        }

        Ok(Self {
            n_latent,
            cardinalities: covars_encoder.clone(),
            tables,
        })
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.cardinalities.keys()
    }

    pub fn cardinality(&self, name: &str) -> Option<usize> {
        self.cardinalities.get(name).copied()
    }

    /// Embedding rows for one covariate's category indices (n,) -> (n x k)
    pub fn lookup(&self, name: &str, ids_n: &Tensor) -> Result<Tensor> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("unknown covariate: {}", name)))?;
        table.forward(ids_n)
    }
}
