use crate::candle_loss_functions::gaussian_kl_loss;
use candle_core::{Result, Tensor};

/// A diagonal Gaussian posterior q(z | x) kept as (mean, log variance)
pub struct GaussianPosterior {
    pub mean: Tensor,
    pub lnvar: Tensor,
}

impl GaussianPosterior {
    /// KL(q || N(0, I)) per cell, summed over latent dimensions
    pub fn kl_standard_normal(&self) -> Result<Tensor> {
        gaussian_kl_loss(&self.mean, &self.lnvar)
    }

    /// One reparameterized draw: z = mu + sigma * eps, eps ~ N(0, 1)
    pub fn rsample(&self) -> Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        &self.mean + (&self.lnvar * 0.5)?.exp()? * eps
    }

    /// `n_samples` reparameterized draws stacked on a leading dimension
    pub fn rsample_n(&self, n_samples: usize) -> Result<Tensor> {
        let mut shape = vec![n_samples];
        shape.extend_from_slice(self.mean.dims());
        let eps = Tensor::randn(0f32, 1f32, shape, self.mean.device())?;
        eps.broadcast_mul(&(&self.lnvar * 0.5)?.exp()?)?
            .broadcast_add(&self.mean)
    }
}

/// A classifier over a latent representation: given latent vectors,
/// return class logits. The adversarial game only relies on this shape.
pub trait ClassifierModuleT {
    /// * `z_nk` - latent vectors (n x k)
    ///
    /// # Returns logits (n x n_classes)
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;

    fn n_classes(&self) -> usize;
}
