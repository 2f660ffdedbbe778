use candle_core::{Result, Tensor};

const EPS: f64 = 1e-8;

/// KL divergence loss between a Gaussian posterior and the standard normal
///
/// 0.5 * (sigma^2 - 1 + mu^2 - log(sigma^2))
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Numerically stable softplus: log(1 + exp(x)) = max(x, 0) + log1p(exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let max_part = x.maximum(0.0)?;
    let log_part = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    max_part + log_part
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6, f64::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let log_xp3 = xp3.log()?;

    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * &log_xp3)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Gaussian log-likelihood with per-gene variance
///
/// llik(i) = -0.5 * sum_w [ log(2 pi) + lnvar(i,w) + (x(i,w) - mean(i,w))^2 / var(i,w) ]
///
/// * `x_nd` - observed data
/// * `mean_nd` - predicted mean
/// * `lnvar_nd` - predicted log variance
///
pub fn gaussian_log_likelihood(x_nd: &Tensor, mean_nd: &Tensor, lnvar_nd: &Tensor) -> Result<Tensor> {
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let sq_err = x_nd.broadcast_sub(mean_nd)?.powf(2.)?;
    let scaled = sq_err.broadcast_div(&lnvar_nd.exp()?)?;
    let elems = (scaled.broadcast_add(lnvar_nd)? + ln_2pi)?;
    elems.sum(elems.rank() - 1)? * (-0.5)
}

/// Negative Binomial log-likelihood with mean `mu` and inverse dispersion `theta`
///
/// ```text
/// llik(i) = sum_w lgamma(x + th) - lgamma(th) - lgamma(x + 1)
///           + th * (log th - log(th + mu)) + x * (log mu - log(th + mu))
/// ```
///
/// * `x_nd` - observed counts (n x d)
/// * `mu_nd` - mean rate (n x d)
/// * `theta_1d` - per-gene inverse dispersion, broadcast over cells (1 x d)
///
pub fn nb_log_likelihood(x_nd: &Tensor, mu_nd: &Tensor, theta_1d: &Tensor) -> Result<Tensor> {
    let log_theta = (theta_1d + EPS)?.log()?;
    let log_theta_mu = (mu_nd.broadcast_add(theta_1d)? + EPS)?.log()?;
    let log_mu = (mu_nd + EPS)?.log()?;

    let term_disp = log_theta
        .broadcast_sub(&log_theta_mu)?
        .broadcast_mul(theta_1d)?;
    let term_rate = log_mu.sub(&log_theta_mu)?.broadcast_mul(x_nd)?;

    let lgamma_x_theta = lgamma_approx(&x_nd.broadcast_add(theta_1d)?)?;
    let lgamma_theta = lgamma_approx(theta_1d)?;
    let lgamma_x_1 = lgamma_approx(&(x_nd + 1.0)?)?;

    let elems = lgamma_x_theta
        .broadcast_sub(&lgamma_theta)?
        .broadcast_sub(&lgamma_x_1)?
        .broadcast_add(&term_disp)?
        .broadcast_add(&term_rate)?;
    elems.sum(elems.rank() - 1)
}

/// Zero-Inflated Negative Binomial log-likelihood
///
/// Zero counts mix the NB mass at zero with the dropout gate
/// `pi = sigmoid(zi_logit)`; positive counts pay the gate's complement.
///
/// * `x_nd` - observed counts
/// * `mu_nd` - NB mean rate
/// * `theta_1d` - per-gene inverse dispersion (1 x d)
/// * `zi_logit_nd` - per-gene dropout logits
///
pub fn zinb_log_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_1d: &Tensor,
    zi_logit_nd: &Tensor,
) -> Result<Tensor> {
    let log_theta = (theta_1d + EPS)?.log()?;
    let log_theta_mu = (mu_nd.broadcast_add(theta_1d)? + EPS)?.log()?;
    let log_mu = (mu_nd + EPS)?.log()?;

    let softplus_pi = softplus(&zi_logit_nd.neg()?)?;
    let pi_theta_log = log_theta
        .broadcast_sub(&log_theta_mu)?
        .broadcast_mul(theta_1d)?
        .sub(zi_logit_nd)?;

    let case_zero = softplus(&pi_theta_log)?.sub(&softplus_pi)?;

    let lgamma_x_theta = lgamma_approx(&x_nd.broadcast_add(theta_1d)?)?;
    let lgamma_theta = lgamma_approx(theta_1d)?;
    let lgamma_x_1 = lgamma_approx(&(x_nd + 1.0)?)?;

    let case_non_zero = pi_theta_log
        .sub(&softplus_pi)?
        .add(&log_mu.sub(&log_theta_mu)?.mul(x_nd)?)?
        .add(&lgamma_x_theta)?
        .broadcast_sub(&lgamma_theta)?
        .sub(&lgamma_x_1)?;

    let zero_mask = x_nd.lt(EPS)?;
    zero_mask
        .where_cond(&case_zero, &case_non_zero)?
        .sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_lgamma_approx() -> Result<()> {
        let device = Device::Cpu;

        let x = Tensor::from_vec(vec![1.0f32, 2.0, 5.0, 10.0], (4,), &device)?;
        let lg = lgamma_approx(&x)?;
        let vals: Vec<f32> = lg.to_vec1()?;

        // lgamma(1) = 0, lgamma(2) = 0, lgamma(5) ≈ 3.178, lgamma(10) ≈ 12.802
        assert!((vals[0] - 0.0).abs() < 0.1);
        assert!((vals[1] - 0.0).abs() < 0.1);
        assert!((vals[2] - 3.178).abs() < 0.2);
        assert!((vals[3] - 12.802).abs() < 0.5);

        Ok(())
    }

    #[test]
    fn test_softplus_stability() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-50.0f32, -1.0, 0.0, 1.0, 50.0], (5,), &device)?;
        let sp: Vec<f32> = softplus(&x)?.to_vec1()?;

        assert!(sp.iter().all(|v| v.is_finite()));
        assert!((sp[2] - (2.0f32).ln()).abs() < 1e-5);
        assert!((sp[4] - 50.0).abs() < 1e-4);
        assert!(sp[0] >= 0.0 && sp[0] < 1e-6);
        Ok(())
    }

    #[test]
    fn test_gaussian_kl_non_negative() -> Result<()> {
        let device = Device::Cpu;
        let mean = Tensor::from_vec(vec![-2.0f32, -0.5, 0.0, 0.5, 2.0, 5.0], (2, 3), &device)?;
        let lnvar = Tensor::from_vec(vec![-3.0f32, -1.0, 0.0, 0.5, 1.0, 3.0], (2, 3), &device)?;

        let kl: Vec<f32> = gaussian_kl_loss(&mean, &lnvar)?.to_vec1()?;
        for v in kl {
            assert!(v >= -1e-6, "KL must be non-negative, got {}", v);
        }
        Ok(())
    }

    #[test]
    fn test_gaussian_llik_peaks_at_observation() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], (1, 3), &device)?;
        let lnvar = Tensor::zeros((1, 3), candle_core::DType::F32, &device)?;

        let at_x = gaussian_log_likelihood(&x, &x, &lnvar)?.to_vec1::<f32>()?[0];
        let off = (&x + 1.0)?;
        let at_off = gaussian_log_likelihood(&x, &off, &lnvar)?.to_vec1::<f32>()?[0];

        assert!(at_x > at_off);
        Ok(())
    }

    #[test]
    fn test_nb_llik_finite() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0.0f32, 1.0, 7.0, 2.0, 0.0, 30.0], (2, 3), &device)?;
        let mu = Tensor::from_vec(vec![0.5f32, 1.5, 5.0, 2.5, 0.1, 20.0], (2, 3), &device)?;
        let theta = Tensor::from_vec(vec![1.0f32, 2.0, 5.0], (1, 3), &device)?;

        let llik: Vec<f32> = nb_log_likelihood(&x, &mu, &theta)?.to_vec1()?;
        assert!(llik.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_zinb_approaches_nb_without_inflation() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1.0f32, 4.0, 2.0], (1, 3), &device)?;
        let mu = Tensor::from_vec(vec![1.5f32, 3.0, 2.0], (1, 3), &device)?;
        let theta = Tensor::from_vec(vec![2.0f32, 2.0, 2.0], (1, 3), &device)?;
        // strongly negative logits turn the dropout gate off
        let zi = Tensor::full(-20.0f32, (1, 3), &device)?;

        let nb = nb_log_likelihood(&x, &mu, &theta)?.to_vec1::<f32>()?[0];
        let zinb = zinb_log_likelihood(&x, &mu, &theta, &zi)?.to_vec1::<f32>()?[0];

        assert!((nb - zinb).abs() < 1e-3, "nb {} vs zinb {}", nb, zinb);
        Ok(())
    }
}
