use std::collections::BTreeMap;

/// Bound used when sanitizing metric inputs
pub const METRIC_CLAMP: f32 = 1e3;

/// Replace NaN by 0 and clamp everything (including infinities) into
/// [-bound, bound], so one exploding feature cannot poison a score.
pub fn nan_to_num(values: &mut [f32], bound: f32) {
    for v in values.iter_mut() {
        if v.is_nan() {
            *v = 0.0;
        } else if *v > bound {
            *v = bound;
        } else if *v < -bound {
            *v = -bound;
        }
    }
}

/// Coefficient of determination R^2 of `pred` against `target`.
///
/// Degenerate inputs (constant target, non-finite residuals) score 0
/// rather than propagating NaN into epoch aggregates.
pub fn r2_score(pred: &[f32], target: &[f32]) -> f32 {
    debug_assert_eq!(pred.len(), target.len());

    if target.is_empty() {
        return 0.0;
    }

    let n = target.len() as f32;
    let target_mean = target.iter().sum::<f32>() / n;

    let ss_tot: f32 = target.iter().map(|y| (y - target_mean).powi(2)).sum();
    let ss_res: f32 = pred
        .iter()
        .zip(target.iter())
        .map(|(f, y)| (y - f).powi(2))
        .sum();

    if ss_tot <= f32::EPSILON {
        return 0.0;
    }

    let r2 = 1.0 - ss_res / ss_tot;
    if r2.is_finite() {
        r2
    } else {
        0.0
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
struct VecPoint {
    data: Vec<f32>,
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

/// k-nearest-neighbour label purity of a latent representation.
///
/// For every cell, the fraction of its k nearest neighbours (self
/// excluded) sharing its label; those fractions are averaged per label
/// and the per-label means averaged, so rare labels weigh as much as
/// common ones.
///
/// Returns `None` when fewer than two points are available: purity is
/// undefined without at least one neighbour.
///
/// * `latent` - one vector per cell
/// * `labels` - one category per cell
/// * `n_neighbors` - requested k; clamped to n - 1
pub fn knn_purity(latent: &[Vec<f32>], labels: &[u32], n_neighbors: usize) -> Option<f32> {
    debug_assert_eq!(latent.len(), labels.len());

    let n = latent.len();
    let k = n_neighbors.min(n.saturating_sub(1));
    if k == 0 {
        return None;
    }

    let points: Vec<VecPoint> = latent
        .iter()
        .map(|row| VecPoint { data: row.clone() })
        .collect();
    let values: Vec<usize> = (0..n).collect();

    let dict = instant_distance::Builder::default()
        .seed(42)
        .build(points.clone(), values);

    let mut label_scores: BTreeMap<u32, (f32, usize)> = BTreeMap::new();

    let mut search = instant_distance::Search::default();
    for (i, point) in points.iter().enumerate() {
        let same = dict
            .search(point, &mut search)
            .filter(|item| *item.value != i)
            .take(k)
            .filter(|item| labels[*item.value] == labels[i])
            .count();

        let score = same as f32 / k as f32;
        let entry = label_scores.entry(labels[i]).or_insert((0.0, 0));
        entry.0 += score;
        entry.1 += 1;
    }

    let per_label: Vec<f32> = label_scores
        .values()
        .map(|(sum, count)| sum / *count as f32)
        .collect();

    Some(per_label.iter().sum::<f32>() / per_label.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r2_is_one_for_perfect_prediction() {
        let target = vec![0.5f32, 1.0, 2.0, 4.0, 8.0];
        let pred = target.clone();
        assert!((r2_score(&pred, &target) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn r2_handles_degenerate_targets() {
        let target = vec![3.0f32; 8];
        let pred = vec![1.0f32; 8];
        assert_eq!(r2_score(&pred, &target), 0.0);
    }

    #[test]
    fn nan_to_num_bounds_everything() {
        let mut values = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 5.0, -2.0e9];
        nan_to_num(&mut values, METRIC_CLAMP);
        assert_eq!(values, vec![0.0, METRIC_CLAMP, -METRIC_CLAMP, 5.0, -METRIC_CLAMP]);
    }

    #[test]
    fn purity_is_one_for_tight_clusters() {
        // two well-separated clusters, nearest neighbour always same label
        let mut latent = vec![];
        let mut labels = vec![];
        for i in 0..5 {
            latent.push(vec![0.0 + 0.01 * i as f32, 0.0]);
            labels.push(0u32);
            latent.push(vec![100.0 + 0.01 * i as f32, 100.0]);
            labels.push(1u32);
        }

        let purity = knn_purity(&latent, &labels, 1).unwrap();
        assert!((purity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn purity_drops_for_alternating_labels() {
        // neighbours always carry the opposite label
        let latent: Vec<Vec<f32>> = (0..8).map(|i| vec![i as f32, 0.0]).collect();
        let labels: Vec<u32> = (0..8).map(|i| (i % 2) as u32).collect();

        let purity = knn_purity(&latent, &labels, 1).unwrap();
        assert!(purity < 1.0);
        assert!(purity <= 0.5 + 1e-6);
    }

    #[test]
    fn purity_undefined_for_single_cell() {
        let latent = vec![vec![1.0f32, 2.0]];
        let labels = vec![0u32];
        assert!(knn_purity(&latent, &labels, 30).is_none());
    }
}
