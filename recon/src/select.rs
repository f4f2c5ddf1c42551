use indexmap::IndexSet;

use crate::params::ReconParams;

/// Chooses which of `num_available` views take part in reconstruction.
/// The result is ordered and free of duplicates.
pub fn select_views(num_available: usize, params: &ReconParams) -> Vec<usize> {
    if num_available == 0 {
        return vec![];
    }

    if let Some(indices) = &params.recon_view_indices {
        let explicit: IndexSet<usize> = indices
            .0
            .iter()
            .cloned()
            .filter(|&i| i < num_available)
            .collect();
        if !explicit.is_empty() {
            return explicit.into_iter().collect();
        }
    }

    match params.recon_images {
        Some(max_count) if max_count > 0 && max_count < num_available => {
            sample_evenly(num_available, max_count)
        }
        _ => (0..num_available).collect(),
    }
}

fn sample_evenly(num_available: usize, max_count: usize) -> Vec<usize> {
    let step = num_available as f64 / max_count as f64;
    let sampled: IndexSet<usize> = (0..max_count)
        .map(|i| ((i as f64 * step) as usize).min(num_available - 1))
        .collect();
    sampled.into_iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;

    use base::util::cli::List;

    fn params(images: Option<usize>, indices: Option<Vec<usize>>) -> ReconParams {
        let mut params = ReconParams::default();
        params.recon_images = images;
        params.recon_view_indices = indices.map(List);
        params
    }

    #[test]
    fn test_all_views() {
        assert_eq!(select_views(4, &params(None, None)), vec![0, 1, 2, 3]);
        assert_eq!(select_views(4, &params(Some(4), None)), vec![0, 1, 2, 3]);
        assert_eq!(select_views(4, &params(Some(9), None)), vec![0, 1, 2, 3]);
        assert!(select_views(0, &params(None, None)).is_empty());
    }

    #[test]
    fn test_evenly_sampled() {
        for total in 1..40 {
            for k in 1..total {
                let selected = select_views(total, &params(Some(k), None));
                assert_eq!(selected.len(), k);
                assert!(selected.windows(2).all(|w| w[0] < w[1]));
                assert!(selected.iter().all(|&i| i < total));
            }
        }
        assert_eq!(select_views(6, &params(Some(3), None)), vec![0, 2, 4]);
    }

    #[test]
    fn test_explicit_indices() {
        let p = params(Some(1), Some(vec![4, 1, 4, 9]));
        assert_eq!(select_views(6, &p), vec![4, 1]);

        // Nothing in range falls back to the remaining rules.
        let p = params(None, Some(vec![7, 8]));
        assert_eq!(select_views(3, &p), vec![0, 1, 2]);
    }
}
