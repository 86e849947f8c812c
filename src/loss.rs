use burn::prelude::*;

/// Triplet loss with online semi-hard negative mining, computed over one
/// class-balanced batch.
///
/// For every anchor-positive pair the negative is the closest embedding that
/// is still farther from the anchor than the positive. When no such negative
/// exists the hardest in-margin negative is used instead. The hinge
/// `max(d(a,p) - d(a,n) + margin, 0)` is averaged over all anchor-positive
/// pairs.
#[derive(Config, Debug)]
pub struct TripletLossConfig {
    #[config(default = 1.0)]
    pub margin: f32,
}

impl TripletLossConfig {
    pub fn init(&self) -> TripletLoss {
        TripletLoss {
            margin: self.margin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TripletLoss {
    margin: f32,
}

impl TripletLoss {
    pub fn forward<B: Backend>(
        &self,
        embeddings: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [n, _] = embeddings.dims();
        let device = embeddings.device();

        let pdist = pairwise_distances(embeddings);

        let labels = targets.reshape([n, 1]).repeat_dim(1, n);
        let adjacency = labels.clone().equal(labels.transpose());
        let adjacency_not = adjacency.clone().bool_not().float();

        // Row r = a * n + p of the tiled matrix holds the anchor row of
        // distances for the (anchor a, positive p) pair.
        let pdist_tile = pdist.clone().repeat_dim(0, n);
        let d_ap = pdist
            .clone()
            .transpose()
            .reshape([n * n, 1])
            .repeat_dim(1, n);

        // Candidates per pair: negatives strictly beyond the positive.
        let beyond_positive = pdist_tile.clone().greater(d_ap).float();
        let candidate_mask = adjacency_not.clone().repeat_dim(0, n) * beyond_positive;

        let has_semi_hard = candidate_mask
            .clone()
            .sum_dim(1)
            .greater_elem(0.0)
            .reshape([n, n])
            .transpose();

        let negatives_outside = masked_minimum(pdist_tile, candidate_mask)
            .reshape([n, n])
            .transpose();
        let negatives_inside =
            masked_maximum(pdist.clone(), adjacency_not).repeat_dim(1, n);

        let semi_hard_negatives = negatives_inside.mask_where(has_semi_hard, negatives_outside);

        let hinge = (pdist - semi_hard_negatives + self.margin).clamp_min(0.0);

        // Anchor-positive pairs, the diagonal excluded.
        let index = Tensor::<B, 1, Int>::arange(0..n as i64, &device)
            .reshape([n, 1])
            .repeat_dim(1, n);
        let diagonal = index.clone().equal(index.transpose()).float();
        let positive_pairs = adjacency.float() - diagonal;

        let pair_count = positive_pairs.clone().sum().clamp_min(1e-16);

        (hinge * positive_pairs).sum() / pair_count
    }
}

/// Euclidean distance between every pair of embedding rows.
pub fn pairwise_distances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = x.dims();

    let squares = x.clone().powf_scalar(2.0).sum_dim(1);
    let products = x.clone().matmul(x.transpose());

    let squared = squares.clone().repeat_dim(1, n) + squares.transpose().repeat_dim(0, n)
        - products * 2.0;

    (squared.clamp_min(0.0) + 1e-12).sqrt()
}

/// Minimum over masked entries per row; rows with an empty mask fall back to
/// the row maximum.
fn masked_minimum<B: Backend>(data: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, cols] = data.dims();
    let axis_max = data.clone().max_dim(1);

    ((data - axis_max.clone().repeat_dim(1, cols)) * mask).min_dim(1) + axis_max
}

/// Maximum over masked entries per row; rows with an empty mask fall back to
/// the row minimum.
fn masked_maximum<B: Backend>(data: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, cols] = data.dims();
    let axis_min = data.clone().min_dim(1);

    ((data - axis_min.clone().repeat_dim(1, cols)) * mask).max_dim(1) + axis_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn pairwise_distances_match_hand_computation() {
        let device = Default::default();
        let x = Tensor::<B, 2>::from_floats([[0.0, 0.0], [3.0, 4.0], [0.0, 1.0]], &device);

        let dists = pairwise_distances(x).into_data().to_vec::<f32>().unwrap();

        let expected = [0.0, 5.0, 1.0, 5.0, 0.0, f32::sqrt(18.0), 1.0, f32::sqrt(18.0), 0.0];
        for (got, want) in dists.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn semi_hard_loss_matches_hand_computation() {
        // One-dimensional embeddings at 0.0, 0.1, 1.0, 1.1 with two plates.
        // Every anchor-positive pair has a semi-hard negative; the hinges are
        // 0.1, 0.2, 0.2, 0.1 with margin 1, so the mean is 0.15.
        let device = Default::default();
        let embeddings =
            Tensor::<B, 2>::from_floats([[0.0], [0.1], [1.0], [1.1]], &device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 0, 1, 1], &device);

        let loss = TripletLossConfig::new().init().forward(embeddings, targets);
        assert!((scalar(loss) - 0.15).abs() < 1e-3);
    }

    #[test]
    fn well_separated_clusters_give_zero_loss() {
        let device = Default::default();
        let embeddings = Tensor::<B, 2>::from_floats(
            [[0.0, 0.0], [0.0, 0.0], [10.0, 0.0], [10.0, 0.0]],
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_ints([0, 0, 1, 1], &device);

        let loss = TripletLossConfig::new().init().forward(embeddings, targets);
        assert!(scalar(loss).abs() < 1e-3);
    }
}
