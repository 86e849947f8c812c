use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{data::dataloader::batcher::Batcher, prelude::*};
use image::{imageops, imageops::FilterType, ImageReader, RgbImage};
use ndarray::{Array2, ArrayView1};

use crate::{
    config::{plates_dir, queries_dir},
    data::{load_image, load_labeled_dir, load_reference_dir, Plate, PlateBatcher},
    model::EmbeddingNet,
};

/// Labeled embeddings used as the nearest-neighbor lookup table. Row order is
/// the (stable) order the reference plates were loaded in.
#[derive(Debug)]
pub struct ReferenceSet {
    embeddings: Array2<f32>,
    labels: Vec<u32>,
}

impl ReferenceSet {
    pub fn new(embeddings: Array2<f32>, labels: Vec<u32>) -> Result<Self> {
        if labels.is_empty() {
            anyhow::bail!("reference set is empty");
        }
        if embeddings.nrows() != labels.len() {
            anyhow::bail!(
                "reference set has {} embeddings for {} labels",
                embeddings.nrows(),
                labels.len()
            );
        }
        Ok(Self { embeddings, labels })
    }

    pub fn label(&self, index: usize) -> u32 {
        self.labels[index]
    }

    /// Index and squared distance of the reference closest to `query`.
    /// Ties go to the first reference encountered.
    pub fn nearest(&self, query: ArrayView1<f32>) -> (usize, f32) {
        let mut best_index = 0;
        let mut best_distance = f32::INFINITY;

        for (index, reference) in self.embeddings.rows().into_iter().enumerate() {
            let distance: f32 = query
                .iter()
                .zip(reference.iter())
                .map(|(q, r)| (q - r) * (q - r))
                .sum();
            if distance < best_distance {
                best_distance = distance;
                best_index = index;
            }
        }

        (best_index, best_distance)
    }

    /// Matched reference index for every query embedding row.
    pub fn matches(&self, queries: &Array2<f32>) -> Vec<usize> {
        queries
            .rows()
            .into_iter()
            .map(|query| self.nearest(query).0)
            .collect()
    }

    /// Mean `|predicted plate index - true plate index|` over all queries.
    pub fn mean_absolute_error(&self, queries: &Array2<f32>, truth: &[u32]) -> f64 {
        let total: f64 = self
            .matches(queries)
            .iter()
            .zip(truth)
            .map(|(&matched, &label)| (self.labels[matched] as f64 - label as f64).abs())
            .sum();

        total / truth.len() as f64
    }
}

/// Nearest-neighbor evaluation of embedding quality against one dataset
/// split. Reference embeddings are recomputed on every call since the model
/// changes between calls during training.
pub struct Metrics<B: Backend> {
    references: Vec<Plate>,
    queries: Vec<Plate>,
    batcher: PlateBatcher<B>,
    batch_size: usize,
    image_size: u32,
    visualizations_dir: PathBuf,
}

impl<B: Backend> Metrics<B> {
    pub fn new(
        split_dir: &Path,
        image_size: u32,
        batch_size: usize,
        device: B::Device,
        visualizations_dir: PathBuf,
    ) -> Result<Self> {
        let references = load_reference_dir(&plates_dir(split_dir), image_size)?;
        if references.is_empty() {
            anyhow::bail!(
                "reference set is empty: no plates found under '{}'",
                plates_dir(split_dir).display()
            );
        }

        let queries = load_labeled_dir(&queries_dir(split_dir), image_size)?;
        if queries.is_empty() {
            anyhow::bail!(
                "no query images found under '{}'",
                queries_dir(split_dir).display()
            );
        }

        Ok(Self {
            references,
            queries,
            batcher: PlateBatcher::new(device, image_size),
            batch_size,
            image_size,
            visualizations_dir,
        })
    }

    /// MAE of predicted versus true plate index over the whole split. With
    /// `visualize` set, also writes query-vs-match panels as a side effect.
    pub fn compute(&self, model: &EmbeddingNet<B>, visualize: bool) -> Result<f64> {
        let reference_set = self.reference_set(model)?;
        let query_embeddings = self.embed(model, &self.queries)?;

        let truth: Vec<u32> = self.queries.iter().map(|q| q.label).collect();
        let mae = reference_set.mean_absolute_error(&query_embeddings, &truth);

        if visualize {
            std::fs::create_dir_all(&self.visualizations_dir)?;
            for (i, matched) in reference_set.matches(&query_embeddings).iter().enumerate() {
                let predicted = reference_set.label(*matched);
                let out = self
                    .visualizations_dir
                    .join(format!("query_{i:04}_pred_{predicted}.png"));
                self.render_match(&self.queries[i].path, &self.references[*matched].path, &out)?;
            }
            tracing::info!(
                "wrote {} match panels to '{}'",
                self.queries.len(),
                self.visualizations_dir.display()
            );
        }

        Ok(mae)
    }

    /// Predicted plate index for one external image. No ground truth, no
    /// error computed.
    pub fn predict(&self, model: &EmbeddingNet<B>, image_path: &Path) -> Result<u32> {
        let pixels = load_image(image_path, self.image_size)?;
        let query = Plate {
            pixels,
            label: 0,
            path: image_path.to_path_buf(),
        };

        let reference_set = self.reference_set(model)?;
        let embedding = self.embed(model, std::slice::from_ref(&query))?;
        let (matched, _) = reference_set.nearest(embedding.row(0));

        Ok(reference_set.label(matched))
    }

    fn reference_set(&self, model: &EmbeddingNet<B>) -> Result<ReferenceSet> {
        let embeddings = self.embed(model, &self.references)?;
        let labels = self.references.iter().map(|r| r.label).collect();
        ReferenceSet::new(embeddings, labels)
    }

    fn embed(&self, model: &EmbeddingNet<B>, plates: &[Plate]) -> Result<Array2<f32>> {
        let mut values = Vec::new();
        let mut dim = 0;

        for chunk in plates.chunks(self.batch_size) {
            let batch = self.batcher.batch(chunk.to_vec());
            let embeddings = model.forward(batch.images);
            let [_, d] = embeddings.dims();
            dim = d;

            let data = embeddings
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("cannot read embedding data: {e:?}"))?;
            values.extend(data);
        }

        Array2::from_shape_vec((plates.len(), dim), values)
            .context("embedding batch produced an unexpected shape")
    }

    fn render_match(&self, query: &Path, reference: &Path, out: &Path) -> Result<()> {
        let size = self.image_size;
        let query_img = ImageReader::open(query)?
            .decode()?
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();
        let reference_img = ImageReader::open(reference)?
            .decode()?
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let mut panel = RgbImage::new(size * 2, size);
        imageops::replace(&mut panel, &query_img, 0, 0);
        imageops::replace(&mut panel, &reference_img, size as i64, 0);

        panel
            .save(out)
            .with_context(|| format!("cannot write visualization '{}'", out.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn empty_reference_set_is_rejected() {
        let err = ReferenceSet::new(Array2::zeros((0, 4)), vec![]).unwrap_err();
        assert!(err.to_string().contains("reference set is empty"));
    }

    #[test]
    fn single_entry_always_wins() {
        let set = ReferenceSet::new(array![[1.0, 0.0]], vec![42]).unwrap();

        for query in [array![0.0, 0.0], array![-5.0, 3.0], array![100.0, 100.0]] {
            let (index, _) = set.nearest(query.view());
            assert_eq!(set.label(index), 42);
        }
    }

    #[test]
    fn exact_match_has_zero_distance() {
        let set = ReferenceSet::new(
            array![[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]],
            vec![1, 2, 3],
        )
        .unwrap();

        let (index, distance) = set.nearest(array![0.0, 1.0].view());
        assert_eq!(index, 1);
        assert_eq!(distance, 0.0);
    }

    #[test]
    fn ties_go_to_the_first_reference() {
        let set = ReferenceSet::new(array![[1.0, 0.0], [1.0, 0.0]], vec![5, 9]).unwrap();

        let (index, _) = set.nearest(array![2.0, 0.0].view());
        assert_eq!(index, 0);
        assert_eq!(set.label(index), 5);
    }

    #[test]
    fn perfect_matches_give_zero_mae() {
        let set = ReferenceSet::new(
            array![[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0]],
            vec![10, 20, 30],
        )
        .unwrap();

        let queries = array![[1.0, 0.0], [0.0, 1.0], [-1.0, 0.0], [0.0, 1.0]];
        let truth = [10, 20, 30, 20];

        assert_eq!(set.mean_absolute_error(&queries, &truth), 0.0);
    }

    #[test]
    fn mae_averages_label_errors() {
        let set = ReferenceSet::new(array![[0.0], [1.0]], vec![3, 7]).unwrap();

        // First query matches plate 3 (true 3, error 0), second matches
        // plate 7 (true 5, error 2).
        let queries = array![[0.1], [0.9]];
        let truth = [3, 5];

        assert_eq!(set.mean_absolute_error(&queries, &truth), 1.0);
    }
}
