use burn::prelude::*;
use nn::{
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};

use crate::module::conv_block::{ConvBlock, ConvBlockConfig};

/// Architecture identifier embedded in checkpoint and log file names.
pub const MODEL_NAME: &str = "embednet";

// Channel widths of the strided backbone stages, stem included.
const STAGE_CHANNELS: [usize; 5] = [3, 32, 64, 128, 256];

/// Convolutional embedding network: strided conv stages, global average
/// pooling, then a linear projection onto the unit hypersphere. Works for any
/// input size; larger inputs just pool over a larger grid.
#[derive(Module, Debug)]
pub struct EmbeddingNet<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    avg_pool: AdaptiveAvgPool2d,
    projection: Linear<B>,
}

impl<B: Backend> EmbeddingNet<B> {
    /// Maps a batch of images to one L2-normalized embedding row per image.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .blocks
            .iter()
            .fold(x, |x, block| block.forward(x));

        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        let x = self.projection.forward(x);

        l2_normalize(x)
    }
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, dim] = x.dims();
    let norms = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12);

    x / norms.repeat_dim(1, dim)
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub embedding_dim: usize,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmbeddingNet<B> {
        let blocks = STAGE_CHANNELS
            .windows(2)
            .map(|channels| {
                ConvBlockConfig::new(
                    [channels[0], channels[1]],
                    [3, 3],
                    [2, 2],
                    PaddingConfig2d::Explicit(1, 1),
                )
                .init(device)
            })
            .collect();

        EmbeddingNet {
            blocks,
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            projection: LinearConfig::new(STAGE_CHANNELS[4], self.embedding_dim).init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn embeddings_have_unit_norm() {
        let device = Default::default();
        let model = ModelConfig::new(16).init::<B>(&device);

        let images = Tensor::<B, 4>::ones([2, 3, 32, 32], &device);
        let embeddings = model.forward(images);
        assert_eq!(embeddings.dims(), [2, 16]);

        let norms = embeddings.powf_scalar(2.0).sum_dim(1).sqrt();
        let norms = norms.into_data().to_vec::<f32>().unwrap();
        for norm in norms {
            assert!((norm - 1.0).abs() < 1e-4, "norm was {norm}");
        }
    }
}
