use burn::{module::Module, nn::conv::Conv2d, prelude::*};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d, Relu};

/// Convolution + batch norm + ReLU, the building block of the embedding
/// backbone.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        self.activation.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    stride: [usize; 2],

    padding: PaddingConfig2d,

    #[config(default = false)]
    bias: bool,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(self.padding.clone())
                .with_bias(self.bias)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            activation: Relu::new(),
        }
    }
}
