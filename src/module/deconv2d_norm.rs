use burn::{module::Module, nn::conv::ConvTranspose2d, prelude::*};
use nn::{conv::ConvTranspose2dConfig, BatchNorm, BatchNormConfig, Relu};

#[derive(Module, Debug)]
pub struct Deconv2dNorm<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> Deconv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        self.activation.forward(x)
    }
}

/// Transpose convolution doubling the spatial resolution.
#[derive(Config, Debug)]
pub struct Deconv2dNormConfig {
    channels: [usize; 2],

    #[config(default = "[4, 4]")]
    kernel_size: [usize; 2],

    #[config(default = "[2, 2]")]
    stride: [usize; 2],

    #[config(default = "[1, 1]")]
    padding: [usize; 2],

    #[config(default = false)]
    bias: bool,
}

impl Deconv2dNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Deconv2dNorm<B> {
        Deconv2dNorm {
            conv: ConvTranspose2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(self.padding)
                .with_bias(self.bias)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            activation: Relu::new(),
        }
    }
}
