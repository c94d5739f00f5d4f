use std::path::Path;

use anyhow::{anyhow, Result};
use burn::{prelude::*, record::CompactRecorder, tensor::activation::softmax};
use nn::{
    conv::{Conv2d, Conv2dConfig},
    loss::CrossEntropyLossConfig,
    Dropout, DropoutConfig, PaddingConfig2d,
};

use crate::module::{
    conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
    deconv2d_norm::{Deconv2dNorm, Deconv2dNormConfig},
};

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    blocks: Vec<Conv2dNorm<B>>,
}

impl<B: Backend> Encoder<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    blocks: Vec<Deconv2dNorm<B>>,
    dropout: Dropout,
    head: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        let x = self.dropout.forward(x);
        self.head.forward(x)
    }
}

/// Per-batch output of the segmentation forward pass.
#[derive(Debug)]
pub struct SegmentationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub logits: Tensor<B, 4>,
    pub targets: Tensor<B, 3, Int>,
}

/// Fully-convolutional encoder/decoder; input spatial dims must be
/// divisible by 8 and are preserved in the output logits.
#[derive(Module, Debug)]
pub struct SegModel<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
}

impl<B: Backend> SegModel<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decoder.forward(self.encoder.forward(x))
    }

    pub fn forward_segmentation(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> SegmentationOutput<B> {
        let logits = self.forward(images);

        let [batch, classes, height, width] = logits.dims();
        let flat_logits = logits
            .clone()
            .permute([0, 2, 3, 1])
            .reshape([batch * height * width, classes]);
        let flat_targets = targets.clone().reshape([batch * height * width]);

        let loss = CrossEntropyLossConfig::new()
            .init(&flat_logits.device())
            .forward(flat_logits, flat_targets);

        SegmentationOutput {
            loss,
            logits,
            targets,
        }
    }

    /// Replace encoder parameters with a recorded snapshot.
    pub fn load_encoder_record(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let encoder = self.encoder;
        self.encoder = encoder
            .load_file(path, &CompactRecorder::new(), device)
            .map_err(|e| anyhow!("failed to load encoder weights {}: {e:?}", path.display()))?;

        Ok(self)
    }
}

/// Class labels from logits, softmax then argmax over the class dimension.
pub fn predicted_labels<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 3, Int> {
    softmax(logits, 1).argmax(1).squeeze(1)
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub num_classes: usize,

    #[config(default = 32)]
    pub base_channels: usize,

    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegModel<B> {
        let c = self.base_channels;

        let stages = [
            ([3, c], 1),
            ([c, c], 2),
            ([c, 2 * c], 1),
            ([2 * c, 2 * c], 2),
            ([2 * c, 4 * c], 1),
            ([4 * c, 4 * c], 2),
        ];
        let blocks = stages
            .into_iter()
            .map(|(channels, stride)| {
                Conv2dNormConfig::new(
                    channels,
                    [3, 3],
                    [stride, stride],
                    PaddingConfig2d::Explicit(1, 1),
                )
                .init(device)
            })
            .collect();

        let decoder_blocks = [[4 * c, 2 * c], [2 * c, c], [c, c]]
            .into_iter()
            .map(|channels| Deconv2dNormConfig::new(channels).init(device))
            .collect();

        SegModel {
            encoder: Encoder { blocks },
            decoder: Decoder {
                blocks: decoder_blocks,
                dropout: DropoutConfig::new(self.dropout).init(),
                head: Conv2dConfig::new([c, self.num_classes], [1, 1]).init(device),
            },
        }
    }
}
