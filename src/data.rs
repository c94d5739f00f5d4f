use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::ImageReader;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

pub const CLASS_COUNT: usize = 7;
pub const SEMANTIC_CLASS_COUNT: usize = 6;

pub const CLASS_NAMES: [&str; CLASS_COUNT] = [
    "urban",
    "agriculture",
    "rangeland",
    "forest",
    "water",
    "barren",
    "unknown",
];

// Mask colors are saturated RGB combinations; indexing by
// 4*R + 2*G + B over thresholded channels gives:
//   0 black   -> unknown      4 red     -> unknown
//   1 blue    -> water        5 magenta -> rangeland
//   2 green   -> forest       6 yellow  -> agriculture
//   3 cyan    -> urban        7 white   -> barren
const COLOR_TO_CLASS: [u8; 8] = [6, 4, 3, 0, 6, 2, 1, 5];

pub fn mask_color_class(r: u8, g: u8, b: u8) -> u8 {
    let code = usize::from(r >= 128) * 4 + usize::from(g >= 128) * 2 + usize::from(b >= 128);
    COLOR_TO_CLASS[code]
}

#[derive(Debug, Clone)]
pub struct SegSample {
    /// Channel-major RGB bytes, `3 * height * width`.
    pub image: Vec<u8>,
    /// Row-major class ids, `height * width`.
    pub mask: Vec<u8>,
    pub height: usize,
    pub width: usize,
}

pub struct SegDataset {
    dataset: InMemDataset<SegSample>,
}

impl Dataset<SegSample> for SegDataset {
    fn get(&self, index: usize) -> Option<SegSample> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl SegDataset {
    pub fn from_samples(samples: Vec<SegSample>) -> Self {
        Self {
            dataset: InMemDataset::new(samples),
        }
    }

    /// Load every `{id}_sat.jpg` / `{id}_mask.png` pair under `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut sat_paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("failed to read data directory {}", dir.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with("_sat.jpg"))
            })
            .collect();
        sat_paths.sort();

        if sat_paths.is_empty() {
            bail!("no *_sat.jpg images found in {}", dir.display());
        }

        let samples = sat_paths
            .par_iter()
            .map(|path| load_pair(path))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_samples(samples))
    }
}

fn load_pair(sat_path: &Path) -> Result<SegSample> {
    let name = sat_path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("non-utf8 image name {}", sat_path.display()))?;
    let mask_path = sat_path.with_file_name(name.replace("_sat.jpg", "_mask.png"));

    let sat = ImageReader::open(sat_path)
        .with_context(|| format!("failed to open {}", sat_path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", sat_path.display()))?
        .to_rgb8();
    let mask_rgb = ImageReader::open(&mask_path)
        .with_context(|| format!("failed to open {}", mask_path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", mask_path.display()))?
        .to_rgb8();

    if sat.dimensions() != mask_rgb.dimensions() {
        bail!(
            "image/mask size mismatch for {}: {:?} vs {:?}",
            sat_path.display(),
            sat.dimensions(),
            mask_rgb.dimensions()
        );
    }

    let (width, height) = (sat.width() as usize, sat.height() as usize);
    let plane = height * width;

    let mut image = vec![0u8; 3 * plane];
    for (i, pixel) in sat.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        image[i] = r;
        image[plane + i] = g;
        image[2 * plane + i] = b;
    }

    let mask = mask_rgb
        .pixels()
        .map(|pixel| {
            let [r, g, b] = pixel.0;
            mask_color_class(r, g, b)
        })
        .collect();

    Ok(SegSample {
        image,
        mask,
        height,
        width,
    })
}

#[derive(Clone, Debug)]
pub struct SegBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 3, Int>,
}

#[derive(Clone)]
pub struct SegBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SegBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<SegSample, SegBatch<B>> for SegBatcher<B> {
    fn batch(&self, items: Vec<SegSample>) -> SegBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                let floats: Vec<f32> = item.image.iter().map(|&v| v as f32).collect();
                TensorData::new(floats, [1, 3, item.height, item.width]).convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 4>::from_data(data, &self.device))
            .map(|tensor| tensor / 255.)
            .collect();

        let masks = items
            .iter()
            .map(|item| {
                let labels: Vec<i64> = item.mask.iter().map(|&v| v as i64).collect();
                TensorData::new(labels, [1, item.height, item.width]).convert::<B::IntElem>()
            })
            .map(|data| Tensor::<B, 3, Int>::from_data(data, &self.device))
            .collect();

        let images = Tensor::cat(images, 0).to_device(&self.device);
        let masks = Tensor::cat(masks, 0).to_device(&self.device);

        SegBatch { images, masks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn::backend::NdArray<f32>;

    #[test]
    fn mask_colors_decode_to_documented_classes() {
        assert_eq!(mask_color_class(0, 255, 255), 0); // cyan: urban
        assert_eq!(mask_color_class(255, 255, 0), 1); // yellow: agriculture
        assert_eq!(mask_color_class(255, 0, 255), 2); // magenta: rangeland
        assert_eq!(mask_color_class(0, 255, 0), 3); // green: forest
        assert_eq!(mask_color_class(0, 0, 255), 4); // blue: water
        assert_eq!(mask_color_class(255, 255, 255), 5); // white: barren
        assert_eq!(mask_color_class(0, 0, 0), 6); // black: unknown
        assert_eq!(mask_color_class(255, 0, 0), 6); // red: unknown
    }

    #[test]
    fn thresholding_tolerates_compression_noise() {
        assert_eq!(mask_color_class(12, 250, 243), 0);
        assert_eq!(mask_color_class(200, 190, 210), 5);
    }

    fn sample(height: usize, width: usize, class: u8) -> SegSample {
        SegSample {
            image: vec![128; 3 * height * width],
            mask: vec![class; height * width],
            height,
            width,
        }
    }

    #[test]
    fn batcher_stacks_images_and_masks() {
        let device = Default::default();
        let batcher = SegBatcher::<B>::new(device);

        let batch = batcher.batch(vec![sample(4, 4, 0), sample(4, 4, 5)]);
        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.masks.dims(), [2, 4, 4]);

        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|&v| (0.0..=1.0).contains(&v)));

        let labels = batch.masks.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels[0], 0);
        assert_eq!(labels[16], 5);
    }

    #[test]
    fn dataset_serves_samples_in_order() {
        let dataset = SegDataset::from_samples(vec![sample(2, 2, 1), sample(2, 2, 2)]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(0).unwrap().mask[0], 1);
        assert_eq!(dataset.get(1).unwrap().mask[0], 2);
        assert!(dataset.get(2).is_none());
    }
}
