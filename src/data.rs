use std::{
    cmp,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use burn::{data::dataloader::batcher::Batcher, prelude::*};
use image::{imageops::FilterType, ImageReader};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

const CHANNEL_COUNT: usize = 3;

/// One labeled image: CHW pixel bytes plus the plate index it depicts.
/// The source path is kept so matches can be rendered later.
#[derive(Debug, Clone)]
pub struct Plate {
    pub pixels: Vec<u8>,
    pub label: u32,
    pub path: PathBuf,
}

/// Decodes an image and lays it out as `[3, size, size]` RGB bytes.
pub fn load_image(path: &Path, size: u32) -> Result<Vec<u8>> {
    let decoded = ImageReader::open(path)
        .with_context(|| format!("cannot open image '{}'", path.display()))?
        .decode()
        .with_context(|| format!("cannot decode image '{}'", path.display()))?;

    let rgb = decoded
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let side = size as usize;
    let mut pixels = vec![0u8; CHANNEL_COUNT * side * side];
    for (i, pixel) in rgb.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        pixels[i] = r;
        pixels[side * side + i] = g;
        pixels[2 * side * side + i] = b;
    }

    Ok(pixels)
}

fn parse_label(name: &str) -> Option<u32> {
    name.parse().ok()
}

/// Loads every image under `<dir>/<plate_index>/`. Used for the train split
/// and for evaluation queries. Decoding runs in parallel per label.
pub fn load_labeled_dir(dir: &Path, size: u32) -> Result<Vec<Plate>> {
    let mut label_dirs = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("cannot read dataset directory '{}'", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(label) = name.to_str().and_then(parse_label) else {
            continue;
        };
        label_dirs.push((label, entry.path()));
    }
    label_dirs.sort_by_key(|(label, _)| *label);

    let groups: Vec<Vec<Plate>> = label_dirs
        .into_par_iter()
        .map(|(label, label_dir)| {
            let mut plates = Vec::new();
            for entry in fs::read_dir(&label_dir)
                .with_context(|| format!("cannot read '{}'", label_dir.display()))?
            {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let pixels = load_image(&path, size)?;
                plates.push(Plate {
                    pixels,
                    label,
                    path,
                });
            }
            Ok(plates)
        })
        .collect::<Result<_>>()?;

    Ok(groups.into_iter().flatten().collect())
}

/// Loads the canonical reference plates of an evaluation split: one file per
/// plate, named `<plate_index>.<ext>`. Returned sorted by label so the
/// reference ordering is stable.
pub fn load_reference_dir(dir: &Path, size: u32) -> Result<Vec<Plate>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("cannot read reference directory '{}'", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(label) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(parse_label)
        else {
            continue;
        };
        files.push((label, path));
    }
    files.sort_by_key(|(label, _)| *label);

    files
        .into_par_iter()
        .map(|(label, path)| {
            let pixels = load_image(&path, size)?;
            Ok(Plate {
                pixels,
                label,
                path,
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct PlateBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct PlateBatcher<B: Backend> {
    device: B::Device,
    image_size: u32,
}

impl<B: Backend> PlateBatcher<B> {
    pub fn new(device: B::Device, image_size: u32) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<Plate, PlateBatch<B>> for PlateBatcher<B> {
    fn batch(&self, items: Vec<Plate>) -> PlateBatch<B> {
        let side = self.image_size as usize;

        let images = items
            .iter()
            .map(|item| {
                TensorData::new(item.pixels.clone(), [CHANNEL_COUNT, side, side])
                    .convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 3>::from_data(data, &self.device))
            .map(|tensor| tensor.reshape([1, CHANNEL_COUNT, side, side]))
            .map(|tensor| tensor / 255.)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0).to_device(&self.device);
        let targets = Tensor::cat(targets, 0).to_device(&self.device);

        PlateBatch { images, targets }
    }
}

/// Unbounded source of training batches structured for the triplet loss:
/// each batch draws `classes_per_batch` plate indices and
/// `samples_per_class` photos of each, so every anchor has at least one
/// positive and negatives from other plates.
pub struct TripletSampler {
    plates: Vec<Plate>,
    groups: Vec<Vec<usize>>,
    classes_per_batch: usize,
    samples_per_class: usize,
    rng: StdRng,
}

impl TripletSampler {
    pub fn new(
        plates: Vec<Plate>,
        classes_per_batch: usize,
        samples_per_class: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (i, plate) in plates.iter().enumerate() {
            by_label.entry(plate.label).or_default().push(i);
        }
        if by_label.len() < 2 {
            anyhow::bail!(
                "triplet training needs at least 2 distinct plate indices, found {}",
                by_label.len()
            );
        }

        Ok(Self {
            plates,
            groups: by_label.into_values().collect(),
            classes_per_batch,
            samples_per_class,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn batch_size(&self) -> usize {
        cmp::min(self.classes_per_batch, self.groups.len()) * self.samples_per_class
    }

    pub fn next_batch(&mut self) -> Vec<Plate> {
        let class_count = cmp::min(self.classes_per_batch, self.groups.len());

        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.shuffle(&mut self.rng);

        let mut picks = Vec::with_capacity(class_count * self.samples_per_class);
        for &group_index in order.iter().take(class_count) {
            let group = &self.groups[group_index];
            for _ in 0..self.samples_per_class {
                let plate_index = group[self.rng.gen_range(0..group.len())];
                picks.push(self.plates[plate_index].clone());
            }
        }

        picks
    }
}
