use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{CrnnError, Result};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TextLineItem {
    // grayscale pixels, row major
    pub image_raw: Vec<u8>,
    pub image_height: usize,
    pub image_width: usize,
    pub transcription: String,
}

/// Text line images listed in a label file, one `path<TAB>transcription` per
/// line. Images are converted to grayscale and resized to a fixed height,
/// keeping their aspect ratio.
pub struct TextLineDataset {
    root_path: PathBuf,
    path_and_label: Vec<(PathBuf, String)>,
    img_height: u32,
    max_width: Option<u32>,
}

impl TextLineDataset {
    pub fn new<P: AsRef<Path>>(
        label_file_path: P,
        root_path: P,
        img_height: u32,
        max_width: Option<u32>,
    ) -> Result<Self> {
        let data = fs::read_to_string(label_file_path.as_ref())?;
        let path_and_label = data
            .lines()
            .filter(|row| !row.trim().is_empty())
            .enumerate()
            .map(|(line, row)| {
                row.split_once('\t')
                    .map(|(path, label)| (PathBuf::from(path.trim()), label.to_string()))
                    .ok_or_else(|| {
                        CrnnError::Config(format!(
                            "{}:{}: expected `path<TAB>transcription`",
                            label_file_path.as_ref().display(),
                            line + 1
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            labels = %label_file_path.as_ref().display(),
            samples = path_and_label.len(),
            "dataset loaded"
        );

        Ok(Self {
            root_path: root_path.as_ref().to_path_buf(),
            path_and_label,
            img_height,
            max_width,
        })
    }

    /// The split `name` of a data root, listed in `<root>/<name>-labels.txt`.
    pub fn split<P: AsRef<Path>>(
        root_path: P,
        name: &str,
        img_height: u32,
        max_width: Option<u32>,
    ) -> Result<Self> {
        let root_path = root_path.as_ref();
        Self::new(
            root_path.join(format!("{name}-labels.txt")).as_path(),
            root_path,
            img_height,
            max_width,
        )
    }

    fn load(&self, index: usize) -> image::ImageResult<TextLineItem> {
        let (path, label) = &self.path_and_label[index];
        let gray = image::open(self.root_path.join(path))?.to_luma8();

        let scaled_width = (self.img_height as f64 * gray.width() as f64 / gray.height().max(1) as f64)
            .round()
            .max(1.0) as u32;
        let width = self.max_width.map_or(scaled_width, |max| scaled_width.min(max));
        let resized = imageops::resize(&gray, width, self.img_height, FilterType::Lanczos3);

        Ok(TextLineItem {
            image_height: resized.height() as usize,
            image_width: resized.width() as usize,
            image_raw: resized.into_vec(),
            transcription: label.clone(),
        })
    }
}

impl Dataset<TextLineItem> for TextLineDataset {
    fn get(&self, index: usize) -> Option<TextLineItem> {
        if index >= self.len() {
            return None;
        }

        match self.load(index) {
            Ok(item) => Some(item),
            Err(err) => {
                error!(index, path = %self.path_and_label[index].0.display(), %err, "fail to read image");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.path_and_label.len()
    }
}

/// Images of one batch padded to a common width, still on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedImages {
    pub pixels: Vec<u8>,
    pub height: usize,
    pub width: usize,
    pub widths: Vec<usize>,
    pub transcriptions: Vec<String>,
}

/// Pads variable-width images to the widest one of the batch. Images are left
/// aligned and the remaining columns take `pad_value`. Sample order is kept.
pub fn collate(items: Vec<TextLineItem>, pad_value: u8) -> Result<PaddedImages> {
    let height = items
        .first()
        .map(|item| item.image_height)
        .ok_or_else(|| CrnnError::shape_mismatch("cannot collate an empty batch"))?;
    let width = items.iter().map(|item| item.image_width).max().unwrap_or(0);

    let mut pixels = vec![pad_value; items.len() * height * width];
    let mut widths = Vec::with_capacity(items.len());
    let mut transcriptions = Vec::with_capacity(items.len());

    for (n, item) in items.into_iter().enumerate() {
        if item.image_height != height {
            return Err(CrnnError::shape_mismatch(format!(
                "sample {n} has height {}, the batch has height {height}",
                item.image_height
            )));
        }
        if item.image_raw.len() != item.image_height * item.image_width {
            return Err(CrnnError::shape_mismatch(format!(
                "sample {n} holds {} pixels for a {}x{} image",
                item.image_raw.len(),
                item.image_height,
                item.image_width
            )));
        }

        let image_start = n * height * width;
        for (row, row_pixels) in item.image_raw.chunks(item.image_width.max(1)).enumerate() {
            let start = image_start + row * width;
            pixels[start..start + row_pixels.len()].copy_from_slice(row_pixels);
        }
        widths.push(item.image_width);
        transcriptions.push(item.transcription);
    }

    Ok(PaddedImages {
        pixels,
        height,
        width,
        widths,
        transcriptions,
    })
}

pub struct TextLineBatcher<B: Backend> {
    device: B::Device,
    pad_value: u8,
}

impl<B: Backend> TextLineBatcher<B> {
    pub fn new(device: B::Device, pad_value: u8) -> Self {
        Self { device, pad_value }
    }
}

#[derive(Clone, Debug)]
pub struct TextLineBatch<B: Backend> {
    /// Shape: `[batch_size, 1, height, max_width]`, range [-1.0, 1.0]
    pub images: Tensor<B, 4>,
    /// Original width of every image before padding.
    pub widths: Vec<usize>,
    pub transcriptions: Vec<String>,
}

impl<B: Backend> TextLineBatch<B> {
    pub fn len(&self) -> usize {
        self.transcriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcriptions.is_empty()
    }
}

impl<B: Backend> Batcher<TextLineItem, Result<TextLineBatch<B>>> for TextLineBatcher<B> {
    fn batch(&self, items: Vec<TextLineItem>) -> Result<TextLineBatch<B>> {
        let padded = collate(items, self.pad_value)?;
        let batch_size = padded.widths.len();

        let data = Data::new(
            padded.pixels,
            Shape::new([batch_size, 1, padded.height, padded.width]),
        );
        let images = Tensor::<B, 4, Int>::from_data(data.convert(), &self.device).float();
        // range: [-1.0, 1.0]
        let images = ((images / 255) - 0.5) / 0.5;

        Ok(TextLineBatch {
            images,
            widths: padded.widths,
            transcriptions: padded.transcriptions,
        })
    }
}

#[cfg(test)]
mod test {
    use burn::backend::NdArray;
    use image::{GrayImage, Luma};

    use super::*;

    fn item(width: usize, value: u8, text: &str) -> TextLineItem {
        TextLineItem {
            image_raw: vec![value; 2 * width],
            image_height: 2,
            image_width: width,
            transcription: text.to_string(),
        }
    }

    #[test]
    fn test_collate_keeps_order_and_count() {
        let items = vec![item(3, 10, "one"), item(1, 20, "two"), item(2, 30, "three")];

        let padded = collate(items, 255).unwrap();

        assert_eq!(padded.transcriptions, vec!["one", "two", "three"]);
        assert_eq!(padded.widths, vec![3, 1, 2]);
        assert_eq!(padded.width, 3);
        #[rustfmt::skip]
        assert_eq!(
            padded.pixels,
            vec![
                10, 10, 10, 10, 10, 10,
                20, 255, 255, 20, 255, 255,
                30, 30, 255, 30, 30, 255,
            ]
        );
    }

    #[test]
    fn test_collate_rejects_mixed_heights() {
        let mut odd = item(2, 0, "x");
        odd.image_height = 1;
        odd.image_raw.truncate(2);

        let err = collate(vec![item(2, 0, "a"), odd], 0).unwrap_err();
        assert!(matches!(err, CrnnError::ShapeMismatch(_)));
        assert!(collate(vec![], 0).is_err());
    }

    #[test]
    fn test_batcher() {
        let batcher = TextLineBatcher::<NdArray>::new(Default::default(), 255);

        let batch = batcher
            .batch(vec![item(4, 0, "ab"), item(2, 0, "b")])
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.dims(), [2, 1, 2, 4]);
        assert_eq!(batch.transcriptions, vec!["ab", "b"]);
        let pixels = batch.images.into_data().value;
        assert_eq!(pixels[0], -1.0);
        // padding is background white
        assert_eq!(pixels[8 + 3], 1.0);
    }

    #[test]
    fn test_label_file_dataset() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(40, 20, Luma([200]))
            .save(dir.path().join("a.png"))
            .unwrap();
        fs::write(
            dir.path().join("train-labels.txt"),
            "a.png\thello world\nmissing.png\tgone\n",
        )
        .unwrap();

        let dataset = TextLineDataset::split(dir.path(), "train", 10, None).unwrap();

        assert_eq!(dataset.len(), 2);
        let first = dataset.get(0).unwrap();
        assert_eq!((first.image_height, first.image_width), (10, 20));
        assert_eq!(first.transcription, "hello world");
        assert!(dataset.get(1).is_none());
        assert!(dataset.get(2).is_none());
    }
}
