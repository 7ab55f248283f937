use anyhow::{Context, Result};
use batchinfer_core::config::{ColorMode, Normalization, PipelineConfig};
use batchinfer_core::types::{Batch, Image, Record};
use ndarray::{Array3, ArrayView3};
use rayon::prelude::*;

/// Stateless per-batch transform applied before prediction.
///
/// Implementations must be deterministic and must not touch anything but the batch; the
/// pipeline runs several batches through one instance concurrently.
pub trait Preprocessor: Send + Sync + 'static {
    fn preprocess(&self, batch: Batch) -> Result<Batch>;
}

/// HWC u8 to normalized CHW f32, center-cropped to a square.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    crop_size: usize,
    channels: usize,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl ImagePreprocessor {
    pub fn new(crop_size: u32, mode: ColorMode, normalization: &Normalization) -> Result<Self> {
        anyhow::ensure!(crop_size > 0, "crop_size must be > 0");
        normalization.validate(mode)?;
        Ok(Self {
            crop_size: crop_size as usize,
            channels: mode.channels(),
            mean: normalization.mean.clone(),
            std: normalization.std.clone(),
        })
    }

    pub fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        Self::new(cfg.crop_size, cfg.image.mode, &cfg.normalization)
    }

    /// Output shape `(C, crop, crop)`.
    pub fn output_shape(&self) -> [usize; 3] {
        [self.channels, self.crop_size, self.crop_size]
    }

    fn transform(&self, raw: ArrayView3<'_, u8>) -> Result<Array3<f32>> {
        let (h, w, c) = raw.dim();
        anyhow::ensure!(
            c == self.channels,
            "image has {c} channels, expected {}",
            self.channels
        );
        let crop = self.crop_size;
        // Negative offsets pad: the source window starts before the image edge.
        let top = (h as isize - crop as isize).div_euclid(2);
        let left = (w as isize - crop as isize).div_euclid(2);

        let mut out = Array3::<f32>::zeros((c, crop, crop));
        for ch in 0..c {
            let mean = self.mean[ch];
            let std = self.std[ch];
            for y in 0..crop {
                let sy = top + y as isize;
                for x in 0..crop {
                    let sx = left + x as isize;
                    let inside = sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w;
                    let v = if inside {
                        raw[[sy as usize, sx as usize, ch]]
                    } else {
                        0
                    };
                    out[[ch, y, x]] = (f32::from(v) / 255.0 - mean) / std;
                }
            }
        }
        Ok(out)
    }

    fn preprocess_record(&self, mut record: Record) -> Result<Record> {
        let Image::Raw(raw) = &record.image else {
            anyhow::bail!(
                "sample_id {}: image is already a preprocessed tensor",
                record.sample_id
            );
        };
        let tensor = self
            .transform(raw.view())
            .with_context(|| format!("sample_id {}: preprocess failed", record.sample_id))?;
        record.image = Image::Tensor(tensor);
        Ok(record)
    }
}

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, batch: Batch) -> Result<Batch> {
        let records = batch
            .records
            .into_par_iter()
            .map(|r| self.preprocess_record(r))
            .collect::<Result<Vec<Record>>>()?;
        Ok(Batch::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(h: usize, w: usize, f: impl Fn(usize, usize, usize) -> u8) -> Array3<u8> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| f(y, x, c))
    }

    fn pre(crop: u32) -> ImagePreprocessor {
        ImagePreprocessor::new(crop, ColorMode::Rgb, &Normalization::imagenet()).unwrap()
    }

    #[test]
    fn crops_the_center_in_chw() {
        // Pixel value encodes its row so the crop window is visible.
        let img = raw(6, 6, |y, _, _| (y * 40) as u8);
        let out = pre(2).transform(img.view()).unwrap();
        assert_eq!(out.dim(), (3, 2, 2));
        let expect_row2 = (80.0 / 255.0 - 0.485) / 0.229;
        let expect_row3 = (120.0 / 255.0 - 0.485) / 0.229;
        assert!((out[[0, 0, 0]] - expect_row2).abs() < 1e-6);
        assert!((out[[0, 1, 1]] - expect_row3).abs() < 1e-6);
    }

    #[test]
    fn odd_margins_floor_the_offset() {
        let img = raw(5, 5, |y, x, _| (y * 10 + x) as u8);
        let out = ImagePreprocessor::new(
            2,
            ColorMode::Rgb,
            &Normalization {
                mean: vec![0.0; 3],
                std: vec![1.0 / 255.0; 3],
            },
        )
        .unwrap()
        .transform(img.view())
        .unwrap();
        // top = left = floor(3 / 2) = 1
        assert!((out[[1, 0, 0]] - 11.0).abs() < 1e-3);
        assert!((out[[1, 1, 1]] - 22.0).abs() < 1e-3);
    }

    #[test]
    fn small_images_are_zero_padded() {
        let img = raw(2, 2, |_, _, _| 255);
        let out = pre(4).transform(img.view()).unwrap();
        let pad = (0.0 - 0.485) / 0.229;
        let full = (1.0 - 0.485) / 0.229;
        assert!((out[[0, 0, 0]] - pad).abs() < 1e-6);
        assert!((out[[0, 1, 1]] - full).abs() < 1e-6);
        assert!((out[[0, 3, 3]] - pad).abs() < 1e-6);
    }

    #[test]
    fn extreme_pixels_stay_within_normalized_range() {
        let norm = Normalization::imagenet();
        let p = pre(8);
        let images = vec![
            raw(12, 10, |_, _, _| 0),
            raw(12, 10, |_, _, _| 255),
            raw(9, 16, |y, x, c| if (y + x + c) % 2 == 0 { 0 } else { 255 }),
            raw(11, 8, |y, x, c| ((y * 31 + x * 17 + c * 101) % 256) as u8),
            // Smaller than the crop on both axes.
            raw(3, 5, |_, x, _| if x % 2 == 0 { 255 } else { 0 }),
        ];
        let batch = Batch::new(
            images
                .into_iter()
                .enumerate()
                .map(|(i, img)| Record::new(i as u64, img, "a"))
                .collect(),
        );
        let out = p.preprocess(batch).unwrap();
        assert_eq!(out.len(), 5);
        for r in &out.records {
            let Image::Tensor(t) = &r.image else {
                panic!("sample_id {} was not preprocessed", r.sample_id);
            };
            let (c, h, w) = t.dim();
            assert_eq!([c, h, w], p.output_shape());
            for ch in 0..c {
                let (lo, hi) = norm.output_range(ch).unwrap();
                for &v in t.index_axis(ndarray::Axis(0), ch) {
                    assert!(
                        v.is_finite() && v >= lo - 1e-5 && v <= hi + 1e-5,
                        "sample_id {} channel {ch}: {v} outside [{lo}, {hi}]",
                        r.sample_id
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_tensors_and_wrong_channels() {
        let p = pre(2);
        let tensor = Record {
            sample_id: 7,
            image: Image::Tensor(Array3::zeros((3, 2, 2))),
            class: "a".into(),
            predicted_class_index: None,
        };
        let err = p.preprocess(Batch::new(vec![tensor])).unwrap_err();
        assert!(format!("{err:#}").contains("sample_id 7"));

        let gray = Record::new(1, Array3::zeros((4, 4, 1)), "a");
        assert!(p.preprocess(Batch::new(vec![gray])).is_err());
    }

    #[test]
    fn invalid_normalization_is_rejected() {
        let bad = Normalization {
            mean: vec![0.5; 3],
            std: vec![0.2, 0.0, 0.2],
        };
        assert!(ImagePreprocessor::new(4, ColorMode::Rgb, &bad).is_err());
        assert!(ImagePreprocessor::new(4, ColorMode::Luma, &Normalization::imagenet()).is_err());
    }
}
