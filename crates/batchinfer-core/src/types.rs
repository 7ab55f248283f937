use ndarray::Array3;
use thiserror::Error;

/// Pixel payload of a record.
///
/// The loader produces `Raw` images (height × width × channel, u8). The preprocessor replaces
/// them with `Tensor` images (channel × height × width, f32). Nothing ever turns a `Tensor` back
/// into a `Raw`.
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    Raw(Array3<u8>),
    Tensor(Array3<f32>),
}

impl Image {
    pub fn is_raw(&self) -> bool {
        matches!(self, Image::Raw(_))
    }

    /// Shape in the image's native layout (HWC for raw, CHW for tensors).
    pub fn shape(&self) -> [usize; 3] {
        let dims = match self {
            Image::Raw(a) => a.dim(),
            Image::Tensor(a) => a.dim(),
        };
        [dims.0, dims.1, dims.2]
    }
}

/// One image example flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Dense id assigned in listing order.
    pub sample_id: u64,
    pub image: Image,
    /// Label taken from the record's parent directory.
    pub class: String,
    pub predicted_class_index: Option<u32>,
}

impl Record {
    pub fn new(sample_id: u64, image: Array3<u8>, class: impl Into<String>) -> Self {
        Self {
            sample_id,
            image: Image::Raw(image),
            class: class.into(),
            predicted_class_index: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("sample_id {0} appears more than once in the batch")]
    DuplicateSampleId(u64),
    #[error("sample_id {sample_id}: image is not a preprocessed tensor")]
    NotPreprocessed { sample_id: u64 },
    #[error("sample_id {sample_id}: tensor shape {actual:?} does not match {expected:?}")]
    ShapeMismatch {
        sample_id: u64,
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("sample_id {sample_id}: missing predicted_class_index")]
    MissingPrediction { sample_id: u64 },
    #[error("sample_id {sample_id}: predicted_class_index {index} out of range (num_classes={num_classes})")]
    PredictionOutOfRange {
        sample_id: u64,
        index: u32,
        num_classes: u32,
    },
}

/// An ordered group of records processed together by one stage invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn sample_ids(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.sample_id).collect()
    }

    pub fn clear_predictions(&mut self) {
        for r in &mut self.records {
            r.predicted_class_index = None;
        }
    }

    /// First and last sample id, for log fields.
    pub fn id_span(&self) -> Option<(u64, u64)> {
        let first = self.records.first()?.sample_id;
        let last = self.records.last()?.sample_id;
        Some((first, last))
    }

    /// Checks that every record carries a CHW tensor of `expected` shape.
    pub fn validate_tensors(&self, expected: [usize; 3]) -> Result<(), RecordError> {
        for r in &self.records {
            let Image::Tensor(t) = &r.image else {
                return Err(RecordError::NotPreprocessed {
                    sample_id: r.sample_id,
                });
            };
            let (c, h, w) = t.dim();
            if [c, h, w] != expected {
                return Err(RecordError::ShapeMismatch {
                    sample_id: r.sample_id,
                    expected,
                    actual: [c, h, w],
                });
            }
        }
        Ok(())
    }

    /// Checks that every record has a prediction in `[0, num_classes)`.
    pub fn validate_predictions(&self, num_classes: Option<u32>) -> Result<(), RecordError> {
        for r in &self.records {
            let index = r
                .predicted_class_index
                .ok_or(RecordError::MissingPrediction {
                    sample_id: r.sample_id,
                })?;
            if let Some(n) = num_classes {
                if index >= n {
                    return Err(RecordError::PredictionOutOfRange {
                        sample_id: r.sample_id,
                        index,
                        num_classes: n,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn check_unique_ids(&self) -> Result<(), RecordError> {
        let mut seen = std::collections::HashSet::with_capacity(self.records.len());
        for r in &self.records {
            if !seen.insert(r.sample_id) {
                return Err(RecordError::DuplicateSampleId(r.sample_id));
            }
        }
        Ok(())
    }
}

impl From<Vec<Record>> for Batch {
    fn from(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
