pub mod augment;
pub mod classifier;
pub mod inference;
pub mod input_tensor;
pub mod ml_model;
pub mod training;

pub use augment::{AffineTransform, Augmenter};
pub use classifier::Classifier;
pub use inference::{decode_model, encode_model, load_classifier, InferenceEngine};
pub use input_tensor::InputTensor;
pub use ml_model::{ModelConfig, OralHealthClassifier};
pub use training::{train_model, ImageFolderDataset, TrainingOutcome};
