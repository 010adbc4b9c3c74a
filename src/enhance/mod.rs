pub mod clahe;
pub mod enhancer;

pub use clahe::Clahe;
pub use enhancer::ImageEnhancer;
