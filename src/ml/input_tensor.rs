//! モデル入力テンソル
//!
//! RGB画像を [0,1] に正規化し、(C, H, W) 順で平坦化して保持します。
//! バッチ次元は推論時に 1 として付与します。

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, RgbImage};

use crate::error::{OralHealthError, Result};

pub const CHANNELS: usize = 3;

/// 正規化済みの入力画像 (3, height, width)
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

/// 画像を指定サイズへ双線形補間でリサイズする（同サイズならそのまま）
pub fn resize_to(image: &RgbImage, size: usize) -> RgbImage {
    let size = size as u32;
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    image::imageops::resize(image, size, size, FilterType::Triangle)
}

impl InputTensor {
    /// 平坦化済みデータから作成（長さが 3*height*width と一致しない場合はエラー）
    pub fn new(data: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        let expected = CHANNELS * height * width;
        if data.len() != expected {
            return Err(OralHealthError::ShapeMismatch {
                expected: [height, width, CHANNELS],
                actual: [data.len() / (CHANNELS * width).max(1), width, CHANNELS],
            });
        }
        Ok(Self { data, height, width })
    }

    /// RGB画像を 255 で割って正規化（サイズは変更しない）
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; CHANNELS * plane];

        for (i, pixel) in image.pixels().enumerate() {
            for channel in 0..CHANNELS {
                data[channel * plane + i] = pixel[channel] as f32 / 255.0;
            }
        }

        Self {
            data,
            height: height as usize,
            width: width as usize,
        }
    }

    /// リサイズしてから正規化
    pub fn from_image(image: &RgbImage, size: usize) -> Self {
        Self::from_rgb(&resize_to(image, size))
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// (height, width, channels)
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, CHANNELS]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// 期待する入力サイズと一致するか確認
    pub fn ensure_size(&self, size: usize) -> Result<()> {
        if self.height != size || self.width != size {
            return Err(OralHealthError::ShapeMismatch {
                expected: [size, size, CHANNELS],
                actual: self.shape(),
            });
        }
        Ok(())
    }

    /// バッチ次元を付与したテンソル [1, 3, H, W] に変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 1>::from_floats(self.data.as_slice(), device).reshape([1, CHANNELS, self.height, self.width])
    }
}
