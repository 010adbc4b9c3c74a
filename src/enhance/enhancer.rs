//! 口腔内写真の照明・コントラスト補正
//!
//! RGB -> YCrCb に変換し、輝度(Y)チャネルのみにCLAHEを適用してからRGBへ戻します。
//! 色差チャネル（歯肉の赤みなど）は変更しません。

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};

use crate::enhance::clahe::Clahe;
use crate::error::{OralHealthError, Result};
use crate::model::config::EnhancementSettings;

/// 画像補正器
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageEnhancer {
    clahe: Clahe,
}

// BT.601 (フルレンジ) の YCrCb 変換係数
const KR: f32 = 0.299;
const KG: f32 = 0.587;
const KB: f32 = 0.114;
const CR_SCALE: f32 = 0.713;
const CB_SCALE: f32 = 0.564;
const CHROMA_OFFSET: f32 = 128.0;

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

impl ImageEnhancer {
    pub fn new(settings: &EnhancementSettings) -> Self {
        Self {
            clahe: Clahe::new(settings.clip_limit, settings.tile_grid, settings.tile_grid),
        }
    }

    /// エンコード済みのバイト列をデコードして補正する
    pub fn enhance_bytes(&self, bytes: &[u8]) -> Result<RgbImage> {
        let image = image::load_from_memory(bytes).map_err(|e| OralHealthError::Decode(e.to_string()))?;
        self.enhance(&image)
    }

    /// デコード済み画像を補正する
    ///
    /// 3チャネル以外（グレースケール、アルファ付き）は `UnsupportedFormat`
    pub fn enhance(&self, image: &DynamicImage) -> Result<RgbImage> {
        let channels = image.color().channel_count();
        if channels != 3 {
            return Err(OralHealthError::UnsupportedFormat { channels });
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(OralHealthError::Decode("画像が空です".to_string()));
        }
        Ok(self.enhance_rgb(&image.to_rgb8()))
    }

    /// RGB画像の輝度にCLAHEを適用する
    pub fn enhance_rgb(&self, rgb: &RgbImage) -> RgbImage {
        let (width, height) = rgb.dimensions();
        let mut luma = GrayImage::new(width, height);
        let mut chroma = Vec::with_capacity((width * height) as usize);

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let [r, g, b] = pixel.0.map(f32::from);
            let y_value = KR * r + KG * g + KB * b;
            let cr = (r - y_value) * CR_SCALE + CHROMA_OFFSET;
            let cb = (b - y_value) * CB_SCALE + CHROMA_OFFSET;
            luma.put_pixel(x, y, Luma([to_u8(y_value)]));
            chroma.push((cr, cb));
        }

        let equalized = self.clahe.apply(&luma);

        let mut out = RgbImage::new(width, height);
        for ((x, y, pixel), (cr, cb)) in out.enumerate_pixels_mut().zip(chroma) {
            let y_value = equalized.get_pixel(x, y)[0] as f32;
            let dcr = cr - CHROMA_OFFSET;
            let dcb = cb - CHROMA_OFFSET;
            let r = y_value + 1.403 * dcr;
            let g = y_value - 0.714 * dcr - 0.344 * dcb;
            let b = y_value + 1.773 * dcb;
            *pixel = Rgb([to_u8(r), to_u8(g), to_u8(b)]);
        }
        out
    }
}
