//! 学習データのオンザフライ拡張
//!
//! 回転・平行移動・せん断・ズームを1つのアフィン変換にまとめ、
//! 出力画素から入力画素への逆写像で双線形サンプリングします。
//! 画像外は最も近い端の画素で埋めます。最後に確率0.5で左右反転します。

use image::{Rgb, RgbImage};
use rand::Rng;

use crate::model::config::AugmentationSettings;

/// 1枚の画像に適用するランダム変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    /// 回転角度（度）
    pub rotation_deg: f32,
    /// 平行移動（ピクセル）
    pub shift_x: f32,
    pub shift_y: f32,
    /// せん断係数 tan(せん断角)
    pub shear: f32,
    /// 軸ごとの拡大率
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub horizontal_flip: bool,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            horizontal_flip: false,
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// 画像外の座標は端へクランプして双線形補間
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

impl AffineTransform {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// 変換を適用する。出力サイズは入力と同じ
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 || self.is_identity() {
            return image.clone();
        }

        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;
        let (sin, cos) = self.rotation_deg.to_radians().sin_cos();

        // 出力座標 -> 入力座標: R * Shear * Zoom * (p - c) + t + c
        let m00 = cos * self.zoom_x;
        let m01 = (cos * self.shear - sin) * self.zoom_y;
        let m10 = sin * self.zoom_x;
        let m11 = (sin * self.shear + cos) * self.zoom_y;

        let mut out = RgbImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let u = x as f32 - cx;
            let v = y as f32 - cy;
            let src_x = m00 * u + m01 * v + self.shift_x + cx;
            let src_y = m10 * u + m11 * v + self.shift_y + cy;
            *pixel = sample_bilinear(image, src_x, src_y);
        }

        if self.horizontal_flip {
            image::imageops::flip_horizontal_in_place(&mut out);
        }
        out
    }
}

/// 学習用データ拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    /// 画像サイズに応じたランダム変換を生成
    pub fn sample_transform<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> AffineTransform {
        let s = &self.settings;
        let zoom = s.zoom_range.max(0.0);
        let (zoom_x, zoom_y) = if zoom > 0.0 {
            (rng.gen_range(1.0 - zoom..=1.0 + zoom), rng.gen_range(1.0 - zoom..=1.0 + zoom))
        } else {
            (1.0, 1.0)
        };

        AffineTransform {
            rotation_deg: symmetric(rng, s.rotation_range),
            shift_x: symmetric(rng, s.width_shift_range) * width as f32,
            shift_y: symmetric(rng, s.height_shift_range) * height as f32,
            shear: symmetric(rng, s.shear_range).to_radians().tan(),
            zoom_x,
            zoom_y,
            horizontal_flip: s.horizontal_flip && rng.gen_bool(0.5),
        }
    }

    /// ランダム変換を生成して適用
    pub fn augment<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let (width, height) = image.dimensions();
        self.sample_transform(rng, width, height).apply(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
    }

    #[test]
    fn test_identity_keeps_image() {
        let image = gradient(20, 10);
        assert_eq!(AffineTransform::default().apply(&image), image);
    }

    #[test]
    fn test_flip_only_mirrors() {
        let image = gradient(20, 10);
        let transform = AffineTransform {
            horizontal_flip: true,
            ..Default::default()
        };
        let out = transform.apply(&image);
        assert_eq!(out.get_pixel(0, 3), image.get_pixel(19, 3));
        assert_eq!(out.get_pixel(19, 7), image.get_pixel(0, 7));
    }

    #[test]
    fn test_shift_fills_with_nearest_edge() {
        let image = gradient(20, 10);
        let transform = AffineTransform {
            shift_x: 5.0,
            ..Default::default()
        };
        let out = transform.apply(&image);
        // 出力(x)は入力(x+5)を参照し、右端は端の画素で埋まる
        assert_eq!(out.get_pixel(0, 0), image.get_pixel(5, 0));
        assert_eq!(out.get_pixel(19, 0), image.get_pixel(19, 0));
    }

    #[test]
    fn test_sampled_transform_respects_ranges() {
        let augmenter = Augmenter::new(AugmentationSettings::default());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let t = augmenter.sample_transform(&mut rng, 224, 224);
            assert!(t.rotation_deg.abs() <= 20.0);
            assert!(t.shift_x.abs() <= 0.2 * 224.0 + 1e-3);
            assert!(t.shift_y.abs() <= 0.2 * 224.0 + 1e-3);
            assert!(t.shear.abs() <= 0.2f32.to_radians().tan() + 1e-6);
            assert!((0.8..=1.2).contains(&t.zoom_x));
            assert!((0.8..=1.2).contains(&t.zoom_y));
        }
    }

    #[test]
    fn test_shear_range_is_in_degrees() {
        let settings = AugmentationSettings {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 45.0,
            zoom_range: 0.0,
            horizontal_flip: false,
        };
        let augmenter = Augmenter::new(settings);
        let mut rng = StdRng::seed_from_u64(11);
        let max = (0..200)
            .map(|_| augmenter.sample_transform(&mut rng, 64, 64).shear.abs())
            .fold(0.0f32, f32::max);
        // ±45度は係数で最大 tan(45°) = 1
        assert!(max <= 1.0 + 1e-5);
        assert!(max > 0.5);
    }

    #[test]
    fn test_disabled_augmentation_is_identity() {
        let settings = AugmentationSettings {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
        };
        let augmenter = Augmenter::new(settings);
        let image = gradient(16, 16);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(augmenter.augment(&image, &mut rng), image);
    }

    #[test]
    fn test_augment_keeps_dimensions() {
        let augmenter = Augmenter::new(AugmentationSettings::default());
        let mut rng = StdRng::seed_from_u64(3);
        let out = augmenter.augment(&gradient(33, 21), &mut rng);
        assert_eq!(out.dimensions(), (33, 21));
    }
}
