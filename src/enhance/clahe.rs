//! CLAHE（コントラスト制限付き適応的ヒストグラム平坦化）
//!
//! 8bit単一チャネル画像をタイルに分割し、タイルごとにクリップしたヒストグラムから
//! 変換テーブル(LUT)を作成します。各画素は近傍4タイルのLUTを双線形補間して変換します。
//!
//! タイルで割り切れない画像は reflect-101 で折り返した画素でヒストグラムを作ります。

use image::{GrayImage, Luma};

const BINS: usize = 256;

/// CLAHE変換器
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    clip_limit: f32,
    tiles_x: u32,
    tiles_y: u32,
}

impl Default for Clahe {
    fn default() -> Self {
        Self::new(2.0, 8, 8)
    }
}

/// reflect-101 境界（例: n=4 のとき 4 -> 2, -1 -> 1）
fn reflect101(i: u32, n: u32) -> u32 {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let i = i % period;
    if i < n {
        i
    } else {
        period - i
    }
}

impl Clahe {
    /// `clip_limit` が0以下の場合はクリップせず通常の適応的平坦化になる
    pub fn new(clip_limit: f32, tiles_x: u32, tiles_y: u32) -> Self {
        Self {
            clip_limit,
            tiles_x: tiles_x.max(1),
            tiles_y: tiles_y.max(1),
        }
    }

    /// 輝度プレーンにCLAHEを適用する。出力サイズは入力と同じ
    pub fn apply(&self, src: &GrayImage) -> GrayImage {
        let (width, height) = src.dimensions();
        if width == 0 || height == 0 {
            return src.clone();
        }

        let tile_w = width.div_ceil(self.tiles_x);
        let tile_h = height.div_ceil(self.tiles_y);
        let luts = self.build_luts(src, tile_w, tile_h);

        let mut dst = GrayImage::new(width, height);
        let inv_tw = 1.0 / tile_w as f32;
        let inv_th = 1.0 / tile_h as f32;
        let max_tx = self.tiles_x as i64 - 1;
        let max_ty = self.tiles_y as i64 - 1;

        for y in 0..height {
            let tyf = y as f32 * inv_th - 0.5;
            let ty1 = tyf.floor() as i64;
            let ya = tyf - ty1 as f32;
            let ty2 = (ty1 + 1).min(max_ty) as usize;
            let ty1 = ty1.max(0) as usize;

            for x in 0..width {
                let txf = x as f32 * inv_tw - 0.5;
                let tx1 = txf.floor() as i64;
                let xa = txf - tx1 as f32;
                let tx2 = (tx1 + 1).min(max_tx) as usize;
                let tx1 = tx1.max(0) as usize;

                let v = src.get_pixel(x, y)[0] as usize;
                let lut = |ty: usize, tx: usize| luts[ty * self.tiles_x as usize + tx][v] as f32;

                let top = lut(ty1, tx1) * (1.0 - xa) + lut(ty1, tx2) * xa;
                let bottom = lut(ty2, tx1) * (1.0 - xa) + lut(ty2, tx2) * xa;
                let value = top * (1.0 - ya) + bottom * ya;

                dst.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
            }
        }

        dst
    }

    fn build_luts(&self, src: &GrayImage, tile_w: u32, tile_h: u32) -> Vec<[u8; BINS]> {
        let (width, height) = src.dimensions();
        let tile_area = (tile_w * tile_h) as usize;
        let clip = if self.clip_limit > 0.0 {
            ((self.clip_limit * tile_area as f32 / BINS as f32) as usize).max(1)
        } else {
            0
        };
        let lut_scale = 255.0 / tile_area as f32;

        let mut luts = Vec::with_capacity((self.tiles_x * self.tiles_y) as usize);
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let mut hist = [0usize; BINS];
                for y in ty * tile_h..(ty + 1) * tile_h {
                    let sy = reflect101(y, height);
                    for x in tx * tile_w..(tx + 1) * tile_w {
                        let sx = reflect101(x, width);
                        hist[src.get_pixel(sx, sy)[0] as usize] += 1;
                    }
                }

                if clip > 0 {
                    clip_histogram(&mut hist, clip);
                }

                let mut lut = [0u8; BINS];
                let mut sum = 0usize;
                for (bin, entry) in lut.iter_mut().enumerate() {
                    sum += hist[bin];
                    *entry = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
                }
                luts.push(lut);
            }
        }
        luts
    }
}

/// クリップ上限を超えた分を全ビンへ均等に再分配する
fn clip_histogram(hist: &mut [usize; BINS], clip: usize) {
    let mut clipped = 0;
    for count in hist.iter_mut() {
        if *count > clip {
            clipped += *count - clip;
            *count = clip;
        }
    }

    let batch = clipped / BINS;
    let residual = clipped - batch * BINS;
    for count in hist.iter_mut() {
        *count += batch;
    }

    if residual > 0 {
        let step = (BINS / residual).max(1);
        for count in hist.iter_mut().step_by(step).take(residual) {
            *count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(img: &GrayImage) -> u8 {
        let max = img.pixels().map(|p| p[0]).max().unwrap();
        let min = img.pixels().map(|p| p[0]).min().unwrap();
        max - min
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(0, 4), 0);
        assert_eq!(reflect101(3, 4), 3);
        assert_eq!(reflect101(4, 4), 2);
        assert_eq!(reflect101(5, 4), 1);
        assert_eq!(reflect101(7, 1), 0);
    }

    #[test]
    fn test_preserves_dimensions() {
        // 8で割り切れないサイズ
        let src = GrayImage::from_fn(37, 19, |x, y| Luma([((x * 5 + y * 3) % 256) as u8]));
        let dst = Clahe::default().apply(&src);
        assert_eq!(dst.dimensions(), (37, 19));
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let src = GrayImage::from_pixel(64, 48, Luma([90]));
        let dst = Clahe::default().apply(&src);
        let first = dst.get_pixel(0, 0)[0];
        assert!(dst.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn test_low_contrast_is_stretched() {
        let src = GrayImage::from_fn(64, 64, |x, y| Luma([100 + ((x * 7 + y * 13) % 21) as u8]));
        let dst = Clahe::default().apply(&src);
        assert!(span(&dst) > span(&src));
    }

    #[test]
    fn test_mapping_is_monotonic_within_tile() {
        let src = GrayImage::from_fn(16, 16, |x, y| Luma([((x + y * 16) % 256) as u8]));
        let dst = Clahe::new(2.0, 1, 1).apply(&src);
        for i in 1..256u32 {
            let prev = dst.get_pixel((i - 1) % 16, (i - 1) / 16)[0];
            let cur = dst.get_pixel(i % 16, i / 16)[0];
            assert!(cur >= prev);
        }
    }

    #[test]
    fn test_clip_histogram_preserves_total() {
        let mut hist = [0usize; BINS];
        hist[10] = 1000;
        hist[20] = 37;
        clip_histogram(&mut hist, 40);
        assert_eq!(hist.iter().sum::<usize>(), 1037);
        assert!(hist[10] < 1000);
    }

    #[test]
    fn test_empty_image_passthrough() {
        let src = GrayImage::new(0, 0);
        assert_eq!(Clahe::default().apply(&src).dimensions(), (0, 0));
    }
}
