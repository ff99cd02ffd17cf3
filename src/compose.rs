use std::io::Cursor;

use image::{imageops, ImageFormat, Rgba, RgbaImage};

use crate::error::Result;

/// Gaussian sigma used to feather mask edges before compositing, so
/// generated content blends into the original without a hard seam.
pub const MASK_FEATHER_SIGMA: f32 = 4.0;

pub fn decode_png(bytes: &[u8]) -> Result<RgbaImage> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Resize to the generation resolution. Returns a clone when already sized.
pub fn scale_to(img: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    if img.width() == width && img.height() == height {
        img.clone()
    } else {
        imageops::resize(img, width, height, imageops::FilterType::CatmullRom)
    }
}

/// A mask with no opaque pixel selects nothing.
pub fn mask_is_empty(mask: &RgbaImage) -> bool {
    mask.pixels().all(|p| p.0[3] == 0)
}

/// Flip the mask's alpha channel. The editor marks editable pixels opaque;
/// queue-and-poll servers expect them transparent. Applied exactly once, at
/// the upload boundary.
pub fn invert_alpha(mask: &RgbaImage) -> RgbaImage {
    let mut out = mask.clone();
    for p in out.pixels_mut() {
        p.0[3] = 255 - p.0[3];
    }
    out
}

/// Convert the alpha selection into a white-on-black grayscale mask
/// (the convention of the synchronous-result backend family).
pub fn alpha_to_luma(mask: &RgbaImage) -> RgbaImage {
    let mut out = RgbaImage::new(mask.width(), mask.height());
    for (src, dst) in mask.pixels().zip(out.pixels_mut()) {
        let a = src.0[3];
        *dst = Rgba([a, a, a, 255]);
    }
    out
}

/// Gaussian-blur the mask for soft edges.
pub fn feather_mask(mask: &RgbaImage, sigma: f32) -> RgbaImage {
    imageops::blur(mask, sigma)
}

/// Destination-out: cut the (feathered) mask's selection out of the source.
/// The result is the compositing base — the preserved-original pixels that
/// get painted back over generated content.
pub fn carve_out(source: &RgbaImage, mask: &RgbaImage) -> RgbaImage {
    let mut out = source.clone();
    for (dst, m) in out.pixels_mut().zip(mask.pixels()) {
        let keep = 255 - m.0[3] as u32;
        dst.0[3] = ((dst.0[3] as u32 * keep) / 255) as u8;
    }
    out
}

/// Source-over: paint `top` onto `bottom`, returning the flattened result.
/// Used to restore the preserved-original pixels over a generated image.
pub fn paint_over(top: &RgbaImage, bottom: &RgbaImage) -> RgbaImage {
    let mut out = RgbaImage::new(bottom.width(), bottom.height());
    for ((t, b), dst) in top.pixels().zip(bottom.pixels()).zip(out.pixels_mut()) {
        let ta = t.0[3] as f32 / 255.0;
        let ba = b.0[3] as f32 / 255.0;
        let oa = ta + ba * (1.0 - ta);
        if oa <= f32::EPSILON {
            *dst = Rgba([0, 0, 0, 0]);
            continue;
        }
        let mut px = [0u8; 4];
        for c in 0..3 {
            let tc = t.0[c] as f32 / 255.0;
            let bc = b.0[c] as f32 / 255.0;
            let oc = (tc * ta + bc * ba * (1.0 - ta)) / oa;
            px[c] = (oc * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        px[3] = (oa * 255.0).round().clamp(0.0, 255.0) as u8;
        *dst = Rgba(px);
    }
    out
}
