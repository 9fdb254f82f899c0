use image::{GrayImage, Luma};

/// Linear stretch mapping the `low`/`high` intensity percentiles to 0/255.
///
/// Flat images are returned unchanged.
pub fn intensity_stretch(image: &GrayImage, low: f64, high: f64) -> GrayImage {
    let n = image.as_raw().len();
    if n == 0 {
        return image.clone();
    }
    let mut hist = [0usize; 256];
    for &v in image.as_raw() {
        hist[v as usize] += 1;
    }
    let percentile = |frac: f64| -> u8 {
        let target = (frac.clamp(0.0, 1.0) * n as f64).ceil() as usize;
        let mut acc = 0usize;
        for (v, &count) in hist.iter().enumerate() {
            acc += count;
            if acc >= target.max(1) {
                return v as u8;
            }
        }
        255
    };
    let lo = percentile(low) as f64;
    let hi = percentile(high) as f64;
    if hi <= lo {
        return image.clone();
    }
    let gain = 255.0 / (hi - lo);
    let mut out = GrayImage::new(image.width(), image.height());
    for (dst, src) in out.pixels_mut().zip(image.pixels()) {
        let v = ((src[0] as f64 - lo) * gain).round().clamp(0.0, 255.0);
        *dst = Luma([v as u8]);
    }
    out
}

/// Gaussian smoothing; `sigma <= 0` copies the image.
pub fn smooth(image: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    imageproc::filter::gaussian_blur_f32(image, sigma)
}
