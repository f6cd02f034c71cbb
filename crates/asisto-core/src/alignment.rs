//! Face alignment via a 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout
//! and resamples the face into a canonical 112×112 RGB crop.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub(crate) const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub(crate) const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit from `src` to `dst` points.
    ///
    /// Treating points as complex numbers, the rotation+scale is
    /// `sum(conj(s') * d') / sum(|s'|^2)` over mean-centred points.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut norm = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }

        if norm < 1e-12 {
            // Degenerate landmarks: translate only.
            return Self { a: 1.0, b: 0.0, tx: mdx - msx, ty: mdy - msy };
        }

        let a = dot / norm;
        let b = cross / norm;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map a destination point back into source space. `None` when the
    /// transform has collapsed to zero scale.
    fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear sample of an RGB image; out-of-bounds neighbours read as black.
fn sample_bilinear(frame: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> [f32; 3] {
        if x < 0 || y < 0 || x >= frame.width() as i64 || y >= frame.height() as i64 {
            return [0.0; 3];
        }
        let p = frame.get_pixel(x as u32, y as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Align a detected face to a canonical 112×112 RGB crop suitable for ArcFace.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        match transform.invert((ox as f32, oy as f32)) {
            Some((sx, sy)) => sample_bilinear(frame, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let t = Similarity::estimate(&pts, &pts);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale: transform should halve them.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}, expected 0.5", t.a);
        assert!(t.b.abs() < 1e-3);
    }

    #[test]
    fn test_transform_maps_landmarks_onto_reference() {
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        for (s, r) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - r.0).abs() < 3.0 && (y - r.1).abs() < 3.0, "{s:?} -> ({x}, {y}), ref {r:?}");
        }
    }

    #[test]
    fn test_invert_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 5.0, ty: -2.0 };
        let p = (17.0, 42.0);
        let back = t.invert(t.apply(p)).unwrap();
        assert!((back.0 - p.0).abs() < 1e-3 && (back.1 - p.1).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_landmarks_translate_only() {
        let src = [(50.0, 50.0); 5];
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(t.a, 1.0);
        assert_eq!(t.b, 0.0);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_bright_patch_lands_on_reference_eye() {
        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let mut frame = RgbImage::new(200, 200);
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&frame, &src_landmarks);

        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let brightest = (rx - 2..=rx + 2)
            .flat_map(|x| (ry - 2..=ry + 2).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "expected red patch near ({rx}, {ry}), max = {brightest}");
    }
}
