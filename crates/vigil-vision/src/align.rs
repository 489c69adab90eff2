//! Five-point face alignment onto the 112×112 ArcFace template.

use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// Template landmark positions in a 112×112 crop:
/// left eye, right eye, nose tip, left and right mouth corners.
pub const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `p' = [[a, -b], [b, a]] · p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst` (Umeyama, no reflection).
    /// `None` when the source points coincide.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut spread, mut dot, mut cross) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx - msx, sy - msy, dx - mdx, dy - mdy);
            spread += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if spread < 1e-6 {
            return None;
        }

        let (a, b) = (dot / spread, cross / spread);
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Warp the face described by `landmarks` onto the template. Pixels that fall
/// outside the source frame are black. `None` for degenerate landmarks.
pub fn align(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> Option<RgbImage> {
    let back = Similarity::estimate(landmarks, &TEMPLATE)?.inverse()?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        bilinear(image, back.apply((x as f32, y as f32)))
    }))
}

fn bilinear(image: &RgbImage, (x, y): (f32, f32)) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let texel = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= image.width() as i64 || py >= image.height() as i64 {
            return [0.0; 3];
        }
        image.get_pixel(px as u32, py as u32).0.map(f32::from)
    };
    let (tl, tr, bl, br) = (texel(x0, y0), texel(x0 + 1, y0), texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] + (tr[c] - tl[c]) * fx;
        let bottom = bl[c] + (br[c] - bl[c]) * fx;
        (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_identity_estimate() {
        let t = Similarity::estimate(&TEMPLATE, &TEMPLATE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-5 && t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_recovers_exact_similarity() {
        let truth = Similarity { a: 0.6, b: 0.3, tx: -12.0, ty: 40.0 };
        let src = TEMPLATE.map(|p| (p.0 * 2.5 + 100.0, p.1 * 2.5 + 30.0));
        let dst = src.map(|p| truth.apply(p));

        let fitted = Similarity::estimate(&src, &dst).unwrap();
        for p in src {
            assert!(close(fitted.apply(p), truth.apply(p)));
        }
    }

    #[test]
    fn test_inverse_round_trips() {
        let t = Similarity { a: 0.4, b: -0.2, tx: 7.0, ty: -3.0 };
        let inv = t.inverse().unwrap();
        for p in TEMPLATE {
            assert!(close(inv.apply(t.apply(p)), p));
        }
    }

    #[test]
    fn test_degenerate_landmarks() {
        let collapsed = [(50.0, 50.0); 5];
        assert!(Similarity::estimate(&collapsed, &TEMPLATE).is_none());
        assert!(align(&RgbImage::new(100, 100), &collapsed).is_none());
    }

    #[test]
    fn test_align_moves_marked_eye_onto_template() {
        let mut image = RgbImage::new(200, 200);
        let landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for y in 58..=62 {
            for x in 78..=82 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align(&image, &landmarks).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));

        let (ex, ey) = (TEMPLATE[0].0.round() as u32, TEMPLATE[0].1.round() as u32);
        let brightest = (ey - 1..=ey + 1)
            .flat_map(|y| (ex - 1..=ex + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "eye patch not found near template, max {brightest}");
        assert_eq!(aligned.get_pixel(0, 111).0, [0, 0, 0]);
    }
}
