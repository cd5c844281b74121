//! Rectangular patch masks (CutMix, TransMix, SaliencyMix boxes)

use super::{MixMask, RatioSampler};
use crate::error::{Error, Result};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where the donor patch may land
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxPlacement {
    /// Box kept fully inside the image, area matches λ up to rounding
    #[default]
    Inside,
    /// Center drawn anywhere, box clipped at the borders
    Clip,
    /// Box snapped to a grid of box-sized cells
    Grid,
}

impl FromStr for BoxPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inside" => Ok(Self::Inside),
            "clip" => Ok(Self::Clip),
            "grid" => Ok(Self::Grid),
            other => Err(Error::ConfigError(format!(
                "unknown placement '{other}', expected inside, clip or grid"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CutMixParams {
    pub ratio: RatioSampler,
    pub placement: BoxPlacement,
}

/// Axis-aligned box in pixel coordinates, half-open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutBox {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

impl CutBox {
    pub fn area(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    #[inline]
    pub fn contains(&self, y: usize, x: usize) -> bool {
        y >= self.top && y < self.top + self.height && x >= self.left && x < self.left + self.width
    }
}

/// Side lengths of a box covering a `1 - lam` share of an (h, w) image
pub fn box_size(h: usize, w: usize, lam: f32) -> (usize, usize) {
    let cut = (1.0 - lam).clamp(0.0, 1.0).sqrt();
    let ch = ((h as f32) * cut).round() as usize;
    let cw = ((w as f32) * cut).round() as usize;
    (ch.min(h), cw.min(w))
}

/// Clip a box of size (ch, cw) centered at (cy, cx) to the image
pub fn centered_box(h: usize, w: usize, cy: usize, cx: usize, ch: usize, cw: usize) -> CutBox {
    let clip = |center: usize, side: usize, len: usize| {
        let start = center as isize - (side / 2) as isize;
        let lo = start.max(0) as usize;
        let hi = ((start + side as isize).max(0) as usize).min(len);
        (lo.min(hi), hi - lo.min(hi))
    };
    let (top, height) = clip(cy, ch, h);
    let (left, width) = clip(cx, cw, w);
    CutBox {
        top,
        left,
        height,
        width,
    }
}

/// Draw a box for ratio `lam` under the given placement
///
/// Placement draws happen in row-then-column order.
pub fn sample_box<R: Rng + ?Sized>(
    h: usize,
    w: usize,
    lam: f32,
    placement: BoxPlacement,
    rng: &mut R,
) -> CutBox {
    let (ch, cw) = box_size(h, w, lam);
    if ch == 0 || cw == 0 {
        return CutBox {
            top: 0,
            left: 0,
            height: 0,
            width: 0,
        };
    }

    match placement {
        BoxPlacement::Inside => CutBox {
            top: rng.random_range(0..=h - ch),
            left: rng.random_range(0..=w - cw),
            height: ch,
            width: cw,
        },
        BoxPlacement::Clip => {
            let cy = rng.random_range(0..h);
            let cx = rng.random_range(0..w);
            centered_box(h, w, cy, cx, ch, cw)
        }
        BoxPlacement::Grid => {
            let slot = |len: usize, side: usize, rng: &mut R| {
                let slots = (len / side).max(1);
                (rng.random_range(0..slots) * side).min(len - side)
            };
            let top = slot(h, ch, rng);
            let left = slot(w, cw, rng);
            CutBox {
                top,
                left,
                height: ch,
                width: cw,
            }
        }
    }
}

/// Binary mask: 0 inside the box (partner pixels), 1 elsewhere
pub fn box_mask(h: usize, w: usize, cut: &CutBox) -> Array2<f32> {
    Array2::from_shape_fn((h, w), |(y, x)| if cut.contains(y, x) { 0.0 } else { 1.0 })
}

/// CutMix mask for ratio `lam`; the realized ratio is the mask mean
pub fn cutmix_mask<R: Rng + ?Sized>(
    h: usize,
    w: usize,
    lam: f32,
    placement: BoxPlacement,
    rng: &mut R,
) -> MixMask {
    let cut = sample_box(h, w, lam, placement, rng);
    MixMask::Dense(box_mask(h, w, &cut))
}
