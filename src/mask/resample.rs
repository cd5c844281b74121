//! Grid pooling, nearest upsampling and bilinear resize
//!
//! Pixel `y` of an `h`-row map belongs to grid row `y * gh / h`. Pooling and
//! upsampling share this mapping so that `sum_pool` is the exact adjoint of
//! `upsample_nearest`.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Grid cell owning pixel index `pos` along an axis of length `len`
#[inline]
pub fn cell_of(pos: usize, len: usize, cells: usize) -> usize {
    pos * cells / len
}

/// Sum of each grid cell
pub fn sum_pool(map: ArrayView2<'_, f32>, gh: usize, gw: usize) -> Array2<f32> {
    let (h, w) = map.dim();
    let mut out = Array2::zeros((gh, gw));
    for y in 0..h {
        let cy = cell_of(y, h, gh);
        for x in 0..w {
            out[[cy, cell_of(x, w, gw)]] += map[[y, x]];
        }
    }
    out
}

/// Mean of each grid cell
pub fn avg_pool(map: ArrayView2<'_, f32>, gh: usize, gw: usize) -> Array2<f32> {
    let (h, w) = map.dim();
    let mut sums = sum_pool(map, gh, gw);
    let mut counts = Array2::<f32>::zeros((gh, gw));
    for y in 0..h {
        let cy = cell_of(y, h, gh);
        for x in 0..w {
            counts[[cy, cell_of(x, w, gw)]] += 1.0;
        }
    }
    sums.zip_mut_with(&counts, |s, &c| {
        if c > 0.0 {
            *s /= c;
        }
    });
    sums
}

/// Per-channel cell means of a (C, H, W) image, returned as (C, gh, gw)
pub fn avg_pool_channels(image: ArrayView3<'_, f32>, gh: usize, gw: usize) -> Array3<f32> {
    let (c, _, _) = image.dim();
    let mut out = Array3::zeros((c, gh, gw));
    for (ch, plane) in image.outer_iter().enumerate() {
        out.index_axis_mut(ndarray::Axis(0), ch)
            .assign(&avg_pool(plane, gh, gw));
    }
    out
}

/// Nearest-neighbour upsampling of a coarse grid to (h, w)
pub fn upsample_nearest(coarse: ArrayView2<'_, f32>, h: usize, w: usize) -> Array2<f32> {
    let (gh, gw) = coarse.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        coarse[[cell_of(y, h, gh), cell_of(x, w, gw)]]
    })
}

/// Bilinear resize of a (C, H, W) image to (C, oh, ow), align-corners off
pub fn resize_bilinear(image: ArrayView3<'_, f32>, oh: usize, ow: usize) -> Array3<f32> {
    let (c, h, w) = image.dim();
    let mut out = Array3::zeros((c, oh, ow));
    if h == 0 || w == 0 {
        return out;
    }
    let scale_y = h as f32 / oh.max(1) as f32;
    let scale_x = w as f32 / ow.max(1) as f32;

    for oy in 0..oh {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;
        for ox in 0..ow {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;
            for ch in 0..c {
                let top = image[[ch, y0, x0]] * (1.0 - fx) + image[[ch, y0, x1]] * fx;
                let bottom = image[[ch, y1, x0]] * (1.0 - fx) + image[[ch, y1, x1]] * fx;
                out[[ch, oy, ox]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_avg_pool_even_grid() {
        let map = arr2(&[
            [1.0, 1.0, 2.0, 2.0],
            [1.0, 1.0, 2.0, 2.0],
            [3.0, 3.0, 4.0, 4.0],
            [3.0, 3.0, 4.0, 4.0],
        ]);
        let pooled = avg_pool(map.view(), 2, 2);
        assert_eq!(pooled, arr2(&[[1.0, 2.0], [3.0, 4.0]]));
    }

    #[test]
    fn test_sum_pool_is_adjoint_of_upsample() {
        let coarse = arr2(&[[0.3, -1.0], [2.0, 0.5]]);
        let fine = arr2(&[
            [1.0, 2.0, 3.0, 4.0, 5.0],
            [0.5, 0.1, -1.0, 2.0, 0.0],
            [3.0, 1.0, 1.0, 1.0, 1.0],
        ]);
        let up = upsample_nearest(coarse.view(), 3, 5);
        let lhs: f32 = (&up * &fine).sum();
        let rhs: f32 = (&coarse * &sum_pool(fine.view(), 2, 2)).sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-5);
    }

    #[test]
    fn test_resize_identity_and_constant() {
        let image = Array3::from_shape_fn((2, 3, 3), |(c, y, x)| (c * 9 + y * 3 + x) as f32);
        let same = resize_bilinear(image.view(), 3, 3);
        assert_eq!(same, image);

        let constant = Array3::from_elem((1, 5, 7), 0.25);
        let small = resize_bilinear(constant.view(), 2, 3);
        assert!(small.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }
}
