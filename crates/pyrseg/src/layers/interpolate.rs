// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of pyrseg — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::tensor::{PureResult, Tensor, TensorError};

/// Bilinear resize of flattened `(batch, channels * h * w)` feature maps.
///
/// Corner pixels of input and output are aligned, so a resize back to the
/// source extent is the identity. When input and output extents match the
/// tensor is returned unchanged.
pub fn bilinear_resize(
    input: &Tensor,
    channels: usize,
    input_hw: (usize, usize),
    output_hw: (usize, usize),
) -> PureResult<Tensor> {
    if channels == 0 || output_hw.0 == 0 || output_hw.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: output_hw.0,
            cols: output_hw.1.max(channels),
        });
    }
    let (batch, cols) = input.shape();
    let (h, w) = input_hw;
    if cols != channels * h * w {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, channels * h * w),
        });
    }
    if input_hw == output_hw {
        return Ok(input.clone());
    }
    let (oh, ow) = output_hw;
    let scale_h = if oh > 1 {
        (h - 1) as f32 / (oh - 1) as f32
    } else {
        0.0
    };
    let scale_w = if ow > 1 {
        (w - 1) as f32 / (ow - 1) as f32
    } else {
        0.0
    };
    let out_cols = channels * oh * ow;
    let mut out = Tensor::zeros(batch, out_cols)?;
    {
        let out_data = out.data_mut();
        for b in 0..batch {
            let row = &input.data()[b * cols..(b + 1) * cols];
            let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
            for c in 0..channels {
                let channel = &row[c * h * w..(c + 1) * h * w];
                for oy in 0..oh {
                    let src_y = oy as f32 * scale_h;
                    let y0 = src_y.floor() as usize;
                    let y1 = (y0 + 1).min(h - 1);
                    let fy = src_y - y0 as f32;
                    for ox in 0..ow {
                        let src_x = ox as f32 * scale_w;
                        let x0 = src_x.floor() as usize;
                        let x1 = (x0 + 1).min(w - 1);
                        let fx = src_x - x0 as f32;
                        let top = channel[y0 * w + x0] * (1.0 - fx) + channel[y0 * w + x1] * fx;
                        let bottom = channel[y1 * w + x0] * (1.0 - fx) + channel[y1 * w + x1] * fx;
                        out_row[c * oh * ow + oy * ow + ox] = top * (1.0 - fy) + bottom * fy;
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_extents_match() {
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = bilinear_resize(&input, 1, (2, 2), (2, 2)).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn upsample_keeps_corners_and_interpolates_centre() {
        let input = Tensor::from_vec(1, 4, vec![0.0, 2.0, 4.0, 6.0]).unwrap();
        let out = bilinear_resize(&input, 1, (2, 2), (3, 3)).unwrap();
        let data = out.data();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[2], 2.0);
        assert_eq!(data[6], 4.0);
        assert_eq!(data[8], 6.0);
        // Centre is the mean of the four corners.
        assert!((data[4] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn downsample_to_single_pixel_takes_origin() {
        // With corner alignment and a 1x1 target the sample point is (0, 0).
        let input = Tensor::from_vec(1, 4, vec![7.0, 1.0, 2.0, 3.0]).unwrap();
        let out = bilinear_resize(&input, 1, (2, 2), (1, 1)).unwrap();
        assert_eq!(out.data(), &[7.0]);
    }

    #[test]
    fn rejects_mismatched_flattened_width() {
        let input = Tensor::zeros(1, 5).unwrap();
        assert!(bilinear_resize(&input, 1, (2, 2), (3, 3)).is_err());
    }
}
