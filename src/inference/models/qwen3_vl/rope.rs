//! Position bookkeeping for the vision and text towers.
//!
//! Everything here is plain index arithmetic; the towers turn the results into tensors.

use anyhow::{bail, Result};

/// Temporal, height and width position of one text-model token.
pub type MropePosition = [i64; 3];

/// Inverse frequencies `1 / theta^(2i / dim)` for `i < dim / 2`.
pub fn inv_freq(dim: usize, theta: f64) -> Vec<f32> {
    (0..dim)
        .step_by(2)
        .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
        .collect()
}

/// Which position axis drives rotary frequency `j`. Height and width are interleaved into the
/// temporal frequencies: every third frequency starting at 1 (resp. 2) within the first
/// `3 * section` slots.
pub fn mrope_axis(j: usize, mrope_section: &[usize; 3]) -> usize {
    if j % 3 == 1 && j < mrope_section[1] * 3 {
        1
    } else if j % 3 == 2 && j < mrope_section[2] * 3 {
        2
    } else {
        0
    }
}

/// Cosine and sine tables of shape `(positions.len(), inv_freq.len())`, row-major.
pub fn mrope_cos_sin(
    positions: &[MropePosition],
    inv_freq: &[f32],
    mrope_section: &[usize; 3],
) -> (Vec<f32>, Vec<f32>) {
    let axes: Vec<usize> = (0..inv_freq.len())
        .map(|j| mrope_axis(j, mrope_section))
        .collect();
    let mut cos = Vec::with_capacity(positions.len() * inv_freq.len());
    let mut sin = Vec::with_capacity(positions.len() * inv_freq.len());
    for position in positions {
        for (freq, &axis) in inv_freq.iter().zip(axes.iter()) {
            let angle = position[axis] as f32 * freq;
            cos.push(angle.cos());
            sin.push(angle.sin());
        }
    }
    (cos, sin)
}

/// Splits every video grid into one `(1, h, w)` group per temporal patch.
fn frame_groups(video_grid_thw: &[[usize; 3]]) -> impl Iterator<Item = [usize; 3]> + '_ {
    video_grid_thw
        .iter()
        .flat_map(|&[t, h, w]| std::iter::repeat([1, h, w]).take(t))
}

/// Multimodal positions of a prompt, plus the offset between the next position and the
/// sequence length that decoding continues from.
///
/// Text tokens advance all three axes together. The tokens of a frame group share one
/// temporal index and are laid out on the merged `h x w` grid, offset from the text before
/// them; the text after a group restarts one past the largest index used so far.
pub fn rope_index(
    input_ids: &[u32],
    video_grid_thw: &[[usize; 3]],
    video_token_id: u32,
    merge_size: usize,
) -> Result<(Vec<MropePosition>, i64)> {
    let mut positions = Vec::with_capacity(input_ids.len());
    let mut start = 0;
    let mut next: i64 = 0;

    for [_, h, w] in frame_groups(video_grid_thw) {
        let Some(rest) = input_ids.get(start..) else {
            bail!("video grid describes more tokens than the prompt holds");
        };
        let Some(offset) = rest.iter().position(|&id| id == video_token_id) else {
            bail!("prompt has fewer video tokens than the video grid describes");
        };
        let end = start + offset;
        for i in 0..offset as i64 {
            positions.push([next + i; 3]);
        }

        let base = next + offset as i64;
        let (grid_h, grid_w) = (h / merge_size, w / merge_size);
        for y in 0..grid_h as i64 {
            for x in 0..grid_w as i64 {
                positions.push([base, base + y, base + x]);
            }
        }
        next = base + grid_h.max(grid_w).max(1) as i64;
        start = end + grid_h * grid_w;
    }

    if start > input_ids.len() {
        bail!("video grid describes more tokens than the prompt holds");
    }
    for i in 0..(input_ids.len() - start) as i64 {
        positions.push([next + i; 3]);
    }
    next += (input_ids.len() - start) as i64;

    let delta = next - input_ids.len() as i64;
    Ok((positions, delta))
}

/// Row and column of every patch, in the order the processor emits patches: merge blocks in
/// row-major order, patches inside a block in row-major order, repeated for every temporal
/// patch.
pub fn vision_patch_coords(grid_thw: [usize; 3], merge_size: usize) -> Vec<[usize; 2]> {
    let [t, h, w] = grid_thw;
    let mut coords = Vec::with_capacity(t * h * w);
    for _ in 0..t {
        for bh in 0..h / merge_size {
            for bw in 0..w / merge_size {
                for ih in 0..merge_size {
                    for iw in 0..merge_size {
                        coords.push([bh * merge_size + ih, bw * merge_size + iw]);
                    }
                }
            }
        }
    }
    coords
}

/// 2-D rotary angles of the vision tower, shape `(coords.len(), 2 * inv_freq.len())`:
/// row frequencies followed by column frequencies.
pub fn vision_rotary_angles(coords: &[[usize; 2]], inv_freq: &[f32]) -> Vec<f32> {
    let mut angles = Vec::with_capacity(coords.len() * inv_freq.len() * 2);
    for &[row, col] in coords {
        angles.extend(inv_freq.iter().map(|f| row as f32 * f));
        angles.extend(inv_freq.iter().map(|f| col as f32 * f));
    }
    angles
}

/// Bilinear lookup into the learned `side x side` position-embedding grid.
///
/// Returns, for the four grid corners, the embedding row of every patch and its weight. The
/// patches come in the same merge order as [`vision_patch_coords`].
pub fn pos_embed_bilinear(
    grid_thw: [usize; 3],
    side: usize,
    merge_size: usize,
) -> ([Vec<u32>; 4], [Vec<f32>; 4]) {
    let [t, h, w] = grid_thw;
    let linspace = |n: usize| -> Vec<f32> {
        if n <= 1 {
            return vec![0.0; n];
        }
        let step = (side - 1) as f32 / (n - 1) as f32;
        (0..n).map(|i| i as f32 * step).collect()
    };
    let h_idxs = linspace(h);
    let w_idxs = linspace(w);

    let mut indices: [Vec<u32>; 4] = Default::default();
    let mut weights: [Vec<f32>; 4] = Default::default();
    for [row, col] in vision_patch_coords([t, h, w], merge_size) {
        let (hf, wf) = (h_idxs[row], w_idxs[col]);
        let (h0, w0) = (hf as usize, wf as usize);
        let (h1, w1) = ((h0 + 1).min(side - 1), (w0 + 1).min(side - 1));
        let (dh, dw) = (hf - h0 as f32, wf - w0 as f32);

        let corners = [
            (h0 * side + w0, (1.0 - dh) * (1.0 - dw)),
            (h0 * side + w1, (1.0 - dh) * dw),
            (h1 * side + w0, dh * (1.0 - dw)),
            (h1 * side + w1, dh * dw),
        ];
        for (k, (index, weight)) in corners.into_iter().enumerate() {
            indices[k].push(index as u32);
            weights[k].push(weight);
        }
    }
    (indices, weights)
}
