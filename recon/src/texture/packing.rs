use std::collections::BTreeMap;

use rectangle_pack::{
    contains_smallest_box, pack_rects, volume_heuristic, GroupedRectsToPlace,
    PackedLocation, RectToInsert, TargetBin,
};

use crate::camera::Vector2;

use super::patching::LocalPatch;
use super::{bisect, extremum, Rectangle};

// Resolution of the integer lattice the rectangles are packed on.
const ACCURACY: f64 = 1e6;
const RTOL: f64 = 1e-3;

/// Packs rectangles of the given physical sizes into the unit square,
/// scaling them all by the largest factor that still fits. Returns the
/// placements with the scale, or `None` if nothing fits at all.
pub fn pack_rectangles_with_automatic_stretching(
    sizes: &[[f64; 2]],
    spacing: f64,
) -> Option<(Vec<Rectangle<f64>>, f64)> {
    let biggest = extremum(sizes.iter().flatten().cloned(), Iterator::max_by)?;
    if !(biggest > 0.0) {
        return None;
    }
    // Just past the scale at which the biggest chart fills the square.
    let bound_failing = (1.0 + RTOL) / biggest;
    let bounds = [bound_failing, 0.0];

    let f = |s| try_pack_rectangles_with_given_stretching(sizes, spacing, s);
    let (scale, rectangles) = bisect(f, bounds, RTOL)?;
    if scale > 0.0 {
        Some((rectangles, scale))
    } else {
        None
    }
}

pub fn try_pack_rectangles_with_given_stretching(
    sizes: &[[f64; 2]],
    spacing: f64,
    scale: f64,
) -> Option<Vec<Rectangle<f64>>> {
    let padded = |x| spacing + x * scale + spacing;
    let sizes_padded: Vec<[f64; 2]> =
        sizes.iter().map(|&[a, b]| [padded(a), padded(b)]).collect();
    let positions = try_pack_rectangles(&sizes_padded)?;

    let rectangles = sizes
        .iter()
        .zip(positions.iter())
        .map(|(&[a, b], &[i, j])| Rectangle {
            pos: [spacing + i, spacing + j],
            size: [a * scale, b * scale],
        })
        .collect();
    Some(rectangles)
}

// Packs into the unit box [0,1]x[0,1].
fn try_pack_rectangles(sizes: &[[f64; 2]]) -> Option<Vec<[f64; 2]>> {
    let f = |x: f64| (x * ACCURACY).ceil() as u32;
    let sizes_discrete: Vec<[u32; 2]> =
        sizes.iter().map(|&[a, b]| [f(a), f(b)]).collect();
    let positions_discrete =
        try_pack_rectangles_u32(&sizes_discrete, [f(1.0), f(1.0)])?;
    let f = |x: u32| x as f64 / ACCURACY;
    Some(
        positions_discrete
            .iter()
            .map(|&[a, b]| [f(a), f(b)])
            .collect(),
    )
}

fn try_pack_rectangles_u32(
    sizes: &[[u32; 2]],
    bounding_size: [u32; 2],
) -> Option<Vec<[u32; 2]>> {
    let mut rects_to_place: GroupedRectsToPlace<usize, ()> =
        GroupedRectsToPlace::new();
    for (i, size) in sizes.iter().enumerate() {
        rects_to_place.push_rect(i, None, RectToInsert::new(size[0], size[1], 1));
    }

    let mut target_bins = BTreeMap::new();
    target_bins.insert((), TargetBin::new(bounding_size[0], bounding_size[1], 1));

    let placements = pack_rects(
        &rects_to_place,
        &mut target_bins,
        &volume_heuristic,
        &contains_smallest_box,
    )
    .ok()?;
    let packed_locations = placements.packed_locations();

    // The names x() and y() belong to the packing library. Here x runs
    // along the first UV coordinate and y along the second.
    let f = |pl: &PackedLocation| [pl.x(), pl.y()];
    (0..sizes.len())
        .map(|i| packed_locations.get(&i).map(|(_, pl)| f(pl)))
        .collect()
}

/// Per-face corner coordinates in the unit square.
pub fn globalize_uv(
    patches: &[LocalPatch],
    placements: &[Rectangle<f64>],
    num_faces: usize,
) -> Vec<[Vector2; 3]> {
    let mut uv_coords = vec![[Vector2::zeros(); 3]; num_faces];
    for (patch, &rect) in patches.iter().zip(placements.iter()) {
        for (&j, uvs) in patch.chunk.iter().zip(patch.to_global_coords(rect)) {
            uv_coords[j] = uvs;
        }
    }
    uv_coords
}

#[cfg(test)]
mod test {
    use super::*;

    fn overlaps(a: &Rectangle<f64>, b: &Rectangle<f64>) -> bool {
        (0..2).all(|k| {
            a.pos[k] < b.pos[k] + b.size[k] && b.pos[k] < a.pos[k] + a.size[k]
        })
    }

    #[test]
    fn test_packing_fits_unit_square() {
        let sizes = [[2.0, 1.0], [1.0, 1.0], [0.5, 3.0], [0.2, 0.2]];
        let (rects, scale) =
            pack_rectangles_with_automatic_stretching(&sizes, 0.005).unwrap();
        assert_eq!(rects.len(), sizes.len());
        assert!(scale > 0.0 && scale < 1.0 / 3.0);

        for (r, s) in rects.iter().zip(sizes.iter()) {
            assert!((r.size[0] - s[0] * scale).abs() < 1e-9);
            for k in 0..2 {
                assert!(r.pos[k] >= 0.0);
                assert!(r.pos[k] + r.size[k] <= 1.0 + 1e-6);
            }
        }
        for i in 0..rects.len() {
            for j in i + 1..rects.len() {
                assert!(!overlaps(&rects[i], &rects[j]));
            }
        }
    }

    #[test]
    fn test_single_square_fills_most_of_the_box() {
        let (rects, scale) =
            pack_rectangles_with_automatic_stretching(&[[1.0, 1.0]], 0.005)
                .unwrap();
        assert!(scale > 0.95);
        assert!(rects[0].pos[0] >= 0.005 - 1e-6);
    }

    #[test]
    fn test_nothing_to_pack() {
        assert!(pack_rectangles_with_automatic_stretching(&[], 0.005).is_none());
        assert!(
            pack_rectangles_with_automatic_stretching(&[[0.0, 0.0]], 0.005)
                .is_none()
        );
    }
}
