//! Geometry of the ring world `[-1, 1]` and nearest-entity lookups on sorted positions.

/// Fold a raw position difference back into `[-1, 1]`.
///
/// Deltas above 1 are shifted by the ring length; deltas below -1 are mirrored.
pub fn fold_delta(d: f64) -> f64 {
    if d > 1.0 {
        d - 2.0
    } else if d < -1.0 {
        -d - 1.0
    } else {
        d
    }
}

/// Fold a position that left `[-1, 1]` after a displacement back onto the ring.
///
/// Only one fold is applied at each end, so a displacement longer than the
/// ring can leave the result outside `[-1, 1]`.
pub fn fold_position(mut x: f64) -> f64 {
    if x > 1.0 {
        x = 1.0 - x;
    }
    if x < -1.0 {
        x = -x - 1.0;
    }
    x
}

/// Linearly map `x` from `[a, b]` to `[c, d]`.
pub fn map_range(x: f64, (a, b): (f64, f64), (c, d): (f64, f64)) -> f64 {
    (x - a) / (b - a) * (d - c) + c
}

/// Nearest item of `sorted_x` to position `x`, as `(index, folded signed distance)`.
///
/// The scan starts at `cursor`, which must not lie past the predecessor of `x`.
/// On return `cursor` points at that predecessor, so a pass over increasing
/// positions visits every item a bounded number of times.
/// Returns `None` when there are no items.
pub fn nearest_sorted(sorted_x: &[f64], x: f64, cursor: &mut usize) -> Option<(usize, f64)> {
    let n_items = sorted_x.len();
    if n_items == 0 {
        return None;
    }

    let start = (*cursor).min(n_items - 1);
    let i_ahead = (start..n_items).find(|&i| sorted_x[i] > x);
    let (i_ahead, i_behind) = match i_ahead {
        Some(i) => {
            *cursor = i.saturating_sub(1);
            (i, (i + n_items - 1) % n_items)
        }
        None => {
            *cursor = n_items - 1;
            (0, n_items - 1)
        }
    };

    let d_ahead = fold_delta(sorted_x[i_ahead] - x);
    let d_behind = fold_delta(sorted_x[i_behind] - x);
    if d_ahead.abs() < d_behind.abs() {
        Some((i_ahead, d_ahead))
    } else {
        Some((i_behind, d_behind))
    }
}

/// Closer of the two index-adjacent entries around `i` (wrapping at both ends),
/// as `(index, folded signed distance)`. Needs at least two entries.
pub fn nearest_neighbor(x_of: impl Fn(usize) -> f64, i: usize, len: usize) -> Option<(usize, f64)> {
    if len < 2 || i >= len {
        return None;
    }
    let x = x_of(i);
    let i_next = (i + 1) % len;
    let i_prev = (i + len - 1) % len;
    let d_next = fold_delta(x_of(i_next) - x);
    let d_prev = fold_delta(x_of(i_prev) - x);
    if d_next.abs() < d_prev.abs() {
        Some((i_next, d_next))
    } else {
        Some((i_prev, d_prev))
    }
}

/// Mutable references to two distinct elements of a slice.
pub fn pair_mut<T>(slice: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    assert_ne!(i, j, "indices must be distinct");
    if i < j {
        let (head, tail) = slice.split_at_mut(j);
        (&mut head[i], &mut tail[0])
    } else {
        let (head, tail) = slice.split_at_mut(i);
        (&mut tail[0], &mut head[j])
    }
}
