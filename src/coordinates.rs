use crate::Float;

/// 1D continuous coordinate.
pub type SpaceCoordinate = Float;
/// 1D discrete bin index. Signed because ghost spans may reach past either end of the mesh.
pub type BinIndex = isize;
/// Flat rank of a process in the group.
pub type Rank = usize;

/// Return one past the index of the bin containing `coord`.
///
/// Bins are half-open, `[edges[i], edges[i + 1])`. This counts the edges `<= coord`, so a
/// coordinate below the first edge gives 0 and one at or above the last edge gives
/// `edges.len()`. Subtract one to get the bin itself (`-1` below the domain).
///
/// `edges` must be non-decreasing.
pub fn bin_upper_from_coordinate(coord: SpaceCoordinate, edges: &[Float]) -> BinIndex {
    edges.partition_point(|&edge| edge <= coord) as BinIndex
}

/// Index of the bin containing `coord` on a periodic axis, counted across periods.
///
/// The bins repeat every `edges[last] - edges[0]`, so the result is unbounded: `-1` is the last
/// bin of the period below the domain and `edges.len() - 1` the first bin of the period above.
pub fn periodic_bin_from_coordinate(coord: SpaceCoordinate, edges: &[Float]) -> BinIndex {
    let n_bins = edges.len() as BinIndex - 1;
    let (first, last) = (edges[0], edges[edges.len() - 1]);
    let period = last - first;
    if period <= 0. {
        return bin_upper_from_coordinate(coord, edges) - 1;
    }

    let turns = ((coord - first) / period).floor();
    let local = coord - turns * period;
    // Rounding can leave `local` a hair outside its period.
    let bin = (bin_upper_from_coordinate(local, edges) - 1).clamp(0, n_bins - 1);
    bin + turns as BinIndex * n_bins
}

/// Wrap a bin index into `[0, n_bins)`.
pub fn wrap_bin(bin: BinIndex, n_bins: usize) -> usize {
    bin.rem_euclid(n_bins as BinIndex) as usize
}

/// Map a mesh coordinate to its flat rank. The last dimension varies fastest.
///
/// # Panics
/// Panics in debug builds if `coord` and `shape` differ in length or a component is out of range.
pub fn ravel_coordinate(coord: &[usize], shape: &[usize]) -> Rank {
    debug_assert_eq!(coord.len(), shape.len());
    coord.iter().zip(shape).fold(0, |rank, (&c, &n)| {
        debug_assert!(c < n, "coordinate {c} outside mesh extent {n}");
        rank * n + c
    })
}

/// Inverse of [ravel_coordinate].
pub fn unravel_rank(rank: Rank, shape: &[usize]) -> Vec<usize> {
    let mut coord = vec![0; shape.len()];
    let mut rest = rank;
    for (c, &n) in coord.iter_mut().zip(shape).rev() {
        *c = rest % n;
        rest /= n;
    }
    coord
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bin_upper_half_open() {
        let edges = [0., 1., 2., 3.];
        assert_eq!(0, bin_upper_from_coordinate(-0.5, &edges));
        assert_eq!(1, bin_upper_from_coordinate(0., &edges));
        assert_eq!(1, bin_upper_from_coordinate(0.99, &edges));
        // An exact edge value belongs to the bin on its right.
        assert_eq!(2, bin_upper_from_coordinate(1., &edges));
        assert_eq!(4, bin_upper_from_coordinate(3., &edges));
        assert_eq!(4, bin_upper_from_coordinate(7., &edges));
    }

    #[test]
    fn test_periodic_bin_counts_periods() {
        let edges = [0., 1., 2., 3.];
        assert_eq!(0, periodic_bin_from_coordinate(0., &edges));
        assert_eq!(2, periodic_bin_from_coordinate(2.5, &edges));
        assert_eq!(3, periodic_bin_from_coordinate(3., &edges));
        assert_eq!(-1, periodic_bin_from_coordinate(-0.5, &edges));
        assert_eq!(-2, periodic_bin_from_coordinate(-1.5, &edges));
        assert_eq!(-4, periodic_bin_from_coordinate(-3.5, &edges));
        assert_eq!(7, periodic_bin_from_coordinate(7.2, &edges));
    }

    #[test]
    fn test_periodic_bin_with_offset_edges() {
        // Period 2, shifted by 1.
        let edges = [1., 1.5, 3.];
        assert_eq!(0, periodic_bin_from_coordinate(1.2, &edges));
        assert_eq!(-1, periodic_bin_from_coordinate(0.9, &edges));
        assert_eq!(-2, periodic_bin_from_coordinate(-0.8, &edges));
        assert_eq!(3, periodic_bin_from_coordinate(3.6, &edges));
    }

    #[test]
    fn test_wrap_bin() {
        assert_eq!(2, wrap_bin(-1, 3));
        assert_eq!(0, wrap_bin(3, 3));
        assert_eq!(1, wrap_bin(1, 3));
    }

    #[test]
    fn test_last_dimension_fastest() {
        let shape = [2, 3];
        let coords: Vec<_> = (0..6).map(|r| unravel_rank(r, &shape)).collect();
        assert_eq!(
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ],
            coords
        );
    }

    #[test]
    fn test_ravel_inverts_unravel() {
        let shape = [3, 1, 4];
        for rank in 0..12 {
            assert_eq!(rank, ravel_coordinate(&unravel_rank(rank, &shape), &shape));
        }
    }
}
