use std::ops::Range;

use ndarray::{Array, ArrayView, Axis, RemoveAxis, ShapeError, Slice};

use crate::error::PartitionError;

/// Computes the contiguous chunk bounds for splitting `len` elements into `parts`.
///
/// The first `len % parts` chunks receive one extra element, so chunk sizes never
/// differ by more than one and rank order matches index order.
///
/// # Errors
///
/// Returns `PartitionError` when `parts` is zero or `len < parts`: every process
/// must receive at least one element.
///
/// # Example
///
/// ```rust
/// # use ptadmm_core::partition::chunk_bounds;
///
/// let bounds = chunk_bounds(7, 3, 0).unwrap();
/// assert_eq!(bounds, vec![0..3, 3..5, 5..7]);
/// ```
pub fn chunk_bounds(len: usize, parts: usize, axis: usize) -> Result<Vec<Range<usize>>, PartitionError> {
    if parts == 0 || len < parts {
        return Err(PartitionError { axis, len, parts });
    }

    let base_chunk_size = len / parts;
    let remainder = len % parts;

    let mut bounds = Vec::with_capacity(parts);
    let mut current = 0;
    for i in 0..parts {
        let chunk_size = if i < remainder {
            base_chunk_size + 1
        } else {
            base_chunk_size
        };
        bounds.push(current..current + chunk_size);
        current += chunk_size;
    }
    Ok(bounds)
}

/// Splits an array along `axis` into `parts` owned chunks, in rank order.
pub fn split_along<A, D>(
    array: ArrayView<'_, A, D>,
    axis: Axis,
    parts: usize,
) -> Result<Vec<Array<A, D>>, PartitionError>
where
    A: Clone,
    D: RemoveAxis,
{
    let bounds = chunk_bounds(array.len_of(axis), parts, axis.index())?;
    Ok(bounds
        .into_iter()
        .map(|range| array.slice_axis(axis, Slice::from(range)).to_owned())
        .collect())
}

/// Extracts only chunk `index` of the split described by [`split_along`].
pub fn chunk_of<A, D>(
    array: ArrayView<'_, A, D>,
    axis: Axis,
    parts: usize,
    index: usize,
) -> Result<Array<A, D>, PartitionError>
where
    A: Clone,
    D: RemoveAxis,
{
    let len = array.len_of(axis);
    let bounds = chunk_bounds(len, parts, axis.index())?;
    let range = bounds
        .get(index)
        .cloned()
        .ok_or(PartitionError { axis: axis.index(), len, parts })?;
    Ok(array.slice_axis(axis, Slice::from(range)).to_owned())
}

/// Concatenates chunks along `axis` in the order given.
pub fn combine_along<A, D>(chunks: &[Array<A, D>], axis: Axis) -> Result<Array<A, D>, ShapeError>
where
    A: Clone,
    D: RemoveAxis,
{
    let views: Vec<ArrayView<'_, A, D>> = chunks.iter().map(|chunk| chunk.view()).collect();
    ndarray::concatenate(axis, &views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3};

    #[test]
    fn remainder_goes_to_earliest_chunks() {
        let sizes: Vec<usize> = chunk_bounds(7, 3, 0)
            .unwrap()
            .iter()
            .map(|r| r.len())
            .collect();
        assert_eq!(sizes, vec![3, 2, 2]);
    }

    #[test]
    fn even_split_has_equal_chunks() {
        let bounds = chunk_bounds(8, 4, 0).unwrap();
        assert_eq!(bounds, vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn axis_shorter_than_parts_is_rejected() {
        let err = chunk_bounds(2, 3, 1).unwrap_err();
        assert_eq!(err, PartitionError { axis: 1, len: 2, parts: 3 });
        assert!(chunk_bounds(5, 0, 0).is_err());
    }

    #[test]
    fn split_then_combine_is_lossless() {
        let a = Array3::from_shape_fn((5, 3, 2), |(i, j, k)| (i * 100 + j * 10 + k) as f64);
        for axis in 0..3 {
            let parts = a.len_of(Axis(axis)).min(2);
            let chunks = split_along(a.view(), Axis(axis), parts).unwrap();
            assert_eq!(chunks.len(), parts);
            let combined = combine_along(&chunks, Axis(axis)).unwrap();
            assert_eq!(combined, a);
        }
    }

    #[test]
    fn chunk_of_matches_split() {
        let a = Array1::from_iter(0..10);
        let chunks = split_along(a.view(), Axis(0), 4).unwrap();
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(&chunk_of(a.view(), Axis(0), 4, index).unwrap(), chunk);
        }
        assert!(chunk_of(a.view(), Axis(0), 4, 4).is_err());
    }
}
