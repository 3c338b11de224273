//! Shape and stride arithmetic.
//!
//! Shapes are ordered dimension sizes, strides are per-dimension element
//! offsets into storage. Nothing here allocates storage or knows about dtypes.

/// Number of elements described by `shape`. The empty shape is a scalar.
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for `shape`: the last dimension has stride 1 and every
/// preceding stride is the product of all following sizes.
pub fn default_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1;
    for (stride, &dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc *= dim;
    }
    strides
}

/// Whether `strides` is exactly the row-major layout of `shape`.
pub fn is_contiguous(shape: &[usize], strides: &[usize]) -> bool {
    shape.len() == strides.len() && default_strides(shape) == strides
}

/// Number of storage elements a view touches: its largest reachable offset
/// plus one, or zero when the view is empty.
pub fn storage_span(shape: &[usize], strides: &[usize]) -> usize {
    if shape.contains(&0) {
        return 0;
    }
    shape
        .iter()
        .zip(strides)
        .map(|(&dim, &stride)| (dim - 1) * stride)
        .sum::<usize>()
        + 1
}

/// Storage offset of the element at logical position `index`.
pub(crate) fn offset_of(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Advances a row-major multi-index by one position. Returns `false` once
/// the index wraps past the last element.
pub(crate) fn next_index(index: &mut [usize], shape: &[usize]) -> bool {
    for axis in (0..shape.len()).rev() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}
