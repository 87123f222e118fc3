use core::ops::Range;

use burn::tensor::{backend::Backend, Element, ElementConversion, Numeric, Tensor};

/// Pads every dimension of `tensor` with `fill_value`, `pad_width[d]` giving
/// the (before, after) amounts for dimension `d`.
pub fn pad<const D: usize, K, E, B>(
    tensor: Tensor<B, D, K>,
    pad_width: [(usize, usize); D],
    fill_value: E,
) -> Tensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
    K::Elem: Element,
    E: ElementConversion,
{
    let device = tensor.device();
    let origin_shape = tensor.dims();

    let pad_shape: [usize; D] =
        core::array::from_fn(|d| origin_shape[d] + pad_width[d].0 + pad_width[d].1);
    let assign_range: [Range<usize>; D] =
        core::array::from_fn(|d| pad_width[d].0..(pad_width[d].0 + origin_shape[d]));

    Tensor::<B, D, K>::full(pad_shape, fill_value, &device).slice_assign(assign_range, tensor)
}

/// Shifts a `[batch, width]` tensor `steps` positions to the right along the
/// last dimension, filling the vacated columns with `fill_value`. The width is
/// unchanged.
pub fn shift_right<B: Backend>(tensor: Tensor<B, 2>, steps: usize, fill_value: f32) -> Tensor<B, 2> {
    let [batch_size, width] = tensor.dims();
    if steps == 0 {
        return tensor;
    }
    if steps >= width {
        return Tensor::full([batch_size, width], fill_value, &tensor.device());
    }

    let kept = tensor.slice([0..batch_size, 0..(width - steps)]);
    pad(kept, [(0, 0), (steps, 0)], fill_value)
}
