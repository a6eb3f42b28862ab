use ndarray::Array4;

use super::frames::RgbFrame;

// ImageNet statistics the backbone was trained with
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Convert a packed RGB frame into a normalized `1x3xHxW` tensor.
pub fn to_input_tensor(frame: &RgbFrame) -> Array4<f32> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        let v = frame.data[(y * w + x) * 3 + c] as f32 / 255.0;
        (v - MEAN[c]) / STD[c]
    })
}
