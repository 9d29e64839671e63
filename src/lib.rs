// offload-v: NMS and 2D convolution on a compute accelerator, with CPU
// reference implementations the device results are checked against.
//
// Reference: Neubeck & Van Gool — "Efficient Non-Maximum Suppression"
// (ICPR 2006)

pub mod convolution;
pub mod gpu;
pub mod image;
pub mod nms;
