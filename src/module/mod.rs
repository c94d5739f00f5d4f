pub mod conv2d_norm;
pub mod deconv2d_norm;
