//! Audio collaborators: formats, buffers, and the decoder, device, and
//! converter interfaces, with symphonia and cpal reference backends

pub mod buffer;
pub mod converter;
pub mod decoder;
pub mod device;
pub mod file_decoder;
pub mod format;
pub mod output_cpal;

pub use buffer::PcmChunk;
pub use format::PcmFormat;
