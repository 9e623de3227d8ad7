//! Filesystem implementation of the spider's page store, plus the default
//! image decoder.

mod decode;
mod den;

pub use decode::DefaultImageDecoder;
pub use den::SpiderDen;
