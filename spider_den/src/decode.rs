use spider_core::ImageDecoder;

/// Decodes downloaded pages with the `image` crate, sniffing the format
/// from the bytes.
pub struct DefaultImageDecoder;

impl ImageDecoder for DefaultImageDecoder {
    fn decode(&self, data: &[u8]) -> Option<image::DynamicImage> {
        image::load_from_memory(data).ok()
    }
}
