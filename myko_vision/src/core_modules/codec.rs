// THEORY:
// The frame codec is the only place that knows about the wire format. A frame
// travels as a base64 string holding a JPEG (or PNG) file, optionally prefixed
// with a `data:image/...;base64,` header. Decoding yields an owned `RgbImage`;
// encoding always produces a bare base64 JPEG.
//
// The codec is pure and stateless, so it is safe to call from any worker.

pub mod codec {
    use crate::core_modules::contour::FrameDims;
    use crate::error::CodecError;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, ImageEncoder, ImageFormat, RgbImage};

    /// A decoded raster. Owned by whichever stage currently holds it.
    #[derive(Debug, Clone)]
    pub struct Frame {
        pub image: RgbImage,
    }

    impl Frame {
        pub fn new(image: RgbImage) -> Self {
            Self { image }
        }

        pub fn dims(&self) -> FrameDims {
            FrameDims::of(&self.image)
        }

        pub fn into_image(self) -> RgbImage {
            self.image
        }
    }

    /// Drops a `data:<mime>;base64,` header if one is present.
    pub fn strip_data_uri(payload: &str) -> &str {
        let trimmed = payload.trim();
        if trimmed.starts_with("data:") {
            match trimmed.split_once(',') {
                Some((_, body)) => body,
                None => "",
            }
        } else {
            trimmed
        }
    }

    pub fn decode(payload: &str) -> Result<Frame, CodecError> {
        let body = strip_data_uri(payload);
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        let bytes = BASE64.decode(body.as_bytes())?;
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        let image = image::load_from_memory(&bytes)?.to_rgb8();
        Ok(Frame::new(image))
    }

    /// Identifies the image format from the file signature without decoding
    /// pixels.
    pub fn sniff(payload: &str) -> Result<ImageFormat, CodecError> {
        let body = strip_data_uri(payload);
        if body.is_empty() {
            return Err(CodecError::Empty);
        }
        let bytes = BASE64.decode(body.as_bytes())?;
        Ok(image::guess_format(&bytes)?)
    }

    /// Encodes as a bare base64 JPEG at the given quality (1..=100).
    pub fn encode(image: &RgbImage, quality: u8) -> Result<String, CodecError> {
        let (width, height) = image.dimensions();
        let mut bytes = Vec::with_capacity((width * height) as usize / 4);
        let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder.write_image(image.as_raw(), width, height, ExtendedColorType::Rgb8)?;
        Ok(BASE64.encode(bytes))
    }

    /// Lossless PNG variant, handy for tests and the offline tester.
    pub fn encode_png(image: &RgbImage) -> Result<String, CodecError> {
        let (width, height) = image.dimensions();
        let mut bytes = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut bytes);
        encoder.write_image(image.as_raw(), width, height, ExtendedColorType::Rgb8)?;
        Ok(BASE64.encode(bytes))
    }
}
