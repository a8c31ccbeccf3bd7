// SPDX-License-Identifier: GPL-3.0-only

//! Still frame encoding
//!
//! - JPEG re-encoding with quality control (stacked HDR output)
//! - DNG wrapping of 16-bit sensor data

use image::RgbImage;
use std::io::{Cursor, Write};
use std::sync::Arc;
use tracing::debug;

/// Supported output formats of the still consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Bytes as delivered by the hardware encoder
    #[default]
    Jpeg,
    /// Raw sensor dump
    Raw,
    /// 16-bit sensor data wrapped as DNG
    Dng,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Raw => "raw",
            OutputFormat::Dng => "dng",
        }
    }
}

/// TIFF/EP photometric interpretation for colour filter array data
const PHOTOMETRIC_CFA: u16 = 32803;

/// Sensor mosaic as CFA colour indices (0 red, 1 green, 2 blue)
const CFA_PATTERN_RGGB: [u8; 4] = [0, 1, 1, 2];

/// Capture metadata written into DNG files
#[derive(Debug, Clone, Default)]
pub struct CameraMetadata {
    /// Camera name, e.g. "pano-rig camera 0"
    pub camera_name: Option<String>,
    /// Exposure time in seconds
    pub exposure_time: Option<f64>,
    pub iso: Option<u32>,
}

impl CameraMetadata {
    pub fn from_exposure_ns(camera_name: Option<String>, exposure_ns: Option<u64>, iso: Option<u32>) -> Self {
        Self {
            camera_name,
            exposure_time: exposure_ns.map(|ns| ns as f64 / 1_000_000_000.0),
            iso,
        }
    }
}

/// Encode an RGB image as JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);

    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100));
    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| format!("JPEG encoding failed: {}", e))?;

    debug!(size = buffer.len(), quality, "JPEG encoded");
    Ok(buffer)
}

/// Wrap little-endian 16-bit sensor samples as a single-plane DNG
pub fn encode_dng(
    data: &[u8],
    width: u32,
    height: u32,
    metadata: &CameraMetadata,
) -> Result<Vec<u8>, String> {
    use dng::ifd::{Ifd, IfdValue, Offsets};
    use dng::tags::ifd as tiff_tags;
    use dng::{DngWriter, FileType};

    let expected = width as usize * height as usize * 2;
    if data.len() < expected {
        return Err(format!(
            "RAW16 buffer too small: {} bytes for {}x{}",
            data.len(),
            width,
            height
        ));
    }
    let raw_data = data[..expected].to_vec();

    let mut ifd = Ifd::default();
    ifd.insert(tiff_tags::ImageWidth, IfdValue::Long(width));
    ifd.insert(tiff_tags::ImageLength, IfdValue::Long(height));
    ifd.insert(tiff_tags::BitsPerSample, IfdValue::Short(16));
    ifd.insert(tiff_tags::Compression, IfdValue::Short(1));
    // Bayer mosaic, one sample per photosite
    ifd.insert(tiff_tags::PhotometricInterpretation, IfdValue::Short(PHOTOMETRIC_CFA));
    ifd.insert(tiff_tags::SamplesPerPixel, IfdValue::Short(1));
    ifd.insert(tiff_tags::CFARepeatPatternDim, [2u16, 2]);
    ifd.insert(tiff_tags::CFAPattern, CFA_PATTERN_RGGB);
    ifd.insert(tiff_tags::RowsPerStrip, IfdValue::Long(height));
    ifd.insert(tiff_tags::PlanarConfiguration, IfdValue::Short(1));
    ifd.insert(
        tiff_tags::Software,
        IfdValue::Ascii(format!("pano-rig v{}", env!("CARGO_PKG_VERSION"))),
    );

    if let Some(camera_name) = &metadata.camera_name {
        ifd.insert(tiff_tags::Make, IfdValue::Ascii("pano-rig".to_string()));
        ifd.insert(tiff_tags::Model, IfdValue::Ascii(camera_name.clone()));
    }

    if let Some(exposure_time) = metadata.exposure_time {
        let numerator = (exposure_time * 1_000_000.0).round() as u32;
        let denominator = 1_000_000u32;
        let gcd = gcd(numerator, denominator);
        ifd.insert(
            tiff_tags::ExposureTime,
            IfdValue::Rational(numerator / gcd, denominator / gcd),
        );
    }

    if let Some(iso) = metadata.iso {
        ifd.insert(
            tiff_tags::ISOSpeedRatings,
            IfdValue::Short(iso.min(65535) as u16),
        );
    }

    struct SensorOffsets {
        data: Vec<u8>,
    }

    impl Offsets for SensorOffsets {
        fn size(&self) -> u32 {
            self.data.len() as u32
        }

        fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
            writer.write_all(&self.data)
        }
    }

    let byte_count = raw_data.len() as u32;
    let offsets: Arc<dyn Offsets + Send + Sync> = Arc::new(SensorOffsets { data: raw_data });
    ifd.insert(tiff_tags::StripOffsets, IfdValue::Offsets(offsets));
    ifd.insert(tiff_tags::StripByteCounts, IfdValue::Long(byte_count));

    let mut buffer = Vec::new();
    DngWriter::write_dng(Cursor::new(&mut buffer), true, FileType::Dng, vec![ifd])
        .map_err(|e| format!("DNG encoding failed: {:?}", e))?;

    debug!(size = buffer.len(), width, height, "DNG encoded");
    Ok(buffer)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions() {
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!(OutputFormat::Raw.extension(), "raw");
        assert_eq!(OutputFormat::Dng.extension(), "dng");
    }

    #[test]
    fn test_jpeg_decodes_back() {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([200, 100, 50]));
        let data = encode_jpeg(&image, 90).unwrap();
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
    }

    #[test]
    fn test_dng_rejects_short_buffer() {
        let metadata = CameraMetadata::default();
        assert!(encode_dng(&[0u8; 10], 4, 4, &metadata).is_err());
    }

    #[test]
    fn test_dng_describes_bayer_mosaic() {
        use dng::DngReader;
        use dng::tags::{IfdFieldDescriptor, MaybeKnownIfdFieldDescriptor, ifd as tiff_tags};

        let data = vec![0u8; 4 * 4 * 2];
        let dng = encode_dng(&data, 4, 4, &CameraMetadata::default()).unwrap();
        let reader = DngReader::read(Cursor::new(dng)).unwrap();
        let ifd = reader.first_ifd();

        let values = |tag: IfdFieldDescriptor| -> Vec<u32> {
            ifd.entries()
                .iter()
                .find(|entry| entry.tag == MaybeKnownIfdFieldDescriptor::from(tag))
                .map(|entry| entry.value.as_list().filter_map(|v| v.as_u32()).collect())
                .unwrap_or_default()
        };
        assert_eq!(values(tiff_tags::PhotometricInterpretation), vec![32803]);
        assert_eq!(values(tiff_tags::CFARepeatPatternDim), vec![2, 2]);
        assert_eq!(values(tiff_tags::CFAPattern), vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_exposure_metadata() {
        let metadata = CameraMetadata::from_exposure_ns(None, Some(10_000_000), Some(200));
        assert_eq!(metadata.exposure_time, Some(0.01));
        assert_eq!(gcd(10_000, 1_000_000), 10_000);
    }
}
