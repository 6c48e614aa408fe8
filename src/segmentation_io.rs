//! Palette-indexed PNG masks.
//!
//! Segmentation masks are stored as 8-bit indexed PNGs whose pixel values are
//! class ids. The `image` crate expands palettes to RGB on decode, so masks go
//! through the `png` codec directly to keep the indices and the palette.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use ndarray::Array2;

use crate::error::{PropagationError, Result};

/// Class id -> RGB color table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
}

impl Palette {
    pub fn new(colors: Vec<[u8; 3]>) -> Result<Self> {
        if colors.is_empty() || colors.len() > 256 {
            return Err(PropagationError::invalid_input(format!(
                "palette must have 1..=256 entries, got {}",
                colors.len()
            )));
        }
        Ok(Self { colors })
    }

    /// The 256-entry PASCAL VOC palette used by DAVIS annotations.
    pub fn davis() -> Self {
        let colors = (0..256u32)
            .map(|i| {
                let (mut r, mut g, mut b) = (0u8, 0u8, 0u8);
                let mut c = i;
                for j in 0..8 {
                    r |= ((c & 1) as u8) << (7 - j);
                    g |= (((c >> 1) & 1) as u8) << (7 - j);
                    b |= (((c >> 2) & 1) as u8) << (7 - j);
                    c >>= 3;
                }
                [r, g, b]
            })
            .collect();
        Self { colors }
    }

    /// Packed `r g b r g b ...` bytes, as stored in a PNG `PLTE` chunk.
    pub fn from_rgb_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 3 != 0 {
            return Err(PropagationError::invalid_input(format!(
                "palette byte length {} is not a multiple of 3",
                bytes.len()
            )));
        }
        Self::new(bytes.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }

    /// One `r g b` triple per line, whitespace separated.
    pub fn from_text_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| PropagationError::io(path, source))?;
        let mut colors = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| PropagationError::io(path, source))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let values = line
                .split_whitespace()
                .map(|v| v.parse::<u8>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    PropagationError::invalid_input(format!(
                        "{}:{}: bad palette entry: {e}",
                        path.display(),
                        lineno + 1
                    ))
                })?;
            if values.len() != 3 {
                return Err(PropagationError::invalid_input(format!(
                    "{}:{}: expected 3 values, got {}",
                    path.display(),
                    lineno + 1,
                    values.len()
                )));
            }
            colors.push([values[0], values[1], values[2]]);
        }
        Self::new(colors)
    }

    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        self.colors.iter().flatten().copied().collect()
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// A decoded mask: `[height, width]` class ids plus the palette, if the file had one.
#[derive(Debug, Clone)]
pub struct IndexedImage {
    pub labels: Array2<u8>,
    pub palette: Option<Palette>,
}

/// Read an 8-bit indexed (or grayscale) PNG without expanding its palette.
pub fn read_indexed_png(path: &Path) -> Result<IndexedImage> {
    let decode_err = |source| PropagationError::PngDecode {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| PropagationError::io(path, source))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(decode_err)?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).map_err(decode_err)?;

    let bits = match (info.color_type, info.bit_depth) {
        (png::ColorType::Indexed | png::ColorType::Grayscale, depth)
            if depth != png::BitDepth::Sixteen =>
        {
            depth as usize
        }
        (color, depth) => {
            return Err(PropagationError::invalid_input(format!(
                "{}: segmentation must be a 2-D indexed or grayscale png of at most 8 bits, got {:?} {:?}",
                path.display(),
                color,
                depth
            )))
        }
    };

    let (width, height, stride) = (info.width as usize, info.height as usize, info.line_size);
    let labels = Array2::from_shape_fn((height, width), |(y, x)| {
        unpack_sample(&buf[y * stride..(y + 1) * stride], x, bits)
    });
    let palette = match reader.info().palette.as_ref() {
        Some(bytes) => Some(Palette::from_rgb_bytes(bytes)?),
        None => None,
    };

    Ok(IndexedImage { labels, palette })
}

/// Sample `x` of a row packed MSB-first at `bits` (1, 2, 4 or 8) bits per pixel.
fn unpack_sample(row: &[u8], x: usize, bits: usize) -> u8 {
    if bits == 8 {
        return row[x];
    }
    let per_byte = 8 / bits;
    let shift = 8 - bits * (x % per_byte + 1);
    let mask = (1u8 << bits) - 1;
    (row[x / per_byte] >> shift) & mask
}

/// Write a class map as an 8-bit indexed PNG.
pub fn write_indexed_png(path: &Path, labels: &Array2<u8>, palette: &Palette) -> Result<()> {
    let encode_err = |source| PropagationError::PngEncode {
        path: path.to_path_buf(),
        source,
    };

    if let Some(&max) = labels.iter().max() {
        if max as usize >= palette.len() {
            return Err(PropagationError::invalid_input(format!(
                "class {max} has no color in a palette of {} entries",
                palette.len()
            )));
        }
    }

    let (height, width) = labels.dim();
    let file = File::create(path).map_err(|source| PropagationError::io(path, source))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width as u32, height as u32);
    encoder.set_color(png::ColorType::Indexed);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_palette(palette.to_rgb_bytes());

    let mut writer = encoder.write_header().map_err(encode_err)?;
    let data: Vec<u8> = labels.iter().copied().collect();
    writer.write_image_data(&data).map_err(encode_err)?;
    writer.finish().map_err(encode_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_davis_palette_first_entries() {
        let palette = Palette::davis();
        assert_eq!(palette.len(), 256);
        assert_eq!(palette.colors()[0], [0, 0, 0]);
        assert_eq!(palette.colors()[1], [128, 0, 0]);
        assert_eq!(palette.colors()[2], [0, 128, 0]);
        assert_eq!(palette.colors()[3], [128, 128, 0]);
        assert_eq!(palette.colors()[4], [0, 0, 128]);
    }

    #[test]
    fn test_indexed_png_roundtrip_keeps_indices_and_palette() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let labels = array![[0u8, 1, 2], [2, 1, 0]];
        let palette = Palette::new(vec![[0, 0, 0], [255, 0, 0], [0, 255, 0]]).unwrap();

        write_indexed_png(&path, &labels, &palette).unwrap();
        let read = read_indexed_png(&path).unwrap();
        assert_eq!(read.labels, labels);
        assert_eq!(read.palette, Some(palette));
    }

    #[test]
    fn test_one_bit_indexed_mask_is_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        let palette = Palette::new(vec![[0, 0, 0], [200, 10, 10]]).unwrap();

        // 10 pixels per row so the last byte is only partly used
        let (width, height) = (10u32, 2u32);
        let mut encoder = png::Encoder::new(File::create(&path).unwrap(), width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::One);
        encoder.set_palette(palette.to_rgb_bytes());
        let mut writer = encoder.write_header().unwrap();
        // row 0: 1010110000, row 1: 0000000011
        writer
            .write_image_data(&[0b1010_1100, 0b0000_0000, 0b0000_0000, 0b1100_0000])
            .unwrap();
        writer.finish().unwrap();

        let read = read_indexed_png(&path).unwrap();
        assert_eq!(
            read.labels,
            array![
                [1u8, 0, 1, 0, 1, 1, 0, 0, 0, 0],
                [0, 0, 0, 0, 0, 0, 0, 0, 1, 1]
            ]
        );
        assert_eq!(read.palette, Some(palette));
    }

    #[test]
    fn test_unpack_four_bit_samples() {
        let row = [0x3a, 0xf0];
        let samples: Vec<u8> = (0..3).map(|x| unpack_sample(&row, x, 4)).collect();
        assert_eq!(samples, vec![3, 10, 15]);
        assert_eq!(unpack_sample(&[0b0110_1100], 2, 2), 0b11);
    }

    #[test]
    fn test_write_rejects_class_outside_palette() {
        let dir = tempfile::tempdir().unwrap();
        let palette = Palette::new(vec![[0, 0, 0], [255, 255, 255]]).unwrap();
        let res = write_indexed_png(&dir.path().join("bad.png"), &array![[0u8, 2]], &palette);
        assert!(matches!(res, Err(PropagationError::InvalidInput(_))));
    }

    #[test]
    fn test_rgb_png_is_not_a_segmentation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        image::RgbImage::new(4, 4).save(&path).unwrap();
        assert!(matches!(
            read_indexed_png(&path),
            Err(PropagationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_palette_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palette.txt");
        std::fs::write(&path, "0 0 0\n128 0 0\n\n0 128 0\n").unwrap();
        let palette = Palette::from_text_file(&path).unwrap();
        assert_eq!(palette.len(), 3);
        assert_eq!(palette, Palette::from_rgb_bytes(&[0, 0, 0, 128, 0, 0, 0, 128, 0]).unwrap());

        std::fs::write(&path, "0 0\n").unwrap();
        assert!(Palette::from_text_file(&path).is_err());
    }
}
