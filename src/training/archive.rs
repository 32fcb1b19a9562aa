//! Packaging of captioned images into a gzip-compressed tar archive.
//!
//! Entries are numbered pairs: `000.png` with its caption in `000.txt`,
//! `001.png` / `001.txt`, and so on. The layout is what trainers expecting
//! a "folder of images with sidecar captions" consume. Archives over the
//! upload limit are rebuilt with downscaled JPEG images (`000.jpg`).

use flate2::write::GzEncoder;
use flate2::Compression;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use tar::{Builder, Header};
use tracing::{debug, info};

use crate::error::TrainingError;

/// One image and the caption it is trained with.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub image_id: String,
    pub bytes: Vec<u8>,
    pub caption: String,
}

/// Re-encoding steps tried in order when the archive is over the limit:
/// longest edge in pixels, then JPEG quality.
const RECOMPRESS_LADDER: &[(u32, u8)] = &[
    (1024, 90),
    (1024, 80),
    (768, 75),
    (768, 60),
    (512, 60),
    (512, 45),
    (384, 40),
];

/// Builds the training archive, keeping it within `max_bytes`.
///
/// Images go in as-is when they fit. Otherwise every image is decoded and
/// re-encoded as JPEG down [`RECOMPRESS_LADDER`] until the archive fits;
/// `ArchiveTooLarge` means even the last step was too big.
pub fn build_archive(entries: &[ArchiveEntry], max_bytes: u64) -> Result<Vec<u8>, TrainingError> {
    if entries.is_empty() {
        return Err(TrainingError::EmptyDataset);
    }
    if let Some(entry) = entries.iter().find(|e| e.caption.trim().is_empty()) {
        return Err(TrainingError::MissingCaption(entry.image_id.clone()));
    }

    let archive = pack(entries.iter().map(|e| (e.bytes.as_slice(), e.caption.as_str())), "png")?;
    if archive.len() as u64 <= max_bytes {
        return Ok(archive);
    }

    let decoded = entries
        .iter()
        .map(|entry| {
            image::load_from_memory(&entry.bytes).map_err(|source| TrainingError::ImageCodec {
                image_id: entry.image_id.clone(),
                source,
            })
        })
        .collect::<Result<Vec<DynamicImage>, TrainingError>>()?;

    let mut size = archive.len() as u64;
    for &(max_edge, quality) in RECOMPRESS_LADDER {
        let mut images = Vec::with_capacity(entries.len());
        for (entry, image) in entries.iter().zip(&decoded) {
            images.push(recompress(&entry.image_id, image, max_edge, quality)?);
        }

        let archive = pack(
            images
                .iter()
                .zip(entries)
                .map(|(bytes, e)| (bytes.as_slice(), e.caption.as_str())),
            "jpg",
        )?;
        debug!(
            max_edge = max_edge,
            quality = quality,
            archive_bytes = archive.len(),
            limit = max_bytes,
            "Recompressed training images"
        );
        size = archive.len() as u64;
        if size <= max_bytes {
            info!(
                max_edge = max_edge,
                quality = quality,
                archive_bytes = size,
                "Training images recompressed to fit upload limit"
            );
            return Ok(archive);
        }
    }

    Err(TrainingError::ArchiveTooLarge {
        size,
        limit: max_bytes,
    })
}

fn pack<'a>(
    entries: impl Iterator<Item = (&'a [u8], &'a str)>,
    extension: &str,
) -> Result<Vec<u8>, TrainingError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::best());
    let mut builder = Builder::new(encoder);

    for (idx, (bytes, caption)) in entries.enumerate() {
        append(&mut builder, &format!("{:03}.{}", idx, extension), bytes)?;
        append(&mut builder, &format!("{:03}.txt", idx), caption.as_bytes())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append(
    builder: &mut Builder<GzEncoder<Vec<u8>>>,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

/// Downscales to `max_edge` if needed and encodes as RGB JPEG.
fn recompress(
    image_id: &str,
    image: &DynamicImage,
    max_edge: u32,
    quality: u8,
) -> Result<Vec<u8>, TrainingError> {
    let (width, height) = image.dimensions();
    let longest_edge = width.max(height);

    let rgb = if longest_edge > max_edge {
        let scale = max_edge as f32 / longest_edge as f32;
        let target_width = ((width as f32 * scale).round() as u32).max(1);
        let target_height = ((height as f32 * scale).round() as u32).max(1);
        image
            .resize(target_width, target_height, FilterType::CatmullRom)
            .to_rgb8()
    } else {
        image.to_rgb8()
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|source| TrainingError::ImageCodec {
            image_id: image_id.to_string(),
            source,
        })?;
    Ok(buffer)
}
