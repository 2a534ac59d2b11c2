//! Best-effort preview images for finished renders.

use std::path::{Path, PathBuf};

use image::ImageFormat;

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMBNAIL_MAX_EDGE: u32 = 512;

/// `<dir>/<stem>_thumb.jpg` next to `source`.
pub fn thumbnail_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    source.with_file_name(format!("{stem}_thumb.jpg"))
}

/// Write a JPEG thumbnail that fits in 512x512 next to `source`.
///
/// Decoding and encoding run on the blocking pool. Any failure is logged
/// and yields `None`; a missing thumbnail never fails a job.
pub async fn generate_thumbnail(source: &Path) -> Option<PathBuf> {
    let source = source.to_path_buf();
    let task_source = source.clone();
    match tokio::task::spawn_blocking(move || render_thumbnail(&task_source)).await {
        Ok(Ok(path)) => Some(path),
        Ok(Err(e)) => {
            tracing::warn!(source = %source.display(), error = %e, "Thumbnail generation failed");
            None
        }
        Err(e) => {
            tracing::warn!(source = %source.display(), error = %e, "Thumbnail task aborted");
            None
        }
    }
}

fn render_thumbnail(source: &Path) -> Result<PathBuf, image::ImageError> {
    let decoded = image::open(source)?;
    let thumb = decoded.thumbnail(THUMBNAIL_MAX_EDGE, THUMBNAIL_MAX_EDGE);
    let dest = thumbnail_path(source);
    // JPEG has no alpha channel.
    thumb.to_rgb8().save_with_format(&dest, ImageFormat::Jpeg)?;
    Ok(dest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use image::{GenericImageView, RgbImage};

    use super::*;

    #[test]
    fn thumbnail_sits_next_to_source() {
        assert_eq!(
            thumbnail_path(Path::new("/renders/shirt_front.png")),
            PathBuf::from("/renders/shirt_front_thumb.jpg")
        );
    }

    #[tokio::test]
    async fn large_render_is_downsized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("wide.png");
        RgbImage::from_pixel(1024, 256, image::Rgb([200, 40, 40]))
            .save(&source)
            .expect("write png");

        let thumb = generate_thumbnail(&source).await.expect("thumbnail");
        assert_eq!(thumb, dir.path().join("wide_thumb.jpg"));

        let decoded = image::open(&thumb).expect("decode thumbnail");
        assert_eq!(decoded.dimensions(), (512, 128));
    }

    #[tokio::test]
    async fn undecodable_file_yields_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("broken.png");
        std::fs::write(&source, b"not an image").expect("write");
        assert!(generate_thumbnail(&source).await.is_none());
    }
}
