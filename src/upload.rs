use axum::extract::Multipart;

use crate::models::{AnalysisRequest, UploadedImage};

pub const IMAGE_FIELD: &str = "images";
const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("No images received.")]
    Empty,
    #[error("You can upload up to {max} images only.")]
    TooMany { max: usize },
    #[error("{0}")]
    Multipart(String),
}

/// Reads every `images` part of the form, in order. Other parts are ignored.
pub async fn collect_images(
    mut multipart: Multipart,
    max_images: usize,
) -> Result<AnalysisRequest, UploadError> {
    let mut images = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Multipart(e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        if images.len() == max_images {
            return Err(UploadError::TooMany { max: max_images });
        }

        let mime = field
            .content_type()
            .filter(|mime| mime.starts_with("image/"))
            .unwrap_or(DEFAULT_MIME)
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| UploadError::Multipart(e.body_text()))?;

        images.push(UploadedImage {
            bytes: bytes.to_vec(),
            mime,
        });
    }

    if images.is_empty() {
        return Err(UploadError::Empty);
    }
    Ok(AnalysisRequest { images })
}
