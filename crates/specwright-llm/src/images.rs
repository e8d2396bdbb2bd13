//! Multimodal image resolution
//!
//! Image entries arrive as local paths, data URIs or remote URLs. Each is
//! resolved independently to an outcome value; a bad image is skipped, never
//! an error, so asset problems cannot fail a call.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use tracing::debug;

/// Image file extensions accepted for local inlining
const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

/// Outcome of resolving one image entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResolution {
    /// Inlined as a base64 data URI
    Inline {
        /// The `data:` URI carrying the image
        data_uri: String,
    },
    /// Passed through as a remote URL for the provider to fetch
    Remote {
        /// The remote URL
        url: String,
    },
    /// Not usable; the call proceeds without it
    Skipped {
        /// Why the entry was skipped
        reason: String,
    },
}

impl ImageResolution {
    /// The URL to place in an image part, when the entry resolved
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Inline { data_uri } => Some(data_uri),
            Self::Remote { url } => Some(url),
            Self::Skipped { .. } => None,
        }
    }
}

fn media_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, media_type)| *media_type)
}

/// Resolve one image entry. Never fails; unusable entries come back as
/// `Skipped` with a reason.
#[must_use]
pub fn resolve_image(source: &str, max_bytes: usize) -> ImageResolution {
    let source = source.trim();
    if source.is_empty() {
        return ImageResolution::Skipped {
            reason: "empty image entry".to_string(),
        };
    }

    if let Some(rest) = source.strip_prefix("data:") {
        if !rest.starts_with("image/") {
            return ImageResolution::Skipped {
                reason: "data URI is not an image".to_string(),
            };
        }
        // Base64 payload is ~4/3 of the decoded size
        let payload_len = rest.rfind(',').map_or(0, |i| rest.len() - i - 1);
        if payload_len / 4 * 3 > max_bytes {
            return ImageResolution::Skipped {
                reason: format!("data URI exceeds {max_bytes} bytes"),
            };
        }
        return ImageResolution::Inline {
            data_uri: source.to_string(),
        };
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        return ImageResolution::Remote {
            url: source.to_string(),
        };
    }

    let path = Path::new(source);
    let Some(media_type) = media_type_for(path) else {
        return ImageResolution::Skipped {
            reason: format!("not an image file: {source}"),
        };
    };
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() > max_bytes => ImageResolution::Skipped {
            reason: format!("image exceeds {max_bytes} bytes: {source}"),
        },
        Ok(bytes) => ImageResolution::Inline {
            data_uri: format!("data:{media_type};base64,{}", STANDARD.encode(bytes)),
        },
        Err(e) => ImageResolution::Skipped {
            reason: format!("unreadable image {source}: {e}"),
        },
    }
}

/// Resolve a batch of image entries, keeping at most `max_images` usable
/// ones. Skips are logged and dropped.
#[must_use]
pub fn resolve_images(sources: &[String], max_images: usize, max_bytes: usize) -> Vec<String> {
    let mut urls = Vec::new();
    for source in sources {
        if urls.len() >= max_images {
            break;
        }
        match resolve_image(source, max_bytes) {
            ImageResolution::Skipped { reason } => {
                debug!(reason, "image entry skipped");
            }
            resolved => {
                if let Some(url) = resolved.url() {
                    urls.push(url.to_string());
                }
            }
        }
    }
    urls
}
