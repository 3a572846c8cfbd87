use thiserror::Error;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl ImageLimits {
    pub fn new(min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            min_bytes,
            max_bytes,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Image too small - minimum {} required", human_size(.min))]
    TooSmall { size: usize, min: usize },
    #[error("Image too large - maximum {} allowed", human_size(.max))]
    TooLarge { max: usize },
    #[error("Invalid JPEG format")]
    InvalidFormat,
    #[error("Failed to read request body: {0}")]
    Unreadable(String),
}

/// `1000` -> `1KB`, `10485760` -> `10MB`.
fn human_size(bytes: &usize) -> String {
    const MIB: usize = 1024 * 1024;
    let bytes = *bytes;
    if bytes >= MIB {
        format!("{}MB", bytes / MIB)
    } else if bytes >= 1000 {
        format!("{}KB", bytes / 1000)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Cheap structural check run before any decode work. Interior corruption is
/// only caught when the image is decoded.
pub fn validate_jpeg(data: &[u8], limits: ImageLimits) -> Result<(), PayloadError> {
    if data.len() < limits.min_bytes {
        return Err(PayloadError::TooSmall {
            size: data.len(),
            min: limits.min_bytes,
        });
    }
    if data.len() > limits.max_bytes {
        return Err(PayloadError::TooLarge {
            max: limits.max_bytes,
        });
    }
    if !(data.starts_with(&JPEG_SOI) && data.ends_with(&JPEG_EOI)) {
        return Err(PayloadError::InvalidFormat);
    }
    Ok(())
}
