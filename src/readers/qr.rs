//! QR code reading with morphological recovery for degraded scans.

use image::{DynamicImage, GrayImage};
use tracing::debug;

use super::morphology::{binarize_inverted, close_rect, invert, open_rect};
use super::CodeReader;
use crate::config::CodeReaderConfig;

/// Decodes the QR code printed on each page.
///
/// The page is first decoded as scanned. If that fails, it is binarized and
/// each opening and closing with kernels up to the configured bound is tried
/// in turn until one decodes. Kernel sides are odd: `1, 3, 5, ...`.
pub struct QrCodeReader {
    threshold: u8,
    max_kernel: (u32, u32),
}

impl QrCodeReader {
    pub fn new(config: &CodeReaderConfig) -> Self {
        Self {
            threshold: config.threshold,
            max_kernel: (config.max_kernel_width.max(1), config.max_kernel_height.max(1)),
        }
    }

    /// The page itself followed by every enhanced variant, lazily.
    fn candidates<'a>(&'a self, gray: &'a GrayImage) -> impl Iterator<Item = GrayImage> + 'a {
        let (max_w, max_h) = self.max_kernel;
        let binary = binarize_inverted(gray, self.threshold);

        let kernels = (1..=max_w)
            .step_by(2)
            .flat_map(move |w| (1..=max_h).step_by(2).map(move |h| (w, h)));
        let enhanced = kernels.flat_map(move |(w, h)| {
            let mut opened = open_rect(&binary, w, h);
            invert(&mut opened);
            let mut closed = close_rect(&binary, w, h);
            invert(&mut closed);
            [opened, closed]
        });

        std::iter::once(gray.clone()).chain(enhanced)
    }
}

impl Default for QrCodeReader {
    fn default() -> Self {
        Self::new(&CodeReaderConfig::default())
    }
}

impl CodeReader for QrCodeReader {
    fn name(&self) -> &str {
        "qr"
    }

    fn read_code(&self, image: &DynamicImage) -> Option<String> {
        let gray = image.to_luma8();
        for (attempt, candidate) in self.candidates(&gray).enumerate() {
            if let Some(payload) = decode(candidate) {
                if attempt > 0 {
                    debug!("QR decoded after {} enhancement attempts", attempt);
                }
                return Some(payload);
            }
        }
        None
    }
}

fn decode(image: GrayImage) -> Option<String> {
    let mut prepared = rqrr::PreparedImage::prepare(image);
    prepared
        .detect_grids()
        .into_iter()
        .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
}
