//! Rectangular-kernel morphology on binary (0/255) images.
//!
//! A `width x height` kernel is centered on each pixel, so even sides round
//! up to the next odd length. Erosion keeps a pixel white only when its whole
//! window is white, which is when the window mean from
//! [`imageproc::filter::box_filter`] is exactly 255; dilation is the
//! complement of the erosion of the complement.

use image::GrayImage;
use imageproc::filter::box_filter;

/// Binary image with ink (pixels at or below `threshold`) white on black.
pub fn binarize_inverted(image: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = imageproc::contrast::threshold(image, threshold);
    invert(&mut out);
    out
}

pub fn invert(image: &mut GrayImage) {
    image::imageops::invert(image);
}

pub fn erode_rect(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    // Box means floor, so only an all-white window averages to 255
    let mut out = box_filter(image, width / 2, height / 2);
    for p in out.pixels_mut() {
        p[0] = if p[0] == 255 { 255 } else { 0 };
    }
    out
}

pub fn dilate_rect(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut complement = image.clone();
    invert(&mut complement);
    let mut out = erode_rect(&complement, width, height);
    invert(&mut out);
    out
}

/// Erosion then dilation: removes white specks smaller than the kernel.
pub fn open_rect(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    dilate_rect(&erode_rect(image, width, height), width, height)
}

/// Dilation then erosion: fills black gaps smaller than the kernel.
pub fn close_rect(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    erode_rect(&dilate_rect(image, width, height), width, height)
}
