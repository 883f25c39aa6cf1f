//! This module implements the pool that owns decoded images, fits them to
//! a cell grid, and slices them into cell-sized fragments for the display
//! layer.
//!
//! Entries are appended by the thread driving the decoder. Handles to pool
//! entries may be dropped from any thread: a drop only records the entry
//! in a mutex-guarded queue, and the lists are mutated exclusively by
//! [`ImagePool::process_operations`] on the owning thread. The renderer is
//! notified of erased images through the pool's removal observer, so it
//! can release the matching textures at a safe point.

use std::collections::HashMap;
use std::mem;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::color::Rgba;

/// Max allowed dimensions (width, height) for an image, in pixels.
pub const MAX_IMAGE_DIMENSIONS: [usize; 2] = [4096, 4096];

/// Unique identifier for every image interned in a pool.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Eq, PartialEq, Clone, Debug, Copy, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// Specifies the format of the pixel data.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Eq, PartialEq, Clone, Debug, Copy)]
pub enum ImageFormat {
    /// 3 bytes per pixel (red, green, blue).
    Rgb,

    /// 4 bytes per pixel (red, green, blue, alpha).
    Rgba,
}

impl ImageFormat {
    /// Number of bytes per pixel.
    #[inline]
    pub fn pixel_size(self) -> usize {
        match self {
            ImageFormat::Rgb => 3,
            ImageFormat::Rgba => 4,
        }
    }
}

/// A decoded image owned by an [`ImagePool`].
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Image {
    /// Image identifier.
    pub id: ImageId,

    /// Format of the pixel data.
    pub format: ImageFormat,

    /// Width, in pixels.
    pub width: usize,

    /// Height, in pixels.
    pub height: usize,

    /// Pixel data, row-major.
    pub pixels: Vec<u8>,
}

/// Shared handle to an [`Image`] in a pool.
///
/// When the last handle to an image is dropped, its identifier is added to
/// the pool's removal queue; the entry itself stays alive until the pool
/// processes its deferred operations.
#[derive(Debug)]
pub struct ImageRef {
    image: Arc<Image>,

    /// Queue to track dropped handles.
    removal_queue: Weak<Mutex<Vec<ImageId>>>,
}

impl Deref for ImageRef {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        // Ignore removal_queue.
        self.image.id == other.image.id
    }
}

impl Eq for ImageRef {}

impl Drop for ImageRef {
    fn drop(&mut self) {
        if let Some(queue) = self.removal_queue.upgrade() {
            queue.lock().push(self.image.id);
        }
    }
}

/// Where an image is anchored inside the cell rectangle it occupies.
///
/// The policy is stored with the rasterization and consumed by the
/// renderer; slicing fragments never resamples the image.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum ImageAlignment {
    TopStart,
    TopCenter,
    TopEnd,
    MiddleStart,
    #[default]
    MiddleCenter,
    MiddleEnd,
    BottomStart,
    BottomCenter,
    BottomEnd,
}

/// How an image is scaled into the cell rectangle it occupies.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum ImageResize {
    #[default]
    NoResize,
    ResizeToFit,
    ResizeToFill,
    StretchToFill,
}

/// An [`Image`] fitted to a cell grid.
///
/// The rasterization records the grid geometry and produces cell-sized
/// tiles on demand; the underlying image is never mutated.
#[derive(Debug)]
pub struct RasterizedImage {
    /// The image this rasterization reads from.
    image: Arc<ImageRef>,

    /// Anchor policy inside the cell rectangle.
    pub alignment: ImageAlignment,

    /// Scaling policy inside the cell rectangle.
    pub resize: ImageResize,

    /// Fill for tile pixels not covered by the image.
    pub default_color: Rgba,

    /// Number of grid columns the image occupies.
    pub span_columns: usize,

    /// Number of grid lines the image occupies.
    pub span_lines: usize,

    /// Width, in pixels, of one cell.
    pub cell_width: usize,

    /// Height, in pixels, of one cell.
    pub cell_height: usize,
}

impl RasterizedImage {
    /// The image this rasterization reads from.
    #[inline]
    pub fn image(&self) -> &Arc<ImageRef> {
        &self.image
    }

    /// Produce the RGBA tile for one cell.
    ///
    /// The returned buffer always holds `cell_width × cell_height × 4`
    /// bytes. Image rows are copied bottom-up, the orientation the texture
    /// uploader expects, and tile pixels the image does not reach are
    /// filled with the default color.
    ///
    /// # Panics
    ///
    /// Panics if the pixel offset of the cell lies outside the image.
    pub fn fragment(&self, column: usize, line: usize) -> Vec<u8> {
        let image: &Image = &self.image;

        let x_offset = column * self.cell_width;
        let y_offset = line * self.cell_height;

        assert!(
            x_offset <= image.width && y_offset <= image.height,
            "fragment ({}, {}) outside image {:?}",
            column,
            line,
            image.id,
        );

        let available_width = (image.width - x_offset).min(self.cell_width);
        let available_height = (image.height - y_offset).min(self.cell_height);

        let default_pixel = self.default_color.to_bytes();
        let mut tile = Vec::with_capacity(self.cell_width * self.cell_height * 4);

        for y in 0..self.cell_height {
            if y < available_height {
                let row = y_offset + (available_height - 1 - y);
                let offset = (row * image.width + x_offset) * 4;
                tile.extend_from_slice(&image.pixels[offset..offset + available_width * 4]);

                for _ in available_width..self.cell_width {
                    tile.extend_from_slice(&default_pixel);
                }
            } else {
                for _ in 0..self.cell_width {
                    tile.extend_from_slice(&default_pixel);
                }
            }
        }

        tile
    }
}

/// Observer invoked with an image just before the pool erases it.
pub type RemovalObserver = Box<dyn FnMut(&Image) + Send>;

/// Owns decoded images and their rasterizations.
#[derive(Default)]
pub struct ImagePool {
    /// Images interned in the pool. The `Arc` storage keeps every entry at
    /// a stable address from creation until removal.
    images: Vec<Arc<Image>>,

    /// Rasterizations produced from the images. The handles returned by
    /// [`rasterize`](Self::rasterize) keep the entries alive; dead entries
    /// are pruned with the deferred operations.
    rasterizations: Vec<Weak<RasterizedImage>>,

    /// Last generated identifier.
    last_id: u64,

    /// Named references to shared images.
    names: HashMap<String, Arc<ImageRef>>,

    /// Identifiers whose last handle went away.
    removal_queue: Arc<Mutex<Vec<ImageId>>>,

    /// Observer invoked before an image is erased.
    removal_observer: Option<RemovalObserver>,
}

impl ImagePool {
    pub fn new() -> ImagePool {
        ImagePool::default()
    }

    /// Register the observer invoked with every erased image.
    pub fn set_removal_observer(&mut self, observer: RemovalObserver) {
        self.removal_observer = Some(observer);
    }

    /// Number of images currently interned.
    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Iterate over the live rasterizations.
    pub fn rasterizations(&self) -> impl Iterator<Item = Arc<RasterizedImage>> + '_ {
        self.rasterizations.iter().filter_map(Weak::upgrade)
    }

    /// Intern a decoded image and return a shared handle to it.
    ///
    /// RGB payloads are widened to RGBA on entry, so every stored image
    /// has a 4-byte pixel format.
    ///
    /// # Panics
    ///
    /// Panics if a dimension exceeds [`MAX_IMAGE_DIMENSIONS`], or if the
    /// payload length does not match the format and dimensions.
    pub fn create(
        &mut self,
        format: ImageFormat,
        width: usize,
        height: usize,
        pixels: Vec<u8>,
    ) -> Arc<ImageRef> {
        assert!(
            width <= MAX_IMAGE_DIMENSIONS[0] && height <= MAX_IMAGE_DIMENSIONS[1],
            "image dimensions {}x{} exceed {:?}",
            width,
            height,
            MAX_IMAGE_DIMENSIONS,
        );
        assert_eq!(
            pixels.len(),
            width * height * format.pixel_size(),
            "pixel payload does not match an {}x{} {:?} image",
            width,
            height,
            format,
        );

        self.last_id += 1;
        let id = ImageId(self.last_id);

        let pixels = match format {
            ImageFormat::Rgba => pixels,
            ImageFormat::Rgb => rgb_to_rgba(&pixels),
        };

        let image = Arc::new(Image { id, format: ImageFormat::Rgba, width, height, pixels });
        self.images.push(image.clone());

        trace!("Intern image {:?} ({}x{})", id, width, height);

        Arc::new(ImageRef { image, removal_queue: Arc::downgrade(&self.removal_queue) })
    }

    /// Fit an image to a cell grid and return a shared handle to the
    /// rasterization. The rasterization holds a strong reference to the
    /// image.
    ///
    /// # Panics
    ///
    /// Panics if either cell dimension is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn rasterize(
        &mut self,
        image: &Arc<ImageRef>,
        alignment: ImageAlignment,
        resize: ImageResize,
        default_color: Rgba,
        span_columns: usize,
        span_lines: usize,
        cell_width: usize,
        cell_height: usize,
    ) -> Arc<RasterizedImage> {
        assert!(cell_width > 0 && cell_height > 0, "cell dimensions must be non-zero");

        let rasterized = Arc::new(RasterizedImage {
            image: image.clone(),
            alignment,
            resize,
            default_color,
            span_columns,
            span_lines,
            cell_width,
            cell_height,
        });

        self.rasterizations.push(Arc::downgrade(&rasterized));
        rasterized
    }

    /// Associate a name with an image. An existing association is
    /// replaced. The association keeps the image alive until
    /// [`unlink`](Self::unlink).
    pub fn link(&mut self, name: impl Into<String>, image: Arc<ImageRef>) {
        self.names.insert(name.into(), image);
    }

    /// Resolve a named image.
    pub fn find_image_by_name(&self, name: &str) -> Option<Arc<ImageRef>> {
        self.names.get(name).cloned()
    }

    /// Drop a named association. Returns whether the name was known.
    pub fn unlink(&mut self, name: &str) -> bool {
        self.names.remove(name).is_some()
    }

    /// Apply the deferred removals on the owning thread.
    ///
    /// Every image whose last handle went away is passed to the removal
    /// observer and erased, and rasterizations without a living handle are
    /// pruned. Returns the identifiers of the erased images.
    pub fn process_operations(&mut self) -> Vec<ImageId> {
        let removed = {
            let mut queue = self.removal_queue.lock();
            if queue.is_empty() {
                Vec::new()
            } else {
                mem::take(&mut *queue)
            }
        };

        for &id in &removed {
            if let Some(position) = self.images.iter().position(|image| image.id == id) {
                if let Some(observer) = &mut self.removal_observer {
                    observer(&self.images[position]);
                }

                trace!("Remove image {:?}", id);
                self.images.remove(position);
            }
        }

        self.rasterizations.retain(|rasterization| rasterization.strong_count() != 0);

        removed
    }
}

/// Widen an RGB payload to RGBA with an opaque alpha channel.
fn rgb_to_rgba(pixels: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
    for pixel in pixels.chunks_exact(3) {
        rgba.extend_from_slice(pixel);
        rgba.push(255);
    }
    rgba
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    /// A solid RGBA payload.
    fn solid(width: usize, height: usize, pixel: [u8; 4]) -> Vec<u8> {
        pixel.repeat(width * height)
    }

    #[test]
    fn image_ids_are_monotonic() {
        let mut pool = ImagePool::new();

        let first = pool.create(ImageFormat::Rgba, 1, 1, solid(1, 1, [1, 2, 3, 255]));
        let second = pool.create(ImageFormat::Rgba, 1, 1, solid(1, 1, [1, 2, 3, 255]));

        assert!(second.id > first.id);
        assert_eq!(pool.image_count(), 2);
    }

    #[test]
    fn rgb_payloads_are_widened() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgb, 2, 1, vec![1, 2, 3, 4, 5, 6]);

        assert_eq!(image.format, ImageFormat::Rgba);
        assert_eq!(image.pixels, &[1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    #[should_panic(expected = "pixel payload")]
    fn create_rejects_inconsistent_payloads() {
        let mut pool = ImagePool::new();
        pool.create(ImageFormat::Rgba, 2, 2, vec![0; 3]);
    }

    #[test]
    fn dropped_handles_are_erased_on_process() {
        let mut pool = ImagePool::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let observer_seen = seen.clone();
        pool.set_removal_observer(Box::new(move |image: &Image| {
            observer_seen.store(image.id.0 as usize, Ordering::Relaxed);
        }));

        let image = pool.create(ImageFormat::Rgba, 1, 1, solid(1, 1, [0; 4]));
        let id = image.id;

        // Nothing is erased while a handle is alive.
        assert!(pool.process_operations().is_empty());

        drop(image);
        assert_eq!(pool.process_operations(), vec![id]);
        assert_eq!(pool.image_count(), 0);
        assert_eq!(seen.load(Ordering::Relaxed), id.0 as usize);
    }

    #[test]
    fn handles_can_be_dropped_from_other_threads() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 1, 1, solid(1, 1, [0; 4]));
        let id = image.id;

        thread::spawn(move || drop(image)).join().unwrap();

        assert_eq!(pool.process_operations(), vec![id]);
        assert_eq!(pool.image_count(), 0);
    }

    #[test]
    fn named_links_keep_images_alive() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 1, 1, solid(1, 1, [0; 4]));
        pool.link("logo", image.clone());
        drop(image);

        // The link still holds a handle.
        assert!(pool.process_operations().is_empty());

        let resolved = pool.find_image_by_name("logo").unwrap();
        let id = resolved.id;
        drop(resolved);

        assert!(pool.unlink("logo"));
        assert!(!pool.unlink("logo"));
        assert_eq!(pool.process_operations(), vec![id]);
    }

    #[test]
    fn rasterizations_keep_images_alive() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 4, 4, solid(4, 4, [9, 9, 9, 255]));
        let id = image.id;
        let rasterized = pool.rasterize(
            &image,
            ImageAlignment::default(),
            ImageResize::default(),
            Rgba::TRANSPARENT,
            2,
            2,
            2,
            2,
        );
        drop(image);

        // The rasterization still reaches its backing image.
        assert_eq!(rasterized.image().id, id);

        assert!(pool.process_operations().is_empty());
        assert_eq!(pool.rasterizations().count(), 1);

        drop(rasterized);
        assert_eq!(pool.process_operations().len(), 1);
        assert_eq!(pool.rasterizations().count(), 0);
        assert_eq!(pool.image_count(), 0);
    }

    #[test]
    fn fragment_has_fixed_size() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 5, 3, solid(5, 3, [1, 1, 1, 255]));
        let rasterized = pool.rasterize(
            &image,
            ImageAlignment::default(),
            ImageResize::default(),
            Rgba::TRANSPARENT,
            2,
            1,
            4,
            4,
        );

        for column in 0..2 {
            assert_eq!(rasterized.fragment(column, 0).len(), 4 * 4 * 4);
        }
    }

    #[test]
    fn fragment_copies_rows_bottom_up() {
        let mut pool = ImagePool::new();

        // 2x2 image with one color per row.
        let mut pixels = Vec::new();
        pixels.extend_from_slice(&[10, 10, 10, 255].repeat(2));
        pixels.extend_from_slice(&[20, 20, 20, 255].repeat(2));

        let image = pool.create(ImageFormat::Rgba, 2, 2, pixels);
        let rasterized = pool.rasterize(
            &image,
            ImageAlignment::default(),
            ImageResize::default(),
            Rgba::TRANSPARENT,
            1,
            1,
            2,
            2,
        );

        let tile = rasterized.fragment(0, 0);
        assert_eq!(&tile[..8], &[20, 20, 20, 255, 20, 20, 20, 255]);
        assert_eq!(&tile[8..], &[10, 10, 10, 255, 10, 10, 10, 255]);
    }

    #[test]
    fn fragment_pads_with_default_color() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 3, 3, solid(3, 3, [7, 7, 7, 255]));
        let default_color = Rgba::new(1, 2, 3, 4);
        let rasterized = pool.rasterize(
            &image,
            ImageAlignment::default(),
            ImageResize::default(),
            default_color,
            2,
            2,
            2,
            2,
        );

        // Bottom-right cell: only one image pixel is available.
        let tile = rasterized.fragment(1, 1);
        assert_eq!(&tile[..4], &[7, 7, 7, 255]);
        assert_eq!(&tile[4..8], &[1, 2, 3, 4]);
        assert_eq!(&tile[8..12], &[1, 2, 3, 4]);
        assert_eq!(&tile[12..], &[1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "outside image")]
    fn fragment_outside_the_image_is_a_bug() {
        let mut pool = ImagePool::new();

        let image = pool.create(ImageFormat::Rgba, 2, 2, solid(2, 2, [0; 4]));
        let rasterized = pool.rasterize(
            &image,
            ImageAlignment::default(),
            ImageResize::default(),
            Rgba::TRANSPARENT,
            1,
            1,
            2,
            2,
        );

        rasterized.fragment(2, 0);
    }
}
