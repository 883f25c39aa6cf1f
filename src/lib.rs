// Copyright 2026 The termsixel Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core of a terminal graphics subsystem: a streaming Sixel decoder, the
//! RGBA raster builder it drives, and the pool that interns decoded images
//! and slices them into cell-sized fragments for the display layer.
//!
//! The crate ends at the fragment boundary. Escape-sequence dispatch, grid
//! placement and texture upload belong to the embedding emulator:
//!
//! 1. The emulator recognises a `DCS q` sequence and opens a
//!    [`sixel::SixelGraphic`] session, feeding it the picture definition
//!    bytes.
//! 2. On the string terminator, the decoded image is interned with
//!    [`pool::ImagePool::create`] and fitted to the cell grid with
//!    [`pool::ImagePool::rasterize`].
//! 3. The renderer pulls one [`pool::RasterizedImage::fragment`] tile per
//!    cell, and releases textures for the identifiers reported by
//!    [`pool::ImagePool::process_operations`].

pub mod color;
pub mod pool;
pub mod sixel;

pub use crate::color::{Rgb, Rgba};
pub use crate::pool::{
    Image, ImageAlignment, ImageFormat, ImageId, ImagePool, ImageRef, ImageResize,
    RasterizedImage, MAX_IMAGE_DIMENSIONS,
};
pub use crate::sixel::{
    Sixel, SixelColorPalette, SixelEvents, SixelGraphic, SixelImage, SixelImageBuilder,
    SixelParser, MAX_COLOR_REGISTERS,
};
