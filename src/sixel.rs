//! This module implements a decoder for the Sixel protocol, based on the
//! chapter [SIXEL GRAPHICS EXTENSION] of the DEC reference manual.
//!
//! [SIXEL GRAPHICS EXTENSION]: https://archive.org/details/bitsavers_decstandar0VideoSystemsReferenceManualDec91_74264381/page/n907/mode/2up
//!
//! The decoder is split in two halves. [`SixelParser`] is a streaming state
//! machine that turns the picture definition bytes into calls on a
//! [`SixelEvents`] sink, and [`SixelImageBuilder`] is the canonical sink,
//! interpreting those calls into an RGBA pixel buffer. [`SixelGraphic`]
//! wires both together for a single decode session.
//!
//! # Limitations
//!
//! * A single image can use up to 1024 color registers.
//!
//!   The Sixel reference requires 256, but we allow more colors.
//!
//! * Colors defined in the HLS coordinate system are dropped.
//!
//! * Pixel aspect ratio parameters are recorded but never applied; multiple
//!   implementations always render 1:1, so these parameters have no real
//!   effect.

use std::fmt;

use log::{trace, warn};
use smallvec::SmallVec;
use vte::Params;

use crate::color::{Rgb, Rgba};

/// Number of color registers.
pub const MAX_COLOR_REGISTERS: usize = 1024;

/// Colors of the VT-340 terminal.
///
/// There is no official documentation about these colors, but multiple
/// Sixel implementations assume this palette. The percent triples are
/// scaled to 8 bits with the same rule the color introducer uses.
const VT340_COLORS: [Rgb; 16] = [
    Rgb::new(0, 0, 0),
    Rgb::new(51, 51, 204),
    Rgb::new(204, 33, 33),
    Rgb::new(51, 204, 51),
    Rgb::new(204, 51, 204),
    Rgb::new(51, 204, 204),
    Rgb::new(204, 204, 51),
    Rgb::new(135, 135, 135),
    Rgb::new(66, 66, 66),
    Rgb::new(84, 84, 153),
    Rgb::new(153, 66, 66),
    Rgb::new(84, 153, 84),
    Rgb::new(153, 84, 153),
    Rgb::new(84, 153, 153),
    Rgb::new(153, 153, 84),
    Rgb::new(204, 204, 204),
];

/// A group of 6 vertical pixels.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Sixel(u8);

impl Sixel {
    /// Create a new sixel.
    ///
    /// It expects the byte value from the picture definition stream.
    #[inline]
    pub fn new(byte: u8) -> Sixel {
        debug_assert!((0x3F..=0x7E).contains(&byte));
        Sixel(byte - 0x3F)
    }

    /// The raw 6-bit mask. Bit 0 is the topmost pixel.
    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }

    /// Return an iterator to get dots in the sixel, top to bottom.
    #[inline]
    pub fn dots(self) -> impl Iterator<Item = bool> {
        let sixel = self.0;
        (0..6).map(move |position| sixel & (1 << position) != 0)
    }
}

/// Sink for the semantic events produced by [`SixelParser`].
///
/// The canonical implementation is [`SixelImageBuilder`].
pub trait SixelEvents {
    /// Record the pixel aspect ratio and establish the image bounds.
    fn set_raster(&mut self, pan: u16, pad: u16, width: usize, height: usize);

    /// Draw a 6-pixel column at the sixel cursor.
    fn render(&mut self, sixel: Sixel);

    /// Select the active color register.
    fn use_color(&mut self, index: u16);

    /// Define a color register.
    fn set_color(&mut self, index: u16, color: Rgb);

    /// Move the sixel cursor back to the leftmost column.
    fn rewind(&mut self);

    /// Move the sixel cursor to the leftmost column of the next band.
    fn newline(&mut self);
}

/// States of the picture definition parser.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
enum State {
    /// Default state. Sixel data bytes are rendered directly, command
    /// introducers switch state.
    Ground,

    /// After `!`. Accumulates the repeat count for the next sixel byte.
    RepeatIntroducer,

    /// After `#`. Awaits the first digit of a color register number.
    ColorIntroducer,

    /// Inside a color selection or definition.
    ColorParam,

    /// After `"`. Accumulates the four raster parameters.
    RasterSettings,
}

/// Streaming parser for the picture definition in a Sixel data stream.
///
/// The parser is deliberately tolerant: bytes that have no meaning in the
/// active state are dropped and it never fails, although the resulting
/// image may be blank or partial. Every byte is translated into calls on a
/// [`SixelEvents`] sink before the next byte is accepted.
pub struct SixelParser {
    /// Active state.
    state: State,

    /// Parameter values of the active command.
    ///
    /// If a value is greater than `u16::MAX`, it is kept as `u16::MAX`.
    params: SmallVec<[u16; 8]>,

    /// Callback invoked by [`finish`](Self::finish).
    finalizer: Option<Box<dyn FnMut() + Send>>,
}

impl Default for SixelParser {
    fn default() -> SixelParser {
        SixelParser::new()
    }
}

impl fmt::Debug for SixelParser {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SixelParser")
            .field("state", &self.state)
            .field("params", &self.params)
            .finish()
    }
}

impl SixelParser {
    /// Creates a new parser.
    pub fn new() -> SixelParser {
        SixelParser { state: State::Ground, params: SmallVec::new(), finalizer: None }
    }

    /// Creates a new parser whose [`finish`](Self::finish) invokes the
    /// given callback after the stream is terminated.
    pub fn with_finalizer(finalizer: impl FnMut() + Send + 'static) -> SixelParser {
        SixelParser { finalizer: Some(Box::new(finalizer)), ..SixelParser::new() }
    }

    /// Parse a byte from the Sixel stream.
    pub fn put<E: SixelEvents>(&mut self, events: &mut E, byte: u8) {
        match self.state {
            State::Ground => self.fallback(events, byte),

            State::RepeatIntroducer => match byte {
                b'0'..=b'9' => self.shift_and_add_digit(byte),

                0x3F..=0x7E => {
                    let sixel = Sixel::new(byte);
                    for _ in 0..self.params[0] {
                        events.render(sixel);
                    }
                    self.state = State::Ground;
                },

                _ => self.fallback(events, byte),
            },

            State::ColorIntroducer => match byte {
                b'0'..=b'9' => {
                    self.shift_and_add_digit(byte);
                    self.state = State::ColorParam;
                },

                _ => self.fallback(events, byte),
            },

            State::ColorParam => match byte {
                b'0'..=b'9' => self.shift_and_add_digit(byte),

                b';' => self.params.push(0),

                _ => {
                    self.leave_color_param(events);
                    self.state = State::Ground;
                    self.fallback(events, byte);
                },
            },

            State::RasterSettings => match byte {
                b'0'..=b'9' => self.shift_and_add_digit(byte),

                b';' => self.params.push(0),

                _ => {
                    self.leave_raster_settings(events);
                    self.state = State::Ground;
                    self.fallback(events, byte);
                },
            },
        }
    }

    /// Terminate the stream.
    ///
    /// A pending color or raster sequence is completed as if an ordinary
    /// terminator had been seen, then the finalizer supplied at
    /// construction time runs.
    pub fn finish<E: SixelEvents>(&mut self, events: &mut E) {
        match self.state {
            State::ColorParam => self.leave_color_param(events),
            State::RasterSettings => self.leave_raster_settings(events),
            _ => (),
        }

        self.state = State::Ground;

        if let Some(finalizer) = &mut self.finalizer {
            finalizer();
        }
    }

    /// Process a byte that has no meaning in the active state.
    ///
    /// Command introducers switch state from anywhere, sixel data bytes
    /// are rendered, and anything else is dropped.
    fn fallback<E: SixelEvents>(&mut self, events: &mut E, byte: u8) {
        match byte {
            b'#' => self.enter(State::ColorIntroducer),

            b'!' => self.enter(State::RepeatIntroducer),

            b'"' => self.enter(State::RasterSettings),

            b'$' => {
                self.state = State::Ground;
                events.rewind();
            },

            b'-' => {
                self.state = State::Ground;
                events.newline();
            },

            0x3F..=0x7E => events.render(Sixel::new(byte)),

            _ => (), // Ignore unknown bytes.
        }
    }

    /// Enter a parameter-accepting state with a single zero parameter.
    fn enter(&mut self, state: State) {
        self.params.clear();
        self.params.push(0);
        self.state = state;
    }

    /// Update the last parameter with one more decimal digit.
    fn shift_and_add_digit(&mut self, byte: u8) {
        if let Some(param) = self.params.last_mut() {
            *param = param.saturating_mul(10).saturating_add((byte - b'0') as u16);
        }
    }

    /// Emit the event for a completed color sequence.
    ///
    /// A single parameter selects a register. Five parameters define a
    /// register; only the RGB coordinate system (2) is interpreted, an HLS
    /// definition emits nothing.
    fn leave_color_param<E: SixelEvents>(&mut self, events: &mut E) {
        match *self.params.as_slice() {
            [index] => events.use_color(index),

            [index, 2, r, g, b] => {
                events.set_color(index, Rgb::new(scale(r), scale(g), scale(b)))
            },

            _ => (),
        }
    }

    /// Emit the raster settings if exactly four parameters were collected.
    fn leave_raster_settings<E: SixelEvents>(&mut self, events: &mut E) {
        if let [pan, pad, x_pixels, y_pixels] = *self.params.as_slice() {
            events.set_raster(pan, pad, x_pixels as usize, y_pixels as usize);
        }
    }
}

/// Scale a color component from the `0..=100` range used by the color
/// introducer to `0..=255`.
///
/// Components above 100 are not clamped; they wrap through the 8-bit
/// cast.
#[inline]
fn scale(component: u16) -> u8 {
    (component as u32 * 255 / 100) as u8
}

/// A resizable, bounded-capacity array of RGB colors.
///
/// Lookups wrap modulo the current length, so a stream can reference any
/// register number without trapping. A palette can outlive a single decode
/// when the terminal runs with shared color registers.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct SixelColorPalette {
    palette: Vec<Rgb>,
    max_size: usize,
}

impl Default for SixelColorPalette {
    fn default() -> SixelColorPalette {
        SixelColorPalette::new(256, MAX_COLOR_REGISTERS)
    }
}

impl SixelColorPalette {
    /// Create a palette with `size` entries, capped at `max_size`, seeded
    /// with the VT-340 default colors.
    pub fn new(size: usize, max_size: usize) -> SixelColorPalette {
        let mut palette =
            SixelColorPalette { palette: vec![Rgb::default(); size.min(max_size)], max_size };
        palette.reset();
        palette
    }

    /// Install the VT-340 default colors in the first 16 registers.
    pub fn reset(&mut self) {
        let len = self.palette.len().min(VT340_COLORS.len());
        self.palette[..len].copy_from_slice(&VT340_COLORS[..len]);
    }

    /// Number of defined registers.
    #[inline]
    pub fn size(&self) -> usize {
        self.palette.len()
    }

    /// Maximum number of registers this palette may hold.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Resize to `min(size, max_size)` registers. New registers are black.
    pub fn set_size(&mut self, size: usize) {
        self.palette.resize(size.min(self.max_size), Rgb::default());
    }

    /// Define the color of a register, expanding the palette when the
    /// register is beyond the current length. Registers at or past the
    /// capacity are dropped.
    pub fn set_color(&mut self, index: usize, color: Rgb) {
        if index >= self.max_size {
            return;
        }

        if index >= self.palette.len() {
            self.palette.resize(index + 1, Rgb::default());
        }

        self.palette[index] = color;
    }

    /// Color of a register. The index wraps modulo the palette length; an
    /// empty palette reads black.
    #[inline]
    pub fn at(&self, index: usize) -> Rgb {
        if self.palette.is_empty() {
            return Rgb::default();
        }

        self.palette[index % self.palette.len()]
    }
}

/// A decoded Sixel image, ready to be interned in an image pool.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct SixelImage {
    /// Width, in pixels.
    pub width: usize,

    /// Height, in pixels.
    pub height: usize,

    /// RGBA pixel data, row-major.
    pub pixels: Vec<u8>,
}

/// Canonical [`SixelEvents`] implementation, interpreting parser events
/// into an RGBA pixel buffer.
///
/// The raster starts at the maximum extent allowed for the decode, filled
/// with the background, and is cut down when the stream supplies raster
/// settings. Pixel writes outside the raster are dropped.
#[derive(Debug)]
pub struct SixelImageBuilder {
    /// Hard ceiling for the raster extent, in pixels.
    max_width: usize,
    max_height: usize,

    /// Current raster extent, in pixels.
    width: usize,
    height: usize,

    /// RGBA pixels of the raster, row-major.
    buffer: Vec<u8>,

    /// Column, in pixels, of the next rendered sixel.
    cursor_column: usize,

    /// Topmost pixel row of the active sixel band. Advances in multiples
    /// of 6.
    cursor_row: usize,

    /// Selected color register.
    current_color: usize,

    /// Pixel aspect ratio (numerator, denominator) from the raster
    /// settings. Recorded only.
    aspect_ratio: (u16, u16),

    /// Fill for pixels never touched by a sixel.
    background: Rgba,

    /// Color registers for this decode.
    palette: SixelColorPalette,
}

impl SixelImageBuilder {
    /// Create a builder for a decode bounded by `max_width` × `max_height`
    /// pixels.
    pub fn new(
        max_width: usize,
        max_height: usize,
        background: Rgba,
        palette: SixelColorPalette,
    ) -> SixelImageBuilder {
        SixelImageBuilder {
            max_width,
            max_height,
            width: max_width,
            height: max_height,
            buffer: background.to_bytes().repeat(max_width * max_height),
            cursor_column: 0,
            cursor_row: 0,
            current_color: 0,
            aspect_ratio: (1, 1),
            background,
            palette,
        }
    }

    /// Current raster width, in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Current raster height, in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel aspect ratio supplied by the raster settings.
    #[inline]
    pub fn aspect_ratio(&self) -> (u16, u16) {
        self.aspect_ratio
    }

    /// Paint every pixel of the raster.
    pub fn clear(&mut self, fill: Rgba) {
        self.buffer = fill.to_bytes().repeat(self.width * self.height);
    }

    /// Read a pixel. Both coordinates wrap at the raster extent.
    pub fn at(&self, row: usize, column: usize) -> Rgba {
        if self.width == 0 || self.height == 0 {
            return self.background;
        }

        let offset = ((row % self.height) * self.width + column % self.width) * 4;
        let pixel = &self.buffer[offset..offset + 4];
        Rgba::new(pixel[0], pixel[1], pixel[2], pixel[3])
    }

    /// The finished image and the palette, for reuse by the next decode.
    pub fn finish(self) -> (SixelImage, SixelColorPalette) {
        let image = SixelImage { width: self.width, height: self.height, pixels: self.buffer };
        (image, self.palette)
    }

    /// Write a pixel, dropping anything outside the raster.
    fn write(&mut self, row: usize, column: usize, color: Rgba) {
        if row < self.height && column < self.width {
            let offset = (row * self.width + column) * 4;
            self.buffer[offset..offset + 4].copy_from_slice(&color.to_bytes());
        }
    }
}

impl SixelEvents for SixelImageBuilder {
    fn set_raster(&mut self, pan: u16, pad: u16, width: usize, height: usize) {
        self.aspect_ratio = (pan, pad);

        if width > self.max_width || height > self.max_height {
            warn!(
                "Clamping Sixel raster {}x{} to the {}x{} limit",
                width, height, self.max_width, self.max_height
            );
        }

        self.width = width.min(self.max_width);
        self.height = height.min(self.max_height);

        trace!("Set Sixel raster to {}x{}", self.width, self.height);

        let background = self.background;
        self.clear(background);
    }

    fn render(&mut self, sixel: Sixel) {
        if self.cursor_column >= self.width {
            return;
        }

        let color = Rgba::from(self.palette.at(self.current_color));
        for (i, dot) in sixel.dots().enumerate() {
            if dot {
                self.write(self.cursor_row + i, self.cursor_column, color);
            }
        }

        self.cursor_column += 1;
    }

    fn use_color(&mut self, index: u16) {
        if self.palette.size() != 0 {
            self.current_color = index as usize % self.palette.size();
        }
    }

    fn set_color(&mut self, index: u16, color: Rgb) {
        self.palette.set_color(index as usize, color);
    }

    fn rewind(&mut self) {
        self.cursor_column = 0;
    }

    fn newline(&mut self) {
        self.cursor_column = 0;

        // The cursor may stop at `height`, one band past the last pixel
        // row; writes from there on are clipped by `write`.
        if self.cursor_row + 6 <= self.height {
            self.cursor_row += 6;
        }
    }
}

/// A single Sixel decode session: a parser wired to its canonical builder.
///
/// The terminal creates one session per `DCS q` sequence, feeds it the
/// picture definition bytes, and finishes it when the string terminator
/// arrives.
#[derive(Debug)]
pub struct SixelGraphic {
    parser: SixelParser,
    builder: SixelImageBuilder,
}

impl SixelGraphic {
    /// Start a decode session.
    ///
    /// `params` are the parameters of the `DCS q` sequence. According to
    /// the Sixel reference, the second one (Ps2) selects how to show
    /// pixels without an explicit color:
    ///
    ///   0   device default action
    ///   1   no action (don't change zero value pixels)
    ///   2   set zero value pixels to background color
    ///
    /// We replicate the xterm behaviour: `1` keeps those pixels
    /// transparent, any other value paints them opaque black.
    ///
    /// A palette returned by a previous session can be handed in when the
    /// terminal runs with shared color registers.
    pub fn new(
        params: &Params,
        max_width: usize,
        max_height: usize,
        shared_palette: Option<SixelColorPalette>,
    ) -> SixelGraphic {
        let ps2 = params.iter().nth(1).and_then(|param| param.iter().next().copied()).unwrap_or(0);
        let background = if ps2 == 1 { Rgba::TRANSPARENT } else { Rgba::BLACK };

        SixelGraphic::with_background(background, max_width, max_height, shared_palette)
    }

    /// Start a decode session with an explicit background fill.
    pub fn with_background(
        background: Rgba,
        max_width: usize,
        max_height: usize,
        shared_palette: Option<SixelColorPalette>,
    ) -> SixelGraphic {
        trace!("Start Sixel decode ({}x{} max)", max_width, max_height);

        let palette = shared_palette.unwrap_or_default();

        SixelGraphic {
            parser: SixelParser::new(),
            builder: SixelImageBuilder::new(max_width, max_height, background, palette),
        }
    }

    /// Feed one byte of the picture definition.
    #[inline]
    pub fn put(&mut self, byte: u8) {
        self.parser.put(&mut self.builder, byte);
    }

    /// Terminate the stream and return the decoded image, plus the palette
    /// for the next session.
    ///
    /// A zero-area raster produces no image.
    pub fn finish(mut self) -> (Option<SixelImage>, SixelColorPalette) {
        self.parser.finish(&mut self.builder);

        let (image, palette) = self.builder.finish();
        if image.width == 0 || image.height == 0 {
            trace!("Discard empty Sixel image");
            return (None, palette);
        }

        trace!("Finish Sixel decode: {}x{}", image.width, image.height);
        (Some(image), palette)
    }
}
