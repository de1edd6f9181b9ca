/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// Guest pixel formats understood by the surface cache. These are the
/// formats a guest title can ask the GPU to sample or render; host
/// backends map them onto whatever the driver actually supports.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum PixelFormat {
    RGBA8,
    RGB8,
    RGB5A1,
    RGB565,
    RGBA4,
    IA8,
    RG8,
    I8,
    A8,
    IA4,
    I4,
    A4,
    ETC1,
    ETC1A4,
    D16,
    D24,
    D24S8,
    #[default]
    Invalid,
}

/// Broad usage class of a surface, derived from its [`PixelFormat`]
/// except for fill surfaces, which carry no real format at all.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SurfaceType {
    Color,
    Depth,
    DepthStencil,
    Texture,
    Fill,
    #[default]
    Invalid,
}

impl PixelFormat {
    /// All non-Invalid formats, in declaration order. Used when probing
    /// for reinterpretation candidates of equal bit width.
    pub const ALL: [PixelFormat; 17] = [
        PixelFormat::RGBA8,
        PixelFormat::RGB8,
        PixelFormat::RGB5A1,
        PixelFormat::RGB565,
        PixelFormat::RGBA4,
        PixelFormat::IA8,
        PixelFormat::RG8,
        PixelFormat::I8,
        PixelFormat::A8,
        PixelFormat::IA4,
        PixelFormat::I4,
        PixelFormat::A4,
        PixelFormat::ETC1,
        PixelFormat::ETC1A4,
        PixelFormat::D16,
        PixelFormat::D24,
        PixelFormat::D24S8,
    ];

    /// Bits of guest memory one pixel of this format occupies.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::RGBA8 | PixelFormat::D24S8 => 32,
            PixelFormat::RGB8 | PixelFormat::D24 => 24,
            PixelFormat::RGB5A1 |
            PixelFormat::RGB565 |
            PixelFormat::RGBA4 |
            PixelFormat::IA8 |
            PixelFormat::RG8 |
            PixelFormat::D16 => 16,
            PixelFormat::I8 | PixelFormat::A8 | PixelFormat::IA4 | PixelFormat::ETC1A4 => 8,
            PixelFormat::I4 | PixelFormat::A4 | PixelFormat::ETC1 => 4,
            PixelFormat::Invalid => 0,
        }
    }

    /// Bytes per pixel, rounded up for the sub-byte formats so staging
    /// buffer sizing never truncates.
    pub fn bytes_per_pixel(self) -> u32 {
        self.bits_per_pixel().div_ceil(8)
    }

    pub fn surface_type(self) -> SurfaceType {
        match self {
            PixelFormat::RGBA8 |
            PixelFormat::RGB8 |
            PixelFormat::RGB5A1 |
            PixelFormat::RGB565 |
            PixelFormat::RGBA4 => SurfaceType::Color,
            PixelFormat::IA8 |
            PixelFormat::RG8 |
            PixelFormat::I8 |
            PixelFormat::A8 |
            PixelFormat::IA4 |
            PixelFormat::I4 |
            PixelFormat::A4 |
            PixelFormat::ETC1 |
            PixelFormat::ETC1A4 => SurfaceType::Texture,
            PixelFormat::D16 | PixelFormat::D24 => SurfaceType::Depth,
            PixelFormat::D24S8 => SurfaceType::DepthStencil,
            PixelFormat::Invalid => SurfaceType::Invalid,
        }
    }

    /// Whether the format stores opaque compressed blocks rather than
    /// addressable pixels. Compressed data is never swizzled.
    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::ETC1 | PixelFormat::ETC1A4)
    }
}

/// Two surfaces can only exchange texels through a plain blit when their
/// usage classes agree; anything else needs a registered reinterpreter.
pub fn formats_blittable(src: PixelFormat, dst: PixelFormat) -> bool {
    let ty = src.surface_type();
    ty == dst.surface_type() && ty != SurfaceType::Invalid
}

/// Decoded format of a custom texture loaded from disk. PNG replacements
/// decode to RGBA8; DDS/KTX containers carry block-compressed payloads
/// that the runtime consumes directly.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CustomPixelFormat {
    #[default]
    RGBA8,
    BC1,
    BC3,
    BC5,
    BC7,
    ASTC4,
}
