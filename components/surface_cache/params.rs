/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! [`SurfaceParams`] describes a guest-memory region interpreted as a 2D
//! image, and carries the geometric predicates the match-finder applies.
//! All address arithmetic is in guest bytes; rectangle coordinates are in
//! guest texels with `min = (left, bottom)`, `max = (right, top)`.

use euclid::Point2D;
use gpu_traits::{GuestRect, HostRect, PAddr, PixelFormat, SurfaceType, scale_rect};

use crate::interval::SurfaceInterval;

/// Sentinel `res_scale` for fill surfaces, which match any host scale.
pub const FILL_RES_SCALE: u32 = u32::MAX;

pub fn align_down(value: u32, alignment: u32) -> u32 {
    value - value % alignment
}

pub fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurfaceParams {
    pub addr: PAddr,
    pub end: PAddr,
    pub size: u32,
    /// Dimensions in guest pixels; `stride >= width`.
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Mip count, 1..=8.
    pub levels: u32,
    /// Integer host upscale factor, or [`FILL_RES_SCALE`].
    pub res_scale: u32,
    /// Tiled surfaces store texels in 8x8 Z-order micro-tiles.
    pub is_tiled: bool,
    pub pixel_format: PixelFormat,
    pub surface_type: SurfaceType,
}

impl SurfaceParams {
    pub fn new() -> SurfaceParams {
        SurfaceParams { levels: 1, res_scale: 1, ..SurfaceParams::default() }
    }

    /// Recomputes the derived members (`stride`, `surface_type`, `size`,
    /// `end`) from `addr`, `width`, `height` and `pixel_format`.
    pub fn update_params(&mut self) {
        if self.stride == 0 {
            self.stride = self.width;
        }
        self.surface_type = self.pixel_format.surface_type();
        self.size = if self.is_tiled {
            self.bytes_in_pixels(self.stride * 8 * (self.height / 8 - 1) + self.width * 8)
        } else {
            self.bytes_in_pixels(self.stride * (self.height - 1) + self.width)
        };
        self.end = self.addr + self.size;
    }

    pub fn interval(&self) -> SurfaceInterval {
        SurfaceInterval::new(self.addr, self.end)
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.pixel_format.bits_per_pixel()
    }

    pub fn bytes_in_pixels(&self, pixels: u32) -> u32 {
        pixels * self.bits_per_pixel() / 8
    }

    pub fn pixels_in_bytes(&self, bytes: u32) -> u32 {
        bytes * 8 / self.bits_per_pixel()
    }

    pub fn scaled_width(&self) -> u32 {
        self.width * self.res_scale
    }

    pub fn scaled_height(&self) -> u32 {
        self.height * self.res_scale
    }

    pub fn rect(&self) -> GuestRect {
        GuestRect::new(Point2D::origin(), Point2D::new(self.width, self.height))
    }

    pub fn scaled_rect(&self) -> HostRect {
        scale_rect(self.rect(), self.res_scale)
    }

    /// True when `other` names exactly this surface.
    pub fn exact_match(&self, other: &SurfaceParams) -> bool {
        self.addr == other.addr &&
            self.width == other.width &&
            self.height == other.height &&
            self.stride == other.stride &&
            self.pixel_format == other.pixel_format &&
            self.is_tiled == other.is_tiled &&
            self.levels == other.levels &&
            self.pixel_format != PixelFormat::Invalid
    }

    /// True when `sub` names a rectangle fully inside this surface: same
    /// format and tiling, start aligned to a texel (a whole micro-tile
    /// when tiled), and either the strides agree or `sub` is at most one
    /// (tile) row tall.
    pub fn can_sub_rect(&self, sub: &SurfaceParams) -> bool {
        sub.addr >= self.addr &&
            sub.end <= self.end &&
            sub.pixel_format == self.pixel_format &&
            self.pixel_format != PixelFormat::Invalid &&
            sub.is_tiled == self.is_tiled &&
            (sub.addr - self.addr) % self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 }) ==
                0 &&
            (sub.stride == self.stride || sub.height <= if self.is_tiled { 8 } else { 1 }) &&
            self.get_sub_rect(sub).max.x <= self.stride
    }

    /// True when this surface could be grown to also cover `expanded`:
    /// same format, tiling and stride, ranges overlapping or abutting,
    /// and the two base addresses a whole number of (tile) rows apart.
    pub fn can_expand(&self, expanded: &SurfaceParams) -> bool {
        self.pixel_format != PixelFormat::Invalid &&
            self.pixel_format == expanded.pixel_format &&
            self.addr <= expanded.end &&
            expanded.addr <= self.end &&
            self.is_tiled == expanded.is_tiled &&
            self.stride == expanded.stride &&
            (expanded.addr.max(self.addr) - expanded.addr.min(self.addr)) %
                self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 }) ==
                0
    }

    /// Whether a guest "texture copy" display transfer described by
    /// `texcopy` can be satisfied from this surface. Texture-copy widths
    /// and strides are in bytes, not texels.
    pub fn can_tex_copy(&self, texcopy: &SurfaceParams) -> bool {
        if self.pixel_format == PixelFormat::Invalid ||
            self.addr > texcopy.addr ||
            self.end < texcopy.end
        {
            return false;
        }

        if texcopy.width != texcopy.stride {
            let tile_align = self.bytes_in_pixels(if self.is_tiled { 64 } else { 1 });
            let tile_stride = self.bytes_in_pixels(self.stride * if self.is_tiled { 8 } else { 1 });
            return (texcopy.addr - self.addr) % tile_align == 0 &&
                texcopy.width % tile_align == 0 &&
                (texcopy.height == 1 || texcopy.stride == tile_stride) &&
                ((texcopy.addr - self.addr) % tile_stride) + texcopy.width <= tile_stride;
        }

        self.from_interval(texcopy.interval()).interval() == texcopy.interval()
    }

    /// The unscaled rectangle inside this surface that `sub` occupies.
    /// Tiled rows count from the top of the image, linear rows from the
    /// bottom; either way the result satisfies `min <= max`.
    pub fn get_sub_rect(&self, sub: &SurfaceParams) -> GuestRect {
        let begin_pixel_index = self.pixels_in_bytes(sub.addr - self.addr);

        if self.is_tiled {
            let x0 = (begin_pixel_index % (self.stride * 8)) / 8;
            let y0 = (begin_pixel_index / (self.stride * 8)) * 8;
            return GuestRect::new(
                Point2D::new(x0, self.height - (y0 + sub.height)),
                Point2D::new(x0 + sub.width, self.height - y0),
            );
        }

        let x0 = begin_pixel_index % self.stride;
        let y0 = begin_pixel_index / self.stride;
        GuestRect::new(Point2D::new(x0, y0), Point2D::new(x0 + sub.width, y0 + sub.height))
    }

    pub fn get_scaled_sub_rect(&self, sub: &SurfaceParams) -> HostRect {
        scale_rect(self.get_sub_rect(sub), self.res_scale)
    }

    /// The smallest surface of the same layout covering the row-aligned
    /// extent of `interval`. A span within a single (tile) row collapses
    /// to a one-row surface whose width and stride equal the row's texel
    /// count.
    pub fn from_interval(&self, interval: SurfaceInterval) -> SurfaceParams {
        let mut params = *self;
        let tiled_size = if self.is_tiled { 8 } else { 1 };
        let stride_tiled_bytes = self.bytes_in_pixels(self.stride * tiled_size);

        let mut aligned_start =
            self.addr + align_down(interval.start - self.addr, stride_tiled_bytes);
        let mut aligned_end = self.addr + align_up(interval.end - self.addr, stride_tiled_bytes);

        if aligned_end - aligned_start > stride_tiled_bytes {
            params.addr = aligned_start;
            params.height = (aligned_end - aligned_start) / self.bytes_in_pixels(self.stride);
        } else {
            debug_assert_eq!(aligned_end - aligned_start, stride_tiled_bytes);
            let tile_align = self.bytes_in_pixels(if self.is_tiled { 8 * 8 } else { 1 });

            aligned_start = self.addr + align_down(interval.start - self.addr, tile_align);
            aligned_end = self.addr + align_up(interval.end - self.addr, tile_align);

            params.addr = aligned_start;
            params.width = self.pixels_in_bytes(aligned_end - aligned_start) / tiled_size;
            params.stride = params.width;
            params.height = tiled_size;
        }

        params.update_params();
        params
    }

    /// Inverse of [`SurfaceParams::get_sub_rect`]: the guest byte
    /// interval an unscaled rectangle occupies, with tiled coordinates
    /// rounded out to whole micro-tiles.
    pub fn get_sub_rect_interval(&self, unscaled_rect: GuestRect) -> SurfaceInterval {
        if unscaled_rect.width() == 0 || unscaled_rect.height() == 0 {
            return SurfaceInterval::default();
        }

        let mut left = unscaled_rect.min.x;
        let mut bottom = unscaled_rect.min.y;
        let mut right = unscaled_rect.max.x;
        let mut top = unscaled_rect.max.y;

        if self.is_tiled {
            // Compress to tile-row coordinates: x spans all 64 texels of
            // each touched tile column, y counts tile rows.
            left = align_down(left, 8) * 8;
            bottom = align_down(bottom, 8) / 8;
            right = align_up(right, 8) * 8;
            top = align_up(top, 8) / 8;
        }

        let stride_tiled = if self.is_tiled { self.stride * 8 } else { self.stride };
        let pixels = (top - bottom - 1) * stride_tiled + (right - left);
        let pixel_offset = stride_tiled *
            (if self.is_tiled { self.height / 8 - top } else { bottom }) +
            left;

        SurfaceInterval::new(
            self.addr + self.bytes_in_pixels(pixel_offset),
            self.addr + self.bytes_in_pixels(pixel_offset + pixels),
        )
    }
}
