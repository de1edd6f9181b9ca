/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::num::NonZeroU64;

use euclid::{Point2D, Size2D};

use crate::format::{PixelFormat, SurfaceType};
use crate::units::{HostPixel, HostRect};

/// Opaque handle to a texture owned by the host-GPU backend. Handles are
/// plain ids so the cache can store them in recycler pools and hash maps
/// without holding backend types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HostTexture(NonZeroU64);

impl HostTexture {
    pub fn from_raw(raw: u64) -> Option<HostTexture> {
        NonZeroU64::new(raw).map(HostTexture)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

/// A texture-to-texture blit submission. Regions are in host texels and
/// may differ in size; the backend filters as needed.
#[derive(Clone, Copy, Debug)]
pub struct TextureBlit {
    pub surface_type: SurfaceType,
    pub src_level: u32,
    pub dst_level: u32,
    pub src_layer: u32,
    pub dst_layer: u32,
    pub src_region: HostRect,
    pub dst_region: HostRect,
}

/// A rectangular clear of one mip level of a texture.
#[derive(Clone, Copy, Debug)]
pub struct TextureClear {
    pub surface_type: SurfaceType,
    pub format: PixelFormat,
    pub level: u32,
    pub rect: HostRect,
}

/// Value a [`TextureClear`] writes, matching the cleared texture's usage
/// class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
    DepthStencil(f32, u8),
}

/// Describes a transfer between a staging buffer and a texture region.
#[derive(Clone, Copy, Debug)]
pub struct BufferTextureCopy {
    pub buffer_offset: usize,
    pub buffer_size: usize,
    /// Texels per buffer row; the surface stride, not the copy width.
    pub buffer_row_length: u32,
    pub buffer_height: u32,
    pub surface_type: SurfaceType,
    pub level: u32,
    pub offset: Point2D<u32, HostPixel>,
    pub extent: Size2D<u32, HostPixel>,
}

/// CPU-visible staging memory handed out by the runtime. The cache fills
/// (or drains) `mapped` and hands the buffer straight back with the
/// transfer call.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    pub mapped: Vec<u8>,
}

/// Host-GPU operations the surface cache consumes. A backend implements
/// this once; the cache drives it from a single thread and relies on
/// submissions taking effect in call order.
pub trait TextureRuntime {
    fn allocate_2d(&mut self, width: u32, height: u32, format: PixelFormat)
    -> Option<HostTexture>;

    fn allocate_cube(&mut self, width: u32, format: PixelFormat) -> Option<HostTexture>;

    fn destroy_texture(&mut self, texture: HostTexture);

    fn blit_textures(&mut self, src: HostTexture, dst: HostTexture, blit: &TextureBlit) -> bool;

    fn clear_texture(&mut self, texture: HostTexture, clear: &TextureClear, value: ClearValue)
    -> bool;

    fn upload_texture(
        &mut self,
        texture: HostTexture,
        copy: &BufferTextureCopy,
        staging: &StagingBuffer,
    ) -> bool;

    fn read_texture(
        &mut self,
        texture: HostTexture,
        copy: &BufferTextureCopy,
        format: PixelFormat,
        out_bytes: &mut [u8],
    ) -> bool;

    /// Returns a staging buffer with at least `size` bytes mapped.
    fn find_staging(&mut self, size: usize, upload: bool) -> StagingBuffer;

    /// True when the backend stores RGBA8/RGB8 with reversed channel
    /// order, in which case linear uploads and downloads byte-swap.
    fn reversed_channel_order(&self) -> bool {
        false
    }
}
