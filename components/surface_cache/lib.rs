/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The rasterizer surface cache: keeps guest-memory images and host-GPU
//! textures coherent while the guest CPU, the emulated GPU and the host
//! GPU all read and write overlapping memory.
//!
//! A [`SurfaceCache`] indexes live [`CachedSurface`]s by guest byte
//! interval. Draws acquire surfaces through the `get_*` entry points;
//! the match-finder reuses, expands or reinterprets cached data wherever
//! possible and only falls back to uploading guest bytes. Mutations mark
//! dirty regions and invalidate overlapping surfaces; guest reads flush
//! dirty host content back at byte-exact resolution. The cache drives
//! page-granular write trapping through the [`gpu_traits::GuestMemory`]
//! capability and submits all host-GPU work through
//! [`gpu_traits::TextureRuntime`].

mod cache;
mod custom_tex;
mod interval;
mod mip;
mod page_tracker;
mod params;
mod surface;
mod tiling;
mod validate;

pub use crate::cache::{
    FramebufferConfig, FramebufferSurfaces, MatchFlags, MemoryFillConfig, ScaleMatch,
    SurfaceCache, TextureInfo,
};
pub use crate::custom_tex::{CustomFileFormat, CustomTexManager, CustomTexture, content_hash};
pub use crate::interval::{IntervalMap, IntervalMultiMap, IntervalSet, SurfaceInterval};
pub use crate::mip::{CachedTextureCube, TextureCubeConfig};
pub use crate::page_tracker::PageCountTracker;
pub use crate::params::{FILL_RES_SCALE, SurfaceParams};
pub use crate::surface::{CachedSurface, SurfaceRef, SurfaceWatcher, WatcherRef};
pub use crate::tiling::{decode_guest_texture, swizzle_texture, unswizzle_texture};
pub use crate::validate::{D24S8toRGBA8, FormatReinterpreter};
