/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared types and capability traits sitting between the rasterizer
//! surface cache and its two collaborators: the host-GPU backend (the
//! [`TextureRuntime`] capability) and the guest physical memory system
//! (the [`GuestMemory`] capability). The cache itself lives in the
//! `surface_cache` component and never talks to a concrete backend.

mod format;
mod memory;
mod runtime;
mod settings;
mod units;

pub use crate::format::{CustomPixelFormat, PixelFormat, SurfaceType, formats_blittable};
pub use crate::memory::{GuestMemory, NUM_TRACKED_PAGES, PAGE_BITS, PAGE_SIZE, PAddr};
pub use crate::runtime::{
    BufferTextureCopy, ClearValue, HostTexture, StagingBuffer, TextureBlit, TextureClear,
    TextureRuntime,
};
pub use crate::settings::VideoSettings;
pub use crate::units::{
    GuestPixel, GuestRect, GuestSize, HostPixel, HostRect, HostSize, scale_rect,
};
