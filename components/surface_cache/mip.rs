/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Composite resources derived from base surfaces through watchers: mip
//! chains blitted level-by-level into the base texture, and cube maps
//! assembled from six independently cached face surfaces.

use gpu_traits::{HostRect, HostTexture, PAddr, PixelFormat, SurfaceType, TextureBlit};
use log::error;

use crate::cache::{ScaleMatch, SurfaceCache, TextureInfo};
use crate::surface::{CachedSurface, SurfaceRef, WatcherRef};

/// Identity of a cube map: the six face addresses plus the shared width
/// and format.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TextureCubeConfig {
    pub px: PAddr,
    pub nx: PAddr,
    pub py: PAddr,
    pub ny: PAddr,
    pub pz: PAddr,
    pub nz: PAddr,
    pub width: u32,
    pub format: PixelFormat,
}

impl TextureCubeConfig {
    fn face_addrs(&self) -> [PAddr; 6] {
        [self.px, self.nx, self.py, self.ny, self.pz, self.nz]
    }
}

/// A composite cube texture plus one watcher per face surface. The
/// texture is allocated lazily once the face scales are known.
pub struct CachedTextureCube {
    pub texture: Option<HostTexture>,
    pub res_scale: u32,
    pub faces: [Option<WatcherRef>; 6],
}

impl Default for CachedTextureCube {
    fn default() -> CachedTextureCube {
        CachedTextureCube { texture: None, res_scale: 1, faces: [const { None }; 6] }
    }
}

impl SurfaceCache {
    /// Brings the mip chain of `surface` up to date for levels
    /// `1..=max_level`, blitting each level surface into the matching
    /// layer of the base texture when its watcher reports staleness.
    pub(crate) fn update_mip_chain(&mut self, surface: &SurfaceRef, max_level: u32) -> Option<()> {
        if max_level as usize > crate::surface::MAX_MIP_LEVELS {
            // The guest only supports textures between 8 and 1024 texels,
            // so at most eight levels including the base exist.
            error!("Unsupported mipmap level {max_level}");
            return None;
        }

        if surface.borrow().max_level < max_level {
            surface.borrow_mut().max_level = max_level;
        }

        let mut level_params = surface.borrow().params;
        for level in 1..=max_level {
            // Mip levels are stored contiguously after the previous
            // level's texels.
            level_params.addr +=
                level_params.bytes_in_pixels(level_params.width * level_params.height);
            level_params.width /= 2;
            level_params.height /= 2;
            level_params.stride = 0;
            level_params.update_params();

            let watcher_index = (level - 1) as usize;
            let needs_watcher = match &surface.borrow().level_watchers[watcher_index] {
                Some(watcher) => watcher.borrow().get().is_none(),
                None => true,
            };
            if needs_watcher {
                let level_surface = self.get_surface(&level_params, ScaleMatch::Ignore, true);
                let watcher =
                    level_surface.as_ref().map(|surface| CachedSurface::create_watcher(surface));
                surface.borrow_mut().level_watchers[watcher_index] = watcher;
            }

            let Some(watcher) = surface.borrow().level_watchers[watcher_index].clone() else {
                continue;
            };
            if watcher.borrow().is_valid() {
                continue;
            }
            let Some(level_surface) = watcher.borrow().get() else {
                continue;
            };

            let (level_addr, level_size, has_invalid) = {
                let level_surface = level_surface.borrow();
                (
                    level_surface.params.addr,
                    level_surface.params.size,
                    !level_surface.invalid_regions.is_empty(),
                )
            };
            if has_invalid {
                self.validate_surface(&level_surface, level_addr, level_size);
            }

            let src_rect = level_surface.borrow().params.scaled_rect();
            let dst_rect = level_params.scaled_rect();
            let (Some(src_texture), Some(dst_texture)) =
                (level_surface.borrow().texture, surface.borrow().texture)
            else {
                continue;
            };
            let blit = TextureBlit {
                surface_type: surface.borrow().params.surface_type,
                src_level: 0,
                dst_level: level,
                src_layer: 0,
                dst_layer: 0,
                src_region: src_rect,
                dst_region: dst_rect,
            };
            self.runtime.blit_textures(src_texture, dst_texture, &blit);
            watcher.borrow_mut().validate();
        }

        Some(())
    }

    /// Acquires the composite cube texture for `config`, (re)building
    /// whatever faces have gone stale since the last draw.
    pub fn get_texture_cube(&mut self, config: &TextureCubeConfig) -> Option<HostTexture> {
        self.sweep_detached();
        self.texture_cube_cache.entry(*config).or_default();

        // Re-resolve faces whose watcher is missing or whose surface
        // died. A face with an unmapped address keeps a `None` watcher;
        // such faces are leftover texture-unit state and never drawn.
        for (index, addr) in config.face_addrs().into_iter().enumerate() {
            let needs_watcher = match &self.texture_cube_cache[config].faces[index] {
                Some(watcher) => watcher.borrow().get().is_none(),
                None => true,
            };
            if !needs_watcher {
                continue;
            }

            let info = TextureInfo {
                addr,
                width: config.width,
                height: config.width,
                format: config.format,
            };
            let face_surface = self.get_texture_surface(&info, 0);
            let watcher = face_surface.as_ref().map(CachedSurface::create_watcher);
            if let Some(cube) = self.texture_cube_cache.get_mut(config) {
                cube.faces[index] = watcher;
            }
        }

        // The composite must be at least as sharp as its sharpest face.
        let max_scale = {
            let cube = &self.texture_cube_cache[config];
            let mut scale = 1;
            for watcher in cube.faces.iter().flatten() {
                if let Some(face_surface) = watcher.borrow().get() {
                    scale = scale.max(face_surface.borrow().params.res_scale);
                }
            }
            scale
        };

        let allocated = self.texture_cube_cache[config].texture;
        if let Some(texture) = allocated {
            if self.texture_cube_cache[config].res_scale != max_scale {
                // A face was recreated at a different scale; rebuild the
                // composite and re-blit every face.
                self.runtime.destroy_texture(texture);
                let cube = self.texture_cube_cache.get_mut(config)?;
                cube.texture = None;
                for watcher in cube.faces.iter().flatten() {
                    watcher.borrow_mut().invalidate();
                }
            }
        }

        if self.texture_cube_cache[config].texture.is_none() {
            let width = max_scale * config.width;
            let texture = self.runtime.allocate_cube(width, config.format)?;
            let cube = self.texture_cube_cache.get_mut(config)?;
            cube.texture = Some(texture);
            cube.res_scale = max_scale;
        }

        let scaled_size = self.texture_cube_cache[config].res_scale * config.width;
        for index in 0..6 {
            let Some(watcher) = self.texture_cube_cache[config].faces[index].clone() else {
                continue;
            };
            if watcher.borrow().is_valid() {
                continue;
            }
            let Some(face_surface) = watcher.borrow().get() else {
                continue;
            };

            let (face_addr, face_size, has_invalid) = {
                let face = face_surface.borrow();
                (face.params.addr, face.params.size, !face.invalid_regions.is_empty())
            };
            if has_invalid {
                self.validate_surface(&face_surface, face_addr, face_size);
            }

            let src_rect = face_surface.borrow().params.scaled_rect();
            let (Some(src_texture), Some(cube_texture)) =
                (face_surface.borrow().texture, self.texture_cube_cache[config].texture)
            else {
                continue;
            };
            let blit = TextureBlit {
                surface_type: SurfaceType::Color,
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: index as u32,
                src_region: src_rect,
                dst_region: HostRect::new(
                    euclid::Point2D::origin(),
                    euclid::Point2D::new(scaled_size, scaled_size),
                ),
            };
            self.runtime.blit_textures(src_texture, cube_texture, &blit);
            watcher.borrow_mut().validate();
        }

        self.texture_cube_cache[config].texture
    }
}
