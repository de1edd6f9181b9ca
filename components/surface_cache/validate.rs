/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Validation: making a byte interval of a surface's host texture agree
//! with its authoritative source. In order of preference that source is
//! another cached surface (blit or clear), a cached surface of a
//! reinterpretable format, or guest memory itself (upload). The download
//! path is the inverse, used when flushing dirty regions back.

use euclid::{Point2D, Size2D};
use gpu_traits::{
    BufferTextureCopy, GuestRect, HostRect, HostTexture, PixelFormat, SurfaceType, TextureBlit,
    TextureRuntime, scale_rect,
};
use log::{debug, info, warn};

use crate::cache::{MatchFlags, ScaleMatch, SurfaceCache};
use crate::interval::SurfaceInterval;
use crate::params::SurfaceParams;
use crate::surface::SurfaceRef;
use crate::tiling::{swizzle_texture, unswizzle_texture};

/// Converts the bits of one pixel format into another on the host GPU.
/// Registered per `(source, dest)` pair; the cache consults the registry
/// when validation finds the requested bytes cached under a different
/// format of equal bit width.
pub trait FormatReinterpreter {
    fn source_format(&self) -> PixelFormat;
    fn dest_format(&self) -> PixelFormat;
    fn reinterpret(
        &self,
        runtime: &mut dyn TextureRuntime,
        src: HostTexture,
        src_rect: HostRect,
        dst: HostTexture,
        dst_rect: HostRect,
    ) -> bool;
}

/// Depth-stencil to colour aliasing, the reinterpretation guest titles
/// lean on hardest. The conversion itself is a backend concern; it is
/// submitted as a cross-class blit the runtime implements as a
/// conversion pass.
pub struct D24S8toRGBA8;

impl FormatReinterpreter for D24S8toRGBA8 {
    fn source_format(&self) -> PixelFormat {
        PixelFormat::D24S8
    }

    fn dest_format(&self) -> PixelFormat {
        PixelFormat::RGBA8
    }

    fn reinterpret(
        &self,
        runtime: &mut dyn TextureRuntime,
        src: HostTexture,
        src_rect: HostRect,
        dst: HostTexture,
        dst_rect: HostRect,
    ) -> bool {
        let blit = TextureBlit {
            surface_type: SurfaceType::DepthStencil,
            src_level: 0,
            dst_level: 0,
            src_layer: 0,
            dst_layer: 0,
            src_region: src_rect,
            dst_region: dst_rect,
        };
        runtime.blit_textures(src, dst, &blit)
    }
}

/// Writes `src` into `dst` with the byte order of every
/// `component_count`-wide pixel reversed.
fn reverse_components(src: &[u8], dst: &mut [u8], component_count: usize) {
    for (src_px, dst_px) in
        src.chunks_exact(component_count).zip(dst.chunks_exact_mut(component_count))
    {
        for (i, byte) in dst_px.iter_mut().enumerate() {
            *byte = src_px[component_count - 1 - i];
        }
    }
}

impl SurfaceCache {
    /// Makes `[addr, addr + size)` of `surface` valid, using the
    /// cheapest source available for each still-invalid piece.
    pub(crate) fn validate_surface(&mut self, surface: &SurfaceRef, addr: u32, size: u32) {
        if size == 0 {
            return;
        }

        let validate_interval = SurfaceInterval::from_extent(addr, size);
        if surface.borrow().params.surface_type == SurfaceType::Fill {
            // Fill surfaces are always valid once registered.
            debug_assert!(surface.borrow().is_region_valid(validate_interval));
            return;
        }

        let mut validate_regions =
            surface.borrow().invalid_regions.intersection(&validate_interval);

        while let Some(first) = validate_regions.first() {
            let interval = first.intersection(&validate_interval);
            let params = surface.borrow().params.from_interval(interval);

            // Look for a valid surface to copy from.
            if let Some(copy_surface) =
                self.find_match(MatchFlags::COPY, &params, ScaleMatch::Ignore, Some(interval))
            {
                let copy_interval = copy_surface.borrow().copyable_interval(&params);
                self.copy_surface(&copy_surface, surface, copy_interval);
                surface.borrow_mut().invalid_regions.remove(copy_interval);
                validate_regions.remove(copy_interval);
                continue;
            }

            // Try surfaces cached under a different format that can be
            // reinterpreted to the requested one.
            if self.validate_by_reinterpretation(surface, &params, interval) {
                surface.borrow_mut().invalid_regions.remove(interval);
                validate_regions.remove(interval);
                continue;
            }

            if self.no_unimplemented_reinterpretations(surface, &params, interval) &&
                !self.interval_has_invalid_format(interval)
            {
                // The region was produced entirely on the GPU and no
                // cached source can express it; treating guest memory as
                // authoritative here would upload stale bytes.
                if self.dirty_regions.covers(interval) {
                    info!(
                        "Region created fully on the GPU with no valid reinterpretation; \
                         skipping validation"
                    );
                    validate_regions.remove(interval);
                    continue;
                }
            }

            // Load from guest memory, first flushing whatever competing
            // writer still owns those bytes. A failed upload (unmapped
            // guest pointer) leaves invalid_regions untouched so a later
            // draw retries.
            self.flush_region(params.addr, params.size, None);
            if self.upload_surface(surface, interval) {
                surface.borrow_mut().invalid_regions.remove(params.interval());
            }
            validate_regions.remove(params.interval());
        }
    }

    /// Copies guest bytes of `interval` into the surface's host texture
    /// through a staging buffer. Returns false when the guest pointer
    /// does not resolve.
    pub(crate) fn upload_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) -> bool {
        let surface_params = surface.borrow().params;
        let info = surface_params.from_interval(interval);
        debug_assert!(info.addr >= surface_params.addr && info.end <= surface_params.end);

        let mut upload_data = vec![0u8; (info.end - info.addr) as usize];
        let Some(read) = self.memory.read_physical(info.addr, &mut upload_data) else {
            return false;
        };
        if read < upload_data.len() {
            warn!(
                "Surface upload at {:#x} truncated by the guest mapping ({read}/{} bytes)",
                info.addr,
                upload_data.len()
            );
            return false;
        }

        if info.addr == surface_params.addr &&
            info.end == surface_params.end &&
            (self.settings.dump_textures || self.settings.custom_textures)
        {
            let hash = self.custom_tex_manager.compute_hash(&surface_params, &upload_data);
            if self.settings.custom_textures && self.upload_custom_surface(surface, hash) {
                // A replacement served the upload; the guest data is
                // neither needed nor worth dumping.
                return true;
            }
            if self.settings.dump_textures {
                self.custom_tex_manager.dump_texture(&surface_params, hash, &upload_data);
            }
        }

        let staging_size = (surface_params.width *
            surface_params.height *
            surface_params.pixel_format.bytes_per_pixel()) as usize;
        let mut staging = self.runtime.find_staging(staging_size, true);
        if staging.mapped.len() < staging_size {
            staging.mapped.resize(staging_size, 0);
        }

        let start_offset = (info.addr - surface_params.addr) as usize;
        if !surface_params.is_tiled {
            debug_assert_eq!(surface_params.surface_type, SurfaceType::Color);
            let dest = &mut staging.mapped[start_offset..start_offset + upload_data.len()];
            if self.runtime.reversed_channel_order() &&
                surface_params.pixel_format == PixelFormat::RGBA8
            {
                reverse_components(&upload_data, dest, 4);
            } else if self.runtime.reversed_channel_order() &&
                surface_params.pixel_format == PixelFormat::RGB8
            {
                reverse_components(&upload_data, dest, 3);
            } else {
                dest.copy_from_slice(&upload_data);
            }
        } else {
            unswizzle_texture(&surface_params, start_offset as u32, &upload_data, &mut staging.mapped);
        }

        let rect = surface_params.get_sub_rect(&info);
        self.upload_texture_rect(surface, rect, &staging);
        true
    }

    /// Substitutes a disk override for this upload when one matches the
    /// content hash. Overrides apply at native dimensions to RGBA8
    /// surfaces; anything else needs runtime-side format support and
    /// falls back to the guest data.
    fn upload_custom_surface(&mut self, surface: &SurfaceRef, hash: u64) -> bool {
        let surface_params = surface.borrow().params;

        let staging_size = {
            let Some(texture) = self.custom_tex_manager.get_texture(hash) else {
                return false;
            };
            if surface_params.pixel_format != PixelFormat::RGBA8 ||
                texture.format != gpu_traits::CustomPixelFormat::RGBA8
            {
                warn!(
                    "Replacement {} needs a format conversion the cache cannot do; \
                     falling back to guest data",
                    texture.path.display()
                );
                return false;
            }
            if texture.width != surface_params.width || texture.height != surface_params.height {
                warn!(
                    "Replacement {} is {}x{} but the surface is {}x{}; \
                     falling back to guest data",
                    texture.path.display(),
                    texture.width,
                    texture.height,
                    surface_params.width,
                    surface_params.height
                );
                return false;
            }
            texture.staging_size
        };

        let mut staging = self.runtime.find_staging(staging_size, true);
        let decoded = match self.custom_tex_manager.get_texture(hash) {
            Some(texture) => self.custom_tex_manager.decode_to_staging(texture, &mut staging),
            None => false,
        };
        if !decoded {
            return false;
        }

        debug!(
            "Replacing {}x{} surface at {:#x} with custom texture {hash:016X}",
            surface_params.width, surface_params.height, surface_params.addr
        );
        self.upload_texture_rect(surface, surface_params.rect(), &staging);
        true
    }

    /// Uploads staging content into the unscaled `rect` of the surface's
    /// texture, routing through a native-size temporary when the surface
    /// is upscaled.
    fn upload_texture_rect(
        &mut self,
        surface: &SurfaceRef,
        rect: GuestRect,
        staging: &gpu_traits::StagingBuffer,
    ) {
        let params = surface.borrow().params;
        if params.surface_type == SurfaceType::Fill {
            return;
        }
        let Some(texture) = surface.borrow().texture else {
            return;
        };

        // Texel-to-byte conversion in bits so 4-bpp formats land on
        // their packed offsets; sub-rects are tile aligned, so the
        // division is exact.
        let buffer_offset =
            (((rect.min.y * params.stride + rect.min.x) * params.bits_per_pixel()) / 8) as usize;
        let (width, height) = (rect.width(), rect.height());

        if params.res_scale == 1 {
            let copy = BufferTextureCopy {
                buffer_offset,
                buffer_size: staging.mapped.len(),
                buffer_row_length: params.stride,
                buffer_height: params.height,
                surface_type: params.surface_type,
                level: 0,
                offset: Point2D::new(rect.min.x, rect.min.y),
                extent: Size2D::new(width, height),
            };
            self.runtime.upload_texture(texture, &copy, staging);
        } else {
            // Upload at 1x and blit up into the scaled surface texture.
            let Some(unscaled) = self.allocate_texture(params.pixel_format, width, height) else {
                return;
            };
            let copy = BufferTextureCopy {
                buffer_offset,
                buffer_size: staging.mapped.len(),
                buffer_row_length: params.stride,
                buffer_height: params.height,
                surface_type: params.surface_type,
                level: 0,
                offset: Point2D::origin(),
                extent: Size2D::new(width, height),
            };
            self.runtime.upload_texture(unscaled, &copy, staging);

            let blit = TextureBlit {
                surface_type: params.surface_type,
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_region: HostRect::new(Point2D::origin(), Point2D::new(width, height)),
                dst_region: scale_rect(rect, params.res_scale),
            };
            self.runtime.blit_textures(unscaled, texture, &blit);
            self.release_texture(params.pixel_format, width, height, unscaled);
        }

        surface.borrow_mut().invalidate_watchers();
    }

    /// Writes `interval` of the surface's host content back to guest
    /// memory at byte-exact resolution.
    pub(crate) fn download_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) {
        let surface_params = surface.borrow().params;
        debug_assert!(
            interval.start >= surface_params.addr && interval.end <= surface_params.end
        );

        if surface_params.surface_type == SurfaceType::Fill {
            self.download_fill_surface(surface, interval);
            return;
        }

        let staging_size = (surface_params.width *
            surface_params.height *
            surface_params.pixel_format.bytes_per_pixel()) as usize;
        let mut staging = self.runtime.find_staging(staging_size, false);
        if staging.mapped.len() < staging_size {
            staging.mapped.resize(staging_size, 0);
        }

        let params = surface_params.from_interval(interval);
        let rect = surface_params.get_sub_rect(&params);
        let buffer_offset = (((rect.min.y * surface_params.stride + rect.min.x) *
            surface_params.bits_per_pixel()) /
            8) as usize;
        let Some(texture) = surface.borrow().texture else {
            return;
        };

        let (width, height) = (rect.width(), rect.height());
        if surface_params.res_scale != 1 {
            // Blit the scaled rect down to a native-size texture and read
            // that instead.
            let Some(unscaled) =
                self.allocate_texture(surface_params.pixel_format, width, height)
            else {
                return;
            };
            let blit = TextureBlit {
                surface_type: surface_params.surface_type,
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_region: scale_rect(rect, surface_params.res_scale),
                dst_region: HostRect::new(Point2D::origin(), Point2D::new(width, height)),
            };
            self.runtime.blit_textures(texture, unscaled, &blit);

            let copy = BufferTextureCopy {
                buffer_offset,
                buffer_size: staging.mapped.len(),
                buffer_row_length: surface_params.stride,
                buffer_height: surface_params.height,
                surface_type: surface_params.surface_type,
                level: 0,
                offset: Point2D::origin(),
                extent: Size2D::new(width, height),
            };
            self.runtime.read_texture(unscaled, &copy, surface_params.pixel_format, &mut staging.mapped);
            self.release_texture(surface_params.pixel_format, width, height, unscaled);
        } else {
            let copy = BufferTextureCopy {
                buffer_offset,
                buffer_size: staging.mapped.len(),
                buffer_row_length: surface_params.stride,
                buffer_height: surface_params.height,
                surface_type: surface_params.surface_type,
                level: 0,
                offset: Point2D::new(rect.min.x, rect.min.y),
                extent: Size2D::new(width, height),
            };
            self.runtime.read_texture(texture, &copy, surface_params.pixel_format, &mut staging.mapped);
        }

        let start_offset = (interval.start - surface_params.addr) as usize;
        let len = interval.len() as usize;
        if !surface_params.is_tiled {
            debug_assert_eq!(surface_params.surface_type, SurfaceType::Color);
            let source = &staging.mapped[start_offset..start_offset + len];
            if self.runtime.reversed_channel_order() &&
                surface_params.pixel_format == PixelFormat::RGBA8
            {
                let mut out = vec![0u8; len];
                reverse_components(source, &mut out, 4);
                self.memory.write_physical(interval.start, &out);
            } else if self.runtime.reversed_channel_order() &&
                surface_params.pixel_format == PixelFormat::RGB8
            {
                let mut out = vec![0u8; len];
                reverse_components(source, &mut out, 3);
                self.memory.write_physical(interval.start, &out);
            } else {
                self.memory.write_physical(interval.start, source);
            }
        } else {
            let mut out = vec![0u8; len];
            swizzle_texture(&surface_params, start_offset as u32, &staging.mapped, &mut out);
            self.memory.write_physical(interval.start, &out);
        }
    }

    /// Fast path for fill surfaces: re-materialize the repeating pattern
    /// over the flushed bytes. The pattern is anchored at the surface
    /// base, so a flush that starts mid-pattern naturally leaves the
    /// partial prefix in guest memory untouched.
    fn download_fill_surface(&mut self, surface: &SurfaceRef, interval: SurfaceInterval) {
        let (base_addr, fill_data, fill_size) = {
            let surface = surface.borrow();
            (surface.params.addr, surface.fill_data, surface.fill_size)
        };
        debug_assert!(fill_size >= 2);

        let start_offset = interval.start - base_addr;
        let out: Vec<u8> = (0..interval.len())
            .map(|i| fill_data[((start_offset + i) % fill_size) as usize])
            .collect();
        self.memory.write_physical(interval.start, &out);
    }

    /// Serves `interval` by converting a surface cached under another
    /// format of the same bit width through a registered reinterpreter.
    fn validate_by_reinterpretation(
        &mut self,
        surface: &SurfaceRef,
        params: &SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        let dst_format = surface.borrow().params.pixel_format;

        for index in 0..self.reinterpreters.len() {
            let source_format = self.reinterpreters[index].source_format();
            if self.reinterpreters[index].dest_format() != dst_format {
                continue;
            }

            let mut find_params = *params;
            find_params.pixel_format = source_format;
            let Some(reinterpret_surface) =
                self.find_match(MatchFlags::COPY, &find_params, ScaleMatch::Ignore, Some(interval))
            else {
                continue;
            };

            let reinterpret_interval =
                reinterpret_surface.borrow().copyable_interval(&find_params);
            let reinterpret_params = surface.borrow().params.from_interval(reinterpret_interval);
            let src_rect =
                reinterpret_surface.borrow().params.get_scaled_sub_rect(&reinterpret_params);
            let dest_rect = surface.borrow().params.get_scaled_sub_rect(&reinterpret_params);

            let Some(src_texture) = reinterpret_surface.borrow().texture else {
                continue;
            };
            let Some(dst_texture) = surface.borrow().texture else {
                continue;
            };

            let src_scale = reinterpret_surface.borrow().params.res_scale;
            let dst_scale = surface.borrow().params.res_scale;
            if src_scale == 1 && dst_scale != 1 {
                // The destination is upscaled; convert at 1x into an
                // intermediate and let a blit do the scaling.
                let width = dest_rect.width() / dst_scale;
                let height = dest_rect.height() / dst_scale;
                let tmp_rect = HostRect::new(Point2D::origin(), Point2D::new(width, height));
                let Some(tmp_texture) = self.allocate_texture(dst_format, width, height) else {
                    continue;
                };

                self.reinterpreters[index].reinterpret(
                    &mut *self.runtime,
                    src_texture,
                    src_rect,
                    tmp_texture,
                    tmp_rect,
                );
                let blit = TextureBlit {
                    surface_type: dst_format.surface_type(),
                    src_level: 0,
                    dst_level: 0,
                    src_layer: 0,
                    dst_layer: 0,
                    src_region: tmp_rect,
                    dst_region: dest_rect,
                };
                self.runtime.blit_textures(tmp_texture, dst_texture, &blit);
                self.release_texture(dst_format, width, height, tmp_texture);
            } else {
                self.reinterpreters[index].reinterpret(
                    &mut *self.runtime,
                    src_texture,
                    src_rect,
                    dst_texture,
                    dest_rect,
                );
            }
            return true;
        }
        false
    }

    /// Probes every format of the surface's bit width for a cached copy
    /// source, to tell "nothing is cached here" apart from "something is
    /// cached but we lack its reinterpreter". Returns false when a
    /// reinterpreter is missing.
    fn no_unimplemented_reinterpretations(
        &self,
        surface: &SurfaceRef,
        params: &SurfaceParams,
        interval: SurfaceInterval,
    ) -> bool {
        let surface_bpp = surface.borrow().params.bits_per_pixel();
        let surface_format = surface.borrow().params.pixel_format;
        let mut implemented = true;

        for format in PixelFormat::ALL {
            if format.bits_per_pixel() != surface_bpp {
                continue;
            }
            let mut probe = *params;
            probe.pixel_format = format;
            if self
                .find_match(MatchFlags::COPY, &probe, ScaleMatch::Ignore, Some(interval))
                .is_some()
            {
                warn!("Missing pixel format reinterpreter: {format:?} -> {surface_format:?}");
                implemented = false;
            }
        }
        implemented
    }

    /// True when a surface with an Invalid pixel format overlaps
    /// `interval`.
    fn interval_has_invalid_format(&self, interval: SurfaceInterval) -> bool {
        for (_, surface) in self.surface_map.iter_overlaps(interval) {
            let surface = surface.borrow();
            if surface.params.pixel_format == PixelFormat::Invalid {
                debug!("Surface {:#x} found with invalid pixel format", surface.params.addr);
                return true;
            }
        }
        false
    }
}
