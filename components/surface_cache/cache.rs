/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The surface cache proper: an interval-indexed multiset of live
//! surfaces, the match-finder that decides how a request can be served
//! from what is already resident, and the flush/invalidate protocol that
//! keeps overlapping surfaces and guest memory mutually consistent.
//!
//! All public entry points take `&mut self`; the embedder serializes
//! access from the GPU command thread, and reentrant operations
//! (invalidate flushing competing writers, validation uploading) are
//! plain inner calls rather than lock re-acquisitions.

use std::mem;
use std::rc::Rc;

use bitflags::bitflags;
use euclid::{Box2D, Point2D};
use gpu_traits::{
    GuestMemory, GuestPixel, GuestRect, HostRect, HostTexture, PAddr, PixelFormat, SurfaceType,
    TextureBlit, TextureClear, TextureRuntime, VideoSettings, formats_blittable,
};
use log::error;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::custom_tex::CustomTexManager;
use crate::interval::{IntervalMap, IntervalMultiMap, IntervalSet, SurfaceInterval};
use crate::mip::{CachedTextureCube, TextureCubeConfig};
use crate::page_tracker::PageCountTracker;
use crate::params::{FILL_RES_SCALE, SurfaceParams, align_up};
use crate::surface::{CachedSurface, SurfaceRef};
use crate::validate::FormatReinterpreter;

/// How strictly a request's `res_scale` must be honoured by a match.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScaleMatch {
    /// Only accept the same scale.
    Exact,
    /// Accept the same or a higher scale.
    Upscale,
    /// Accept any scale.
    Ignore,
}

bitflags! {
    /// Kinds of match the finder may consider for a candidate surface.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MatchFlags: u32 {
        /// Candidates may be only partially valid over the request.
        const INVALID = 1;
        /// Candidate matches the request exactly.
        const EXACT = 1 << 1;
        /// Candidate fully encompasses the request.
        const SUB_RECT = 1 << 2;
        /// Candidate can serve as a copy source for validation.
        const COPY = 1 << 3;
        /// Candidate could be grown to cover the request as well.
        const EXPAND = 1 << 4;
        /// Candidate satisfies a "texture copy" display transfer.
        const TEX_COPY = 1 << 5;
    }
}

/// A texture sampling request, as decoded from the guest's texture unit
/// configuration.
#[derive(Clone, Copy, Debug)]
pub struct TextureInfo {
    pub addr: PAddr,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// A guest memory-fill configuration: a byte range filled with a 16-,
/// 24- or 32-bit repeating pattern.
#[derive(Clone, Copy, Debug)]
pub struct MemoryFillConfig {
    pub start: PAddr,
    pub end: PAddr,
    pub fill_data: [u8; 4],
    pub fill_size: u32,
}

/// The guest's framebuffer configuration for a draw.
#[derive(Clone, Copy, Debug)]
pub struct FramebufferConfig {
    pub width: u32,
    pub height: u32,
    pub color_addr: PAddr,
    pub color_format: PixelFormat,
    pub depth_addr: PAddr,
    pub depth_format: PixelFormat,
}

/// Result of a framebuffer acquisition: the render target pair and the
/// draw rectangle both share, in host texels.
pub struct FramebufferSurfaces {
    pub color: Option<SurfaceRef>,
    pub depth: Option<SurfaceRef>,
    pub fb_rect: HostRect,
}

/// Key of the host-texture recycler: textures are interchangeable when
/// format and scaled dimensions agree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct HostTextureTag {
    format: PixelFormat,
    width: u32,
    height: u32,
}

pub struct SurfaceCache {
    pub(crate) memory: Rc<dyn GuestMemory>,
    pub(crate) runtime: Box<dyn TextureRuntime>,
    pub(crate) settings: VideoSettings,
    pub(crate) custom_tex_manager: CustomTexManager,
    pub(crate) surface_map: IntervalMultiMap<SurfaceRef>,
    pub(crate) dirty_regions: IntervalMap<SurfaceRef>,
    remove_surfaces: Vec<SurfaceRef>,
    /// Unregistered surfaces whose host texture has not been reclaimed
    /// yet because callers may still hold references.
    detached: Vec<SurfaceRef>,
    pub(crate) texture_cube_cache: FxHashMap<TextureCubeConfig, CachedTextureCube>,
    host_texture_recycler: FxHashMap<HostTextureTag, Vec<HostTexture>>,
    pub(crate) page_tracker: PageCountTracker,
    pub(crate) reinterpreters: Vec<Box<dyn FormatReinterpreter>>,
    pub(crate) resolution_scale_factor: u32,
}

impl SurfaceCache {
    pub fn new(
        memory: Rc<dyn GuestMemory>,
        runtime: Box<dyn TextureRuntime>,
        settings: VideoSettings,
    ) -> SurfaceCache {
        let mut custom_tex_manager = CustomTexManager::new(&settings);
        if settings.custom_textures {
            custom_tex_manager.find_custom_textures();
        }
        SurfaceCache {
            memory,
            runtime,
            resolution_scale_factor: settings.resolution_factor.max(1),
            settings,
            custom_tex_manager,
            surface_map: IntervalMultiMap::new(),
            dirty_regions: IntervalMap::new(),
            remove_surfaces: Vec::new(),
            detached: Vec::new(),
            texture_cube_cache: FxHashMap::default(),
            host_texture_recycler: FxHashMap::default(),
            page_tracker: PageCountTracker::new(),
            reinterpreters: vec![Box::new(crate::validate::D24S8toRGBA8)],
        }
    }

    pub fn resolution_scale_factor(&self) -> u32 {
        self.resolution_scale_factor
    }

    /// Adds a format reinterpreter the validator may use to serve one
    /// format's bytes from a surface cached in another.
    pub fn register_reinterpreter(&mut self, reinterpreter: Box<dyn FormatReinterpreter>) {
        self.reinterpreters.push(reinterpreter);
    }

    /// Switches the global upscale factor, dropping every cached surface
    /// after writing dirty content back to the guest.
    pub fn set_resolution_scale(&mut self, scale: u32) {
        let scale = scale.max(1);
        if scale == self.resolution_scale_factor {
            return;
        }
        self.resolution_scale_factor = scale;
        self.flush_all();
        self.unregister_all();
        self.clear_cube_cache();
        self.sweep_detached();
    }

    /// The best cached surface for the given search, or `None`. The
    /// selection is a lexicographic maximum over (res_scale, validity,
    /// matched length): a higher-resolution host texture is preferred
    /// since downscaling on demand is cheap next to re-uploading.
    pub(crate) fn find_match(
        &self,
        flags: MatchFlags,
        params: &SurfaceParams,
        match_scale_type: ScaleMatch,
        validate_interval: Option<SurfaceInterval>,
    ) -> Option<SurfaceRef> {
        let mut best: Option<SurfaceRef> = None;
        let mut best_valid = false;
        let mut best_scale = 0u32;
        let mut best_interval = SurfaceInterval::default();

        for (_, candidate) in self.surface_map.iter_overlaps(params.interval()) {
            let surface = candidate.borrow();
            let res_scale_matched = match match_scale_type {
                ScaleMatch::Exact => params.res_scale == surface.params.res_scale,
                _ => params.res_scale <= surface.params.res_scale,
            };
            // Copy candidates check validity through the copyable
            // interval instead.
            let is_valid = if flags.contains(MatchFlags::COPY) {
                true
            } else {
                surface.is_region_valid(validate_interval.unwrap_or_else(|| params.interval()))
            };
            if !flags.contains(MatchFlags::INVALID) && !is_valid {
                continue;
            }

            let mut checks: SmallVec<[(bool, SurfaceInterval); 5]> = SmallVec::new();
            if flags.contains(MatchFlags::EXACT) {
                checks.push((surface.params.exact_match(params), surface.interval()));
            }
            if flags.contains(MatchFlags::SUB_RECT) {
                checks.push((surface.params.can_sub_rect(params), surface.interval()));
            }
            if flags.contains(MatchFlags::COPY) {
                debug_assert!(validate_interval.is_some());
                let validate = validate_interval.unwrap_or_else(|| params.interval());
                let copy_interval = surface.copyable_interval(&params.from_interval(validate));
                let matched = copy_interval.intersection(&validate).len() != 0 &&
                    surface.can_copy(params, copy_interval);
                checks.push((matched, copy_interval));
            }
            if flags.contains(MatchFlags::EXPAND) {
                checks.push((surface.params.can_expand(params), surface.interval()));
            }
            if flags.contains(MatchFlags::TEX_COPY) {
                checks.push((surface.params.can_tex_copy(params), surface.interval()));
            }

            let scale = surface.params.res_scale;
            let is_fill = surface.params.surface_type == SurfaceType::Fill;
            for (matched, interval) in checks {
                if !matched {
                    continue;
                }
                if !res_scale_matched && match_scale_type != ScaleMatch::Ignore && !is_fill {
                    continue;
                }
                let better = if scale != best_scale {
                    scale > best_scale
                } else if is_valid != best_valid {
                    is_valid
                } else {
                    interval.len() > best_interval.len()
                };
                if better {
                    best = Some(candidate.clone());
                    best_valid = is_valid;
                    best_scale = scale;
                    best_interval = interval;
                }
            }
        }
        best
    }

    /// Acquires a surface exactly matching `params`, creating (and
    /// optionally validating) one when nothing in the cache fits.
    pub fn get_surface(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<SurfaceRef> {
        if params.addr == 0 || params.width * params.height == 0 {
            return None;
        }
        if params.width != params.stride {
            // Strided requests go through get_surface_sub_rect.
            error!("Surface request at {:#x} has width {} != stride {}",
                params.addr, params.width, params.stride);
            return None;
        }
        if params.is_tiled && (params.width % 8 != 0 || params.height % 8 != 0) {
            error!("Tiled surface request at {:#x} has unaligned size {}x{}",
                params.addr, params.width, params.height);
            return None;
        }

        let mut surface =
            self.find_match(MatchFlags::EXACT | MatchFlags::INVALID, params, match_res_scale, None);

        if surface.is_none() {
            let mut target_res_scale = params.res_scale;
            if match_res_scale != ScaleMatch::Exact {
                // The request may be a subrect of a surface cached at a
                // higher scale; adopt that scale up front to avoid a
                // later upscale.
                let mut find_params = *params;
                if let Some(expandable) = self.find_match(
                    MatchFlags::EXPAND | MatchFlags::INVALID,
                    &find_params,
                    match_res_scale,
                    None,
                ) {
                    target_res_scale = target_res_scale.max(expandable.borrow().params.res_scale);
                }
                // Let RGBA8 requests adopt the scale of an aliasing
                // depth-stencil buffer they will be reinterpreted from.
                if params.pixel_format == PixelFormat::RGBA8 {
                    find_params.pixel_format = PixelFormat::D24S8;
                    if let Some(expandable) = self.find_match(
                        MatchFlags::EXPAND | MatchFlags::INVALID,
                        &find_params,
                        match_res_scale,
                        None,
                    ) {
                        target_res_scale =
                            target_res_scale.max(expandable.borrow().params.res_scale);
                    }
                }
            }

            let mut new_params = *params;
            new_params.res_scale = target_res_scale;
            let created = self.create_surface(&new_params)?;
            self.register_surface(&created);
            surface = Some(created);
        }

        let surface = surface?;
        if load_if_create {
            self.validate_surface(&surface, params.addr, params.size);
        }
        Some(surface)
    }

    /// Acquires a surface covering `params` when the request is narrower
    /// than its stride, returning the matched surface and the scaled
    /// rectangle the request occupies inside it.
    pub fn get_surface_sub_rect(
        &mut self,
        params: &SurfaceParams,
        match_res_scale: ScaleMatch,
        load_if_create: bool,
    ) -> Option<(SurfaceRef, HostRect)> {
        if params.addr == 0 || params.width * params.height == 0 {
            return None;
        }

        let mut surface = self.find_match(
            MatchFlags::SUB_RECT | MatchFlags::INVALID,
            params,
            match_res_scale,
            None,
        );

        // If the match failed only because of resolution, synthesize a
        // surface shaped like the lower-res one at the requested scale so
        // the old one stops being used.
        if surface.is_none() && match_res_scale != ScaleMatch::Ignore {
            if let Some(found) = self.find_match(
                MatchFlags::SUB_RECT | MatchFlags::INVALID,
                params,
                ScaleMatch::Ignore,
                None,
            ) {
                let mut new_params = found.borrow().params;
                new_params.res_scale = params.res_scale;
                let created = self.create_surface(&new_params)?;
                self.register_surface(&created);
                surface = Some(created);
            }
        }

        let mut aligned_params = *params;
        if params.is_tiled {
            aligned_params.height = align_up(params.height, 8);
            aligned_params.width = align_up(params.width, 8);
            aligned_params.stride = align_up(params.stride, 8);
            aligned_params.update_params();
        }

        // Check for a surface we can expand before creating a new one.
        if surface.is_none() {
            if let Some(expandable) = self.find_match(
                MatchFlags::EXPAND | MatchFlags::INVALID,
                &aligned_params,
                match_res_scale,
                None,
            ) {
                aligned_params.width = aligned_params.stride;
                aligned_params.update_params();

                let mut new_params = expandable.borrow().params;
                new_params.addr = aligned_params.addr.min(new_params.addr);
                new_params.end = aligned_params.end.max(new_params.end);
                new_params.size = new_params.end - new_params.addr;
                new_params.height =
                    new_params.size / aligned_params.bytes_in_pixels(aligned_params.stride);
                debug_assert_eq!(
                    new_params.size % aligned_params.bytes_in_pixels(aligned_params.stride),
                    0
                );

                let new_surface = self.create_surface(&new_params)?;
                self.duplicate_surface(&expandable, &new_surface);

                // The expanded surface can't be deleted yet; it may still
                // be in use. Unlink its watchers as if it were and queue
                // it for removal.
                expandable.borrow_mut().unlink_watchers();
                self.queue_removal(&expandable);

                self.register_surface(&new_surface);
                surface = Some(new_surface);
            }
        }

        let surface = match surface {
            // No subrect found; create a gap-less surface spanning the
            // full stride and retry through get_surface.
            None => {
                let mut new_params = aligned_params;
                new_params.width = aligned_params.stride;
                new_params.update_params();
                self.get_surface(&new_params, match_res_scale, load_if_create)?
            },
            Some(surface) => {
                if load_if_create {
                    self.validate_surface(&surface, aligned_params.addr, aligned_params.size);
                }
                surface
            },
        };

        let rect = surface.borrow().params.get_scaled_sub_rect(params);
        Some((surface, rect))
    }

    /// Acquires the surface backing a texture sampling request, keeping
    /// its mip chain valid up to `max_level`.
    pub fn get_texture_surface(
        &mut self,
        info: &TextureInfo,
        max_level: u32,
    ) -> Option<SurfaceRef> {
        if info.addr == 0 {
            return None;
        }
        self.sweep_detached();

        let mut params = SurfaceParams::new();
        params.addr = info.addr;
        params.width = info.width;
        params.height = info.height;
        params.is_tiled = true;
        params.pixel_format = info.format;
        params.update_params();

        let min_width = info.width >> max_level;
        let min_height = info.height >> max_level;
        if min_width % 8 != 0 || min_height % 8 != 0 {
            error!("Texture size ({min_width}x{min_height}) is not multiple of 8");
            return None;
        }
        if info.width != (min_width << max_level) || info.height != (min_height << max_level) {
            error!(
                "Texture size ({}x{}) does not support required mipmap level ({max_level})",
                params.width, params.height
            );
            return None;
        }

        let surface = self.get_surface(&params, ScaleMatch::Ignore, true)?;

        if max_level != 0 {
            self.update_mip_chain(&surface, max_level)?;
        }

        Some(surface)
    }

    /// Registers a surface representing a repeating fill pattern over a
    /// byte range. Fill surfaces match any scale and validate copies by
    /// clearing.
    pub fn get_fill_surface(&mut self, config: &MemoryFillConfig) -> SurfaceRef {
        let mut params = SurfaceParams::new();
        params.addr = config.start;
        params.end = config.end;
        params.size = params.end - params.addr;
        params.surface_type = SurfaceType::Fill;
        params.res_scale = FILL_RES_SCALE;

        let mut surface = CachedSurface::new(params);
        surface.fill_data = config.fill_data;
        surface.fill_size = config.fill_size;
        debug_assert!(matches!(config.fill_size, 2..=4));

        let surface = Rc::new(std::cell::RefCell::new(surface));
        self.register_surface(&surface);
        surface
    }

    /// Finds a surface able to satisfy a guest "texture copy" display
    /// transfer, validating it over the copy range.
    pub fn get_tex_copy_surface(
        &mut self,
        params: &SurfaceParams,
    ) -> Option<(SurfaceRef, HostRect)> {
        let match_surface = self.find_match(
            MatchFlags::TEX_COPY | MatchFlags::INVALID,
            params,
            ScaleMatch::Ignore,
            None,
        )?;
        self.validate_surface(&match_surface, params.addr, params.size);

        let match_params = match_surface.borrow().params;
        let match_subrect = if params.width != params.stride {
            // Strided texture copies address raw bytes; convert them to
            // texels of the matched surface.
            let tiled_size = if match_params.is_tiled { 8 } else { 1 };
            let mut subrect = *params;
            subrect.width = match_params.pixels_in_bytes(params.width) / tiled_size;
            subrect.stride = match_params.pixels_in_bytes(params.stride) / tiled_size;
            subrect.height *= tiled_size;
            subrect
        } else {
            let subrect = match_params.from_interval(params.interval());
            debug_assert_eq!(subrect.interval(), params.interval());
            subrect
        };

        let rect = match_params.get_scaled_sub_rect(&match_subrect);
        Some((match_surface, rect))
    }

    /// Acquires the colour/depth surface pair for a draw over `viewport`.
    pub fn get_framebuffer_surfaces(
        &mut self,
        using_color_fb: bool,
        using_depth_fb: bool,
        config: &FramebufferConfig,
        viewport_rect: Box2D<i32, GuestPixel>,
    ) -> FramebufferSurfaces {
        self.sweep_detached();
        let mut using_depth_fb = using_depth_fb;

        let clamp_to = |value: i32, limit: u32| value.clamp(0, limit as i32) as u32;
        let viewport_clamped = GuestRect::new(
            Point2D::new(
                clamp_to(viewport_rect.min.x, config.width),
                clamp_to(viewport_rect.min.y, config.height),
            ),
            Point2D::new(
                clamp_to(viewport_rect.max.x, config.width),
                clamp_to(viewport_rect.max.y, config.height),
            ),
        );

        let mut color_params = SurfaceParams::new();
        color_params.is_tiled = true;
        color_params.res_scale = self.resolution_scale_factor;
        color_params.width = config.width;
        color_params.height = config.height;
        let mut depth_params = color_params;

        color_params.addr = config.color_addr;
        color_params.pixel_format = config.color_format;
        color_params.update_params();

        depth_params.addr = config.depth_addr;
        depth_params.pixel_format = config.depth_format;
        depth_params.update_params();

        let color_vp_interval = if using_color_fb {
            color_params.get_sub_rect_interval(viewport_clamped)
        } else {
            SurfaceInterval::default()
        };
        let depth_vp_interval = if using_depth_fb {
            depth_params.get_sub_rect_interval(viewport_clamped)
        } else {
            SurfaceInterval::default()
        };

        // Make sure that framebuffers don't overlap if both color and
        // depth are being used.
        if using_color_fb &&
            using_depth_fb &&
            color_vp_interval.intersection(&depth_vp_interval).len() != 0
        {
            error!(
                "Color and depth framebuffer memory regions overlap; \
                 overlapping framebuffers not supported!"
            );
            using_depth_fb = false;
        }

        let mut color_rect = HostRect::zero();
        let mut color_surface = None;
        if using_color_fb {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&color_params, ScaleMatch::Exact, false)
            {
                color_surface = Some(surface);
                color_rect = rect;
            }
        }

        let mut depth_rect = HostRect::zero();
        let mut depth_surface = None;
        if using_depth_fb {
            if let Some((surface, rect)) =
                self.get_surface_sub_rect(&depth_params, ScaleMatch::Exact, false)
            {
                depth_surface = Some(surface);
                depth_rect = rect;
            }
        }

        let mut fb_rect = HostRect::zero();
        match (&color_surface, &depth_surface) {
            (Some(_), Some(_)) => {
                fb_rect = color_rect;
                // Color and depth surfaces must have the same dimensions
                // and offsets.
                if color_rect != depth_rect {
                    color_surface = self.get_surface(&color_params, ScaleMatch::Exact, false);
                    depth_surface = self.get_surface(&depth_params, ScaleMatch::Exact, false);
                    if let Some(color) = &color_surface {
                        fb_rect = color.borrow().params.scaled_rect();
                    }
                }
            },
            (Some(_), None) => fb_rect = color_rect,
            (None, Some(_)) => fb_rect = depth_rect,
            (None, None) => {},
        }

        if let Some(color) = &color_surface {
            self.validate_surface(color, color_vp_interval.start, color_vp_interval.len());
            color.borrow_mut().invalidate_watchers();
        }
        if let Some(depth) = &depth_surface {
            self.validate_surface(depth, depth_vp_interval.start, depth_vp_interval.len());
            depth.borrow_mut().invalidate_watchers();
        }

        FramebufferSurfaces { color: color_surface, depth: depth_surface, fb_rect }
    }

    /// Blits between two surfaces' textures, if their formats allow it.
    pub fn blit_surfaces(
        &mut self,
        src_surface: &SurfaceRef,
        src_rect: HostRect,
        dst_surface: &SurfaceRef,
        dst_rect: HostRect,
    ) -> bool {
        let src_format = src_surface.borrow().params.pixel_format;
        let dst_format = dst_surface.borrow().params.pixel_format;
        if !formats_blittable(src_format, dst_format) {
            return false;
        }

        dst_surface.borrow_mut().invalidate_watchers();

        let (Some(src_texture), Some(dst_texture)) =
            (src_surface.borrow().texture, dst_surface.borrow().texture)
        else {
            return false;
        };
        let blit = TextureBlit {
            surface_type: src_surface.borrow().params.surface_type,
            src_level: 0,
            dst_level: 0,
            src_layer: 0,
            dst_layer: 0,
            src_region: src_rect,
            dst_region: dst_rect,
        };
        self.runtime.blit_textures(src_texture, dst_texture, &blit)
    }

    /// Copies `copy_interval` of `src_surface` into `dst_surface`: a
    /// clear for fill sources, a blit otherwise.
    pub(crate) fn copy_surface(
        &mut self,
        src_surface: &SurfaceRef,
        dst_surface: &SurfaceRef,
        copy_interval: SurfaceInterval,
    ) {
        let subrect_params = dst_surface.borrow().params.from_interval(copy_interval);
        debug_assert!(
            subrect_params.interval() == copy_interval && !Rc::ptr_eq(src_surface, dst_surface)
        );

        let dst_rect = dst_surface.borrow().params.get_scaled_sub_rect(&subrect_params);
        let (dst_type, dst_format, dst_texture) = {
            let dst = dst_surface.borrow();
            (dst.params.surface_type, dst.params.pixel_format, dst.texture)
        };

        if src_surface.borrow().params.surface_type == SurfaceType::Fill {
            let clear_value =
                src_surface.borrow().make_clear_value(copy_interval.start, dst_format);
            let Some(dst_texture) = dst_texture else {
                error!("Fill copy into a surface without a host texture");
                return;
            };
            let clear = TextureClear {
                surface_type: dst_type,
                format: dst_format,
                level: 0,
                rect: dst_rect,
            };
            self.runtime.clear_texture(dst_texture, &clear, clear_value);
            return;
        }

        if src_surface.borrow().params.can_sub_rect(&subrect_params) {
            let src_rect = src_surface.borrow().params.get_scaled_sub_rect(&subrect_params);
            let Some(src_texture) = src_surface.borrow().texture else {
                return;
            };
            let Some(dst_texture) = dst_texture else {
                return;
            };
            let blit = TextureBlit {
                surface_type: src_surface.borrow().params.surface_type,
                src_level: 0,
                dst_level: 0,
                src_layer: 0,
                dst_layer: 0,
                src_region: src_rect,
                dst_region: dst_rect,
            };
            self.runtime.blit_textures(src_texture, dst_texture, &blit);
            return;
        }

        error!("copy_surface reached with a source that can neither fill nor blit");
    }

    /// Copies `src_surface`'s full content and dirty attribution into the
    /// enclosing `dest_surface`.
    pub(crate) fn duplicate_surface(
        &mut self,
        src_surface: &SurfaceRef,
        dest_surface: &SurfaceRef,
    ) {
        let src_params = src_surface.borrow().params;
        let dest_params = dest_surface.borrow().params;
        debug_assert!(dest_params.addr <= src_params.addr && dest_params.end >= src_params.end);

        let src_rect = src_params.scaled_rect();
        let dst_rect = dest_params.get_scaled_sub_rect(&src_params);
        self.blit_surfaces(src_surface, src_rect, dest_surface, dst_rect);

        {
            let src = src_surface.borrow();
            let mut dest = dest_surface.borrow_mut();
            dest.invalid_regions.remove(src.interval());
            let src_invalid = src.invalid_regions.clone();
            dest.invalid_regions.union_with(&src_invalid);
        }

        let mut transferred = IntervalSet::new();
        for (interval, owner) in self.dirty_regions.iter_overlaps(src_params.interval()) {
            if Rc::ptr_eq(owner, src_surface) {
                transferred.insert(interval);
            }
        }
        for interval in transferred.iter().collect::<Vec<_>>() {
            self.dirty_regions.set(interval, dest_surface.clone());
        }
    }

    /// Writes any dirty host content overlapping `[addr, addr + size)`
    /// back to guest memory. When `flush_surface` is given only regions
    /// owned by that surface flush.
    pub fn flush_region(&mut self, addr: PAddr, size: u32, flush_surface: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }

        let flush_interval = SurfaceInterval::from_extent(addr, size);
        let mut flushed_intervals = IntervalSet::new();

        let candidates: Vec<(SurfaceInterval, SurfaceRef)> = self
            .dirty_regions
            .iter_overlaps(flush_interval)
            .map(|(interval, surface)| (interval, surface.clone()))
            .collect();

        for (stored_interval, surface) in candidates {
            // Small sizes imply the guest CPU is polling; flush the whole
            // dirty interval since the same region tends to be read again
            // immediately.
            let interval = if size <= 8 {
                stored_interval
            } else {
                stored_interval.intersection(&flush_interval)
            };

            if let Some(filter) = flush_surface {
                if !Rc::ptr_eq(filter, &surface) {
                    continue;
                }
            }

            // This surface is the most recent writer of the region, so it
            // must consider it valid.
            debug_assert!(surface.borrow().is_region_valid(interval));

            self.download_surface(&surface, interval);
            flushed_intervals.insert(interval);
        }

        for interval in flushed_intervals.iter().collect::<Vec<_>>() {
            self.dirty_regions.subtract(interval);
        }
    }

    pub fn flush_all(&mut self) {
        self.flush_region(0, u32::MAX, None);
    }

    /// Marks `[addr, addr + size)` as rewritten by `region_owner`, or by
    /// the guest CPU when no owner is given. Other surfaces covering the
    /// range lose validity there; small CPU writes evict the affected
    /// surfaces outright so their pages can stop trapping.
    pub fn invalidate_region(&mut self, addr: PAddr, size: u32, region_owner: Option<&SurfaceRef>) {
        if size == 0 {
            return;
        }

        let invalid_interval = SurfaceInterval::from_extent(addr, size);

        if let Some(owner) = region_owner {
            let mut owner_mut = owner.borrow_mut();
            debug_assert_ne!(owner_mut.params.surface_type, SurfaceType::Texture);
            debug_assert!(
                addr >= owner_mut.params.addr && addr + size <= owner_mut.params.end,
                "owner must contain the invalidated range"
            );
            // Surfaces can't have a gap.
            debug_assert_eq!(owner_mut.params.width, owner_mut.params.stride);
            owner_mut.invalid_regions.remove(invalid_interval);
        }

        let overlapping: Vec<SurfaceRef> = self
            .surface_map
            .iter_overlaps(invalid_interval)
            .map(|(_, surface)| surface.clone())
            .collect();

        for cached_surface in overlapping {
            if let Some(owner) = region_owner {
                if Rc::ptr_eq(owner, &cached_surface) {
                    continue;
                }
            }

            // If the CPU is invalidating this region, remove the surface
            // so the memory pages can likely be marked uncached again.
            if region_owner.is_none() && size <= 8 {
                let (surface_addr, surface_size) = {
                    let surface = cached_surface.borrow();
                    (surface.params.addr, surface.params.size)
                };
                self.flush_region(surface_addr, surface_size, Some(&cached_surface));
                self.queue_removal(&cached_surface);
                continue;
            }

            {
                let mut surface = cached_surface.borrow_mut();
                let interval = surface.interval().intersection(&invalid_interval);
                surface.invalid_regions.insert(interval);
                surface.invalidate_watchers();
            }

            // Fully invalid surfaces only clog the cache.
            if cached_surface.borrow().is_fully_invalid() {
                self.queue_removal(&cached_surface);
            }
        }

        match region_owner {
            Some(owner) => self.dirty_regions.set(invalid_interval, owner.clone()),
            None => self.dirty_regions.subtract(invalid_interval),
        }

        self.process_removals(region_owner);
        self.sweep_detached();
    }

    /// Discards every cached surface, optionally flushing dirty content
    /// to guest memory first, and releases all tracked pages.
    pub fn clear_all(&mut self, flush: bool) {
        if flush {
            self.flush_all();
        }
        self.unregister_all();
        self.clear_cube_cache();
        // Dirty attributions hold strong references; drop them before the
        // sweep so evicted textures actually land in the recycler.
        self.dirty_regions.clear();
        self.sweep_detached();

        let recycled: Vec<HostTexture> =
            self.host_texture_recycler.drain().flat_map(|(_, textures)| textures).collect();
        for texture in recycled {
            self.runtime.destroy_texture(texture);
        }

        self.page_tracker.clear_all(&*self.memory);
    }

    fn unregister_all(&mut self) {
        while let Some(surface) = self.surface_map.first().map(|(_, surface)| surface.clone()) {
            self.unregister_surface(&surface);
        }
    }

    fn clear_cube_cache(&mut self) {
        let cubes: Vec<CachedTextureCube> =
            self.texture_cube_cache.drain().map(|(_, cube)| cube).collect();
        for cube in cubes {
            if let Some(texture) = cube.texture {
                self.runtime.destroy_texture(texture);
            }
        }
    }

    fn queue_removal(&mut self, surface: &SurfaceRef) {
        if !self.remove_surfaces.iter().any(|queued| Rc::ptr_eq(queued, surface)) {
            self.remove_surfaces.push(surface.clone());
        }
    }

    /// Unregisters everything queued for removal. When the removed
    /// surface is the current region owner its content is first rescued
    /// into an enclosing surface, provided that surface would not lose
    /// information in the transfer.
    fn process_removals(&mut self, region_owner: Option<&SurfaceRef>) {
        let removals = mem::take(&mut self.remove_surfaces);
        for remove_surface in removals {
            if let Some(owner) = region_owner {
                if Rc::ptr_eq(&remove_surface, owner) {
                    let owner_params = owner.borrow().params;
                    let expanded = self.find_match(
                        MatchFlags::SUB_RECT | MatchFlags::INVALID,
                        &owner_params,
                        ScaleMatch::Ignore,
                        None,
                    );
                    let expanded = expanded.filter(|surface| !Rc::ptr_eq(surface, owner));
                    let Some(expanded) = expanded else {
                        error!("No surface to rescue the removed region owner into");
                        continue;
                    };

                    let salvageable = {
                        let owner_ref = owner.borrow();
                        let expanded_ref = expanded.borrow();
                        owner_ref
                            .invalid_regions
                            .difference(&expanded_ref.invalid_regions)
                            .is_empty()
                    };
                    if salvageable {
                        self.duplicate_surface(owner, &expanded);
                    } else {
                        continue;
                    }
                }
            }
            self.unregister_surface(&remove_surface);
        }
    }

    /// Allocates a host texture of the given shape, preferring the
    /// recycler over the runtime.
    pub(crate) fn allocate_texture(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Option<HostTexture> {
        let tag = HostTextureTag { format, width, height };
        if let Some(texture) = self.host_texture_recycler.get_mut(&tag).and_then(Vec::pop) {
            return Some(texture);
        }
        let texture = self.runtime.allocate_2d(width, height, format);
        if texture.is_none() {
            error!("Runtime refused a {width}x{height} {format:?} allocation");
        }
        texture
    }

    /// Returns a host texture to the recycler for the next allocation of
    /// matching shape.
    pub(crate) fn release_texture(
        &mut self,
        format: PixelFormat,
        width: u32,
        height: u32,
        texture: HostTexture,
    ) {
        let tag = HostTextureTag { format, width, height };
        self.host_texture_recycler.entry(tag).or_default().push(texture);
    }

    fn create_surface(&mut self, params: &SurfaceParams) -> Option<SurfaceRef> {
        let texture =
            self.allocate_texture(params.pixel_format, params.scaled_width(), params.scaled_height())?;

        let mut surface = CachedSurface::new(*params);
        surface.invalid_regions.insert(params.interval());
        surface.texture = Some(texture);
        Some(Rc::new(std::cell::RefCell::new(surface)))
    }

    pub(crate) fn register_surface(&mut self, surface: &SurfaceRef) {
        let (interval, addr, size, registered) = {
            let surface = surface.borrow();
            (surface.interval(), surface.params.addr, surface.params.size, surface.registered)
        };
        if registered {
            return;
        }
        surface.borrow_mut().registered = true;
        self.surface_map.insert(interval, surface.clone());
        self.page_tracker.update_pages_cached_count(&*self.memory, addr, size, 1);
    }

    pub(crate) fn unregister_surface(&mut self, surface: &SurfaceRef) {
        let (interval, addr, size, registered) = {
            let surface = surface.borrow();
            (surface.interval(), surface.params.addr, surface.params.size, surface.registered)
        };
        if !registered {
            return;
        }
        surface.borrow_mut().registered = false;
        self.page_tracker.update_pages_cached_count(&*self.memory, addr, size, -1);
        self.surface_map.remove(interval, |candidate| Rc::ptr_eq(candidate, surface));
        self.detached.push(surface.clone());
    }

    /// Reclaims host textures of unregistered surfaces nothing references
    /// anymore. Runs at entry points, i.e. the cache's safe points.
    pub(crate) fn sweep_detached(&mut self) {
        let detached = mem::take(&mut self.detached);
        for surface in detached {
            if Rc::strong_count(&surface) == 1 {
                let mut surface = surface.borrow_mut();
                if let Some(texture) = surface.texture.take() {
                    let tag = HostTextureTag {
                        format: surface.params.pixel_format,
                        width: surface.params.scaled_width(),
                        height: surface.params.scaled_height(),
                    };
                    self.host_texture_recycler.entry(tag).or_default().push(texture);
                }
            } else {
                self.detached.push(surface);
            }
        }
    }
}
