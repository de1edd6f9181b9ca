/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! End-to-end behaviour of the surface cache against mock memory and
//! runtime capabilities: upload/download round trips, match preference,
//! the dirty/invalid protocol, aliasing, reinterpretation, cube assembly
//! and texture recycling.

mod common;

use std::rc::Rc;

use euclid::{Box2D, Point2D};
use gpu_traits::{PixelFormat, SurfaceType};
use surface_cache::{
    MemoryFillConfig, ScaleMatch, SurfaceInterval, TextureCubeConfig, TextureInfo,
};

use crate::common::{harness, pattern_bytes, surface_params};

#[test]
fn upload_download_round_trip() {
    let cases = [
        (PixelFormat::RGBA8, false),
        (PixelFormat::RGBA8, true),
        (PixelFormat::RGB8, false),
        (PixelFormat::RGB565, true),
        (PixelFormat::D16, true),
        (PixelFormat::D24S8, true),
    ];

    for (format, is_tiled) in cases {
        let base = 0x1800_0000;
        let mut h = harness(base, 1 << 20);
        let params = surface_params(base, 32, 32, format, is_tiled, 1);
        let bytes = pattern_bytes(params.size as usize, 0x17);

        h.memory.write(base, &bytes);
        let surface = h
            .cache
            .get_surface(&params, ScaleMatch::Exact, true)
            .expect("surface creation failed");
        assert!(surface.borrow().invalid_regions.is_empty());

        // Clobber guest memory, hand ownership of the range to the
        // surface, and flush it back out.
        h.memory.write(base, &vec![0u8; params.size as usize]);
        h.cache.invalidate_region(base, params.size, Some(&surface));
        h.cache.flush_region(base, params.size, None);

        assert_eq!(
            h.memory.read(base, params.size as usize),
            bytes,
            "round trip failed for {format:?} tiled={is_tiled}"
        );
    }
}

#[test]
fn find_match_prefers_higher_resolution() {
    let base = 0x1800_0000;
    let mut h = harness(base, 1 << 20);

    let params_1x = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1);
    let params_2x = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 2);

    let _s1 = h.cache.get_surface(&params_1x, ScaleMatch::Exact, true).unwrap();
    let s2 = h.cache.get_surface(&params_2x, ScaleMatch::Exact, true).unwrap();

    // A sub-rect request at any scale lands on the sharper surface.
    let sub = surface_params(base, 64, 16, PixelFormat::RGBA8, true, 1);
    let (matched, _rect) = h.cache.get_surface_sub_rect(&sub, ScaleMatch::Ignore, true).unwrap();
    assert!(Rc::ptr_eq(&matched, &s2));
}

#[test]
fn invalidation_attributes_dirty_bytes_to_owner() {
    let base = 0x1800_0000;
    let mut h = harness(base, 1 << 20);

    let params_1x = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1);
    let params_2x = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 2);
    let owner = h.cache.get_surface(&params_1x, ScaleMatch::Exact, true).unwrap();
    let other = h.cache.get_surface(&params_2x, ScaleMatch::Exact, true).unwrap();

    // One tile row, starting one tile row in.
    let tile_row = params_1x.bytes_in_pixels(64 * 8);
    let start = base + tile_row;
    h.cache.invalidate_region(start, tile_row, Some(&owner));

    let dirty = SurfaceInterval::new(start, start + tile_row);
    {
        let other = other.borrow();
        assert!(!other.is_region_valid(dirty));
        assert!(other.is_region_valid(SurfaceInterval::new(base, start)));
        assert!(
            other.is_region_valid(SurfaceInterval::new(start + tile_row, params_1x.end)),
            "invalidation must not leak outside the written range"
        );
        assert!(owner.borrow().is_region_valid(dirty));
    }

    // Flushing the range downloads from the owner, nobody else.
    h.cache.flush_region(start, tile_row, None);
    let owner_texture = owner.borrow().texture.unwrap();
    let state = h.runtime.borrow();
    assert_eq!(state.read_targets.as_slice(), &[owner_texture]);
}

#[test]
fn validation_is_idempotent_within_a_frame() {
    let base = 0x1800_0000;
    let mut h = harness(base, 1 << 20);
    let info =
        TextureInfo { addr: base, width: 64, height: 64, format: PixelFormat::RGBA8 };
    h.memory.write(base, &pattern_bytes(64 * 64 * 4, 3));

    let first = h.cache.get_texture_surface(&info, 0).unwrap();
    let uploads = h.runtime.borrow().uploads;
    let reads = h.memory.read_count.get();

    let second = h.cache.get_texture_surface(&info, 0).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert!(second.borrow().invalid_regions.is_empty());
    assert_eq!(h.runtime.borrow().uploads, uploads, "no host work on a warm hit");
    assert_eq!(h.memory.read_count.get(), reads, "no guest re-read on a warm hit");
}

#[test]
fn page_count_notifications_cancel_out() {
    let base = 0x1800_0000;
    let mut h = harness(base, 1 << 22);

    let regions = [
        surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1),
        surface_params(base + 0x2000, 64, 64, PixelFormat::RGB565, true, 1),
        surface_params(base + 0x100_000, 128, 128, PixelFormat::RGBA8, true, 1),
    ];
    let mut surfaces = Vec::new();
    for params in &regions {
        surfaces.push(h.cache.get_surface(params, ScaleMatch::Exact, false).unwrap());
    }
    drop(surfaces);
    h.cache.clear_all(false);

    let mut balance = std::collections::HashMap::new();
    for (addr, size, cached) in h.memory.cached_calls.borrow().iter() {
        for page in (*addr >> 12)..((*addr + *size - 1) >> 12) + 1 {
            *balance.entry(page).or_insert(0i32) += if *cached { 1 } else { -1 };
        }
    }
    assert!(balance.values().all(|&v| v == 0), "every cache call needs a matching uncache");
}

#[test]
fn fill_surface_downloads_pattern_with_offset() {
    let base = 0x1900_0000;
    let mut h = harness(base, 1 << 16);

    let start = base + 0x10;
    let config = MemoryFillConfig {
        start,
        end: start + 0x90,
        fill_data: [0x11, 0x22, 0x33, 0x00],
        fill_size: 3,
    };

    // Sentinel bytes everywhere so untouched memory is detectable.
    h.memory.write(base, &vec![0xEE; 0x100]);
    let fill = h.cache.get_fill_surface(&config);
    assert_eq!(fill.borrow().params.surface_type, SurfaceType::Fill);
    h.cache.invalidate_region(start, 0x90, Some(&fill));

    // Flush a sub-range that starts mid-pattern.
    h.cache.flush_region(start + 5, 0x40, None);

    let pattern = [0x11, 0x22, 0x33];
    let flushed = h.memory.read(start + 5, 0x40);
    for (i, byte) in flushed.iter().enumerate() {
        assert_eq!(*byte, pattern[(5 + i) % 3], "pattern mismatch at byte {i}");
    }
    // The partial-pattern prefix before the flush range is untouched.
    assert_eq!(h.memory.read(start, 5), vec![0xEE; 5]);
    assert_eq!(h.memory.read(start + 0x45, 8), vec![0xEE; 8]);
}

#[test]
fn framebuffer_reused_as_texture_without_flush() {
    let base = 0x1F00_0000;
    let mut h = harness(base, 1 << 21);

    // A colour target rendered to by the GPU.
    let params = surface_params(base, 512, 256, PixelFormat::RGBA8, true, 1);
    let color = h.cache.get_surface(&params, ScaleMatch::Exact, false).unwrap();
    h.cache.invalidate_region(base, params.size, Some(&color));

    let reads = h.memory.read_count.get();
    let info = TextureInfo { addr: base, width: 512, height: 256, format: PixelFormat::RGBA8 };
    let texture = h.cache.get_texture_surface(&info, 0).unwrap();

    assert!(Rc::ptr_eq(&texture, &color), "the render target itself must be reused");
    assert_eq!(h.memory.read_count.get(), reads, "no flush to guest memory");
    assert_eq!(h.runtime.borrow().uploads, 0);
}

#[test]
fn small_cpu_write_evicts_and_uncaches() {
    let base = 0x2000_0000;
    let mut h = harness(base, 1 << 21);

    let params = surface_params(base, 256, 256, PixelFormat::RGBA8, true, 1);
    let surface = h.cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();
    assert!(surface.borrow().registered);

    // Guest CPU pokes four bytes into the middle of the surface.
    h.cache.invalidate_region(base + 0x100, 4, None);

    assert!(!surface.borrow().registered, "small CPU writes evict the surface");
    let calls = h.memory.cached_calls.borrow();
    let uncached: u32 = calls.iter().filter(|(_, _, cached)| !cached).map(|(_, s, _)| s).sum();
    let cached: u32 = calls.iter().filter(|(_, _, cached)| *cached).map(|(_, s, _)| s).sum();
    assert_eq!(cached, uncached, "all pages covering the surface must be released");
}

#[test]
fn rgba8_request_adopts_depth_stencil_scale_and_reinterprets() {
    let base = 0x1E00_0000;
    let mut h = harness(base, 1 << 20);

    // A depth-stencil target at 2x, rendered by the GPU.
    let depth_params = surface_params(base, 64, 64, PixelFormat::D24S8, true, 2);
    let depth = h.cache.get_surface(&depth_params, ScaleMatch::Exact, false).unwrap();
    h.cache.invalidate_region(base, depth_params.size, Some(&depth));

    let reads = h.memory.read_count.get();
    let color_params = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1);
    let color = h.cache.get_surface(&color_params, ScaleMatch::Upscale, true).unwrap();

    // The new surface adopted the aliasing depth buffer's scale and was
    // validated by reinterpretation rather than an upload.
    assert_eq!(color.borrow().params.res_scale, 2);
    assert!(color.borrow().invalid_regions.is_empty());
    assert_eq!(h.memory.read_count.get(), reads);

    let depth_texture = depth.borrow().texture.unwrap();
    let color_texture = color.borrow().texture.unwrap();
    let state = h.runtime.borrow();
    assert!(
        state.blits.iter().any(|(src, dst, blit)| {
            *src == depth_texture &&
                *dst == color_texture &&
                blit.surface_type == SurfaceType::DepthStencil
        }),
        "expected a depth-stencil reinterpretation submission"
    );
}

#[test]
fn cube_faces_assemble_once_and_stay_valid() {
    let base = 0x1A00_0000;
    let mut h = harness(base, 1 << 22);

    let face_size = 128 * 128 * 4;
    let config = TextureCubeConfig {
        px: base,
        nx: base + face_size,
        py: base + face_size * 2,
        ny: base + face_size * 3,
        pz: base + face_size * 4,
        nz: base + face_size * 5,
        width: 128,
        format: PixelFormat::RGBA8,
    };

    let cube = h.cache.get_texture_cube(&config).expect("cube assembly failed");
    {
        let state = h.runtime.borrow();
        assert!(state.textures[&cube.raw()].cube);
        assert_eq!(state.textures[&cube.raw()].width, 128);

        let mut layers: Vec<u32> = state
            .blits
            .iter()
            .filter(|(_, dst, _)| *dst == cube)
            .map(|(_, _, blit)| blit.dst_layer)
            .collect();
        layers.sort_unstable();
        assert_eq!(layers, vec![0, 1, 2, 3, 4, 5], "each face blits into its own layer");
    }

    // All face watchers are valid now; a second draw reuses the
    // composite as-is.
    let blits_before = h.runtime.borrow().blits.len();
    let again = h.cache.get_texture_cube(&config).unwrap();
    assert_eq!(again, cube);
    assert_eq!(h.runtime.borrow().blits.len(), blits_before);
}

#[test]
fn narrow_request_expands_existing_surface() {
    let base = 0x1B00_0000;
    let mut h = harness(base, 1 << 21);

    let existing_params = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1);
    let existing = h.cache.get_surface(&existing_params, ScaleMatch::Exact, true).unwrap();

    // An abutting render target below the existing surface.
    let below = surface_params(existing_params.end, 64, 32, PixelFormat::RGBA8, true, 1);
    let (expanded, _rect) =
        h.cache.get_surface_sub_rect(&below, ScaleMatch::Exact, true).unwrap();

    assert_eq!(expanded.borrow().params.addr, base);
    assert_eq!(expanded.borrow().params.height, 96);
    assert!(!Rc::ptr_eq(&expanded, &existing));

    // The old surface's content was duplicated into the expansion.
    let old_texture = existing.borrow().texture.unwrap();
    let new_texture = expanded.borrow().texture.unwrap();
    assert!(
        h.runtime.borrow().blits.iter().any(|(src, dst, _)| {
            *src == old_texture && *dst == new_texture
        })
    );

    // Removal of the replaced surface is deferred to the next safe
    // point.
    assert!(existing.borrow().registered);
    h.cache.invalidate_region(base + 0x10_0000, 16, None);
    assert!(!existing.borrow().registered);
}

#[test]
fn evicted_texture_is_recycled_for_matching_shape() {
    let base = 0x1C00_0000;
    let mut h = harness(base, 1 << 21);

    let params = surface_params(base, 64, 64, PixelFormat::RGBA8, true, 1);
    let surface = h.cache.get_surface(&params, ScaleMatch::Exact, false).unwrap();
    let allocations = h.runtime.borrow().allocations;

    // CPU write evicts; dropping the handle lets the sweep reclaim the
    // texture at the next safe point.
    h.cache.invalidate_region(base + 4, 4, None);
    drop(surface);
    h.cache.invalidate_region(base + 0x10_0000, 16, None);

    let other = surface_params(base + 0x8_0000, 64, 64, PixelFormat::RGBA8, true, 1);
    let _second = h.cache.get_surface(&other, ScaleMatch::Exact, false).unwrap();
    assert_eq!(
        h.runtime.borrow().allocations,
        allocations,
        "a recycled texture must satisfy the matching allocation"
    );
}

#[test]
fn small_flush_writes_back_the_whole_dirty_interval() {
    let base = 0x1D00_0000;
    let mut h = harness(base, 1 << 20);

    let params = surface_params(base, 64, 64, PixelFormat::RGBA8, false, 1);
    let bytes = pattern_bytes(params.size as usize, 0x42);
    h.memory.write(base, &bytes);
    let surface = h.cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();

    h.memory.write(base, &vec![0u8; params.size as usize]);
    h.cache.invalidate_region(base, params.size, Some(&surface));

    // A four-byte CPU poll flushes the entire dirty interval: the guest
    // will almost certainly read around it next.
    h.cache.flush_region(base + 0x100, 4, None);
    assert_eq!(h.memory.read(base, params.size as usize), bytes);

    // Nothing left to flush afterwards.
    let reads = h.runtime.borrow().reads;
    h.cache.flush_region(base, params.size, None);
    assert_eq!(h.runtime.borrow().reads, reads);
}

#[test]
fn framebuffer_pair_acquisition_rejects_overlap() {
    let base = 0x1800_0000;
    let mut h = harness(base, 1 << 22);

    let config = surface_cache::FramebufferConfig {
        width: 64,
        height: 64,
        color_addr: base,
        color_format: PixelFormat::RGBA8,
        // Depth range overlapping the colour buffer.
        depth_addr: base + 0x1000,
        depth_format: PixelFormat::D24S8,
    };
    let viewport = Box2D::new(Point2D::new(0, 0), Point2D::new(64, 64));

    let result = h.cache.get_framebuffer_surfaces(true, true, &config, viewport);
    assert!(result.color.is_some());
    assert!(result.depth.is_none(), "overlapping depth buffer must be rejected");

    // With disjoint ranges both surfaces materialize and share a rect.
    let config = surface_cache::FramebufferConfig {
        depth_addr: base + 0x10_0000,
        ..config
    };
    let result = h.cache.get_framebuffer_surfaces(true, true, &config, viewport);
    let color = result.color.expect("color surface");
    let depth = result.depth.expect("depth surface");
    assert_eq!(color.borrow().params.surface_type, SurfaceType::Color);
    assert_eq!(depth.borrow().params.surface_type, SurfaceType::DepthStencil);
    assert_eq!(result.fb_rect.width(), 64);
    assert_eq!(result.fb_rect.height(), 64);
}
