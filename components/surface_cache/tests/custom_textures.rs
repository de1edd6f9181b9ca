/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Disk-backed texture replacement and dumping, driven through the full
//! upload path with real files in a temporary directory.

mod common;

use std::fs;
use std::path::PathBuf;

use gpu_traits::{PixelFormat, VideoSettings};
use surface_cache::{CustomTexManager, ScaleMatch, content_hash};

use crate::common::{harness_with_settings, pattern_bytes, surface_params};

const TITLE_ID: u64 = 0x0004_0000_0000_0007;

fn temp_root(test: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("surface-cache-{test}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn settings(root: &PathBuf) -> VideoSettings {
    VideoSettings {
        textures_dir: root.join("textures"),
        dump_dir: root.join("dump"),
        title_id: TITLE_ID,
        ..VideoSettings::default()
    }
}

fn title_dir(root: &PathBuf, which: &str) -> PathBuf {
    root.join(which).join(format!("{TITLE_ID:016X}"))
}

/// An 8x8 RGBA checkerboard nothing in the guest data resembles.
fn checkerboard_png_bytes() -> Vec<u8> {
    let mut pixels = Vec::with_capacity(8 * 8 * 4);
    for y in 0..8u32 {
        for x in 0..8u32 {
            let on = (x + y) % 2 == 0;
            pixels.extend_from_slice(if on { &[255, 0, 255, 255] } else { &[0, 255, 0, 255] });
        }
    }
    pixels
}

#[test]
fn matching_upload_is_replaced_and_not_dumped() {
    let root = temp_root("replace");
    let base = 0x1800_0000;

    let params = surface_params(base, 8, 8, PixelFormat::RGBA8, true, 1);
    let guest_bytes = pattern_bytes(params.size as usize, 0x21);
    let hash = content_hash(&guest_bytes);

    // Drop a replacement on disk under the name the manager looks for.
    let load_dir = title_dir(&root, "textures");
    fs::create_dir_all(&load_dir).unwrap();
    let replacement = checkerboard_png_bytes();
    image::save_buffer_with_format(
        load_dir.join(format!("tex1_8x8_{hash:016X}_0.png")),
        &replacement,
        8,
        8,
        image::ExtendedColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .unwrap();

    let mut settings = settings(&root);
    settings.custom_textures = true;
    settings.dump_textures = true;
    let mut h = harness_with_settings(base, 1 << 16, settings);

    h.memory.write(base, &guest_bytes);
    let surface = h.cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();

    // The decoded replacement, not the guest data, reached the host
    // texture.
    let texture = surface.borrow().texture.unwrap();
    assert_eq!(h.runtime.borrow().texture_data(texture), replacement.as_slice());
    assert!(surface.borrow().invalid_regions.is_empty());

    // Resolved uploads are not dumped. Dropping the cache joins the
    // worker pool first so no dump could still be in flight.
    drop(h.cache);
    let dumped = title_dir(&root, "dump");
    let dump_count = fs::read_dir(&dumped).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(dump_count, 0, "a replaced upload must not be dumped");

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn unmatched_upload_is_dumped_as_png() {
    let root = temp_root("dump");
    let base = 0x1800_0000;

    let params = surface_params(base, 8, 8, PixelFormat::RGBA8, true, 1);
    let guest_bytes = pattern_bytes(params.size as usize, 0x55);
    let hash = content_hash(&guest_bytes);

    let mut settings = settings(&root);
    settings.dump_textures = true;
    let mut h = harness_with_settings(base, 1 << 16, settings);

    h.memory.write(base, &guest_bytes);
    let _surface = h.cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();

    // Join the worker pool, then look for the dumped file.
    drop(h.cache);
    let dump_path =
        title_dir(&root, "dump").join(format!("tex1_8x8_{hash:016X}_{}.png", 0));
    assert!(dump_path.exists(), "missing dump at {}", dump_path.display());

    let dumped = image::open(&dump_path).unwrap().into_rgba8();
    assert_eq!((dumped.width(), dumped.height()), (8, 8));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn non_power_of_two_uploads_are_not_dumped() {
    let root = temp_root("npot");
    let base = 0x1800_0000;

    // 24x8 is renderable but not a texture shape worth dumping.
    let params = surface_params(base, 24, 8, PixelFormat::RGBA8, true, 1);
    let mut settings = settings(&root);
    settings.dump_textures = true;
    let mut h = harness_with_settings(base, 1 << 16, settings);

    let _surface = h.cache.get_surface(&params, ScaleMatch::Exact, true).unwrap();
    drop(h.cache);

    let dumped = title_dir(&root, "dump");
    let dump_count = fs::read_dir(&dumped).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(dump_count, 0);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn conflicting_hashes_keep_a_single_replacement() {
    let root = temp_root("conflict");
    let load_dir = title_dir(&root, "textures");
    fs::create_dir_all(&load_dir).unwrap();

    let hash = 0xDEAD_BEEF_CAFE_F00Du64;
    for name in
        [format!("tex1_8x8_{hash:016X}_0.png"), format!("tex1_16x16_{hash:016X}_0.png")]
    {
        image::save_buffer_with_format(
            load_dir.join(name),
            &checkerboard_png_bytes(),
            8,
            8,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .unwrap();
    }

    let mut settings = settings(&root);
    settings.custom_textures = true;
    let mut manager = CustomTexManager::new(&settings);
    manager.find_custom_textures();

    // One of the two conflicting files won; the other was discarded.
    assert!(manager.get_texture(hash).is_some());

    let _ = fs::remove_dir_all(&root);
}
