/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;

/// Video-related settings the enclosing process resolves from its
/// configuration and hands to the surface cache at construction.
#[derive(Clone, Debug)]
pub struct VideoSettings {
    /// Host upscale factor, 1..=10. A configured value of 0 means
    /// "follow window scaling" and is resolved by the embedder before it
    /// reaches the cache.
    pub resolution_factor: u32,
    /// Substitute uploads with matching textures found on disk.
    pub custom_textures: bool,
    /// Write uploaded textures to the dump directory as PNG.
    pub dump_textures: bool,
    /// Hash decoded RGBA bytes instead of raw guest bytes, for packs made
    /// with older dumpers.
    pub compatibility_mode: bool,
    /// Root of the custom-texture load tree; the per-title directory is
    /// appended.
    pub textures_dir: PathBuf,
    /// Root of the texture dump tree.
    pub dump_dir: PathBuf,
    /// Title id of the running guest program, used to segregate texture
    /// packs per game.
    pub title_id: u64,
}

impl Default for VideoSettings {
    fn default() -> VideoSettings {
        VideoSettings {
            resolution_factor: 1,
            custom_textures: false,
            dump_textures: false,
            compatibility_mode: false,
            textures_dir: PathBuf::new(),
            dump_dir: PathBuf::new(),
            title_id: 0,
        }
    }
}
