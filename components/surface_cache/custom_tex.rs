/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Disk-backed texture replacement. Uploaded textures are identified by
//! a 64-bit content hash; a matching file under the per-title load
//! directory overrides the guest data, and unmatched power-of-two
//! uploads can be dumped back out as PNG for pack authors. Decoding and
//! encoding run on a small worker pool so the GPU thread never blocks on
//! image I/O; workers only ever touch value-owned pixel buffers.

use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use gpu_traits::{CustomPixelFormat, StagingBuffer, VideoSettings};
use image::ImageFormat;
use log::{debug, error, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};

use crate::params::SurfaceParams;
use crate::tiling::decode_guest_texture;

/// How deep the load directory is searched. Pack authors like to nest.
const MAX_SCAN_DEPTH: u32 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CustomFileFormat {
    Png,
    Dds,
    Ktx,
}

/// A replacement texture discovered on disk. Until the first use only
/// the header has been examined; `data` holds the raw file (PNG) or the
/// extracted payload (DDS/KTX).
#[derive(Debug)]
pub struct CustomTexture {
    pub width: u32,
    pub height: u32,
    pub format: CustomPixelFormat,
    pub file_format: CustomFileFormat,
    pub path: PathBuf,
    pub staging_size: usize,
    pub data: Vec<u8>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fire-and-forget worker threads fed over a channel. Jobs own their
/// data outright; dropping the pool closes the channel and joins the
/// workers, finishing whatever was queued.
struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(name: &str) -> WorkerPool {
        let worker_count = num_cpus::get().saturating_sub(1).max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..worker_count)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}#{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("Thread spawning failed")
            })
            .collect();
        WorkerPool { sender: Some(sender), workers }
    }

    fn queue(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

pub struct CustomTexManager {
    load_dir: PathBuf,
    dump_dir: PathBuf,
    compatibility_mode: bool,
    custom_textures: FxHashMap<u64, CustomTexture>,
    dumped_textures: FxHashSet<u64>,
    textures_loaded: bool,
    workers: WorkerPool,
}

impl CustomTexManager {
    pub fn new(settings: &VideoSettings) -> CustomTexManager {
        let title = format!("{:016X}", settings.title_id);
        CustomTexManager {
            load_dir: settings.textures_dir.join(&title),
            dump_dir: settings.dump_dir.join(&title),
            compatibility_mode: settings.compatibility_mode,
            custom_textures: FxHashMap::default(),
            dumped_textures: FxHashSet::default(),
            textures_loaded: false,
            workers: WorkerPool::new("HiresProcessing"),
        }
    }

    /// Scans the per-title load directory for replacement textures.
    /// Only headers are parsed here; decode happens on first use.
    pub fn find_custom_textures(&mut self) {
        if self.textures_loaded {
            return;
        }
        self.textures_loaded = true;

        if !self.load_dir.exists() {
            if let Err(err) = fs::create_dir_all(&self.load_dir) {
                warn!("Unable to create {}: {err}", self.load_dir.display());
                return;
            }
        }

        let mut pending = vec![(self.load_dir.clone(), 0u32)];
        while let Some((dir, depth)) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if depth < MAX_SCAN_DEPTH {
                        pending.push((path, depth + 1));
                    }
                    continue;
                }

                let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                    continue;
                };
                let Some((hash, file_format)) = parse_texture_filename(name) else {
                    continue;
                };

                if let Some(existing) = self.custom_textures.get(&hash) {
                    error!(
                        "Textures {} and {} conflict, ignoring!",
                        existing.path.display(),
                        path.display()
                    );
                    continue;
                }

                let mut texture = CustomTexture {
                    width: 0,
                    height: 0,
                    format: CustomPixelFormat::RGBA8,
                    file_format,
                    path,
                    staging_size: 0,
                    data: Vec::new(),
                };
                if load_texture(&mut texture) {
                    self.custom_textures.insert(hash, texture);
                }
            }
        }

        debug!(
            "Found {} replacement textures under {}",
            self.custom_textures.len(),
            self.load_dir.display()
        );
    }

    /// Content hash of an upload, over raw guest bytes or (in
    /// compatibility mode) over the decoded RGBA image.
    pub fn compute_hash(&self, params: &SurfaceParams, data: &[u8]) -> u64 {
        if self.compatibility_mode {
            if let Some(decoded) = decode_guest_texture(params, data) {
                return content_hash(&decoded);
            }
        }
        content_hash(data)
    }

    pub fn get_texture(&self, hash: u64) -> Option<&CustomTexture> {
        let texture = self.custom_textures.get(&hash);
        if texture.is_none() {
            debug!("No replacement for surface upload with hash {hash:016X}");
        }
        texture
    }

    pub fn is_dumped(&self, hash: u64) -> bool {
        self.dumped_textures.contains(&hash)
    }

    /// Saves an uploaded texture under the dump directory as
    /// `tex1_<w>x<h>_<hash>_<format>.png`, once per hash. Non-power-of-2
    /// surfaces are almost certainly framebuffers and are skipped.
    pub fn dump_texture(&mut self, params: &SurfaceParams, hash: u64, data: &[u8]) {
        if self.dumped_textures.contains(&hash) {
            return;
        }

        let (width, height) = (params.width, params.height);
        if !width.is_power_of_two() || !height.is_power_of_two() {
            warn!("Not dumping {hash:016X} because size isn't a power of 2 ({width}x{height})");
            return;
        }

        let Some(decoded) = decode_guest_texture(params, data) else {
            debug!("Not dumping {hash:016X}: format {:?} has no CPU decoder", params.pixel_format);
            return;
        };

        let dump_dir = self.dump_dir.clone();
        let format = params.pixel_format as u32;
        self.workers.queue(move || {
            if let Err(err) = fs::create_dir_all(&dump_dir) {
                error!("Unable to create {}: {err}", dump_dir.display());
                return;
            }
            let path = dump_dir.join(format!("tex1_{width}x{height}_{hash:016X}_{format}.png"));
            if let Err(err) = image::save_buffer_with_format(
                &path,
                &decoded,
                width,
                height,
                image::ExtendedColorType::Rgba8,
                ImageFormat::Png,
            ) {
                error!("Failed to encode {}: {err}", path.display());
            }
        });
        self.dumped_textures.insert(hash);
    }

    /// Decodes `texture` into staging memory the runtime can consume.
    /// PNG decodes to RGBA8; compressed containers are copied through.
    pub fn decode_to_staging(&self, texture: &CustomTexture, staging: &mut StagingBuffer) -> bool {
        if staging.mapped.len() < texture.staging_size {
            staging.mapped.resize(texture.staging_size, 0);
        }
        match texture.file_format {
            CustomFileFormat::Png => {
                let image = match image::load_from_memory_with_format(&texture.data, ImageFormat::Png)
                {
                    Ok(image) => image.into_rgba8(),
                    Err(err) => {
                        error!("Failed to decode png {}: {err}", texture.path.display());
                        return false;
                    },
                };
                let pixels = image.into_raw();
                staging.mapped[..pixels.len()].copy_from_slice(&pixels);
                true
            },
            CustomFileFormat::Dds | CustomFileFormat::Ktx => {
                staging.mapped[..texture.data.len()].copy_from_slice(&texture.data);
                true
            },
        }
    }
}

/// Stable 64-bit content hash: leading bytes of the SHA-256 digest. The
/// value is embedded in on-disk filenames, so it has to agree across
/// runs and platforms.
pub fn content_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// Parses `tex1_<width>x<height>_<hash:016X>_<format>.<ext>`. Only the
/// hash matters for lookup; dimensions and format are re-read from the
/// file itself.
fn parse_texture_filename(name: &str) -> Option<(u64, CustomFileFormat)> {
    let rest = name.strip_prefix("tex1_")?;
    let (stem, ext) = rest.rsplit_once('.')?;
    let file_format = match ext {
        "png" => CustomFileFormat::Png,
        "dds" => CustomFileFormat::Dds,
        "ktx" => CustomFileFormat::Ktx,
        _ => {
            error!("Unknown file extension .{ext} on {name}");
            return None;
        },
    };

    let mut parts = stem.split('_');
    let dims = parts.next()?;
    let hash = parts.next()?;
    let _format = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let (width, height) = dims.split_once('x')?;
    width.parse::<u32>().ok()?;
    height.parse::<u32>().ok()?;
    let hash = u64::from_str_radix(hash, 16).ok()?;
    Some((hash, file_format))
}

/// Fills `texture` with the information needed to use it later: the
/// dimensions, decoded format and staging footprint. PNG payloads stay
/// encoded; DDS/KTX payloads are extracted from their containers.
fn load_texture(texture: &mut CustomTexture) -> bool {
    let data = match fs::read(&texture.path) {
        Ok(data) => data,
        Err(err) => {
            error!("Failed to read {}: {err}", texture.path.display());
            return false;
        },
    };

    match texture.file_format {
        CustomFileFormat::Png => {
            let info = match imsz::imsz(&texture.path) {
                Ok(info) => info,
                Err(err) => {
                    error!("Failed to parse png file {}: {err}", texture.path.display());
                    return false;
                },
            };
            texture.width = info.width as u32;
            texture.height = info.height as u32;
            texture.format = CustomPixelFormat::RGBA8;
            texture.staging_size = (info.width * info.height * 4) as usize;
            texture.data = data;
        },
        CustomFileFormat::Dds => {
            if !parse_dds(&data, texture) {
                error!("Failed to parse dds file {}", texture.path.display());
                return false;
            }
        },
        CustomFileFormat::Ktx => {
            if !parse_ktx(&data, texture) {
                error!("Failed to parse ktx file {}", texture.path.display());
                return false;
            }
        },
    }

    if texture.width == 0 || texture.height == 0 || texture.staging_size == 0 {
        error!("Invalid parameters read from {}", texture.path.display());
        return false;
    }
    true
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(offset..offset + 4)?.try_into().unwrap()))
}

/// Minimal DDS container parse: header dimensions, fourcc-derived block
/// format, and the payload offset. Only formats the runtime consumes
/// directly are accepted.
fn parse_dds(data: &[u8], texture: &mut CustomTexture) -> bool {
    const DDS_MAGIC: u32 = 0x2053_4444; // "DDS "
    if read_u32(data, 0) != Some(DDS_MAGIC) || read_u32(data, 4) != Some(124) {
        return false;
    }
    let Some(height) = read_u32(data, 12) else { return false };
    let Some(width) = read_u32(data, 16) else { return false };
    let Some(fourcc) = data.get(84..88) else { return false };

    let mut payload_offset = 128;
    let format = match fourcc {
        b"DXT1" => CustomPixelFormat::BC1,
        b"DXT5" => CustomPixelFormat::BC3,
        b"ATI2" | b"BC5U" => CustomPixelFormat::BC5,
        b"DX10" => {
            // DXGI_FORMAT_BC7_UNORM in the extended header.
            payload_offset += 20;
            match read_u32(data, 128) {
                Some(98) => CustomPixelFormat::BC7,
                other => {
                    error!("Unknown dds dxgi format {other:?}");
                    return false;
                },
            }
        },
        other => {
            error!("Unknown dds fourcc {other:?}");
            return false;
        },
    };

    if data.len() <= payload_offset {
        return false;
    }
    texture.width = width;
    texture.height = height;
    texture.format = format;
    texture.data = data[payload_offset..].to_vec();
    texture.staging_size = texture.data.len();
    true
}

/// Minimal KTX1 container parse, analogous to [`parse_dds`].
fn parse_ktx(data: &[u8], texture: &mut CustomTexture) -> bool {
    const KTX_MAGIC: [u8; 12] =
        [0xAB, 0x4B, 0x54, 0x58, 0x20, 0x31, 0x31, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A];
    if data.get(..12) != Some(&KTX_MAGIC) {
        return false;
    }
    let Some(gl_internal_format) = read_u32(data, 28) else { return false };
    let Some(width) = read_u32(data, 36) else { return false };
    let Some(height) = read_u32(data, 40) else { return false };
    let Some(key_value_bytes) = read_u32(data, 60) else { return false };

    let format = match gl_internal_format {
        // GL_COMPRESSED_RGBA_ASTC_4x4
        0x93B0 => CustomPixelFormat::ASTC4,
        // GL_COMPRESSED_RGBA_BPTC_UNORM
        0x8E8C => CustomPixelFormat::BC7,
        other => {
            error!("Unknown ktx internal format {other:#x}");
            return false;
        },
    };

    // Header, key/value data, then a u32 image size before the payload.
    let payload_offset = 64 + key_value_bytes as usize + 4;
    if data.len() <= payload_offset {
        return false;
    }
    texture.width = width;
    texture.height = height;
    texture.format = format;
    texture.data = data[payload_offset..].to_vec();
    texture.staging_size = texture.data.len();
    true
}

#[cfg(test)]
mod tests {
    use gpu_traits::PixelFormat;

    use super::*;

    #[test]
    fn filename_parsing() {
        let (hash, format) = parse_texture_filename("tex1_64x64_0000000000ABCDEF_0.png").unwrap();
        assert_eq!(hash, 0xAB_CDEF);
        assert_eq!(format, CustomFileFormat::Png);

        assert!(parse_texture_filename("tex1_64x64_00ABCDEF_0.dds").is_some());
        assert!(parse_texture_filename("skybox.png").is_none());
        assert!(parse_texture_filename("tex1_64x64_XYZ_0.png").is_none());
        assert!(parse_texture_filename("tex1_64x64_00ABCDEF_0.tga").is_none());
    }

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash(b"surface bytes");
        let b = content_hash(b"surface bytes");
        let c = content_hash(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn compatibility_mode_hashes_decoded_pixels() {
        let mut settings = VideoSettings::default();
        settings.compatibility_mode = true;
        let manager = CustomTexManager::new(&settings);

        let mut params = SurfaceParams::new();
        params.addr = 0x1000_0000;
        params.width = 8;
        params.height = 8;
        params.pixel_format = PixelFormat::I8;
        params.update_params();

        let data = vec![0x40u8; params.size as usize];
        let compat_hash = manager.compute_hash(&params, &data);
        assert_ne!(compat_hash, content_hash(&data));

        let raw_manager = CustomTexManager::new(&VideoSettings::default());
        assert_eq!(raw_manager.compute_hash(&params, &data), content_hash(&data));
    }

    #[test]
    fn dds_header_parse() {
        let mut file = vec![0u8; 256];
        file[0..4].copy_from_slice(b"DDS ");
        file[4..8].copy_from_slice(&124u32.to_le_bytes());
        file[12..16].copy_from_slice(&32u32.to_le_bytes());
        file[16..20].copy_from_slice(&64u32.to_le_bytes());
        file[84..88].copy_from_slice(b"DXT5");

        let mut texture = CustomTexture {
            width: 0,
            height: 0,
            format: CustomPixelFormat::RGBA8,
            file_format: CustomFileFormat::Dds,
            path: PathBuf::new(),
            staging_size: 0,
            data: Vec::new(),
        };
        assert!(parse_dds(&file, &mut texture));
        assert_eq!((texture.width, texture.height), (64, 32));
        assert_eq!(texture.format, CustomPixelFormat::BC3);
        assert_eq!(texture.staging_size, 128);
    }
}
