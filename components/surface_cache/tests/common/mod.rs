/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Test doubles for the two capabilities the cache consumes: a byte-array
//! guest memory and a host runtime that records submissions and actually
//! moves texel data, so upload/download round trips are observable.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use gpu_traits::{
    BufferTextureCopy, ClearValue, GuestMemory, HostTexture, PAddr, PixelFormat, StagingBuffer,
    TextureBlit, TextureClear, TextureRuntime, VideoSettings,
};
use surface_cache::{SurfaceCache, SurfaceParams};

pub struct TextureRecord {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub cube: bool,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct RuntimeState {
    next_id: u64,
    pub textures: HashMap<u64, TextureRecord>,
    pub allocations: usize,
    pub uploads: usize,
    pub reads: usize,
    pub read_targets: Vec<HostTexture>,
    pub blits: Vec<(HostTexture, HostTexture, TextureBlit)>,
    pub clears: Vec<(HostTexture, TextureClear, ClearValue)>,
    pub destroyed: Vec<HostTexture>,
}

impl RuntimeState {
    pub fn texture_data(&self, texture: HostTexture) -> &[u8] {
        &self.textures[&texture.raw()].data
    }
}

pub struct MockRuntime {
    pub state: Rc<RefCell<RuntimeState>>,
}

fn texel_bytes(format: PixelFormat, texels: u32) -> usize {
    (texels as usize * format.bits_per_pixel() as usize).div_ceil(8)
}

impl TextureRuntime for MockRuntime {
    fn allocate_2d(&mut self, width: u32, height: u32, format: PixelFormat)
    -> Option<HostTexture> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.allocations += 1;
        let id = state.next_id;
        let data = vec![0u8; texel_bytes(format, width * height)];
        state.textures.insert(id, TextureRecord { width, height, format, cube: false, data });
        HostTexture::from_raw(id)
    }

    fn allocate_cube(&mut self, width: u32, format: PixelFormat) -> Option<HostTexture> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.allocations += 1;
        let id = state.next_id;
        let data = vec![0u8; texel_bytes(format, width * width * 6)];
        state
            .textures
            .insert(id, TextureRecord { width, height: width, format, cube: true, data });
        HostTexture::from_raw(id)
    }

    fn destroy_texture(&mut self, texture: HostTexture) {
        let mut state = self.state.borrow_mut();
        state.textures.remove(&texture.raw());
        state.destroyed.push(texture);
    }

    fn blit_textures(&mut self, src: HostTexture, dst: HostTexture, blit: &TextureBlit) -> bool {
        let mut state = self.state.borrow_mut();
        state.blits.push((src, dst, *blit));

        // Equal-size 2D blits of matching formats move actual texels, so
        // the staging round trip through temporaries stays byte exact.
        let (src_w, src_h) = (blit.src_region.width(), blit.src_region.height());
        if (src_w, src_h) != (blit.dst_region.width(), blit.dst_region.height()) {
            return true;
        }
        let (Some(src_tex), Some(dst_tex)) =
            (state.textures.get(&src.raw()), state.textures.get(&dst.raw()))
        else {
            return true;
        };
        if src_tex.format != dst_tex.format || src_tex.cube || dst_tex.cube {
            return true;
        }

        let bits = src_tex.format.bits_per_pixel();
        let row_len = (src_w * bits / 8) as usize;
        let src_width = src_tex.width;
        let dst_width = dst_tex.width;
        let mut rows = Vec::with_capacity(src_h as usize);
        for row in 0..src_h {
            let offset =
                (((blit.src_region.min.y + row) * src_width + blit.src_region.min.x) * bits / 8)
                    as usize;
            rows.push(src_tex.data[offset..offset + row_len].to_vec());
        }
        let dst_tex = state.textures.get_mut(&dst.raw()).unwrap();
        for (row, data) in rows.iter().enumerate() {
            let offset = (((blit.dst_region.min.y + row as u32) * dst_width +
                blit.dst_region.min.x) *
                bits /
                8) as usize;
            dst_tex.data[offset..offset + row_len].copy_from_slice(data);
        }
        true
    }

    fn clear_texture(
        &mut self,
        texture: HostTexture,
        clear: &TextureClear,
        value: ClearValue,
    ) -> bool {
        self.state.borrow_mut().clears.push((texture, *clear, value));
        true
    }

    fn upload_texture(
        &mut self,
        texture: HostTexture,
        copy: &BufferTextureCopy,
        staging: &StagingBuffer,
    ) -> bool {
        let mut state = self.state.borrow_mut();
        state.uploads += 1;
        let Some(record) = state.textures.get_mut(&texture.raw()) else {
            return false;
        };
        let bits = record.format.bits_per_pixel();
        let row_len = (copy.extent.width * bits / 8) as usize;
        let tex_width = record.width;
        for row in 0..copy.extent.height {
            let staging_offset =
                copy.buffer_offset + (row * copy.buffer_row_length * bits / 8) as usize;
            let tex_offset =
                (((copy.offset.y + row) * tex_width + copy.offset.x) * bits / 8) as usize;
            record.data[tex_offset..tex_offset + row_len]
                .copy_from_slice(&staging.mapped[staging_offset..staging_offset + row_len]);
        }
        true
    }

    fn read_texture(
        &mut self,
        texture: HostTexture,
        copy: &BufferTextureCopy,
        _format: PixelFormat,
        out_bytes: &mut [u8],
    ) -> bool {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        state.read_targets.push(texture);
        let Some(record) = state.textures.get(&texture.raw()) else {
            return false;
        };
        let bits = record.format.bits_per_pixel();
        let row_len = (copy.extent.width * bits / 8) as usize;
        for row in 0..copy.extent.height {
            let out_offset = copy.buffer_offset + (row * copy.buffer_row_length * bits / 8) as usize;
            let tex_offset =
                (((copy.offset.y + row) * record.width + copy.offset.x) * bits / 8) as usize;
            out_bytes[out_offset..out_offset + row_len]
                .copy_from_slice(&record.data[tex_offset..tex_offset + row_len]);
        }
        true
    }

    fn find_staging(&mut self, size: usize, _upload: bool) -> StagingBuffer {
        StagingBuffer { mapped: vec![0u8; size] }
    }
}

pub struct MockMemory {
    base: PAddr,
    pub data: RefCell<Vec<u8>>,
    pub cached_calls: RefCell<Vec<(PAddr, u32, bool)>>,
    pub read_count: Cell<usize>,
}

impl MockMemory {
    pub fn new(base: PAddr, size: usize) -> MockMemory {
        MockMemory {
            base,
            data: RefCell::new(vec![0u8; size]),
            cached_calls: RefCell::new(Vec::new()),
            read_count: Cell::new(0),
        }
    }

    pub fn write(&self, addr: PAddr, bytes: &[u8]) {
        let offset = (addr - self.base) as usize;
        self.data.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read(&self, addr: PAddr, len: usize) -> Vec<u8> {
        let offset = (addr - self.base) as usize;
        self.data.borrow()[offset..offset + len].to_vec()
    }
}

impl GuestMemory for MockMemory {
    fn read_physical(&self, addr: PAddr, dest: &mut [u8]) -> Option<usize> {
        self.read_count.set(self.read_count.get() + 1);
        if addr < self.base {
            return None;
        }
        let data = self.data.borrow();
        let offset = (addr - self.base) as usize;
        if offset >= data.len() {
            return None;
        }
        let len = dest.len().min(data.len() - offset);
        dest[..len].copy_from_slice(&data[offset..offset + len]);
        Some(len)
    }

    fn write_physical(&self, addr: PAddr, source: &[u8]) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let mut data = self.data.borrow_mut();
        let offset = (addr - self.base) as usize;
        if offset >= data.len() {
            return None;
        }
        let len = source.len().min(data.len() - offset);
        data[offset..offset + len].copy_from_slice(&source[..len]);
        Some(len)
    }

    fn mark_region_cached(&self, addr: PAddr, size: u32, cached: bool) {
        self.cached_calls.borrow_mut().push((addr, size, cached));
    }
}

pub struct TestHarness {
    pub cache: SurfaceCache,
    pub memory: Rc<MockMemory>,
    pub runtime: Rc<RefCell<RuntimeState>>,
}

pub fn harness(base: PAddr, memory_size: usize) -> TestHarness {
    harness_with_settings(base, memory_size, VideoSettings::default())
}

pub fn harness_with_settings(
    base: PAddr,
    memory_size: usize,
    settings: VideoSettings,
) -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let memory = Rc::new(MockMemory::new(base, memory_size));
    let runtime = Rc::new(RefCell::new(RuntimeState::default()));
    let cache = SurfaceCache::new(
        memory.clone(),
        Box::new(MockRuntime { state: runtime.clone() }),
        settings,
    );
    TestHarness { cache, memory, runtime }
}

pub fn surface_params(
    addr: PAddr,
    width: u32,
    height: u32,
    format: PixelFormat,
    is_tiled: bool,
    res_scale: u32,
) -> SurfaceParams {
    let mut params = SurfaceParams::new();
    params.addr = addr;
    params.width = width;
    params.height = height;
    params.is_tiled = is_tiled;
    params.pixel_format = format;
    params.res_scale = res_scale;
    params.update_params();
    params
}

/// A deterministic but non-repeating byte pattern.
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
