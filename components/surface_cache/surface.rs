/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! One cached surface: a guest byte range bound to a host texture, plus
//! the bookkeeping that keeps the two coherent. Surfaces are shared
//! through [`SurfaceRef`] handles on the single cache thread; watchers
//! observe a surface weakly so composite resources (cubemaps, mip
//! chains) notice mutation without keeping dead surfaces alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use gpu_traits::{ClearValue, HostTexture, PAddr, PixelFormat, SurfaceType};
use smallvec::SmallVec;

use crate::interval::{IntervalSet, SurfaceInterval};
use crate::params::SurfaceParams;

pub type SurfaceRef = Rc<RefCell<CachedSurface>>;
pub type WatcherRef = Rc<RefCell<SurfaceWatcher>>;

/// Observes a surface on behalf of a derived resource. Invalidated on
/// every mutation of the watched surface; `get` yields the surface while
/// it is still alive.
pub struct SurfaceWatcher {
    surface: Weak<RefCell<CachedSurface>>,
    valid: bool,
}

impl SurfaceWatcher {
    /// Whether the watched surface is alive and its content has not
    /// changed since the last `validate`.
    pub fn is_valid(&self) -> bool {
        self.surface.strong_count() > 0 && self.valid
    }

    /// Marks the watcher's consumer as up to date with the surface.
    pub fn validate(&mut self) {
        debug_assert!(self.surface.strong_count() > 0);
        self.valid = true;
    }

    /// Marks the watcher's consumer as stale without touching the
    /// surface.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn get(&self) -> Option<SurfaceRef> {
        self.surface.upgrade()
    }
}

/// Number of derivable mip levels beyond the base.
pub const MAX_MIP_LEVELS: usize = 7;

pub struct CachedSurface {
    pub params: SurfaceParams,
    /// Host texture at scaled dimensions. Fill surfaces may not have one.
    pub texture: Option<HostTexture>,
    /// Byte ranges whose host contents do not reflect guest memory.
    pub invalid_regions: IntervalSet,
    /// Fill pattern, `fill_size` in 2..=4; zero for non-fill surfaces.
    pub fill_size: u32,
    pub fill_data: [u8; 4],
    pub registered: bool,
    pub max_level: u32,
    pub level_watchers: [Option<WatcherRef>; MAX_MIP_LEVELS],
    watchers: SmallVec<[Weak<RefCell<SurfaceWatcher>>; 8]>,
}

impl CachedSurface {
    pub fn new(params: SurfaceParams) -> CachedSurface {
        CachedSurface {
            params,
            texture: None,
            invalid_regions: IntervalSet::new(),
            fill_size: 0,
            fill_data: [0; 4],
            registered: false,
            max_level: 0,
            level_watchers: [const { None }; MAX_MIP_LEVELS],
            watchers: SmallVec::new(),
        }
    }

    pub fn interval(&self) -> SurfaceInterval {
        self.params.interval()
    }

    pub fn overlaps(&self, addr: PAddr, size: u32) -> bool {
        self.params.addr < addr.saturating_add(size) && addr < self.params.end
    }

    /// Whether the host texture is current for every byte of `interval`.
    pub fn is_region_valid(&self, interval: SurfaceInterval) -> bool {
        !self.invalid_regions.overlaps(&interval)
    }

    /// A surface with no salvageable content should leave the cache.
    pub fn is_fully_invalid(&self) -> bool {
        self.invalid_regions.covers(&self.interval())
    }

    /// Registers a new watcher on `this` and returns the strong handle
    /// the consumer keeps.
    pub fn create_watcher(this: &SurfaceRef) -> WatcherRef {
        let watcher = Rc::new(RefCell::new(SurfaceWatcher {
            surface: Rc::downgrade(this),
            valid: false,
        }));
        this.borrow_mut().watchers.push(Rc::downgrade(&watcher));
        watcher
    }

    /// Tells every live watcher the surface content changed.
    pub fn invalidate_watchers(&mut self) {
        for watcher in &self.watchers {
            if let Some(watcher) = watcher.upgrade() {
                watcher.borrow_mut().valid = false;
            }
        }
    }

    /// Severs every watcher, as if the surface were already destroyed.
    /// Used when a surface is replaced by an expanded one and scheduled
    /// for removal while references may still be in flight.
    pub fn unlink_watchers(&mut self) {
        for watcher in self.watchers.drain(..) {
            if let Some(watcher) = watcher.upgrade() {
                let mut watcher = watcher.borrow_mut();
                watcher.valid = false;
                watcher.surface = Weak::new();
            }
        }
    }

    /// Whether this fill surface can validate `fill_interval` of a
    /// destination surface: the interval must be inside the fill range,
    /// form a whole rectangle of the destination, and the repeated
    /// pattern must agree with the destination's pixel width.
    pub fn can_fill(&self, dest: &SurfaceParams, fill_interval: SurfaceInterval) -> bool {
        if self.params.surface_type != SurfaceType::Fill ||
            !self.is_region_valid(fill_interval) ||
            fill_interval.start < self.params.addr ||
            fill_interval.end > self.params.end ||
            dest.from_interval(fill_interval).interval() != fill_interval
        {
            return false;
        }

        if self.fill_size * 8 != dest.bits_per_pixel() {
            // The pattern must tile evenly into destination pixels: every
            // dest-pixel-wide slice of the repeated pattern has to be
            // identical.
            let dest_bytes_per_pixel = (dest.bits_per_pixel() / 8).max(1);
            let mut fill_test = vec![0u8; (self.fill_size * dest_bytes_per_pixel) as usize];
            for i in 0..dest_bytes_per_pixel {
                let start = (i * self.fill_size) as usize;
                fill_test[start..start + self.fill_size as usize]
                    .copy_from_slice(&self.fill_data[..self.fill_size as usize]);
            }

            for i in 0..self.fill_size {
                let start = (i * dest_bytes_per_pixel) as usize;
                if fill_test[start..start + dest_bytes_per_pixel as usize] !=
                    fill_test[..dest_bytes_per_pixel as usize]
                {
                    return false;
                }
            }

            if dest.bits_per_pixel() == 4 && (fill_test[0] & 0xF) != (fill_test[0] >> 4) {
                return false;
            }
        }
        true
    }

    /// Whether this surface can validate `copy_interval` of `dest`,
    /// either as a sub-rect blit source or as a fill.
    pub fn can_copy(&self, dest: &SurfaceParams, copy_interval: SurfaceInterval) -> bool {
        let subrect_params = dest.from_interval(copy_interval);
        debug_assert_eq!(subrect_params.interval(), copy_interval);
        if self.params.can_sub_rect(&subrect_params) {
            return true;
        }
        self.can_fill(dest, copy_interval)
    }

    /// The largest whole-rectangle interval of `params` this surface
    /// holds valid data for.
    pub fn copyable_interval(&self, params: &SurfaceParams) -> SurfaceInterval {
        let mut result = SurfaceInterval::default();
        let tile_align = params.bytes_in_pixels(if params.is_tiled { 8 * 8 } else { 1 });
        let valid_regions = {
            let mut candidate = IntervalSet::new();
            candidate.insert(params.interval().intersection(&self.interval()));
            candidate.difference(&self.invalid_regions)
        };

        for valid_interval in valid_regions.iter() {
            let aligned_start =
                params.addr + crate::params::align_up(valid_interval.start - params.addr, tile_align);
            let aligned_end = params.addr +
                crate::params::align_down(valid_interval.end - params.addr, tile_align);

            // Too short to hold even one aligned unit.
            if tile_align > valid_interval.len() || aligned_start >= aligned_end {
                continue;
            }
            let aligned = SurfaceInterval::new(aligned_start, aligned_end);

            // Trim to whole rows of the destination rectangle.
            let stride_bytes =
                params.bytes_in_pixels(params.stride) * if params.is_tiled { 8 } else { 1 };
            let row_start = params.addr +
                crate::params::align_up(aligned.start - params.addr, stride_bytes);
            let row_end =
                params.addr + crate::params::align_down(aligned.end - params.addr, stride_bytes);

            let rect_interval = if row_start > row_end {
                // Within a single row.
                aligned
            } else if row_start == row_end {
                // Two partial rows that do not stack into a rectangle;
                // keep the longer one.
                let row1 = SurfaceInterval::new(aligned.start, row_start);
                let row2 = SurfaceInterval::new(row_start, aligned.end);
                if row1.len() > row2.len() { row1 } else { row2 }
            } else {
                SurfaceInterval::new(row_start, row_end)
            };

            if rect_interval.len() > result.len() {
                result = rect_interval;
            }
        }
        result
    }

    /// Builds the clear value equivalent to this fill pattern as seen
    /// from `copy_addr` in the destination format.
    pub fn make_clear_value(&self, copy_addr: PAddr, dst_format: PixelFormat) -> ClearValue {
        let fill_buffer = self.make_fill_buffer(copy_addr);
        match dst_format.surface_type() {
            SurfaceType::Depth => {
                let depth = match dst_format {
                    PixelFormat::D16 => {
                        u16::from_le_bytes([fill_buffer[0], fill_buffer[1]]) as f32 / 65535.0
                    },
                    _ => {
                        let raw = u32::from_le_bytes([
                            fill_buffer[0],
                            fill_buffer[1],
                            fill_buffer[2],
                            0,
                        ]);
                        raw as f32 / 16_777_215.0
                    },
                };
                ClearValue::Depth(depth)
            },
            SurfaceType::DepthStencil => {
                let raw = u32::from_le_bytes(fill_buffer);
                ClearValue::DepthStencil((raw >> 8) as f32 / 16_777_215.0, (raw & 0xFF) as u8)
            },
            _ => ClearValue::Color(decode_fill_color(dst_format, &fill_buffer)),
        }
    }

    /// The four fill bytes as seen when the pattern is applied starting
    /// at `copy_addr` rather than at the fill surface's own base.
    fn make_fill_buffer(&self, copy_addr: PAddr) -> [u8; 4] {
        debug_assert!(self.fill_size >= 2);
        let fill_offset = (copy_addr - self.params.addr) % self.fill_size;
        let mut buffer = [0u8; 4];
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = self.fill_data[((fill_offset as usize + i) % self.fill_size as usize)];
        }
        buffer
    }
}

/// Decodes one packed pixel of `format` into normalized RGBA. Guest
/// colors are stored little-endian with the red component in the most
/// significant position.
fn decode_fill_color(format: PixelFormat, bytes: &[u8; 4]) -> [f32; 4] {
    let unorm = |v: u32, max: u32| v as f32 / max as f32;
    match format {
        PixelFormat::RGBA8 => [
            unorm(bytes[3] as u32, 255),
            unorm(bytes[2] as u32, 255),
            unorm(bytes[1] as u32, 255),
            unorm(bytes[0] as u32, 255),
        ],
        PixelFormat::RGB8 => [
            unorm(bytes[2] as u32, 255),
            unorm(bytes[1] as u32, 255),
            unorm(bytes[0] as u32, 255),
            1.0,
        ],
        PixelFormat::RGB5A1 => {
            let v = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
            [
                unorm((v >> 11) & 0x1F, 31),
                unorm((v >> 6) & 0x1F, 31),
                unorm((v >> 1) & 0x1F, 31),
                (v & 1) as f32,
            ]
        },
        PixelFormat::RGB565 => {
            let v = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
            [unorm((v >> 11) & 0x1F, 31), unorm((v >> 5) & 0x3F, 63), unorm(v & 0x1F, 31), 1.0]
        },
        PixelFormat::RGBA4 => {
            let v = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
            [
                unorm((v >> 12) & 0xF, 15),
                unorm((v >> 8) & 0xF, 15),
                unorm((v >> 4) & 0xF, 15),
                unorm(v & 0xF, 15),
            ]
        },
        // Remaining formats clear through their first byte; exotic fill
        // destinations do not occur in practice.
        _ => {
            let v = unorm(bytes[0] as u32, 255);
            [v, v, v, v]
        },
    }
}
