/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Codecs between the guest's tiled texture layout and linear staging
//! memory. Tiled surfaces store texels in 8x8 micro-tiles laid out
//! row-major across the stride, with texels inside each tile in Z-order.
//! Linear staging rows for tiled surfaces are flipped vertically so both
//! layouts present the same way to the host GPU.

use gpu_traits::PixelFormat;

use crate::params::SurfaceParams;

/// Texels per micro-tile edge.
const TILE_DIM: u32 = 8;

/// Z-order (Morton) x coordinate of texel `index` within a tile.
fn morton_x(index: u32) -> u32 {
    (index & 1) | ((index >> 1) & 2) | ((index >> 2) & 4)
}

/// Z-order (Morton) y coordinate of texel `index` within a tile.
fn morton_y(index: u32) -> u32 {
    ((index >> 1) & 1) | ((index >> 2) & 2) | ((index >> 3) & 4)
}

/// Z-order index of the texel at `(x, y)` within a tile.
fn morton_index(x: u32, y: u32) -> u32 {
    (x & 1) |
        ((y & 1) << 1) |
        ((x & 2) << 1) |
        ((y & 2) << 2) |
        ((x & 4) << 2) |
        ((y & 4) << 3)
}

fn read_nibble(buf: &[u8], index: usize) -> u8 {
    let byte = buf[index / 2];
    if index % 2 == 0 { byte & 0xF } else { byte >> 4 }
}

fn write_nibble(buf: &mut [u8], index: usize, value: u8) {
    let byte = &mut buf[index / 2];
    if index % 2 == 0 {
        *byte = (*byte & 0xF0) | (value & 0xF);
    } else {
        *byte = (*byte & 0x0F) | (value << 4);
    }
}

/// Walks every texel of the tiled region `[start_offset, start_offset +
/// len)` of `params`, handing `op` the tiled texel index (relative to the
/// region start) and the linear staging texel index.
fn for_each_texel(
    params: &SurfaceParams,
    start_offset: u32,
    len: u32,
    mut op: impl FnMut(u32, u32),
) {
    let bits = params.bits_per_pixel();
    let tile_texels = TILE_DIM * TILE_DIM;
    let tile_bytes = tile_texels * bits / 8;
    let tiles_per_row = params.stride / TILE_DIM;

    debug_assert_eq!(start_offset % tile_bytes, 0);
    debug_assert_eq!(len % tile_bytes, 0);

    let first_tile = start_offset / tile_bytes;
    for tile in 0..len / tile_bytes {
        let tile_index = first_tile + tile;
        let tile_x = (tile_index % tiles_per_row) * TILE_DIM;
        let tile_y = (tile_index / tiles_per_row) * TILE_DIM;
        for texel in 0..tile_texels {
            let x = tile_x + morton_x(texel);
            let y = tile_y + morton_y(texel);
            let linear_row = params.height - 1 - y;
            op(tile * tile_texels + texel, linear_row * params.stride + x);
        }
    }
}

/// Converts tiled guest bytes into their linear position in a staging
/// buffer sized for the whole surface. `start_offset` is the byte offset
/// of `guest` from the surface base and must be micro-tile aligned, which
/// `SurfaceParams::from_interval` guarantees for every upload interval.
pub fn unswizzle_texture(
    params: &SurfaceParams,
    start_offset: u32,
    guest: &[u8],
    linear: &mut [u8],
) {
    if params.pixel_format.is_compressed() {
        // Compressed blocks are opaque to the cache; they travel in guest
        // order.
        let start = start_offset as usize;
        linear[start..start + guest.len()].copy_from_slice(guest);
        return;
    }

    let bits = params.bits_per_pixel();
    if bits == 4 {
        for_each_texel(params, start_offset, guest.len() as u32, |src, dst| {
            write_nibble(linear, dst as usize, read_nibble(guest, src as usize));
        });
    } else {
        let bytes = (bits / 8) as usize;
        for_each_texel(params, start_offset, guest.len() as u32, |src, dst| {
            let src = src as usize * bytes;
            let dst = dst as usize * bytes;
            linear[dst..dst + bytes].copy_from_slice(&guest[src..src + bytes]);
        });
    }
}

/// Inverse of [`unswizzle_texture`]: gathers linear staging texels back
/// into tiled guest order.
pub fn swizzle_texture(params: &SurfaceParams, start_offset: u32, linear: &[u8], guest: &mut [u8]) {
    if params.pixel_format.is_compressed() {
        let start = start_offset as usize;
        guest.copy_from_slice(&linear[start..start + guest.len()]);
        return;
    }

    let bits = params.bits_per_pixel();
    if bits == 4 {
        for_each_texel(params, start_offset, guest.len() as u32, |dst, src| {
            write_nibble(guest, dst as usize, read_nibble(linear, src as usize));
        });
    } else {
        let bytes = (bits / 8) as usize;
        for_each_texel(params, start_offset, guest.len() as u32, |dst, src| {
            let src = src as usize * bytes;
            let dst = dst as usize * bytes;
            guest[dst..dst + bytes].copy_from_slice(&linear[src..src + bytes]);
        });
    }
}

/// Decodes one texel's raw value into RGBA. `value` holds up to four
/// little-endian bytes of the texel.
fn decode_texel(format: PixelFormat, value: [u8; 4]) -> [u8; 4] {
    let expand5 = |v: u32| ((v * 255 + 15) / 31) as u8;
    let expand6 = |v: u32| ((v * 255 + 31) / 63) as u8;
    let expand4 = |v: u8| v * 17;
    match format {
        PixelFormat::RGBA8 => [value[3], value[2], value[1], value[0]],
        PixelFormat::RGB8 => [value[2], value[1], value[0], 255],
        PixelFormat::RGB5A1 => {
            let v = u16::from_le_bytes([value[0], value[1]]) as u32;
            [
                expand5((v >> 11) & 0x1F),
                expand5((v >> 6) & 0x1F),
                expand5((v >> 1) & 0x1F),
                if v & 1 != 0 { 255 } else { 0 },
            ]
        },
        PixelFormat::RGB565 => {
            let v = u16::from_le_bytes([value[0], value[1]]) as u32;
            [expand5((v >> 11) & 0x1F), expand6((v >> 5) & 0x3F), expand5(v & 0x1F), 255]
        },
        PixelFormat::RGBA4 => {
            let v = u16::from_le_bytes([value[0], value[1]]);
            [
                expand4((v >> 12) as u8 & 0xF),
                expand4((v >> 8) as u8 & 0xF),
                expand4((v >> 4) as u8 & 0xF),
                expand4(v as u8 & 0xF),
            ]
        },
        PixelFormat::IA8 => [value[1], value[1], value[1], value[0]],
        PixelFormat::RG8 => [value[1], value[0], 0, 255],
        PixelFormat::I8 => [value[0], value[0], value[0], 255],
        PixelFormat::A8 => [0, 0, 0, value[0]],
        PixelFormat::IA4 => {
            let i = expand4(value[0] >> 4);
            [i, i, i, expand4(value[0] & 0xF)]
        },
        PixelFormat::I4 => {
            let i = expand4(value[0] & 0xF);
            [i, i, i, 255]
        },
        PixelFormat::A4 => [0, 0, 0, expand4(value[0] & 0xF)],
        _ => [0, 0, 0, 0],
    }
}

/// Decodes a full surface's guest bytes to RGBA8 rows in guest row
/// order. Returns `None` for formats that cannot be decoded on the CPU
/// (compressed and depth formats).
pub fn decode_guest_texture(params: &SurfaceParams, data: &[u8]) -> Option<Vec<u8>> {
    if params.pixel_format.is_compressed() ||
        !matches!(
            params.pixel_format.surface_type(),
            gpu_traits::SurfaceType::Color | gpu_traits::SurfaceType::Texture
        )
    {
        return None;
    }

    let bits = params.bits_per_pixel();
    let mut out = vec![0u8; (params.width * params.height * 4) as usize];
    for y in 0..params.height {
        for x in 0..params.width {
            let texel_index = if params.is_tiled {
                let tile = (y / TILE_DIM) * (params.stride / TILE_DIM) + x / TILE_DIM;
                tile * TILE_DIM * TILE_DIM + morton_index(x % TILE_DIM, y % TILE_DIM)
            } else {
                y * params.stride + x
            };

            let mut value = [0u8; 4];
            if bits == 4 {
                value[0] = read_nibble(data, texel_index as usize);
            } else {
                let bytes = (bits / 8) as usize;
                let offset = texel_index as usize * bytes;
                value[..bytes].copy_from_slice(&data[offset..offset + bytes]);
            }

            let rgba = decode_texel(params.pixel_format, value);
            let out_offset = ((y * params.width + x) * 4) as usize;
            out[out_offset..out_offset + 4].copy_from_slice(&rgba);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiled_params(format: PixelFormat, width: u32, height: u32) -> SurfaceParams {
        let mut params = SurfaceParams::new();
        params.addr = 0x1000_0000;
        params.width = width;
        params.height = height;
        params.is_tiled = true;
        params.pixel_format = format;
        params.update_params();
        params
    }

    #[test]
    fn morton_order_is_a_bijection() {
        let mut seen = [false; 64];
        for i in 0..64 {
            let (x, y) = (morton_x(i), morton_y(i));
            assert!(x < 8 && y < 8);
            assert_eq!(morton_index(x, y), i);
            assert!(!seen[(y * 8 + x) as usize]);
            seen[(y * 8 + x) as usize] = true;
        }
    }

    #[test]
    fn swizzle_round_trips_every_bpp_class() {
        for format in [
            PixelFormat::RGBA8,
            PixelFormat::RGB8,
            PixelFormat::RGB565,
            PixelFormat::IA8,
            PixelFormat::I8,
            PixelFormat::I4,
            PixelFormat::D16,
            PixelFormat::D24,
            PixelFormat::D24S8,
        ] {
            let params = tiled_params(format, 16, 16);
            let guest: Vec<u8> = (0..params.size).map(|i| (i * 7 + 3) as u8).collect();
            let staging_len = (params.stride * params.height * format.bytes_per_pixel()) as usize;

            let mut linear = vec![0u8; staging_len];
            unswizzle_texture(&params, 0, &guest, &mut linear);

            let mut back = vec![0u8; guest.len()];
            swizzle_texture(&params, 0, &linear, &mut back);
            assert_eq!(back, guest, "round trip failed for {format:?}");
        }
    }

    #[test]
    fn swizzle_round_trips_partial_interval() {
        let params = tiled_params(PixelFormat::RGBA8, 16, 16);
        // Second tile row only.
        let tile_row_bytes = params.bytes_in_pixels(params.stride * 8);
        let guest: Vec<u8> = (0..tile_row_bytes).map(|i| (i ^ 0x5A) as u8).collect();

        let mut linear = vec![0u8; params.size as usize];
        unswizzle_texture(&params, tile_row_bytes, &guest, &mut linear);

        // The untouched first tile row stays zero.
        let untouched_rows = &linear[(8 * params.stride * 4) as usize..];
        assert!(untouched_rows.iter().all(|&b| b == 0));

        let mut back = vec![0u8; guest.len()];
        swizzle_texture(&params, tile_row_bytes, &linear, &mut back);
        assert_eq!(back, guest);
    }

    #[test]
    fn compressed_formats_pass_through() {
        let params = tiled_params(PixelFormat::ETC1, 16, 16);
        let guest: Vec<u8> = (0..params.size).map(|i| i as u8).collect();
        let mut linear = vec![0u8; params.size as usize];
        unswizzle_texture(&params, 0, &guest, &mut linear);
        assert_eq!(&linear[..guest.len()], &guest[..]);

        let mut back = vec![0u8; guest.len()];
        swizzle_texture(&params, 0, &linear, &mut back);
        assert_eq!(back, guest);
    }

    #[test]
    fn decode_expands_small_formats() {
        let mut params = SurfaceParams::new();
        params.addr = 0x1000_0000;
        params.width = 8;
        params.height = 8;
        params.pixel_format = PixelFormat::I4;
        params.is_tiled = true;
        params.update_params();

        let data = vec![0xFFu8; params.size as usize];
        let decoded = decode_guest_texture(&params, &data).unwrap();
        assert_eq!(decoded.len(), 8 * 8 * 4);
        assert!(decoded.chunks(4).all(|px| px == [255, 255, 255, 255]));

        let depth = tiled_params(PixelFormat::D24S8, 8, 8);
        assert!(decode_guest_texture(&depth, &vec![0u8; depth.size as usize]).is_none());
    }
}
