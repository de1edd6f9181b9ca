/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use euclid::{Box2D, Point2D, Size2D};

/// One texel of guest memory, at the resolution the title rendered at.
#[derive(Clone, Copy, Debug)]
pub enum GuestPixel {}

/// One texel of a host texture, i.e. a guest pixel multiplied by the
/// surface's integer resolution scale.
#[derive(Clone, Copy, Debug)]
pub enum HostPixel {}

/// Rectangles are stored with `min = (left, bottom)` and
/// `max = (right, top)`: guest framebuffers address rows bottom-up, so
/// the natural min/max ordering of [`Box2D`] holds for both linear and
/// tiled layouts.
pub type GuestRect = Box2D<u32, GuestPixel>;
pub type HostRect = Box2D<u32, HostPixel>;

pub type GuestSize = Size2D<u32, GuestPixel>;
pub type HostSize = Size2D<u32, HostPixel>;

/// Multiplies a guest-space rectangle up to host texels.
pub fn scale_rect(rect: GuestRect, res_scale: u32) -> HostRect {
    HostRect::new(
        Point2D::new(rect.min.x * res_scale, rect.min.y * res_scale),
        Point2D::new(rect.max.x * res_scale, rect.max.y * res_scale),
    )
}
