// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Lane assignment for narrow handlers on a wide bus.
//!
//! When a handler is narrower than the bus, each bus word is split into
//! lanes of the handler's width.  The unit mask selects which lanes the
//! handler serves, the chip-select width groups lanes that share one
//! handler-side address, and endianness decides which lane sits at the
//! lowest byte address.  The result is a list of (value shift, handler
//! address offset) pairs plus the address stride between consecutive bus
//! words on the handler side.

use crate::config::{DataWidth, Endianness};

/// One lane (or chip-select group slice) served by a narrow handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaneAssignment {
    /// Bits of the bus word this lane occupies.
    pub lane_mask: u64,
    /// Left shift from handler value position to bus value position.
    pub dshift: u32,
    /// Handler-side address offset of this lane's group within one word.
    pub addr_offset: u32,
}

/// Full lane decomposition of one mismatched install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryUnits {
    pub lanes: Vec<LaneAssignment>,
    /// Handler-side addresses consumed per bus word.
    pub stride: u32,
}

/// Decompose a bus word into handler lanes.
///
/// `unitmask` must already be validated to select whole `access`-wide
/// lanes, and `cswidth_bits` to be a multiple of the access width dividing
/// the bus width; the range optimizer does both.
pub fn memory_units(
    bus: DataWidth,
    access: DataWidth,
    endian: Endianness,
    unitmask: u64,
    cswidth_bits: u32,
) -> MemoryUnits {
    let lanes_per_word = bus.bytes() / access.bytes();
    let group_size = cswidth_bits / access.bits();
    let acc_mask = access.mask();

    // First pass: find the active chip-select groups in address order.
    let mut active_groups: Vec<u32> = Vec::new();
    for pos in 0..lanes_per_word {
        let j = match endian {
            Endianness::Little => pos,
            Endianness::Big => lanes_per_word - 1 - pos,
        };
        let dshift = 8 * access.bytes() * j;
        if unitmask & (acc_mask << dshift) != 0 {
            let group = pos / group_size;
            if !active_groups.contains(&group) {
                active_groups.push(group);
            }
        }
    }
    let stride = active_groups.len() as u32;

    let mut lanes = Vec::new();
    for pos in 0..lanes_per_word {
        let j = match endian {
            Endianness::Little => pos,
            Endianness::Big => lanes_per_word - 1 - pos,
        };
        let dshift = 8 * access.bytes() * j;
        if unitmask & (acc_mask << dshift) != 0 {
            let group = pos / group_size;
            let addr_offset = active_groups.iter().position(|&g| g == group).unwrap_or(0) as u32;
            lanes.push(LaneAssignment {
                lane_mask: acc_mask << dshift,
                dshift,
                addr_offset,
            });
        }
    }

    MemoryUnits { lanes, stride }
}
