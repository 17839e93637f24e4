// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bus shape configuration.
//!
//! A [`SpaceConfig`] is the immutable descriptor of one physical bus: data
//! width, address-to-byte shift, endianness and address bit-width.  It is
//! shared by value across every component derived from that bus, and the
//! legal (width, shift) combinations are fixed at construction, so the rest
//! of the crate never has to re-validate them.

use bitflags::bitflags;

use crate::error::ConfigError;

/// Address type used across the crate, counted in address units (which are
/// bytes only when the address shift is zero).
pub type Offs = u32;

/// Native data width of a bus or of an individual handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataWidth {
    W8,
    W16,
    W32,
    W64,
}

impl DataWidth {
    pub const fn bits(self) -> u32 {
        match self {
            DataWidth::W8 => 8,
            DataWidth::W16 => 16,
            DataWidth::W32 => 32,
            DataWidth::W64 => 64,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// All-ones value mask for this width.
    pub const fn mask(self) -> u64 {
        match self {
            DataWidth::W64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

/// Byte order of the bus, deciding how lanes map to byte addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

bitflags! {
    /// Which sides of the bus an operation touches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Side: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Side {
    pub const RW: Side = Side::READ.union(Side::WRITE);
}

/// Immutable bus descriptor shared by every component of one address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceConfig {
    data_width: DataWidth,
    addr_width: u32,
    addr_shift: i8,
    endian: Endianness,
}

impl SpaceConfig {
    /// Build a configuration, rejecting (width, shift) pairs no real bus
    /// uses.  The legal table matches the classic set: 8:{+1,0},
    /// 16:{+3,0,-1}, 32:{+3,0,-1,-2}, 64:{0,-1,-2,-3}.
    pub fn new(
        data_width: DataWidth,
        addr_width: u32,
        addr_shift: i8,
        endian: Endianness,
    ) -> Result<Self, ConfigError> {
        if addr_width == 0 || addr_width > 32 {
            return Err(ConfigError::BadAddressWidth(addr_width));
        }
        let legal = match (data_width, addr_shift) {
            (DataWidth::W8, 1 | 0) => true,
            (DataWidth::W16, 3 | 0 | -1) => true,
            (DataWidth::W32, 3 | 0 | -1 | -2) => true,
            (DataWidth::W64, 0 | -1 | -2 | -3) => true,
            _ => false,
        };
        if !legal {
            return Err(ConfigError::UnsupportedShape {
                width: data_width.bits(),
                shift: addr_shift,
            });
        }
        Ok(Self {
            data_width,
            addr_width,
            addr_shift,
            endian,
        })
    }

    pub fn data_width(&self) -> DataWidth {
        self.data_width
    }

    pub fn addr_width(&self) -> u32 {
        self.addr_width
    }

    pub fn addr_shift(&self) -> i8 {
        self.addr_shift
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    /// Mask covering every valid address of the space.
    pub fn addr_mask(&self) -> Offs {
        if self.addr_width == 32 {
            Offs::MAX
        } else {
            (1 << self.addr_width) - 1
        }
    }

    /// Address units spanned by one native bus word.
    pub fn native_step(&self) -> u32 {
        let bytes = self.data_width.bytes();
        if self.addr_shift >= 0 {
            bytes << self.addr_shift
        } else {
            bytes >> -self.addr_shift
        }
    }

    /// Low-bit mask of addresses within one native word.
    pub fn native_mask(&self) -> Offs {
        self.native_step() - 1
    }

    /// Number of low address bits a dispatch tree leaves undecoded.
    pub fn low_bits(&self) -> u32 {
        self.native_step().trailing_zeros()
    }

    /// Convert an address-unit count into a byte count.
    pub fn addr_to_byte(&self, addr: Offs) -> u64 {
        if self.addr_shift < 0 {
            (addr as u64) << -self.addr_shift
        } else {
            (addr as u64) >> self.addr_shift
        }
    }

    /// Bytes covered by the inclusive range `start..=end`.
    pub fn range_to_bytes(&self, start: Offs, end: Offs) -> usize {
        let units = end as u64 - start as u64 + 1;
        let bytes = if self.addr_shift < 0 {
            units << -self.addr_shift
        } else {
            units >> self.addr_shift
        };
        bytes as usize
    }
}
