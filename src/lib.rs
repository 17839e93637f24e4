// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! mapbus - reconfigurable memory dispatch for emulated buses
//!
//! This library provides the memory side of a hardware emulator: address
//! spaces with radix dispatch trees, declarative address maps, switchable
//! view windows, width-mismatch adaptation and passthrough taps.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod installer;
pub mod manager;
pub mod map;
pub mod range;
pub mod space;
pub mod units;
pub mod view;

// Re-export commonly used types
pub use config::{DataWidth, Endianness, Offs, Side, SpaceConfig};
pub use error::ConfigError;
pub use handler::{MemoryBank, ReadHandlerRef, SharedBytes, TapGroup, WriteHandlerRef};
pub use manager::MemoryManager;
pub use map::AddressMap;
pub use space::{make_space, AddressSpace, AnySpace, InvalidateSink};
pub use view::{MemoryView, ViewEntry};
