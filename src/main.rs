// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

// A small demo walking through the main features: a banked machine with
// a boot overlay view that starts mapped over RAM and is switched away,
// the way real hardware exposes its reset vector.
use anyhow::Result;

use mapbus_core::{
    AddressSpace, DataWidth, Endianness, MemoryManager, MemoryView, Side, SpaceConfig,
};

fn main() -> Result<()> {
    env_logger::init();

    println!("mapbus demo");
    println!("===========");
    println!();

    let manager = MemoryManager::new();

    // 8 KiB of "boot ROM" with a recognizable pattern
    let mut rom = vec![0u8; 0x2000];
    for (i, b) in rom.iter_mut().enumerate() {
        *b = (i & 0xff) as u8;
    }
    manager.install_region("boot", rom);

    let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little)?;
    let space: AddressSpace<u8> = AddressSpace::new("prog", cfg, manager.clone())?;

    // permanent RAM in the upper half of the space
    space.install_ram(0x8000, 0xffff, 0, Side::RW, None)?;

    // the low 8 KiB are a view: slot 0 shows the boot ROM, slot 1 the
    // RAM the program sees after boot
    let overlay: MemoryView<u8> = MemoryView::new("boot");
    overlay.bind_to_window(0x0000, 0x1fff, space.config())?;
    overlay.entry(0)?.with_map(|m| {
        m.entry(0x0000, 0x1fff).rom().region("boot", 0);
    });
    overlay.entry(1)?.with_map(|m| {
        m.entry(0x0000, 0x1fff).ram();
    });
    space.install_view(0x0000, 0x1fff, 0, &overlay)?;

    overlay.select(0)?;
    println!("boot overlay active:");
    println!("  [0x0123] = 0x{:02X} (ROM pattern)", space.read(0x0123));

    overlay.select(1)?;
    space.write(0x0123, 0x42);
    println!("overlay switched to RAM:");
    println!("  [0x0123] = 0x{:02X} (after write)", space.read(0x0123));

    overlay.select(0)?;
    println!("back to ROM:");
    println!("  [0x0123] = 0x{:02X}", space.read(0x0123));

    // a read tap watching the ROM window without disturbing it
    let group = space.install_read_tap(
        0x0000,
        0x1fff,
        0,
        "boot_watch",
        |offset, data, _| {
            println!("  tap: read [0x{offset:04X}] -> 0x{:02X}", *data);
        },
        None,
    )?;
    println!("with tap installed:");
    space.read(0x0042);
    group.remove();

    println!();
    println!("invalidations: {} read / {} write", space.read_invalidations(), space.write_invalidations());
    Ok(())
}
