// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use mapbus_core::{
    AddressSpace, DataWidth, Endianness, MemoryManager, MemoryView, Side, SpaceConfig,
};

fn build_space() -> AddressSpace<u16> {
    let cfg = SpaceConfig::new(DataWidth::W16, 24, 0, Endianness::Little).unwrap();
    let space: AddressSpace<u16> =
        AddressSpace::new("bench", cfg, MemoryManager::new()).unwrap();
    space
        .install_ram(0x00_0000, 0x00_ffff, 0, Side::RW, None)
        .unwrap();
    space
}

fn bench_ram_read(c: &mut Criterion) {
    let space = build_space();
    c.bench_function("ram_read", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for addr in (0x0000..0x1000).step_by(2) {
                acc = acc.wrapping_add(space.read(black_box(addr)) as u32);
            }
            acc
        })
    });
}

fn bench_ram_write(c: &mut Criterion) {
    let space = build_space();
    c.bench_function("ram_write", |b| {
        b.iter(|| {
            for addr in (0x0000..0x1000).step_by(2) {
                space.write(black_box(addr), black_box(0x5aa5));
            }
        })
    });
}

fn bench_view_read(c: &mut Criterion) {
    let space = build_space();
    let view: MemoryView<u16> = MemoryView::new("overlay");
    space.install_view(0x01_0000, 0x01_ffff, 0, &view).unwrap();
    let slot = view.entry(0).unwrap();
    slot.installer()
        .unwrap()
        .install_ram(0x01_0000, 0x01_ffff, 0, Side::RW, None)
        .unwrap();
    view.select(0).unwrap();
    c.bench_function("view_read", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for addr in (0x01_0000..0x01_1000).step_by(2) {
                acc = acc.wrapping_add(space.read(black_box(addr)) as u32);
            }
            acc
        })
    });
}

criterion_group!(benches, bench_ram_read, bench_ram_write, bench_view_read);
criterion_main!(benches);
