// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Address spaces: the bus front end.
//!
//! An [`AddressSpace`] owns the top-level dispatch tree pair of one bus
//! and exposes the whole installation surface plus the access entry
//! points.  It is generic over the bus word so the hot read/write path
//! monomorphizes; [`make_space`] picks the right instantiation from a
//! runtime configuration.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::{DataWidth, Offs, Side, SpaceConfig};
use crate::dispatch::DispatchTree;
use crate::error::ConfigError;
use crate::handler::{
    BusWord, MemoryBank, ReadHandler, SharedBytes, TapGroup, UnmappedRead, UnmappedWrite,
    WriteHandler,
};
use crate::installer::{InstallCtx, SharedReadTree, SharedWriteTree, SpaceRef};
use crate::manager::MemoryManager;
use crate::map::AddressMap;
use crate::view::MemoryView;

/// Downstream notification point for configuration changes.
///
/// Anything caching lookups out of the dispatch trees (a CPU core's fast
/// access path, typically) registers a hook and counts on being told
/// whenever an install, view switch or tap changes what an address means.
#[derive(Default)]
pub struct InvalidateSink {
    reads: Cell<u64>,
    writes: Cell<u64>,
    hook: RefCell<Option<Box<dyn Fn(Side)>>>,
}

impl InvalidateSink {
    pub fn invalidate(&self, side: Side) {
        if side.is_empty() {
            return;
        }
        if side.contains(Side::READ) {
            self.reads.set(self.reads.get() + 1);
        }
        if side.contains(Side::WRITE) {
            self.writes.set(self.writes.get() + 1);
        }
        if let Some(hook) = &*self.hook.borrow() {
            hook(side);
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.get()
    }

    pub fn writes(&self) -> u64 {
        self.writes.get()
    }

    pub fn set_hook(&self, hook: impl Fn(Side) + 'static) {
        *self.hook.borrow_mut() = Some(Box::new(hook));
    }
}

/// One bus of a machine, carrying words of type `W`.
pub struct AddressSpace<W: BusWord> {
    space: SpaceRef,
    read_tree: SharedReadTree<W>,
    write_tree: SharedWriteTree<W>,
}

impl<W: BusWord> AddressSpace<W> {
    /// Build a space over `config`; `W` must match the configured data
    /// width.
    pub fn new(
        name: &str,
        config: SpaceConfig,
        manager: Rc<MemoryManager>,
    ) -> Result<Self, ConfigError> {
        if W::WIDTH != config.data_width() {
            return Err(ConfigError::SpaceWidthMismatch {
                space: name.to_string(),
                expected: config.data_width().bits(),
                got: W::BITS,
            });
        }
        let sink = Rc::new(InvalidateSink::default());
        let space = SpaceRef::new(name, config, manager, sink);
        let rdef: Rc<dyn ReadHandler<W>> = Rc::new(UnmappedRead::new(false, name));
        let wdef: Rc<dyn WriteHandler<W>> = Rc::new(UnmappedWrite::new(false, name));
        let low = config.low_bits();
        let high = config.addr_width();
        Ok(Self {
            space,
            read_tree: Rc::new(RefCell::new(DispatchTree::new(low, high, rdef))),
            write_tree: Rc::new(RefCell::new(DispatchTree::new(low, high, wdef))),
        })
    }

    pub fn name(&self) -> &str {
        self.space.name()
    }

    pub fn config(&self) -> &SpaceConfig {
        self.space.config()
    }

    pub fn manager(&self) -> &Rc<MemoryManager> {
        self.space.manager()
    }

    /// Region implicit `rom()` entries bind to when they name none.
    pub fn set_default_region(&self, tag: Option<String>) {
        self.space.set_default_region(tag);
    }

    pub fn on_invalidate(&self, hook: impl Fn(Side) + 'static) {
        self.space.sink().set_hook(hook);
    }

    pub fn read_invalidations(&self) -> u64 {
        self.space.sink().reads()
    }

    pub fn write_invalidations(&self) -> u64 {
        self.space.sink().writes()
    }

    /// Unwindowed installation context over the space's own trees.
    pub fn installer(&self) -> InstallCtx<W> {
        InstallCtx {
            space: self.space.clone(),
            window: None,
            key: String::new(),
            read_tree: self.read_tree.clone(),
            write_tree: self.write_tree.clone(),
        }
    }

    /// Build a map with `build` and install it.
    pub fn install_map(&self, build: impl Fn(&mut AddressMap<W>)) -> Result<(), ConfigError> {
        let mut map = AddressMap::new();
        build(&mut map);
        self.installer().populate_from_map(&mut map)
    }

    pub fn install_ram(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        side: Side,
        backing: Option<SharedBytes>,
    ) -> Result<SharedBytes, ConfigError> {
        self.installer().install_ram(start, end, mirror, side, backing)
    }

    pub fn install_bank(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        rbank: Option<Rc<MemoryBank>>,
        wbank: Option<Rc<MemoryBank>>,
    ) -> Result<(), ConfigError> {
        self.installer().install_bank(start, end, mirror, rbank, wbank)
    }

    pub fn install_view(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        view: &MemoryView<W>,
    ) -> Result<(), ConfigError> {
        self.installer().install_view(start, end, mirror, view)
    }

    pub fn unmap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        side: Side,
        quiet: bool,
    ) -> Result<(), ConfigError> {
        self.installer().unmap(start, end, mirror, side, quiet)
    }

    pub fn install_read_tap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        name: impl Into<String>,
        cb: impl FnMut(Offs, &mut W, W) + 'static,
        group: Option<TapGroup>,
    ) -> Result<TapGroup, ConfigError> {
        self.installer().install_read_tap(start, end, mirror, name, cb, group)
    }

    pub fn install_write_tap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        name: impl Into<String>,
        cb: impl FnMut(Offs, &mut W, W) + 'static,
        group: Option<TapGroup>,
    ) -> Result<TapGroup, ConfigError> {
        self.installer().install_write_tap(start, end, mirror, name, cb, group)
    }

    /// Full-width read.
    pub fn read(&self, addr: Offs) -> W {
        self.read_masked(addr, W::all_ones())
    }

    /// Read with an explicit lane mask.
    pub fn read_masked(&self, addr: Offs, mem_mask: W) -> W {
        let addr = addr & self.space.config().addr_mask();
        // clone the leaf before invoking it: a tap or view handler may
        // repopulate the tree mid-access
        let h = self.read_tree.borrow().lookup(addr).clone();
        h.read(addr, mem_mask)
    }

    /// Full-width write.
    pub fn write(&self, addr: Offs, data: W) {
        self.write_masked(addr, data, W::all_ones());
    }

    /// Write with an explicit lane mask.
    pub fn write_masked(&self, addr: Offs, data: W, mem_mask: W) {
        let addr = addr & self.space.config().addr_mask();
        let h = self.write_tree.borrow().lookup(addr).clone();
        h.write(addr, data, mem_mask)
    }
}

/// An address space of runtime-selected width.
pub enum AnySpace {
    B8(AddressSpace<u8>),
    B16(AddressSpace<u16>),
    B32(AddressSpace<u32>),
    B64(AddressSpace<u64>),
}

impl AnySpace {
    pub fn name(&self) -> &str {
        match self {
            AnySpace::B8(s) => s.name(),
            AnySpace::B16(s) => s.name(),
            AnySpace::B32(s) => s.name(),
            AnySpace::B64(s) => s.name(),
        }
    }

    pub fn config(&self) -> &SpaceConfig {
        match self {
            AnySpace::B8(s) => s.config(),
            AnySpace::B16(s) => s.config(),
            AnySpace::B32(s) => s.config(),
            AnySpace::B64(s) => s.config(),
        }
    }

    pub fn read(&self, addr: Offs) -> u64 {
        match self {
            AnySpace::B8(s) => s.read(addr) as u64,
            AnySpace::B16(s) => s.read(addr) as u64,
            AnySpace::B32(s) => s.read(addr) as u64,
            AnySpace::B64(s) => s.read(addr),
        }
    }

    pub fn write(&self, addr: Offs, data: u64) {
        match self {
            AnySpace::B8(s) => s.write(addr, data as u8),
            AnySpace::B16(s) => s.write(addr, data as u16),
            AnySpace::B32(s) => s.write(addr, data as u32),
            AnySpace::B64(s) => s.write(addr, data),
        }
    }
}

/// Instantiate the space variant matching the configured data width.
pub fn make_space(
    name: &str,
    config: SpaceConfig,
    manager: Rc<MemoryManager>,
) -> Result<AnySpace, ConfigError> {
    Ok(match config.data_width() {
        DataWidth::W8 => AnySpace::B8(AddressSpace::new(name, config, manager)?),
        DataWidth::W16 => AnySpace::B16(AddressSpace::new(name, config, manager)?),
        DataWidth::W32 => AnySpace::B32(AddressSpace::new(name, config, manager)?),
        DataWidth::W64 => AnySpace::B64(AddressSpace::new(name, config, manager)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endianness;
    use crate::handler::{ReadHandlerRef, WriteHandlerRef};
    use pretty_assertions::assert_eq;
    use std::rc::Weak;

    fn space8() -> AddressSpace<u8> {
        let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little).unwrap();
        AddressSpace::new("prog", cfg, MemoryManager::new()).unwrap()
    }

    fn space16(endian: Endianness) -> AddressSpace<u16> {
        let cfg = SpaceConfig::new(DataWidth::W16, 16, 0, endian).unwrap();
        AddressSpace::new("prog", cfg, MemoryManager::new()).unwrap()
    }

    #[test]
    fn width_mismatch_rejected_at_construction() {
        let cfg = SpaceConfig::new(DataWidth::W16, 16, 0, Endianness::Little).unwrap();
        let r: Result<AddressSpace<u8>, _> =
            AddressSpace::new("prog", cfg, MemoryManager::new());
        assert!(matches!(
            r,
            Err(ConfigError::SpaceWidthMismatch { expected: 16, got: 8, .. })
        ));
    }

    #[test]
    fn handler_serves_exactly_its_range() {
        let s = space8();
        s.installer()
            .install_read_handler::<u8>(
                0x1000,
                0x1fff,
                0,
                0,
                0,
                ReadHandlerRef::new("range_r", |_, _| 0x42),
                0,
                0,
            )
            .unwrap();
        assert_eq!(s.read(0x0fff), 0xff);
        assert_eq!(s.read(0x1000), 0x42);
        assert_eq!(s.read(0x1fff), 0x42);
        assert_eq!(s.read(0x2000), 0xff);
    }

    #[test]
    fn delegate_sees_relative_offsets() {
        let s = space8();
        let seen = Rc::new(Cell::new(0u32));
        let seen2 = seen.clone();
        s.installer()
            .install_read_handler::<u8>(
                0x2000,
                0x2fff,
                0,
                0,
                0,
                ReadHandlerRef::new("offset_r", move |offset, _| {
                    seen2.set(offset);
                    0
                }),
                0,
                0,
            )
            .unwrap();
        s.read(0x2345);
        assert_eq!(seen.get(), 0x345);
    }

    #[test]
    fn ram_round_trips_and_mirrors() {
        let s = space8();
        s.install_ram(0x0000, 0x00ff, 0x0f00, Side::RW, None).unwrap();
        s.write(0x0010, 0x5a);
        assert_eq!(s.read(0x0010), 0x5a);
        // every mirror image aliases the same bytes
        assert_eq!(s.read(0x0710), 0x5a);
        s.write(0x0f10, 0xa5);
        assert_eq!(s.read(0x0010), 0xa5);
    }

    #[test]
    fn failed_install_leaves_space_untouched() {
        let s = space8();
        s.install_ram(0x0000, 0x0fff, 0, Side::RW, None).unwrap();
        s.write(0x0800, 0x11);
        let before = s.read_invalidations();
        // bad mirror must fail before any tree mutation
        let r = s.install_ram(0x0800, 0x08ff, 0x0800, Side::RW, None);
        assert!(matches!(r, Err(ConfigError::BadMirror { .. })));
        assert_eq!(s.read(0x0800), 0x11);
        assert_eq!(s.read_invalidations(), before);
    }

    #[test]
    fn view_slots_switch_and_restore() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();

        let slot_a = view.entry(0).unwrap();
        slot_a.installer().unwrap().install_ram(0x0000, 0x0fff, 0, Side::RW, None).unwrap();
        let slot_b = view.entry(1).unwrap();
        slot_b
            .installer()
            .unwrap()
            .install_read_handler::<u8>(
                0x0000,
                0x0fff,
                0,
                0,
                0,
                ReadHandlerRef::new("rom_r", |_, _| 0x99),
                0,
                0,
            )
            .unwrap();

        // disabled view serves unmapped
        assert_eq!(s.read(0x0100), 0xff);

        view.select(0).unwrap();
        s.write(0x0100, 0x42);
        assert_eq!(s.read(0x0100), 0x42);

        view.select(1).unwrap();
        assert_eq!(s.read(0x0100), 0x99);

        // switching back restores the slot's contents untouched
        view.select(0).unwrap();
        assert_eq!(s.read(0x0100), 0x42);

        view.disable();
        assert_eq!(s.read(0x0100), 0xff);
        view.select(0).unwrap();
        assert_eq!(s.read(0x0100), 0x42);
    }

    #[test]
    fn view_install_outside_window_rejected() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
        let slot = view.entry(0).unwrap();
        slot.installer().unwrap().install_ram(0x0800, 0x0fff, 0, Side::RW, None).unwrap();
        let r = slot
            .installer()
            .unwrap()
            .install_ram(0x0800, 0x1800, 0, Side::RW, None);
        assert!(matches!(r, Err(ConfigError::OutsideWindow { .. })));
        // the earlier install is still intact
        view.select(0).unwrap();
        s.write(0x0900, 0x77);
        assert_eq!(s.read(0x0900), 0x77);
    }

    #[test]
    fn view_placed_only_once() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
        let r = s.install_view(0x2000, 0x2fff, 0, &view);
        assert!(matches!(r, Err(ConfigError::ViewReinstalled { .. })));
    }

    #[test]
    fn dropped_view_releases_its_slots() {
        let weak: Weak<()>;
        {
            let s = space8();
            let view: MemoryView<u8> = MemoryView::new("overlay");
            s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
            let slot = view.entry(0).unwrap();
            let marker = Rc::new(());
            let m = marker.clone();
            weak = Rc::downgrade(&marker);
            slot.installer()
                .unwrap()
                .install_read_handler::<u8>(
                    0x0000,
                    0x00ff,
                    0,
                    0,
                    0,
                    ReadHandlerRef::new("slot_r", move |_, _| {
                        let _ = &m;
                        0x2a
                    }),
                    0,
                    0,
                )
                .unwrap();
            view.select(0).unwrap();
            assert_eq!(s.read(0x0010), 0x2a);
            assert!(weak.upgrade().is_some());
        }
        // no cycle between the view and its space-side leaves: everything
        // in the slots goes away with the last handle
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn preconfigured_view_checks_placement() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        view.bind_to_window(0x0000, 0x0fff, s.config()).unwrap();
        let slot = view.entry(0).unwrap();
        slot.with_map(|m| {
            m.entry(0x0000, 0x00ff).ram();
        });
        assert!(matches!(
            s.install_view(0x0000, 0x1fff, 0, &view),
            Err(ConfigError::ViewRangeMismatch { .. })
        ));
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
        view.select(0).unwrap();
        s.write(0x0010, 0x2b);
        assert_eq!(s.read(0x0010), 0x2b);
    }

    #[test]
    fn mirrored_handler_is_shared_and_released() {
        let s = space8();
        let weak: Weak<()>;
        {
            let marker = Rc::new(());
            let m = marker.clone();
            weak = Rc::downgrade(&marker);
            s.installer()
                .install_read_handler::<u8>(
                    0x0000,
                    0x00ff,
                    0,
                    0x0300,
                    0,
                    ReadHandlerRef::new("alias_r", move |_, _| {
                        let _ = &m;
                        0x13
                    }),
                    0,
                    0,
                )
                .unwrap();
        }
        assert_eq!(s.read(0x0000), 0x13);
        assert_eq!(s.read(0x0280), 0x13);
        assert!(weak.upgrade().is_some());
        // overwriting every image drops the handler synchronously
        s.unmap(0x0000, 0x03ff, 0, Side::READ, true).unwrap();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn narrow_handler_lane_order_little_endian() {
        let s = space16(Endianness::Little);
        let log: Rc<RefCell<Vec<(Offs, u8)>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        s.installer()
            .install_write_handler::<u8>(
                0x0000,
                0x00ff,
                0,
                0,
                0,
                WriteHandlerRef::new("chip_w", move |offset, data, _| {
                    l.borrow_mut().push((offset, data));
                }),
                0,
                0,
            )
            .unwrap();
        s.write(0x0010, 0xbbaa);
        // LE: low byte of the word lives at the lower handler address
        assert_eq!(&*log.borrow(), &[(0x10, 0xaa), (0x11, 0xbb)]);
    }

    #[test]
    fn narrow_handler_lane_order_big_endian() {
        let s = space16(Endianness::Big);
        let log: Rc<RefCell<Vec<(Offs, u8)>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        s.installer()
            .install_write_handler::<u8>(
                0x0000,
                0x00ff,
                0,
                0,
                0,
                WriteHandlerRef::new("chip_w", move |offset, data, _| {
                    l.borrow_mut().push((offset, data));
                }),
                0,
                0,
            )
            .unwrap();
        s.write(0x0010, 0xbbaa);
        // BE: high byte first
        assert_eq!(&*log.borrow(), &[(0x10, 0xbb), (0x11, 0xaa)]);
    }

    #[test]
    fn narrow_reads_merge_lanes() {
        let s = space16(Endianness::Little);
        s.installer()
            .install_read_handler::<u8>(
                0x0000,
                0x00ff,
                0,
                0,
                0,
                ReadHandlerRef::new("lo_r", |_, _| 0x21),
                0x00ff,
                0,
            )
            .unwrap();
        // upper lane unpopulated: reads as fill
        assert_eq!(s.read(0x0000), 0xff21);
        s.installer()
            .install_read_handler::<u8>(
                0x0000,
                0x00ff,
                0,
                0,
                0,
                ReadHandlerRef::new("hi_r", |_, _| 0x43),
                0xff00,
                0,
            )
            .unwrap();
        // second install merges with the first instead of displacing it
        assert_eq!(s.read(0x0000), 0x4321);
        // lane masking reaches only the selected chip
        assert_eq!(s.read_masked(0x0000, 0x00ff) & 0x00ff, 0x0021);
    }

    #[test]
    fn merged_lanes_keep_their_own_offsets() {
        let s = space16(Endianness::Little);
        let log: Rc<RefCell<Vec<(Offs, u8)>>> = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        s.installer()
            .install_write_handler::<u8>(
                0x0000,
                0x00ff,
                0,
                0,
                0,
                WriteHandlerRef::new("lo_w", move |offset, data, _| {
                    l.borrow_mut().push((offset, data));
                }),
                0x00ff,
                0,
            )
            .unwrap();
        // a narrower install on the other lane merges over part of the range
        s.installer()
            .install_write_handler::<u8>(
                0x0010,
                0x001f,
                0,
                0,
                0,
                WriteHandlerRef::new("hi_w", |_, _, _| {}),
                0xff00,
                0,
            )
            .unwrap();
        // the retained low-lane chip still numbers words from its own base
        s.write(0x0010, 0xbbaa);
        assert_eq!(&*log.borrow(), &[(0x8, 0xaa)]);
        // outside the merged stretch the first install is untouched
        s.write(0x0000, 0x0201);
        assert_eq!(log.borrow().last(), Some(&(0x0, 0x01)));
    }

    #[test]
    fn too_wide_handler_rejected() {
        let s = space8();
        let r = s.installer().install_read_handler::<u16>(
            0x0000,
            0x00ff,
            0,
            0,
            0,
            ReadHandlerRef::new("wide_r", |_, _| 0),
            0,
            0,
        );
        assert!(matches!(r, Err(ConfigError::HandlerTooWide { .. })));
    }

    #[test]
    fn deferred_handler_resolution_failure_is_reported() {
        let s = space8();
        let r = s.installer().install_read_handler::<u8>(
            0x0000,
            0x00ff,
            0,
            0,
            0,
            ReadHandlerRef::deferred("ghost_r", || None),
            0,
            0,
        );
        assert!(matches!(
            r,
            Err(ConfigError::UnresolvedHandler { ref name, .. }) if name == "ghost_r"
        ));
        // failed resolution leaves the range unmapped
        assert_eq!(s.read(0x0000), 0xff);
    }

    #[test]
    fn taps_observe_and_restore() {
        let s = space8();
        s.install_ram(0x0000, 0x00ff, 0, Side::RW, None).unwrap();
        s.write(0x0040, 0x12);

        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let group = s
            .install_read_tap(0x0000, 0x00ff, 0, "watch_r", move |_, _, _| {
                h.set(h.get() + 1);
            }, None)
            .unwrap();
        assert_eq!(s.read(0x0040), 0x12);
        assert_eq!(hits.get(), 1);

        // a write tap on the same group can rewrite in-flight data
        s.install_write_tap(0x0000, 0x00ff, 0, "mangle_w", |_, data, _| {
            *data |= 0x80;
        }, Some(group.clone()))
            .unwrap();
        s.write(0x0041, 0x01);
        assert_eq!(s.read(0x0041), 0x81);
        assert_eq!(hits.get(), 2);

        // removal deactivates both taps; traffic flows untouched
        group.remove();
        s.write(0x0041, 0x01);
        assert_eq!(s.read(0x0041), 0x01);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn map_population_full_flow() {
        let manager = MemoryManager::new();
        let mut rom = vec![0u8; 0x2000];
        rom[0x0123] = 0xab;
        manager.install_region("boot", rom);
        manager.port_alloc("in0").set_value(0x3c);

        let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little).unwrap();
        let s: AddressSpace<u8> = AddressSpace::new("prog", cfg, manager.clone()).unwrap();
        s.install_map(|map| {
            map.entry(0x0000, 0x1fff).rom().region("boot", 0);
            map.entry(0x2000, 0x23ff).ram().share("wram").mirror(0x0c00);
            map.entry(0x4000, 0x4000).portr("in0");
            map.entry(0x5000, 0x50ff).noprw();
            map.entry(0x6000, 0x6fff).submap(|m| {
                m.entry(0x000, 0x0ff).ram();
                m.entry(0x100, 0x100)
                    .read::<u8>("status_r", |_, _| 0x5f);
            });
        })
        .unwrap();

        assert_eq!(s.read(0x0123), 0xab);
        s.write(0x2010, 0x66);
        assert_eq!(s.read(0x2c10), 0x66);
        assert_eq!(s.read(0x4000), 0x3c);
        assert_eq!(s.read(0x5000), 0xff);
        s.write(0x6020, 0x31);
        assert_eq!(s.read(0x6020), 0x31);
        assert_eq!(s.read(0x6100), 0x5f);

        // the share is registered and sized
        assert_eq!(manager.share_find("wram").map(|sh| sh.len()), Some(0x400));
    }

    #[test]
    fn map_error_cases() {
        let manager = MemoryManager::new();
        manager.install_region("boot", vec![0u8; 0x100]);
        let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little).unwrap();
        let s: AddressSpace<u8> = AddressSpace::new("prog", cfg, manager).unwrap();

        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x0000, 0x1fff).rom().region("missing", 0);
            }),
            Err(ConfigError::UnknownRegion { .. })
        ));
        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x0000, 0x1fff).rom().region("boot", 0);
            }),
            Err(ConfigError::RegionTooSmall { .. })
        ));
        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x0000, 0x00ff).rom();
            }),
            Err(ConfigError::UnboundRom { .. })
        ));
        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x0000, 0x00ff).portr("nodev");
            }),
            Err(ConfigError::UnknownPort { .. })
        ));
        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x0000, 0x00ff)
                    .rom()
                    .region("boot", 0)
                    .share("x");
            }),
            Err(ConfigError::RegionAndShare { .. })
        ));
    }

    #[test]
    fn device_map_confined_to_its_window() {
        let s = space8();
        // an entry spilling past the window is rejected before any install
        let r = s.installer().install_map(0x4000, 0x4fff, |m| {
            m.entry(0x0000, 0x1fff).ram();
        });
        assert!(matches!(r, Err(ConfigError::OutsideWindow { .. })));
        assert_eq!(s.read(0x4000), 0xff);

        s.installer()
            .install_map(0x4000, 0x4fff, |m| {
                m.entry(0x0000, 0x0fff).ram();
            })
            .unwrap();
        s.write(0x4123, 0x9c);
        assert_eq!(s.read(0x4123), 0x9c);
        assert_eq!(s.read(0x5000), 0xff);
    }

    #[test]
    fn default_region_binds_implicit_rom() {
        let manager = MemoryManager::new();
        let mut rom = vec![0u8; 0x1000];
        rom[0x0800] = 0xcd;
        manager.install_region("maincpu", rom);
        let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little).unwrap();
        let s: AddressSpace<u8> = AddressSpace::new("prog", cfg, manager).unwrap();
        s.set_default_region(Some("maincpu".into()));
        s.install_map(|map| {
            map.entry(0x0000, 0x0fff).rom();
        })
        .unwrap();
        assert_eq!(s.read(0x0800), 0xcd);
    }

    #[test]
    fn share_shape_mismatch_rejected() {
        let manager = MemoryManager::new();
        let cfg = SpaceConfig::new(DataWidth::W8, 16, 0, Endianness::Little).unwrap();
        let s: AddressSpace<u8> = AddressSpace::new("prog", cfg, manager).unwrap();
        s.install_map(|map| {
            map.entry(0x0000, 0x00ff).ram().share("buf");
        })
        .unwrap();
        assert!(matches!(
            s.install_map(|map| {
                map.entry(0x1000, 0x11ff).ram().share("buf");
            }),
            Err(ConfigError::ShareMismatch { .. })
        ));
    }

    #[test]
    fn view_slot_ram_persists_across_repopulation() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        view.bind_to_window(0x0000, 0x0fff, s.config()).unwrap();
        let slot = view.entry(0).unwrap();
        slot.with_map(|m| {
            m.entry(0x0000, 0x00ff).ram();
        });
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
        view.select(0).unwrap();
        s.write(0x0010, 0x42);
        // repopulating the same slot map finds the same anonymous block
        slot.populate_from_map().unwrap();
        assert_eq!(s.read(0x0010), 0x42);
    }

    #[test]
    fn distinct_slots_get_distinct_ram() {
        let s = space8();
        let view: MemoryView<u8> = MemoryView::new("overlay");
        s.install_view(0x0000, 0x0fff, 0, &view).unwrap();
        for slot in 0..2 {
            let e = view.entry(slot).unwrap();
            e.with_map(|m| {
                m.entry(0x0000, 0x00ff).ram();
            });
            e.populate_from_map().unwrap();
        }
        view.select(0).unwrap();
        s.write(0x0000, 0x11);
        view.select(1).unwrap();
        s.write(0x0000, 0x22);
        view.select(0).unwrap();
        assert_eq!(s.read(0x0000), 0x11);
    }

    #[test]
    fn invalidations_count_per_side() {
        let s = space8();
        let base_r = s.read_invalidations();
        let base_w = s.write_invalidations();
        s.install_ram(0x0000, 0x00ff, 0, Side::RW, None).unwrap();
        assert_eq!(s.read_invalidations(), base_r + 1);
        assert_eq!(s.write_invalidations(), base_w + 1);
        s.unmap(0x0000, 0x00ff, 0, Side::READ, true).unwrap();
        assert_eq!(s.read_invalidations(), base_r + 2);
        assert_eq!(s.write_invalidations(), base_w + 1);

        let fired = Rc::new(Cell::new(0u32));
        let f = fired.clone();
        s.on_invalidate(move |_| f.set(f.get() + 1));
        s.unmap(0x0000, 0x00ff, 0, Side::WRITE, true).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn bank_switch_through_space() {
        let s = space8();
        let bank = s.manager().bank("rombank");
        let lo = crate::handler::shared_bytes(0x100);
        let hi = crate::handler::shared_bytes(0x100);
        lo.borrow_mut()[0] = 0x01;
        hi.borrow_mut()[0] = 0x02;
        bank.configure_entry(0, lo);
        bank.configure_entry(1, hi);
        s.install_bank(0x8000, 0x80ff, 0, Some(bank.clone()), None).unwrap();
        assert_eq!(s.read(0x8000), 0x01);
        bank.set_entry(1);
        assert_eq!(s.read(0x8000), 0x02);
    }

    #[test]
    fn any_space_factory_matches_width() {
        let manager = MemoryManager::new();
        let cfg = SpaceConfig::new(DataWidth::W16, 16, 0, Endianness::Little).unwrap();
        let any = make_space("prog", cfg, manager).unwrap();
        assert!(matches!(any, AnySpace::B16(_)));
        assert_eq!(any.read(0x0000), 0xffff);
    }
}
