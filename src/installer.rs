// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Handler installation over a pair of dispatch trees.
//!
//! [`InstallCtx`] is the one implementation of every install operation;
//! an address space and a view slot are both just a context with
//! different trees, window and naming.  All validation happens before any
//! tree is touched, so a failed install leaves the previous configuration
//! fully intact, and every successful install ends by invalidating the
//! space's cached lookups.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::config::{DataWidth, Offs, Side, SpaceConfig};
use crate::dispatch::DispatchTree;
use crate::error::ConfigError;
use crate::handler::{
    AddressInfo, BankRead, BankWrite, BusWord, DelegateRead, DelegateWrite, MemoryBank,
    MemoryRead, MemoryWrite, PortRead, PortWrite, RawRead, RawWrite, ReadHandler,
    ReadHandlerRef, SharedBytes, SubUnitRead, SubUnitWrite, SubUnitsRead, SubUnitsWrite,
    TapFn, TapGroup, TapRead, TapWrite, UnmappedRead, UnmappedWrite, WriteHandler,
    WriteHandlerRef,
};
use crate::manager::MemoryManager;
use crate::map::{AddressMap, ReadKind, WriteKind};
use crate::range::{check_optimize_all, check_optimize_mirror, NormalizedRange};
use crate::space::InvalidateSink;
use crate::units::memory_units;

/// Identity of the space an install context works for: shared by the
/// space itself and every view bound into it.  Cheap to clone.
#[derive(Clone)]
pub struct SpaceRef {
    name: Rc<str>,
    config: SpaceConfig,
    manager: Rc<MemoryManager>,
    sink: Rc<InvalidateSink>,
    default_region: Rc<RefCell<Option<String>>>,
}

impl SpaceRef {
    pub(crate) fn new(
        name: &str,
        config: SpaceConfig,
        manager: Rc<MemoryManager>,
        sink: Rc<InvalidateSink>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            manager,
            sink,
            default_region: Rc::new(RefCell::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn manager(&self) -> &Rc<MemoryManager> {
        &self.manager
    }

    pub(crate) fn sink(&self) -> &Rc<InvalidateSink> {
        &self.sink
    }

    /// Two refs are the same space iff they share an invalidation sink.
    pub(crate) fn same_space(&self, other: &SpaceRef) -> bool {
        Rc::ptr_eq(&self.sink, &other.sink)
    }

    pub(crate) fn set_default_region(&self, tag: Option<String>) {
        *self.default_region.borrow_mut() = tag;
    }

    pub(crate) fn default_region(&self) -> Option<String> {
        self.default_region.borrow().clone()
    }
}

pub(crate) type SharedReadTree<W> = Rc<RefCell<DispatchTree<dyn ReadHandler<W>>>>;
pub(crate) type SharedWriteTree<W> = Rc<RefCell<DispatchTree<dyn WriteHandler<W>>>>;

/// Installation target: the dispatch trees of a space or of one view
/// slot, plus the window restricting where installs may land and the key
/// prefix naming anonymous resources.
pub struct InstallCtx<W: BusWord> {
    pub(crate) space: SpaceRef,
    pub(crate) window: Option<(Offs, Offs)>,
    pub(crate) key: String,
    pub(crate) read_tree: SharedReadTree<W>,
    pub(crate) write_tree: SharedWriteTree<W>,
}

impl<W: BusWord> InstallCtx<W> {
    fn cfg(&self) -> &SpaceConfig {
        self.space.config()
    }

    fn info(&self, n: &NormalizedRange) -> AddressInfo {
        AddressInfo::new(n.start, n.mask, self.cfg().addr_shift())
    }

    fn owner(&self) -> String {
        format!("{}:{}", self.space.name(), self.key)
    }

    fn invalidate(&self, side: Side) {
        self.space.sink().invalidate(side);
    }

    // -- delegate handlers --------------------------------------------------

    /// Install a read callback of width `A` over the range, `A` no wider
    /// than the bus word.
    #[allow(clippy::too_many_arguments)]
    pub fn install_read_handler<A: BusWord>(
        &self,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        handler: ReadHandlerRef<A>,
        unitmask: u64,
        cswidth_bits: u32,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_read_handler";
        let (name, f) = resolve_read(FN, &handler, start, end, mask, mirror, select, unitmask)?;
        self.read_erased(
            FN, start, end, mask, mirror, select, name, A::WIDTH, f, unitmask, cswidth_bits,
        )?;
        self.invalidate(Side::READ);
        Ok(())
    }

    /// Install a write callback of width `A`.
    #[allow(clippy::too_many_arguments)]
    pub fn install_write_handler<A: BusWord>(
        &self,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        handler: WriteHandlerRef<A>,
        unitmask: u64,
        cswidth_bits: u32,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_write_handler";
        let (name, f) = resolve_write(FN, &handler, start, end, mask, mirror, select, unitmask)?;
        self.write_erased(
            FN, start, end, mask, mirror, select, name, A::WIDTH, f, unitmask, cswidth_bits,
        )?;
        self.invalidate(Side::WRITE);
        Ok(())
    }

    /// Install both sides at once.  Both handlers are resolved before
    /// either tree is touched.
    #[allow(clippy::too_many_arguments)]
    pub fn install_readwrite_handler<A: BusWord>(
        &self,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        rhandler: ReadHandlerRef<A>,
        whandler: WriteHandlerRef<A>,
        unitmask: u64,
        cswidth_bits: u32,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_readwrite_handler";
        let (rname, rf) = resolve_read(FN, &rhandler, start, end, mask, mirror, select, unitmask)?;
        let (wname, wf) = resolve_write(FN, &whandler, start, end, mask, mirror, select, unitmask)?;
        self.read_erased(
            FN, start, end, mask, mirror, select, rname, A::WIDTH, rf, unitmask, cswidth_bits,
        )?;
        self.write_erased(
            FN, start, end, mask, mirror, select, wname, A::WIDTH, wf, unitmask, cswidth_bits,
        )?;
        self.invalidate(Side::RW);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn read_erased(
        &self,
        function: &'static str,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        name: String,
        width: DataWidth,
        f: RawRead,
        unitmask: u64,
        cswidth_bits: u32,
    ) -> Result<(), ConfigError> {
        if width.bits() > W::BITS {
            return Err(ConfigError::HandlerTooWide {
                function,
                handler_bits: width.bits(),
                bus_bits: W::BITS,
            });
        }
        let n = check_optimize_all(
            function,
            self.cfg(),
            width,
            self.window,
            start,
            end,
            mask,
            mirror,
            select,
            unitmask,
            cswidth_bits,
        )?;
        trace!(
            "{}: {function} '{name}' {:#x}-{:#x} mirror {:#x} umask {:#x}",
            self.owner(),
            n.range.start,
            n.range.end,
            n.range.mirror,
            n.unitmask,
        );
        let info = self.info(&n.range);
        let word_shift = self.cfg().low_bits();
        let mut tree = self.read_tree.borrow_mut();
        if width == W::WIDTH {
            let g: crate::handler::ReadDelegate<W> =
                Rc::new(move |offset, mem_mask: W| W::from_u64(f(offset, mem_mask.to_u64())));
            let leaf: Rc<dyn ReadHandler<W>> =
                Rc::new(DelegateRead::new(info, word_shift, name, g));
            tree.populate(n.range.start, n.range.end, n.range.mirror, leaf);
        } else {
            let units = memory_units(
                W::WIDTH,
                width,
                self.cfg().endian(),
                n.unitmask,
                n.cswidth_bits,
            );
            let new_units: Vec<SubUnitRead> = units
                .lanes
                .iter()
                .map(|l| SubUnitRead {
                    info,
                    lane_mask: l.lane_mask,
                    dshift: l.dshift,
                    addr_offset: l.addr_offset,
                    stride: units.stride,
                    width,
                    name: name.clone(),
                    f: f.clone(),
                })
                .collect();
            let covered: u64 = new_units.iter().fold(0, |m, u| m | u.lane_mask);
            let mut cache: Vec<(Rc<dyn ReadHandler<W>>, Rc<dyn ReadHandler<W>>)> = Vec::new();
            tree.populate_replace(n.range.start, n.range.end, n.range.mirror, &mut |old| {
                if let Some((_, new)) = cache.iter().find(|(o, _)| Rc::ptr_eq(o, old)) {
                    return new.clone();
                }
                // keep sub-units of a previous mismatched install on the
                // lanes we do not cover; anything else is displaced
                let mut merged: Vec<SubUnitRead> = match old.subunits() {
                    Some(su) => su
                        .units()
                        .iter()
                        .filter(|u| u.lane_mask & covered == 0)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                merged.extend(new_units.iter().cloned());
                let new: Rc<dyn ReadHandler<W>> =
                    Rc::new(SubUnitsRead::new(word_shift, merged));
                cache.push((old.clone(), new.clone()));
                new
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_erased(
        &self,
        function: &'static str,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        name: String,
        width: DataWidth,
        f: RawWrite,
        unitmask: u64,
        cswidth_bits: u32,
    ) -> Result<(), ConfigError> {
        if width.bits() > W::BITS {
            return Err(ConfigError::HandlerTooWide {
                function,
                handler_bits: width.bits(),
                bus_bits: W::BITS,
            });
        }
        let n = check_optimize_all(
            function,
            self.cfg(),
            width,
            self.window,
            start,
            end,
            mask,
            mirror,
            select,
            unitmask,
            cswidth_bits,
        )?;
        trace!(
            "{}: {function} '{name}' {:#x}-{:#x} mirror {:#x} umask {:#x}",
            self.owner(),
            n.range.start,
            n.range.end,
            n.range.mirror,
            n.unitmask,
        );
        let info = self.info(&n.range);
        let word_shift = self.cfg().low_bits();
        let mut tree = self.write_tree.borrow_mut();
        if width == W::WIDTH {
            let g: crate::handler::WriteDelegate<W> =
                Rc::new(move |offset, data: W, mem_mask: W| {
                    f(offset, data.to_u64(), mem_mask.to_u64())
                });
            let leaf: Rc<dyn WriteHandler<W>> =
                Rc::new(DelegateWrite::new(info, word_shift, name, g));
            tree.populate(n.range.start, n.range.end, n.range.mirror, leaf);
        } else {
            let units = memory_units(
                W::WIDTH,
                width,
                self.cfg().endian(),
                n.unitmask,
                n.cswidth_bits,
            );
            let new_units: Vec<SubUnitWrite> = units
                .lanes
                .iter()
                .map(|l| SubUnitWrite {
                    info,
                    lane_mask: l.lane_mask,
                    dshift: l.dshift,
                    addr_offset: l.addr_offset,
                    stride: units.stride,
                    width,
                    name: name.clone(),
                    f: f.clone(),
                })
                .collect();
            let covered: u64 = new_units.iter().fold(0, |m, u| m | u.lane_mask);
            let mut cache: Vec<(Rc<dyn WriteHandler<W>>, Rc<dyn WriteHandler<W>>)> = Vec::new();
            tree.populate_replace(n.range.start, n.range.end, n.range.mirror, &mut |old| {
                if let Some((_, new)) = cache.iter().find(|(o, _)| Rc::ptr_eq(o, old)) {
                    return new.clone();
                }
                let mut merged: Vec<SubUnitWrite> = match old.subunits() {
                    Some(su) => su
                        .units()
                        .iter()
                        .filter(|u| u.lane_mask & covered == 0)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                merged.extend(new_units.iter().cloned());
                let new: Rc<dyn WriteHandler<W>> =
                    Rc::new(SubUnitsWrite::new(word_shift, merged));
                cache.push((old.clone(), new.clone()));
                new
            });
        }
        Ok(())
    }

    // -- memory -------------------------------------------------------------

    /// Install RAM over the range.  With no backing supplied an anonymous
    /// block is fetched from the manager, keyed by context and start
    /// address so reinstalling the same slot finds the same bytes.
    pub fn install_ram(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        side: Side,
        backing: Option<SharedBytes>,
    ) -> Result<SharedBytes, ConfigError> {
        const FN: &str = "install_ram";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let need = self.cfg().range_to_bytes(start, end);
        let bytes = match backing {
            Some(b) => b,
            None => {
                let key = format!("{}ram_{:x}", self.key, n.start);
                self.space.manager().anonymous_alloc(key, need)
            }
        };
        self.install_backed(FN, &n, side, bytes.clone(), 0, need)?;
        self.invalidate(side);
        Ok(bytes)
    }

    /// Install memory at a byte offset inside an existing backing, the
    /// form used for region-bound ROM.
    pub fn install_memory(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        side: Side,
        backing: SharedBytes,
        byte_offset: usize,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_memory";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let need = self.cfg().range_to_bytes(start, end);
        self.install_backed(FN, &n, side, backing, byte_offset, need)?;
        self.invalidate(side);
        Ok(())
    }

    fn install_backed(
        &self,
        function: &'static str,
        n: &NormalizedRange,
        side: Side,
        bytes: SharedBytes,
        byte_offset: usize,
        need: usize,
    ) -> Result<(), ConfigError> {
        let have = bytes.borrow().len();
        if have < byte_offset + need {
            return Err(ConfigError::BackingTooSmall {
                function,
                start: n.start,
                end: n.end,
                need: byte_offset + need,
                have,
            });
        }
        trace!(
            "{}: {function} {:#x}-{:#x} mirror {:#x} ({need:#x} bytes)",
            self.owner(),
            n.start,
            n.end,
            n.mirror,
        );
        let info = self.info(n);
        let endian = self.cfg().endian();
        if side.contains(Side::READ) {
            let leaf: Rc<dyn ReadHandler<W>> =
                Rc::new(MemoryRead::new(info, bytes.clone(), byte_offset, endian));
            self.read_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
        }
        if side.contains(Side::WRITE) {
            let leaf: Rc<dyn WriteHandler<W>> =
                Rc::new(MemoryWrite::new(info, bytes, byte_offset, endian));
            self.write_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
        }
        Ok(())
    }

    // -- banks and ports ----------------------------------------------------

    pub fn install_bank(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        rbank: Option<Rc<MemoryBank>>,
        wbank: Option<Rc<MemoryBank>>,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_bank";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let info = self.info(&n);
        let endian = self.cfg().endian();
        let mut side = Side::empty();
        if let Some(bank) = rbank {
            trace!("{}: {FN} read '{}' {:#x}-{:#x}", self.owner(), bank.name(), n.start, n.end);
            let leaf: Rc<dyn ReadHandler<W>> = Rc::new(BankRead::new(info, bank, endian));
            self.read_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
            side |= Side::READ;
        }
        if let Some(bank) = wbank {
            trace!("{}: {FN} write '{}' {:#x}-{:#x}", self.owner(), bank.name(), n.start, n.end);
            let leaf: Rc<dyn WriteHandler<W>> = Rc::new(BankWrite::new(info, bank, endian));
            self.write_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
            side |= Side::WRITE;
        }
        self.invalidate(side);
        Ok(())
    }

    pub fn install_ports(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        rtag: Option<&str>,
        wtag: Option<&str>,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_ports";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        // both ports must exist before either side is touched
        let rport = match rtag {
            Some(tag) => Some(self.space.manager().port(tag).ok_or_else(|| {
                ConfigError::UnknownPort {
                    tag: tag.to_string(),
                    space: self.space.name().to_string(),
                }
            })?),
            None => None,
        };
        let wport = match wtag {
            Some(tag) => Some(self.space.manager().port(tag).ok_or_else(|| {
                ConfigError::UnknownPort {
                    tag: tag.to_string(),
                    space: self.space.name().to_string(),
                }
            })?),
            None => None,
        };
        let mut side = Side::empty();
        if let Some(port) = rport {
            let leaf: Rc<dyn ReadHandler<W>> = Rc::new(PortRead::new(port));
            self.read_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
            side |= Side::READ;
        }
        if let Some(port) = wport {
            let leaf: Rc<dyn WriteHandler<W>> = Rc::new(PortWrite::new(port));
            self.write_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
            side |= Side::WRITE;
        }
        self.invalidate(side);
        Ok(())
    }

    // -- unmapping ----------------------------------------------------------

    /// Return a range to the unmapped state; `quiet` suppresses access
    /// logging (the nop variant).
    pub fn unmap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        side: Side,
        quiet: bool,
    ) -> Result<(), ConfigError> {
        const FN: &str = "unmap";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        if side.contains(Side::READ) {
            let leaf: Rc<dyn ReadHandler<W>> = Rc::new(UnmappedRead::new(quiet, self.owner()));
            self.read_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
        }
        if side.contains(Side::WRITE) {
            let leaf: Rc<dyn WriteHandler<W>> = Rc::new(UnmappedWrite::new(quiet, self.owner()));
            self.write_tree
                .borrow_mut()
                .populate(n.start, n.end, n.mirror, leaf);
        }
        self.invalidate(side);
        Ok(())
    }

    // -- passthrough taps ---------------------------------------------------

    /// Wrap every read handler in the range with an observer callback.
    /// Passing an existing group ties several taps to one removal handle.
    pub fn install_read_tap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        name: impl Into<String>,
        cb: impl FnMut(Offs, &mut W, W) + 'static,
        group: Option<TapGroup>,
    ) -> Result<TapGroup, ConfigError> {
        const FN: &str = "install_read_tap";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let group = group.unwrap_or_else(TapGroup::new);
        let name = name.into();
        let info = self.info(&n);
        let word_shift = self.cfg().low_bits();
        let cb: TapFn<W> = Rc::new(RefCell::new(cb));
        let mut cache: Vec<(Rc<dyn ReadHandler<W>>, Rc<dyn ReadHandler<W>>)> = Vec::new();
        self.read_tree
            .borrow_mut()
            .populate_replace(n.start, n.end, n.mirror, &mut |old| {
                if let Some((_, new)) = cache.iter().find(|(o, _)| Rc::ptr_eq(o, old)) {
                    return new.clone();
                }
                let new: Rc<dyn ReadHandler<W>> = Rc::new(TapRead::new(
                    name.clone(),
                    info,
                    word_shift,
                    group.clone(),
                    cb.clone(),
                    old.clone(),
                ));
                cache.push((old.clone(), new.clone()));
                new
            });
        self.invalidate(Side::READ);
        Ok(group)
    }

    /// Wrap every write handler in the range with an observer callback
    /// that may also rewrite the in-flight data.
    pub fn install_write_tap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        name: impl Into<String>,
        cb: impl FnMut(Offs, &mut W, W) + 'static,
        group: Option<TapGroup>,
    ) -> Result<TapGroup, ConfigError> {
        const FN: &str = "install_write_tap";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let group = group.unwrap_or_else(TapGroup::new);
        let name = name.into();
        let info = self.info(&n);
        let word_shift = self.cfg().low_bits();
        let cb: TapFn<W> = Rc::new(RefCell::new(cb));
        let mut cache: Vec<(Rc<dyn WriteHandler<W>>, Rc<dyn WriteHandler<W>>)> = Vec::new();
        self.write_tree
            .borrow_mut()
            .populate_replace(n.start, n.end, n.mirror, &mut |old| {
                if let Some((_, new)) = cache.iter().find(|(o, _)| Rc::ptr_eq(o, old)) {
                    return new.clone();
                }
                let new: Rc<dyn WriteHandler<W>> = Rc::new(TapWrite::new(
                    name.clone(),
                    info,
                    word_shift,
                    group.clone(),
                    cb.clone(),
                    old.clone(),
                ));
                cache.push((old.clone(), new.clone()));
                new
            });
        self.invalidate(Side::WRITE);
        Ok(group)
    }

    /// Install both a read and a write tap over the range under one
    /// group handle.
    #[allow(clippy::too_many_arguments)]
    pub fn install_readwrite_tap(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        name: impl Into<String>,
        cbr: impl FnMut(Offs, &mut W, W) + 'static,
        cbw: impl FnMut(Offs, &mut W, W) + 'static,
        group: Option<TapGroup>,
    ) -> Result<TapGroup, ConfigError> {
        let name = name.into();
        let group = self.install_read_tap(start, end, mirror, name.clone(), cbr, group)?;
        self.install_write_tap(start, end, mirror, name, cbw, Some(group.clone()))?;
        Ok(group)
    }

    // -- views --------------------------------------------------------------

    /// Place a view over the range.  The view's dispatch leaves are
    /// created (or revalidated) first, then every already-configured slot
    /// is populated from its map.
    pub fn install_view(
        &self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        view: &crate::view::MemoryView<W>,
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_view";
        let n = check_optimize_mirror(FN, self.cfg(), self.window, start, end, mirror)?;
        let (rleaf, wleaf) = view.make_handlers(&self.space, start, end)?;
        trace!("{}: {FN} '{}' {:#x}-{:#x}", self.owner(), view.name(), n.start, n.end);
        self.read_tree
            .borrow_mut()
            .populate(n.start, n.end, n.mirror, rleaf);
        self.write_tree
            .borrow_mut()
            .populate(n.start, n.end, n.mirror, wleaf);
        view.make_subdispatch(self.key.clone())?;
        self.invalidate(Side::RW);
        Ok(())
    }

    // -- declarative maps ---------------------------------------------------

    /// Install a device-scoped map into the window `start`-`end`: the map's
    /// entry addresses are relative to `start`.  Entries spilling past `end`
    /// are rejected before anything is installed.
    pub fn install_map(
        &self,
        start: Offs,
        end: Offs,
        build: impl Fn(&mut AddressMap<W>),
    ) -> Result<(), ConfigError> {
        const FN: &str = "install_map";
        let mut map = AddressMap::new();
        build(&mut map);
        map.import_submaps();
        for entry in &mut map.entries {
            entry.start += start;
            entry.end += start;
        }
        for entry in &map.entries {
            if entry.start < start || (entry.end | entry.mirror | entry.select) > end {
                return Err(ConfigError::OutsideWindow {
                    function: FN,
                    start: entry.start,
                    end: entry.end,
                    mirror: entry.mirror,
                    select: entry.select,
                    window_start: start,
                    window_end: end,
                });
            }
        }
        self.populate_from_map(&mut map)
    }

    /// Resolve and install every entry of a finished map.  Later entries
    /// overlay earlier ones.
    pub fn populate_from_map(&self, map: &mut AddressMap<W>) -> Result<(), ConfigError> {
        const FN: &str = "populate_from_map";
        map.import_submaps();
        for entry in &map.entries {
            // views occupy the whole entry; nothing else applies
            if let Some(view) = &entry.view {
                self.install_view(entry.start, entry.end, entry.mirror, view)?;
                continue;
            }

            let backing = self.resolve_backing(entry)?;

            match &entry.read {
                ReadKind::None => {}
                ReadKind::Ram | ReadKind::Rom => {
                    let (bytes, offset) = self.backing_or_err(entry, &backing)?;
                    self.install_memory(
                        entry.start,
                        entry.end,
                        entry.mirror,
                        Side::READ,
                        bytes,
                        offset,
                    )?;
                }
                ReadKind::Nop => {
                    self.unmap(entry.start, entry.end, entry.mirror, Side::READ, true)?;
                }
                ReadKind::Unmap => {
                    self.unmap(entry.start, entry.end, entry.mirror, Side::READ, false)?;
                }
                ReadKind::Port(tag) => {
                    self.install_ports(entry.start, entry.end, entry.mirror, Some(tag), None)?;
                }
                ReadKind::Bank(tag) => {
                    let bank = self.space.manager().bank(tag);
                    self.install_bank(entry.start, entry.end, entry.mirror, Some(bank), None)?;
                }
                ReadKind::Delegate(d) => {
                    self.read_erased(
                        FN,
                        entry.start,
                        entry.end,
                        entry.mask,
                        entry.mirror,
                        entry.select,
                        d.name.clone(),
                        d.width,
                        d.f.clone(),
                        entry.unitmask,
                        entry.cswidth_bits,
                    )?;
                    self.invalidate(Side::READ);
                }
            }

            match &entry.write {
                WriteKind::None => {}
                WriteKind::Ram => {
                    let (bytes, offset) = self.backing_or_err(entry, &backing)?;
                    self.install_memory(
                        entry.start,
                        entry.end,
                        entry.mirror,
                        Side::WRITE,
                        bytes,
                        offset,
                    )?;
                }
                WriteKind::Nop => {
                    self.unmap(entry.start, entry.end, entry.mirror, Side::WRITE, true)?;
                }
                WriteKind::Unmap => {
                    self.unmap(entry.start, entry.end, entry.mirror, Side::WRITE, false)?;
                }
                WriteKind::Port(tag) => {
                    self.install_ports(entry.start, entry.end, entry.mirror, None, Some(tag))?;
                }
                WriteKind::Bank(tag) => {
                    let bank = self.space.manager().bank(tag);
                    self.install_bank(entry.start, entry.end, entry.mirror, None, Some(bank))?;
                }
                WriteKind::Delegate(d) => {
                    self.write_erased(
                        FN,
                        entry.start,
                        entry.end,
                        entry.mask,
                        entry.mirror,
                        entry.select,
                        d.name.clone(),
                        d.width,
                        d.f.clone(),
                        entry.unitmask,
                        entry.cswidth_bits,
                    )?;
                    self.invalidate(Side::WRITE);
                }
            }
        }
        Ok(())
    }

    /// Resolve the memory backing a map entry refers to: a share, an
    /// explicit region slice, the space's default region for implicit
    /// ROM, or an anonymous RAM block.
    fn resolve_backing(
        &self,
        entry: &crate::map::MapEntry<W>,
    ) -> Result<Option<(SharedBytes, usize)>, ConfigError> {
        let wants_memory = matches!(entry.read, ReadKind::Ram | ReadKind::Rom)
            || matches!(entry.write, WriteKind::Ram);
        if !wants_memory {
            return Ok(None);
        }
        if entry.share.is_some() && entry.region.is_some() {
            return Err(ConfigError::RegionAndShare {
                space: self.space.name().to_string(),
                start: entry.start,
                end: entry.end,
            });
        }
        let cfg = self.cfg();
        let len = cfg.range_to_bytes(entry.start, entry.end);

        if let Some(tag) = &entry.share {
            let manager = self.space.manager();
            let share = match manager.share_find(tag) {
                Some(share) => {
                    if let Some(message) =
                        share.compare(cfg.data_width(), len, cfg.endian())
                    {
                        return Err(ConfigError::ShareMismatch {
                            tag: tag.clone(),
                            message,
                        });
                    }
                    share
                }
                None => manager.share_alloc(tag.clone(), cfg.data_width(), len, cfg.endian()),
            };
            return Ok(Some((share.bytes(), 0)));
        }

        if let Some((tag, offset)) = &entry.region {
            let region = self.space.manager().region(tag).ok_or_else(|| {
                ConfigError::UnknownRegion {
                    space: self.space.name().to_string(),
                    start: entry.start,
                    end: entry.end,
                    tag: tag.clone(),
                }
            })?;
            let size = region.borrow().len();
            if offset + len > size {
                return Err(ConfigError::RegionTooSmall {
                    space: self.space.name().to_string(),
                    start: entry.start,
                    end: entry.end,
                    tag: tag.clone(),
                    size,
                });
            }
            return Ok(Some((region, *offset)));
        }

        if matches!(entry.read, ReadKind::Rom) {
            // implicit ROM binds into the default region when the range
            // fits inside it
            if let Some(tag) = self.space.default_region() {
                if let Some(region) = self.space.manager().region(&tag) {
                    let size = region.borrow().len() as u64;
                    if cfg.addr_to_byte(entry.end) < size {
                        let offset = cfg.addr_to_byte(entry.start) as usize;
                        return Ok(Some((region, offset)));
                    }
                }
            }
            return Err(ConfigError::UnboundRom {
                space: self.space.name().to_string(),
                start: entry.start,
                end: entry.end,
            });
        }

        // anonymous RAM, stable across repopulation of the same context
        let key = format!("{}ram_{:x}", self.key, entry.start & cfg.addr_mask());
        Ok(Some((self.space.manager().anonymous_alloc(key, len), 0)))
    }

    fn backing_or_err(
        &self,
        entry: &crate::map::MapEntry<W>,
        backing: &Option<(SharedBytes, usize)>,
    ) -> Result<(SharedBytes, usize), ConfigError> {
        match backing {
            Some((bytes, offset)) => Ok((bytes.clone(), *offset)),
            None => Err(ConfigError::UnboundRom {
                space: self.space.name().to_string(),
                start: entry.start,
                end: entry.end,
            }),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_read<A: BusWord>(
    function: &'static str,
    handler: &ReadHandlerRef<A>,
    start: Offs,
    end: Offs,
    mask: Offs,
    mirror: Offs,
    select: Offs,
    unitmask: u64,
) -> Result<(String, RawRead), ConfigError> {
    match handler.resolve() {
        Some(f) => {
            let raw: RawRead =
                Rc::new(move |offset, mem_mask| f(offset, A::from_u64(mem_mask)).to_u64());
            Ok((handler.name().to_string(), raw))
        }
        None => Err(ConfigError::UnresolvedHandler {
            function,
            name: handler.name().to_string(),
            start,
            end,
            mask,
            mirror,
            select,
            unitmask,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_write<A: BusWord>(
    function: &'static str,
    handler: &WriteHandlerRef<A>,
    start: Offs,
    end: Offs,
    mask: Offs,
    mirror: Offs,
    select: Offs,
    unitmask: u64,
) -> Result<(String, RawWrite), ConfigError> {
    match handler.resolve() {
        Some(f) => {
            let raw: RawWrite = Rc::new(move |offset, data, mem_mask| {
                f(offset, A::from_u64(data), A::from_u64(mem_mask))
            });
            Ok((handler.name().to_string(), raw))
        }
        None => Err(ConfigError::UnresolvedHandler {
            function,
            name: handler.name().to_string(),
            start,
            end,
            mask,
            mirror,
            select,
            unitmask,
        }),
    }
}
