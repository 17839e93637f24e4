// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Declarative address maps.
//!
//! A map is an ordered list of range entries built with a chained entry
//! API; nothing is resolved or installed while building.  The installer
//! walks the finished map, resolves symbolic references (regions, shares,
//! banks, ports) against the manager and populates the dispatch trees.
//! Later entries overlay earlier ones where they overlap.

use std::rc::Rc;

use crate::config::{DataWidth, Offs};
use crate::handler::{BusWord, RawRead, RawWrite};
use crate::view::MemoryView;

/// Read disposition of one map entry.
pub enum ReadKind {
    None,
    Ram,
    Rom,
    Nop,
    Unmap,
    Port(String),
    Bank(String),
    Delegate(ErasedRead),
}

/// Write disposition of one map entry.
pub enum WriteKind {
    None,
    Ram,
    Nop,
    Unmap,
    Port(String),
    Bank(String),
    Delegate(ErasedWrite),
}

/// A read callback with its width erased to u64 so maps can mix handler
/// widths narrower than the bus.
pub struct ErasedRead {
    pub name: String,
    pub width: DataWidth,
    pub f: RawRead,
}

/// A width-erased write callback.
pub struct ErasedWrite {
    pub name: String,
    pub width: DataWidth,
    pub f: RawWrite,
}

type SubmapFn<W> = Rc<dyn Fn(&mut AddressMap<W>)>;

/// One range of a map under construction.
pub struct MapEntry<W: BusWord> {
    pub start: Offs,
    pub end: Offs,
    pub mask: Offs,
    pub mirror: Offs,
    pub select: Offs,
    pub unitmask: u64,
    pub cswidth_bits: u32,
    pub read: ReadKind,
    pub write: WriteKind,
    pub share: Option<String>,
    pub region: Option<(String, usize)>,
    pub view: Option<MemoryView<W>>,
    pub submap: Option<SubmapFn<W>>,
}

impl<W: BusWord> MapEntry<W> {
    fn new(start: Offs, end: Offs) -> Self {
        Self {
            start,
            end,
            mask: 0,
            mirror: 0,
            select: 0,
            unitmask: 0,
            cswidth_bits: 0,
            read: ReadKind::None,
            write: WriteKind::None,
            share: None,
            region: None,
            view: None,
            submap: None,
        }
    }

    /// Read/write RAM, allocated anonymously unless bound by `share()`.
    pub fn ram(&mut self) -> &mut Self {
        self.read = ReadKind::Ram;
        self.write = WriteKind::Ram;
        self
    }

    /// Read-only memory; writes stay unmapped.  Binds to `region()`, a
    /// share, or the space's default region.
    pub fn rom(&mut self) -> &mut Self {
        self.read = ReadKind::Rom;
        self
    }

    /// RAM readable but ignoring writes.
    pub fn ram_read_only(&mut self) -> &mut Self {
        self.read = ReadKind::Ram;
        self.write = WriteKind::Nop;
        self
    }

    pub fn nopr(&mut self) -> &mut Self {
        self.read = ReadKind::Nop;
        self
    }

    pub fn nopw(&mut self) -> &mut Self {
        self.write = WriteKind::Nop;
        self
    }

    pub fn noprw(&mut self) -> &mut Self {
        self.read = ReadKind::Nop;
        self.write = WriteKind::Nop;
        self
    }

    pub fn unmapr(&mut self) -> &mut Self {
        self.read = ReadKind::Unmap;
        self
    }

    pub fn unmapw(&mut self) -> &mut Self {
        self.write = WriteKind::Unmap;
        self
    }

    pub fn unmaprw(&mut self) -> &mut Self {
        self.read = ReadKind::Unmap;
        self.write = WriteKind::Unmap;
        self
    }

    pub fn portr(&mut self, tag: impl Into<String>) -> &mut Self {
        self.read = ReadKind::Port(tag.into());
        self
    }

    pub fn portw(&mut self, tag: impl Into<String>) -> &mut Self {
        self.write = WriteKind::Port(tag.into());
        self
    }

    pub fn portrw(&mut self, tag: impl Into<String>) -> &mut Self {
        let tag = tag.into();
        self.read = ReadKind::Port(tag.clone());
        self.write = WriteKind::Port(tag);
        self
    }

    pub fn read_bank(&mut self, tag: impl Into<String>) -> &mut Self {
        self.read = ReadKind::Bank(tag.into());
        self
    }

    pub fn write_bank(&mut self, tag: impl Into<String>) -> &mut Self {
        self.write = WriteKind::Bank(tag.into());
        self
    }

    pub fn bankrw(&mut self, tag: impl Into<String>) -> &mut Self {
        let tag = tag.into();
        self.read = ReadKind::Bank(tag.clone());
        self.write = WriteKind::Bank(tag);
        self
    }

    /// Read callback of width `A`, `A` no wider than the bus.
    pub fn read<A: BusWord>(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(Offs, A) -> A + 'static,
    ) -> &mut Self {
        let f: RawRead = Rc::new(move |offset, mem_mask| {
            f(offset, A::from_u64(mem_mask)).to_u64()
        });
        self.read = ReadKind::Delegate(ErasedRead {
            name: name.into(),
            width: A::WIDTH,
            f,
        });
        self
    }

    /// Write callback of width `A`.
    pub fn write<A: BusWord>(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(Offs, A, A) + 'static,
    ) -> &mut Self {
        let f: RawWrite = Rc::new(move |offset, data, mem_mask| {
            f(offset, A::from_u64(data), A::from_u64(mem_mask));
        });
        self.write = WriteKind::Delegate(ErasedWrite {
            name: name.into(),
            width: A::WIDTH,
            f,
        });
        self
    }

    /// Bind the entry's memory to a named share.
    pub fn share(&mut self, tag: impl Into<String>) -> &mut Self {
        self.share = Some(tag.into());
        self
    }

    /// Bind the entry's memory to a named region at a byte offset.
    pub fn region(&mut self, tag: impl Into<String>, offset: usize) -> &mut Self {
        self.region = Some((tag.into(), offset));
        self
    }

    /// Place a view over the range; its slots are configured separately.
    pub fn view(&mut self, view: &MemoryView<W>) -> &mut Self {
        self.view = Some(view.clone());
        self
    }

    /// Inline another map builder, translated to start at this entry's
    /// start address.
    pub fn submap(&mut self, f: impl Fn(&mut AddressMap<W>) + 'static) -> &mut Self {
        self.submap = Some(Rc::new(f));
        self
    }

    pub fn mask(&mut self, mask: Offs) -> &mut Self {
        self.mask = mask;
        self
    }

    pub fn mirror(&mut self, mirror: Offs) -> &mut Self {
        self.mirror = mirror;
        self
    }

    pub fn select(&mut self, select: Offs) -> &mut Self {
        self.select = select;
        self
    }

    pub fn umask(&mut self, unitmask: u64) -> &mut Self {
        self.unitmask = unitmask;
        self
    }

    pub fn cswidth(&mut self, bits: u32) -> &mut Self {
        self.cswidth_bits = bits;
        self
    }
}

/// A map under construction for a bus carrying words of type `W`.
pub struct AddressMap<W: BusWord> {
    pub entries: Vec<MapEntry<W>>,
}

impl<W: BusWord> Default for AddressMap<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: BusWord> AddressMap<W> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append an entry covering the inclusive range and return its
    /// builder.
    pub fn entry(&mut self, start: Offs, end: Offs) -> &mut MapEntry<W> {
        self.entries.push(MapEntry::new(start, end));
        let idx = self.entries.len() - 1;
        &mut self.entries[idx]
    }

    /// Flatten submap entries in place, translating child addresses by
    /// the parent entry's start and inheriting its mirror.
    pub fn import_submaps(&mut self) {
        let mut flat: Vec<MapEntry<W>> = Vec::new();
        for entry in self.entries.drain(..) {
            if let Some(builder) = entry.submap {
                let mut child = AddressMap::new();
                builder(&mut child);
                child.import_submaps();
                for mut sub in child.entries {
                    sub.start += entry.start;
                    sub.end += entry.start;
                    sub.mirror |= entry.mirror;
                    flat.push(sub);
                }
            } else {
                flat.push(entry);
            }
        }
        self.entries = flat;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chains() {
        let mut map: AddressMap<u8> = AddressMap::new();
        map.entry(0x0000, 0x1fff).rom().region("boot", 0);
        map.entry(0x2000, 0x3fff).ram().share("wram").mirror(0x4000);
        map.entry(0x8000, 0x8000)
            .read::<u8>("status_r", |_, _| 0x80)
            .write::<u8>("ctrl_w", |_, _, _| {});
        assert_eq!(map.entries.len(), 3);
        assert!(matches!(map.entries[0].read, ReadKind::Rom));
        assert_eq!(map.entries[1].mirror, 0x4000);
        assert!(matches!(map.entries[2].write, WriteKind::Delegate(_)));
    }

    #[test]
    fn submaps_flatten_with_translation() {
        let mut map: AddressMap<u8> = AddressMap::new();
        map.entry(0x4000, 0x4fff).mirror(0x8000).submap(|m| {
            m.entry(0x000, 0x0ff).ram();
            m.entry(0x100, 0x1ff).nopr();
        });
        map.entry(0x0000, 0x00ff).ram();
        map.import_submaps();
        assert_eq!(map.entries.len(), 3);
        assert_eq!(map.entries[0].start, 0x4000);
        assert_eq!(map.entries[0].end, 0x40ff);
        assert_eq!(map.entries[0].mirror, 0x8000);
        assert_eq!(map.entries[1].start, 0x4100);
        assert_eq!(map.entries[2].start, 0x0000);
    }

    #[test]
    fn delegate_width_is_recorded() {
        let mut map: AddressMap<u32> = AddressMap::new();
        map.entry(0, 3).read::<u8>("narrow_r", |_, _| 0xff);
        match &map.entries[0].read {
            ReadKind::Delegate(d) => assert_eq!(d.width, DataWidth::W8),
            _ => panic!("expected delegate"),
        }
    }
}
