// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Radix dispatch tree mapping addresses to leaf handlers.
//!
//! Each node decodes up to eight address bits into a slot table; a slot
//! either holds a shared leaf or a child node decoding the next bits down.
//! The tree is always full: construction seeds every slot with the default
//! (unmapped) leaf, so lookup never has a miss path.  Installing over a
//! partially covered slot pushes the previous leaf down into a fresh child
//! node, one slot clone per sub-slot, keeping mirrored ranges sharing a
//! single leaf allocation.

use std::rc::Rc;

use crate::config::Offs;

const LEVEL_BITS: u32 = 8;

enum Slot<H: ?Sized> {
    Leaf(Rc<H>),
    Sub(Box<Node<H>>),
}

struct Node<H: ?Sized> {
    shift: u32,
    slots: Vec<Slot<H>>,
}

impl<H: ?Sized> Node<H> {
    /// Node decoding bits `shift..top_bits`, every slot seeded with `fill`.
    fn new(top_bits: u32, low_bits: u32, fill: &Rc<H>) -> Self {
        let bits = (top_bits - low_bits).min(LEVEL_BITS);
        let shift = top_bits - bits;
        let slots = (0..1usize << bits).map(|_| Slot::Leaf(fill.clone())).collect();
        Self { shift, slots }
    }

    fn slot_index(&self, addr: Offs) -> usize {
        ((addr as u64 >> self.shift) as usize) & (self.slots.len() - 1)
    }

    fn lookup(&self, addr: Offs) -> &Rc<H> {
        match &self.slots[self.slot_index(addr)] {
            Slot::Leaf(leaf) => leaf,
            Slot::Sub(node) => node.lookup(addr),
        }
    }

    /// Install `f(old)` over `start..=end`, assuming the caller already
    /// expanded mirrors.  Fully covered slots are rewritten in place;
    /// partially covered ones materialize a child node first, seeded with
    /// the displaced leaf, and recurse with clamped bounds.
    fn populate_range(
        &mut self,
        start: Offs,
        end: Offs,
        low_bits: u32,
        f: &mut dyn FnMut(&Rc<H>) -> Rc<H>,
    ) {
        let span = (1u64 << self.shift) - 1;
        let lo = self.slot_index(start);
        let hi = self.slot_index(end);
        for idx in lo..=hi {
            let base = ((start as u64) & !(((self.slots.len() as u64) << self.shift) - 1))
                + ((idx as u64) << self.shift);
            let slot_start = base as Offs;
            let slot_end = (base + span) as Offs;
            let covered = start <= slot_start && slot_end <= end;
            if covered || self.shift == low_bits {
                match &mut self.slots[idx] {
                    Slot::Leaf(leaf) => *leaf = f(leaf),
                    Slot::Sub(node) => {
                        node.populate_range(slot_start, slot_end, low_bits, f);
                    }
                }
            } else {
                if let Slot::Leaf(leaf) = &self.slots[idx] {
                    let child = Node::new(self.shift, low_bits, leaf);
                    self.slots[idx] = Slot::Sub(Box::new(child));
                }
                if let Slot::Sub(node) = &mut self.slots[idx] {
                    node.populate_range(start.max(slot_start), end.min(slot_end), low_bits, f);
                }
            }
        }
    }
}

/// Decode tree for one side (read or write) of one address space or view
/// slot.  `H` is the unsized handler trait object type.
pub struct DispatchTree<H: ?Sized> {
    root: Node<H>,
    low_bits: u32,
}

impl<H: ?Sized> DispatchTree<H> {
    /// Tree decoding bits `low_bits..high_bits`, fully seeded with
    /// `default`.  A zero-span tree still gets one root slot.
    pub fn new(low_bits: u32, high_bits: u32, default: Rc<H>) -> Self {
        let top = high_bits.max(low_bits + 1);
        Self {
            root: Node::new(top, low_bits, &default),
            low_bits,
        }
    }

    /// Leaf serving `addr`.  Never fails; unmapped areas hold the stub.
    pub fn lookup(&self, addr: Offs) -> &Rc<H> {
        self.root.lookup(addr)
    }

    /// Install one shared leaf over a range and all its mirror images.
    pub fn populate(&mut self, start: Offs, end: Offs, mirror: Offs, leaf: Rc<H>) {
        self.populate_replace(start, end, mirror, &mut |_| leaf.clone());
    }

    /// Rewrite every leaf covering the range (and mirrors) through `f`.
    /// `f` receives the displaced leaf, so installs can wrap or merge with
    /// what was there; callers wanting shared replacements cache by
    /// `Rc::ptr_eq` on the old leaf.
    pub fn populate_replace(
        &mut self,
        start: Offs,
        end: Offs,
        mirror: Offs,
        f: &mut dyn FnMut(&Rc<H>) -> Rc<H>,
    ) {
        if mirror == 0 {
            self.root.populate_range(start, end, self.low_bits, f);
            return;
        }
        // enumerate the subsets of the mirror bits
        let mut value: Offs = 0;
        loop {
            self.root
                .populate_range(start | value, end | value, self.low_bits, f);
            value = value.wrapping_sub(mirror) & mirror;
            if value == 0 {
                break;
            }
        }
    }
}
