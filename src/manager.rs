// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Machine-wide registry of named memory resources.
//!
//! Regions hold preloaded data (typically ROM images), shares are RAM
//! blocks visible from several spaces under one tag, banks are switchable
//! indirections and ports are latched I/O values.  Anonymous RAM blocks
//! allocated for plain `ram()` map entries are also kept here, keyed by
//! their installation context, so repopulating the same map (a view slot
//! being reselected) finds the same storage instead of fresh zeroes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::{DataWidth, Endianness};
use crate::handler::{shared_bytes, IoPort, MemoryBank, SharedBytes};

/// A RAM block shared between address spaces under one tag.  The creating
/// map records the shape; later users must agree on it.
pub struct Share {
    tag: String,
    width: DataWidth,
    endian: Endianness,
    bytes: SharedBytes,
}

impl Share {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn bytes(&self) -> SharedBytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check a later user's expectations against the recorded shape.
    pub fn compare(&self, width: DataWidth, len: usize, endian: Endianness) -> Option<String> {
        if self.len() != len {
            return Some(format!(
                "found with size {:#x}, requested {:#x}",
                self.len(),
                len
            ));
        }
        if self.width != width {
            return Some(format!(
                "found with width {}, requested {}",
                self.width.bits(),
                width.bits()
            ));
        }
        if self.width != DataWidth::W8 && self.endian != endian {
            return Some("found with a different endianness".into());
        }
        None
    }
}

/// Owner of every named resource the maps of one machine refer to.
#[derive(Default)]
pub struct MemoryManager {
    regions: RefCell<HashMap<String, SharedBytes>>,
    shares: RefCell<HashMap<String, Rc<Share>>>,
    banks: RefCell<HashMap<String, Rc<MemoryBank>>>,
    ports: RefCell<HashMap<String, Rc<IoPort>>>,
    anonymous: RefCell<HashMap<String, SharedBytes>>,
}

impl MemoryManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register a preloaded data region under `tag`, replacing any
    /// previous content.
    pub fn install_region(&self, tag: impl Into<String>, data: Vec<u8>) -> SharedBytes {
        let bytes = Rc::new(RefCell::new(data));
        self.regions.borrow_mut().insert(tag.into(), bytes.clone());
        bytes
    }

    pub fn region(&self, tag: &str) -> Option<SharedBytes> {
        self.regions.borrow().get(tag).cloned()
    }

    pub fn region_len(&self, tag: &str) -> Option<usize> {
        self.regions.borrow().get(tag).map(|r| r.borrow().len())
    }

    pub fn share_find(&self, tag: &str) -> Option<Rc<Share>> {
        self.shares.borrow().get(tag).cloned()
    }

    /// Allocate a share; first declaration wins and fixes the shape.
    pub fn share_alloc(
        &self,
        tag: impl Into<String>,
        width: DataWidth,
        len: usize,
        endian: Endianness,
    ) -> Rc<Share> {
        let tag = tag.into();
        let share = Rc::new(Share {
            tag: tag.clone(),
            width,
            endian,
            bytes: shared_bytes(len),
        });
        self.shares.borrow_mut().insert(tag, share.clone());
        share
    }

    /// Find or create the bank registered under `tag`.
    pub fn bank(&self, tag: &str) -> Rc<MemoryBank> {
        self.banks
            .borrow_mut()
            .entry(tag.to_string())
            .or_insert_with(|| Rc::new(MemoryBank::new(tag)))
            .clone()
    }

    pub fn bank_find(&self, tag: &str) -> Option<Rc<MemoryBank>> {
        self.banks.borrow().get(tag).cloned()
    }

    /// Declare an I/O port.  Ports are not auto-created by maps; mapping
    /// an undeclared tag is a configuration error.
    pub fn port_alloc(&self, tag: impl Into<String>) -> Rc<IoPort> {
        let tag = tag.into();
        self.ports
            .borrow_mut()
            .entry(tag.clone())
            .or_insert_with(|| Rc::new(IoPort::new(tag)))
            .clone()
    }

    pub fn port(&self, tag: &str) -> Option<Rc<IoPort>> {
        self.ports.borrow().get(tag).cloned()
    }

    /// Find or create the anonymous RAM block identified by `key`.  The
    /// key encodes the installation context and range, making repeated
    /// population of the same map idempotent.
    pub fn anonymous_alloc(&self, key: impl Into<String>, len: usize) -> SharedBytes {
        self.anonymous
            .borrow_mut()
            .entry(key.into())
            .or_insert_with(|| shared_bytes(len))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_round_trip() {
        let m = MemoryManager::new();
        m.install_region("maincpu", vec![1, 2, 3, 4]);
        assert_eq!(m.region_len("maincpu"), Some(4));
        assert!(m.region("other").is_none());
    }

    #[test]
    fn share_shape_comparison() {
        let m = MemoryManager::new();
        let s = m.share_alloc("vram", DataWidth::W16, 0x100, Endianness::Little);
        assert!(s.compare(DataWidth::W16, 0x100, Endianness::Little).is_none());
        assert!(s.compare(DataWidth::W16, 0x80, Endianness::Little).is_some());
        assert!(s.compare(DataWidth::W8, 0x100, Endianness::Little).is_some());
        assert!(s.compare(DataWidth::W16, 0x100, Endianness::Big).is_some());
        // byte-wide shares have no endianness
        let b = m.share_alloc("bram", DataWidth::W8, 0x10, Endianness::Little);
        assert!(b.compare(DataWidth::W8, 0x10, Endianness::Big).is_none());
    }

    #[test]
    fn banks_are_created_on_demand() {
        let m = MemoryManager::new();
        let a = m.bank("rombank");
        let b = m.bank("rombank");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(m.bank_find("other").is_none());
    }

    #[test]
    fn ports_require_declaration() {
        let m = MemoryManager::new();
        assert!(m.port("in0").is_none());
        let p = m.port_alloc("in0");
        p.set_value(0x5a);
        assert_eq!(m.port("in0").map(|p| p.value()), Some(0x5a));
    }

    #[test]
    fn anonymous_blocks_are_stable_per_key() {
        let m = MemoryManager::new();
        let a = m.anonymous_alloc("cpu:ram_1000", 0x100);
        a.borrow_mut()[0] = 0x42;
        let b = m.anonymous_alloc("cpu:ram_1000", 0x100);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(b.borrow()[0], 0x42);
        let c = m.anonymous_alloc("cpu:ram_2000", 0x100);
        assert!(!Rc::ptr_eq(&a, &c));
    }
}
