// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Leaf handlers terminating a dispatch tree.
//!
//! A leaf performs the actual read or write once the tree has decoded the
//! address: plain memory, bank, I/O port, delegate callback, unmapped stub,
//! width-mismatch aggregate, or passthrough tap.  Leaves are shared between
//! tree slots with [`Rc`], so a handler covering a mirrored range is stored
//! once and dropped synchronously when the last slot referencing it is
//! overwritten.
//!
//! Handlers receive absolute bus addresses; each leaf carries the canonical
//! start and folding mask recorded at install time and derives its own
//! relative offset from them.  Delegate callbacks see offsets in native-word
//! granularity.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use log::warn;

use crate::config::{DataWidth, Endianness, Offs};

/// One of the four machine word types a bus can carry.
pub trait BusWord: Copy + Eq + fmt::Debug + fmt::LowerHex + 'static {
    const WIDTH: DataWidth;
    const BITS: u32;
    const BYTES: u32;

    fn from_u64(v: u64) -> Self;
    fn to_u64(self) -> u64;

    fn all_ones() -> Self {
        Self::from_u64(u64::MAX)
    }

    fn zero() -> Self {
        Self::from_u64(0)
    }
}

macro_rules! bus_word {
    ($t:ty, $w:expr) => {
        impl BusWord for $t {
            const WIDTH: DataWidth = $w;
            const BITS: u32 = <$t>::BITS;
            const BYTES: u32 = <$t>::BITS / 8;

            fn from_u64(v: u64) -> Self {
                v as $t
            }

            fn to_u64(self) -> u64 {
                self as u64
            }
        }
    };
}

bus_word!(u8, DataWidth::W8);
bus_word!(u16, DataWidth::W16);
bus_word!(u32, DataWidth::W32);
bus_word!(u64, DataWidth::W64);

/// Shared byte storage backing RAM, regions and shares.
pub type SharedBytes = Rc<RefCell<Vec<u8>>>;

/// Allocate zero-filled shared storage.
pub fn shared_bytes(len: usize) -> SharedBytes {
    Rc::new(RefCell::new(vec![0; len]))
}

/// Canonical address information attached to a leaf at install time.
///
/// `mask` keeps the changing bits of the range (plus any select bits) and
/// drops mirror bits, so every mirrored copy of a range folds to the same
/// relative offset.
#[derive(Clone, Copy, Debug)]
pub struct AddressInfo {
    pub start: Offs,
    pub mask: Offs,
    pub shift: i8,
}

impl AddressInfo {
    pub fn new(start: Offs, mask: Offs, shift: i8) -> Self {
        Self { start, mask, shift }
    }

    /// Range-relative offset in address units.
    pub fn offset(&self, addr: Offs) -> Offs {
        (addr & self.mask).wrapping_sub(self.start & self.mask)
    }

    /// Range-relative offset in bytes.
    pub fn byte_offset(&self, addr: Offs) -> usize {
        let units = self.offset(addr) as u64;
        let bytes = if self.shift < 0 {
            units << -self.shift
        } else {
            units >> self.shift
        };
        bytes as usize
    }
}

/// Read side of a leaf handler.
pub trait ReadHandler<W: BusWord> {
    fn name(&self) -> String;
    fn read(&self, addr: Offs, mem_mask: W) -> W;

    #[doc(hidden)]
    fn subunits(&self) -> Option<&SubUnitsRead<W>> {
        None
    }
}

/// Write side of a leaf handler.
pub trait WriteHandler<W: BusWord> {
    fn name(&self) -> String;
    fn write(&self, addr: Offs, data: W, mem_mask: W);

    #[doc(hidden)]
    fn subunits(&self) -> Option<&SubUnitsWrite<W>> {
        None
    }
}

fn load_word(bytes: &[u8], endian: Endianness) -> u64 {
    let n = bytes.len();
    let mut v = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        let shift = match endian {
            Endianness::Little => 8 * i,
            Endianness::Big => 8 * (n - 1 - i),
        };
        v |= (*b as u64) << shift;
    }
    v
}

fn store_word(bytes: &mut [u8], endian: Endianness, data: u64, mask: u64) {
    let n = bytes.len();
    for (i, b) in bytes.iter_mut().enumerate() {
        let shift = match endian {
            Endianness::Little => 8 * i,
            Endianness::Big => 8 * (n - 1 - i),
        };
        let m = ((mask >> shift) & 0xff) as u8;
        if m != 0 {
            *b = (*b & !m) | (((data >> shift) as u8) & m);
        }
    }
}

// ---------------------------------------------------------------------------
// plain memory

/// RAM/ROM read leaf over shared byte storage, optionally region-relative.
pub struct MemoryRead<W: BusWord> {
    info: AddressInfo,
    base: SharedBytes,
    base_offset: usize,
    endian: Endianness,
    _marker: PhantomData<W>,
}

impl<W: BusWord> MemoryRead<W> {
    pub fn new(info: AddressInfo, base: SharedBytes, base_offset: usize, endian: Endianness) -> Self {
        Self {
            info,
            base,
            base_offset,
            endian,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for MemoryRead<W> {
    fn name(&self) -> String {
        "memory".into()
    }

    fn read(&self, addr: Offs, _mem_mask: W) -> W {
        let off = self.base_offset + self.info.byte_offset(addr);
        let bytes = self.base.borrow();
        match bytes.get(off..off + W::BYTES as usize) {
            Some(slice) => W::from_u64(load_word(slice, self.endian)),
            None => {
                warn!("memory read past backing at {addr:#x}");
                W::all_ones()
            }
        }
    }
}

/// RAM write leaf over shared byte storage.
pub struct MemoryWrite<W: BusWord> {
    info: AddressInfo,
    base: SharedBytes,
    base_offset: usize,
    endian: Endianness,
    _marker: PhantomData<W>,
}

impl<W: BusWord> MemoryWrite<W> {
    pub fn new(info: AddressInfo, base: SharedBytes, base_offset: usize, endian: Endianness) -> Self {
        Self {
            info,
            base,
            base_offset,
            endian,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for MemoryWrite<W> {
    fn name(&self) -> String {
        "memory".into()
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        let off = self.base_offset + self.info.byte_offset(addr);
        let mut bytes = self.base.borrow_mut();
        match bytes.get_mut(off..off + W::BYTES as usize) {
            Some(slice) => store_word(slice, self.endian, data.to_u64(), mem_mask.to_u64()),
            None => warn!("memory write past backing at {addr:#x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// banks

/// A switchable bank: several configured byte backings, one selected at a
/// time by an integer entry index.
pub struct MemoryBank {
    name: String,
    entries: RefCell<Vec<Option<SharedBytes>>>,
    cur: Cell<usize>,
}

impl MemoryBank {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RefCell::new(Vec::new()),
            cur: Cell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind backing storage to entry `index`, growing the table as needed.
    pub fn configure_entry(&self, index: usize, backing: SharedBytes) {
        let mut entries = self.entries.borrow_mut();
        if entries.len() <= index {
            entries.resize(index + 1, None);
        }
        entries[index] = Some(backing);
    }

    /// Switch the bank; a single integer write, effective immediately.
    pub fn set_entry(&self, index: usize) {
        if self
            .entries
            .borrow()
            .get(index)
            .is_none_or(|e| e.is_none())
        {
            log::error!("bank '{}': selecting unconfigured entry {index}", self.name);
        }
        self.cur.set(index);
    }

    pub fn entry(&self) -> usize {
        self.cur.get()
    }

    fn backing(&self) -> Option<SharedBytes> {
        self.entries.borrow().get(self.cur.get()).cloned().flatten()
    }
}

/// Read leaf dispatching through a bank's currently selected entry.
pub struct BankRead<W: BusWord> {
    info: AddressInfo,
    bank: Rc<MemoryBank>,
    endian: Endianness,
    _marker: PhantomData<W>,
}

impl<W: BusWord> BankRead<W> {
    pub fn new(info: AddressInfo, bank: Rc<MemoryBank>, endian: Endianness) -> Self {
        Self {
            info,
            bank,
            endian,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for BankRead<W> {
    fn name(&self) -> String {
        format!("bank '{}'", self.bank.name)
    }

    fn read(&self, addr: Offs, _mem_mask: W) -> W {
        match self.bank.backing() {
            Some(base) => {
                let off = self.info.byte_offset(addr);
                let bytes = base.borrow();
                match bytes.get(off..off + W::BYTES as usize) {
                    Some(slice) => W::from_u64(load_word(slice, self.endian)),
                    None => {
                        warn!("bank '{}': read past backing at {addr:#x}", self.bank.name);
                        W::all_ones()
                    }
                }
            }
            None => {
                warn!("bank '{}': read with no backing at {addr:#x}", self.bank.name);
                W::all_ones()
            }
        }
    }
}

/// Write leaf dispatching through a bank's currently selected entry.
pub struct BankWrite<W: BusWord> {
    info: AddressInfo,
    bank: Rc<MemoryBank>,
    endian: Endianness,
    _marker: PhantomData<W>,
}

impl<W: BusWord> BankWrite<W> {
    pub fn new(info: AddressInfo, bank: Rc<MemoryBank>, endian: Endianness) -> Self {
        Self {
            info,
            bank,
            endian,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for BankWrite<W> {
    fn name(&self) -> String {
        format!("bank '{}'", self.bank.name)
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        match self.bank.backing() {
            Some(base) => {
                let off = self.info.byte_offset(addr);
                let mut bytes = base.borrow_mut();
                match bytes.get_mut(off..off + W::BYTES as usize) {
                    Some(slice) => store_word(slice, self.endian, data.to_u64(), mem_mask.to_u64()),
                    None => warn!("bank '{}': write past backing at {addr:#x}", self.bank.name),
                }
            }
            None => warn!("bank '{}': write with no backing at {addr:#x}", self.bank.name),
        }
    }
}

// ---------------------------------------------------------------------------
// I/O ports

/// Named I/O port latch: reads return the latched value, writes update it.
pub struct IoPort {
    name: String,
    value: Cell<u64>,
}

impl IoPort {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Cell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> u64 {
        self.value.get()
    }

    pub fn set_value(&self, value: u64) {
        self.value.set(value);
    }
}

pub struct PortRead<W: BusWord> {
    port: Rc<IoPort>,
    _marker: PhantomData<W>,
}

impl<W: BusWord> PortRead<W> {
    pub fn new(port: Rc<IoPort>) -> Self {
        Self {
            port,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for PortRead<W> {
    fn name(&self) -> String {
        format!("port '{}'", self.port.name)
    }

    fn read(&self, _addr: Offs, _mem_mask: W) -> W {
        W::from_u64(self.port.value.get())
    }
}

pub struct PortWrite<W: BusWord> {
    port: Rc<IoPort>,
    _marker: PhantomData<W>,
}

impl<W: BusWord> PortWrite<W> {
    pub fn new(port: Rc<IoPort>) -> Self {
        Self {
            port,
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for PortWrite<W> {
    fn name(&self) -> String {
        format!("port '{}'", self.port.name)
    }

    fn write(&self, _addr: Offs, data: W, mem_mask: W) {
        let old = self.port.value.get();
        let mask = mem_mask.to_u64() & W::WIDTH.mask();
        self.port.value.set((old & !mask) | (data.to_u64() & mask));
    }
}

// ---------------------------------------------------------------------------
// delegates

/// Read callback: (native-word offset, mem_mask) -> data.
pub type ReadDelegate<W> = Rc<dyn Fn(Offs, W) -> W>;
/// Write callback: (native-word offset, data, mem_mask).
pub type WriteDelegate<W> = Rc<dyn Fn(Offs, W, W)>;

/// A symbolic read-handler reference, resolved to a live callback at
/// install time.  Deferred references let a machine description name a
/// handler before the object serving it exists; resolution failure is
/// surfaced by the installer with full range context.
pub enum ReadHandlerRef<W: BusWord> {
    Resolved {
        name: String,
        f: ReadDelegate<W>,
    },
    Deferred {
        name: String,
        resolve: Rc<dyn Fn() -> Option<ReadDelegate<W>>>,
    },
}

impl<W: BusWord> ReadHandlerRef<W> {
    pub fn new(name: impl Into<String>, f: impl Fn(Offs, W) -> W + 'static) -> Self {
        Self::Resolved {
            name: name.into(),
            f: Rc::new(f),
        }
    }

    pub fn deferred(
        name: impl Into<String>,
        resolve: impl Fn() -> Option<ReadDelegate<W>> + 'static,
    ) -> Self {
        Self::Deferred {
            name: name.into(),
            resolve: Rc::new(resolve),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Resolved { name, .. } | Self::Deferred { name, .. } => name,
        }
    }

    pub(crate) fn resolve(&self) -> Option<ReadDelegate<W>> {
        match self {
            Self::Resolved { f, .. } => Some(f.clone()),
            Self::Deferred { resolve, .. } => resolve(),
        }
    }
}

/// A symbolic write-handler reference; see [`ReadHandlerRef`].
pub enum WriteHandlerRef<W: BusWord> {
    Resolved {
        name: String,
        f: WriteDelegate<W>,
    },
    Deferred {
        name: String,
        resolve: Rc<dyn Fn() -> Option<WriteDelegate<W>>>,
    },
}

impl<W: BusWord> WriteHandlerRef<W> {
    pub fn new(name: impl Into<String>, f: impl Fn(Offs, W, W) + 'static) -> Self {
        Self::Resolved {
            name: name.into(),
            f: Rc::new(f),
        }
    }

    pub fn deferred(
        name: impl Into<String>,
        resolve: impl Fn() -> Option<WriteDelegate<W>> + 'static,
    ) -> Self {
        Self::Deferred {
            name: name.into(),
            resolve: Rc::new(resolve),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Resolved { name, .. } | Self::Deferred { name, .. } => name,
        }
    }

    pub(crate) fn resolve(&self) -> Option<WriteDelegate<W>> {
        match self {
            Self::Resolved { f, .. } => Some(f.clone()),
            Self::Deferred { resolve, .. } => resolve(),
        }
    }
}

/// Leaf invoking a read callback with native-word relative offsets.
pub struct DelegateRead<W: BusWord> {
    info: AddressInfo,
    word_shift: u32,
    name: String,
    f: ReadDelegate<W>,
}

impl<W: BusWord> DelegateRead<W> {
    pub fn new(info: AddressInfo, word_shift: u32, name: String, f: ReadDelegate<W>) -> Self {
        Self {
            info,
            word_shift,
            name,
            f,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for DelegateRead<W> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&self, addr: Offs, mem_mask: W) -> W {
        (self.f)(self.info.offset(addr) >> self.word_shift, mem_mask)
    }
}

/// Leaf invoking a write callback with native-word relative offsets.
pub struct DelegateWrite<W: BusWord> {
    info: AddressInfo,
    word_shift: u32,
    name: String,
    f: WriteDelegate<W>,
}

impl<W: BusWord> DelegateWrite<W> {
    pub fn new(info: AddressInfo, word_shift: u32, name: String, f: WriteDelegate<W>) -> Self {
        Self {
            info,
            word_shift,
            name,
            f,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for DelegateWrite<W> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        (self.f)(self.info.offset(addr) >> self.word_shift, data, mem_mask)
    }
}

// ---------------------------------------------------------------------------
// unmapped stubs

/// Stub serving unmapped ranges.  Reads return all ones; the noisy variant
/// logs every access so stray pointers in the emulated program surface.
pub struct UnmappedRead<W: BusWord> {
    quiet: bool,
    owner: String,
    _marker: PhantomData<W>,
}

impl<W: BusWord> UnmappedRead<W> {
    pub fn new(quiet: bool, owner: impl Into<String>) -> Self {
        Self {
            quiet,
            owner: owner.into(),
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for UnmappedRead<W> {
    fn name(&self) -> String {
        if self.quiet { "nop".into() } else { "unmapped".into() }
    }

    fn read(&self, addr: Offs, mem_mask: W) -> W {
        if !self.quiet {
            warn!("{}: unmapped read from {addr:#x} & {mem_mask:#x}", self.owner);
        }
        W::all_ones()
    }
}

pub struct UnmappedWrite<W: BusWord> {
    quiet: bool,
    owner: String,
    _marker: PhantomData<W>,
}

impl<W: BusWord> UnmappedWrite<W> {
    pub fn new(quiet: bool, owner: impl Into<String>) -> Self {
        Self {
            quiet,
            owner: owner.into(),
            _marker: PhantomData,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for UnmappedWrite<W> {
    fn name(&self) -> String {
        if self.quiet { "nop".into() } else { "unmapped".into() }
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        if !self.quiet {
            warn!(
                "{}: unmapped write of {data:#x} & {mem_mask:#x} to {addr:#x}",
                self.owner
            );
        }
    }
}

// ---------------------------------------------------------------------------
// width-mismatch aggregates

/// Type-erased narrow read callback operating on u64-normalized values.
pub type RawRead = Rc<dyn Fn(Offs, u64) -> u64>;
/// Type-erased narrow write callback.
pub type RawWrite = Rc<dyn Fn(Offs, u64, u64)>;

/// One narrow sub-handler covering a lane group of a wider bus word.
/// Each unit carries the address info of the install that created it, so
/// a later merge keeps the addressing its handler was given.
#[derive(Clone)]
pub struct SubUnitRead {
    pub info: AddressInfo,
    pub lane_mask: u64,
    pub dshift: u32,
    pub addr_offset: u32,
    pub stride: u32,
    pub width: DataWidth,
    pub name: String,
    pub f: RawRead,
}

impl SubUnitRead {
    fn sub_address(&self, addr: Offs, word_shift: u32) -> Offs {
        (self.info.offset(addr) >> word_shift) * self.stride + self.addr_offset
    }
}

/// Aggregate read leaf assembling a full bus word from narrow sub-handlers.
/// Lanes no sub-handler covers read as unmapped fill.
pub struct SubUnitsRead<W: BusWord> {
    word_shift: u32,
    units: Vec<SubUnitRead>,
    _marker: PhantomData<W>,
}

impl<W: BusWord> SubUnitsRead<W> {
    pub fn new(word_shift: u32, units: Vec<SubUnitRead>) -> Self {
        Self {
            word_shift,
            units,
            _marker: PhantomData,
        }
    }

    pub fn units(&self) -> &[SubUnitRead] {
        &self.units
    }
}

impl<W: BusWord> ReadHandler<W> for SubUnitsRead<W> {
    fn name(&self) -> String {
        let names: Vec<_> = self.units.iter().map(|u| u.name.as_str()).collect();
        format!("units({})", names.join(","))
    }

    fn read(&self, addr: Offs, mem_mask: W) -> W {
        let mm = mem_mask.to_u64();
        let mut v = u64::MAX;
        for u in &self.units {
            if mm & u.lane_mask != 0 {
                let sub_mask = (mm >> u.dshift) & u.width.mask();
                let r = (u.f)(u.sub_address(addr, self.word_shift), sub_mask) & u.width.mask();
                v = (v & !u.lane_mask) | (r << u.dshift);
            }
        }
        W::from_u64(v)
    }

    fn subunits(&self) -> Option<&SubUnitsRead<W>> {
        Some(self)
    }
}

/// One narrow write sub-handler; see [`SubUnitRead`].
#[derive(Clone)]
pub struct SubUnitWrite {
    pub info: AddressInfo,
    pub lane_mask: u64,
    pub dshift: u32,
    pub addr_offset: u32,
    pub stride: u32,
    pub width: DataWidth,
    pub name: String,
    pub f: RawWrite,
}

impl SubUnitWrite {
    fn sub_address(&self, addr: Offs, word_shift: u32) -> Offs {
        (self.info.offset(addr) >> word_shift) * self.stride + self.addr_offset
    }
}

/// Aggregate write leaf scattering a full bus word across narrow
/// sub-handlers.
pub struct SubUnitsWrite<W: BusWord> {
    word_shift: u32,
    units: Vec<SubUnitWrite>,
    _marker: PhantomData<W>,
}

impl<W: BusWord> SubUnitsWrite<W> {
    pub fn new(word_shift: u32, units: Vec<SubUnitWrite>) -> Self {
        Self {
            word_shift,
            units,
            _marker: PhantomData,
        }
    }

    pub fn units(&self) -> &[SubUnitWrite] {
        &self.units
    }
}

impl<W: BusWord> WriteHandler<W> for SubUnitsWrite<W> {
    fn name(&self) -> String {
        let names: Vec<_> = self.units.iter().map(|u| u.name.as_str()).collect();
        format!("units({})", names.join(","))
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        let d = data.to_u64();
        let mm = mem_mask.to_u64();
        for u in &self.units {
            if mm & u.lane_mask != 0 {
                (u.f)(
                    u.sub_address(addr, self.word_shift),
                    (d >> u.dshift) & u.width.mask(),
                    (mm >> u.dshift) & u.width.mask(),
                );
            }
        }
    }

    fn subunits(&self) -> Option<&SubUnitsWrite<W>> {
        Some(self)
    }
}

// ---------------------------------------------------------------------------
// passthrough taps

/// Handle shared by a group of passthrough taps so they can be torn down
/// together.  Removal deactivates the callbacks; the shadowed handlers keep
/// serving traffic untouched.
#[derive(Clone)]
pub struct TapGroup {
    inner: Rc<TapGroupInner>,
}

struct TapGroupInner {
    active: Cell<bool>,
}

impl TapGroup {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(TapGroupInner {
                active: Cell::new(true),
            }),
        }
    }

    pub fn remove(&self) {
        self.inner.active.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }
}

/// Tap callback: (native-word offset, in-flight data, mem_mask).  The data
/// reference is mutable, so a tap can also rewrite in-flight values.
pub type TapFn<W> = Rc<RefCell<dyn FnMut(Offs, &mut W, W)>>;

/// Observer in front of a read handler.
pub struct TapRead<W: BusWord> {
    name: String,
    info: AddressInfo,
    word_shift: u32,
    group: TapGroup,
    cb: TapFn<W>,
    next: Rc<dyn ReadHandler<W>>,
}

impl<W: BusWord> TapRead<W> {
    pub fn new(
        name: String,
        info: AddressInfo,
        word_shift: u32,
        group: TapGroup,
        cb: TapFn<W>,
        next: Rc<dyn ReadHandler<W>>,
    ) -> Self {
        Self {
            name,
            info,
            word_shift,
            group,
            cb,
            next,
        }
    }
}

impl<W: BusWord> ReadHandler<W> for TapRead<W> {
    fn name(&self) -> String {
        format!("tap '{}' on {}", self.name, self.next.name())
    }

    fn read(&self, addr: Offs, mem_mask: W) -> W {
        let mut data = self.next.read(addr, mem_mask);
        if self.group.is_active() {
            (self.cb.borrow_mut())(self.info.offset(addr) >> self.word_shift, &mut data, mem_mask);
        }
        data
    }
}

/// Observer in front of a write handler.
pub struct TapWrite<W: BusWord> {
    name: String,
    info: AddressInfo,
    word_shift: u32,
    group: TapGroup,
    cb: TapFn<W>,
    next: Rc<dyn WriteHandler<W>>,
}

impl<W: BusWord> TapWrite<W> {
    pub fn new(
        name: String,
        info: AddressInfo,
        word_shift: u32,
        group: TapGroup,
        cb: TapFn<W>,
        next: Rc<dyn WriteHandler<W>>,
    ) -> Self {
        Self {
            name,
            info,
            word_shift,
            group,
            cb,
            next,
        }
    }
}

impl<W: BusWord> WriteHandler<W> for TapWrite<W> {
    fn name(&self) -> String {
        format!("tap '{}' on {}", self.name, self.next.name())
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        let mut data = data;
        if self.group.is_active() {
            (self.cb.borrow_mut())(self.info.offset(addr) >> self.word_shift, &mut data, mem_mask);
        }
        self.next.write(addr, data, mem_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(start: Offs, mask: Offs) -> AddressInfo {
        AddressInfo::new(start, mask, 0)
    }

    #[test]
    fn memory_read_little_and_big() {
        let base = shared_bytes(4);
        base.borrow_mut().copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);

        let le: MemoryRead<u16> = MemoryRead::new(info(0, 0x3), base.clone(), 0, Endianness::Little);
        assert_eq!(le.read(0, 0xffff), 0x2211);
        assert_eq!(le.read(2, 0xffff), 0x4433);

        let be: MemoryRead<u16> = MemoryRead::new(info(0, 0x3), base, 0, Endianness::Big);
        assert_eq!(be.read(0, 0xffff), 0x1122);
    }

    #[test]
    fn memory_write_respects_mem_mask() {
        let base = shared_bytes(2);
        let w: MemoryWrite<u16> = MemoryWrite::new(info(0, 0x1), base.clone(), 0, Endianness::Little);
        w.write(0, 0xaabb, 0x00ff);
        assert_eq!(&*base.borrow(), &[0xbb, 0x00]);
        w.write(0, 0xccdd, 0xff00);
        assert_eq!(&*base.borrow(), &[0xbb, 0xcc]);
    }

    #[test]
    fn mirror_mask_folds_addresses() {
        let base = shared_bytes(2);
        base.borrow_mut().copy_from_slice(&[0x5a, 0xa5]);
        // range 0x000-0x001 mirrored at 0x100: mask keeps only the low bit
        let r: MemoryRead<u8> = MemoryRead::new(info(0, 0x1), base, 0, Endianness::Little);
        assert_eq!(r.read(0x000, 0xff), 0x5a);
        assert_eq!(r.read(0x100, 0xff), 0x5a);
        assert_eq!(r.read(0x101, 0xff), 0xa5);
    }

    #[test]
    fn bank_switching() {
        let bank = Rc::new(MemoryBank::new("cart"));
        let lo = shared_bytes(2);
        let hi = shared_bytes(2);
        lo.borrow_mut().copy_from_slice(&[0x01, 0x02]);
        hi.borrow_mut().copy_from_slice(&[0x81, 0x82]);
        bank.configure_entry(0, lo);
        bank.configure_entry(1, hi);

        let r: BankRead<u8> = BankRead::new(info(0, 0x1), bank.clone(), Endianness::Little);
        assert_eq!(r.read(0, 0xff), 0x01);
        bank.set_entry(1);
        assert_eq!(r.read(0, 0xff), 0x81);
        assert_eq!(r.read(1, 0xff), 0x82);
    }

    #[test]
    fn port_latch_round_trip() {
        let port = Rc::new(IoPort::new("dsw"));
        let r: PortRead<u16> = PortRead::new(port.clone());
        let w: PortWrite<u16> = PortWrite::new(port.clone());
        w.write(0, 0x1234, 0xffff);
        assert_eq!(r.read(0, 0xffff), 0x1234);
        w.write(0, 0x00ff, 0x00ff);
        assert_eq!(port.value(), 0x12ff);
    }

    #[test]
    fn tap_observes_and_can_rewrite() {
        let base = shared_bytes(2);
        base.borrow_mut().copy_from_slice(&[0x34, 0x12]);
        let next: Rc<dyn ReadHandler<u16>> =
            Rc::new(MemoryRead::new(info(0, 0x1), base, 0, Endianness::Little));
        let group = TapGroup::new();
        let cb: TapFn<u16> = Rc::new(RefCell::new(|_o: Offs, d: &mut u16, _m: u16| {
            *d |= 0x8000;
        }));
        let tap = TapRead::new("bp".into(), info(0, 0x1), 1, group.clone(), cb, next);
        assert_eq!(tap.read(0, 0xffff), 0x9234);
        group.remove();
        assert_eq!(tap.read(0, 0xffff), 0x1234);
    }

    #[test]
    fn subunits_assemble_word() {
        // two 8-bit chips composing a 16-bit little-endian word
        let lo: RawRead = Rc::new(|_o, _m| 0xaa);
        let hi: RawRead = Rc::new(|_o, _m| 0xbb);
        let units = vec![
            SubUnitRead {
                info: info(0, 0xff),
                lane_mask: 0x00ff,
                dshift: 0,
                addr_offset: 0,
                stride: 1,
                width: DataWidth::W8,
                name: "lo".into(),
                f: lo,
            },
            SubUnitRead {
                info: info(0, 0xff),
                lane_mask: 0xff00,
                dshift: 8,
                addr_offset: 0,
                stride: 1,
                width: DataWidth::W8,
                name: "hi".into(),
                f: hi,
            },
        ];
        let h: SubUnitsRead<u16> = SubUnitsRead::new(1, units);
        assert_eq!(h.read(0, 0xffff), 0xbbaa);
        // lane not selected by mem_mask keeps the unmapped fill
        assert_eq!(h.read(0, 0x00ff) & 0x00ff, 0x00aa);
    }

    #[test]
    fn subunits_address_from_their_own_base() {
        // units installed over different ranges keep their own word numbering
        let lo_offs: Rc<Cell<Offs>> = Rc::new(Cell::new(Offs::MAX));
        let hi_offs: Rc<Cell<Offs>> = Rc::new(Cell::new(Offs::MAX));
        let (l, h) = (lo_offs.clone(), hi_offs.clone());
        let units = vec![
            SubUnitRead {
                info: info(0x00, 0xff),
                lane_mask: 0x00ff,
                dshift: 0,
                addr_offset: 0,
                stride: 1,
                width: DataWidth::W8,
                name: "lo".into(),
                f: Rc::new(move |o, _m| {
                    l.set(o);
                    0xaa
                }),
            },
            SubUnitRead {
                info: info(0x10, 0x0f),
                lane_mask: 0xff00,
                dshift: 8,
                addr_offset: 0,
                stride: 1,
                width: DataWidth::W8,
                name: "hi".into(),
                f: Rc::new(move |o, _m| {
                    h.set(o);
                    0xbb
                }),
            },
        ];
        let agg: SubUnitsRead<u16> = SubUnitsRead::new(1, units);
        assert_eq!(agg.read(0x10, 0xffff), 0xbbaa);
        assert_eq!(lo_offs.get(), 0x8);
        assert_eq!(hi_offs.get(), 0x0);
    }
}
