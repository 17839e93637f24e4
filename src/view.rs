// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Switchable view windows.
//!
//! A view covers a fixed window of an address space and holds any number
//! of numbered slots, each with its own pair of dispatch trees.  Exactly
//! one slot (or none) is active at a time; switching is a single integer
//! write, effective on the very next access through the window.  Slot
//! configurations persist while inactive, so reselecting a slot restores
//! exactly what was installed in it, and a disabled view serves the
//! window as unmapped.
//!
//! A view can be placed in only one space, at only one range; it learns
//! the bus shape at placement time unless preconfigured, and slots can be
//! populated both before and after placement.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use log::trace;

use crate::config::{Offs, Side, SpaceConfig};
use crate::dispatch::DispatchTree;
use crate::error::ConfigError;
use crate::handler::{BusWord, ReadHandler, UnmappedRead, UnmappedWrite, WriteHandler};
use crate::installer::{InstallCtx, SharedReadTree, SharedWriteTree, SpaceRef};
use crate::map::AddressMap;

struct ViewCore<W: BusWord> {
    name: String,
    config: RefCell<Option<SpaceConfig>>,
    window: Cell<Option<(Offs, Offs)>>,
    binding: RefCell<Option<SpaceRef>>,
    leaves: RefCell<Option<(Rc<dyn ReadHandler<W>>, Rc<dyn WriteHandler<W>>)>>,
    context: RefCell<String>,
    /// Internal index into `entries` of the active slot.
    active: Cell<Option<usize>>,
    /// External id of the active slot.
    cur_slot: Cell<Option<usize>>,
    slot_map: RefCell<BTreeMap<usize, usize>>,
    entries: RefCell<Vec<ViewEntry<W>>>,
}

impl<W: BusWord> ViewCore<W> {
    fn invalidate(&self) {
        if let Some(binding) = &*self.binding.borrow() {
            binding.sink().invalidate(Side::RW);
        }
    }
}

/// A reconfigurable window of an address space.  Clones share identity.
pub struct MemoryView<W: BusWord> {
    core: Rc<ViewCore<W>>,
}

impl<W: BusWord> Clone for MemoryView<W> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<W: BusWord> MemoryView<W> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: Rc::new(ViewCore {
                name: name.into(),
                config: RefCell::new(None),
                window: Cell::new(None),
                binding: RefCell::new(None),
                leaves: RefCell::new(None),
                context: RefCell::new(String::new()),
                active: Cell::new(None),
                cur_slot: Cell::new(None),
                slot_map: RefCell::new(BTreeMap::new()),
                entries: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Preconfigure window and bus shape ahead of placement, so slots
    /// can be populated offline.  Placement later re-checks both.
    pub fn bind_to_window(
        &self,
        start: Offs,
        end: Offs,
        config: &SpaceConfig,
    ) -> Result<(), ConfigError> {
        if self.core.config.borrow().is_some() {
            return Err(ConfigError::ViewRebound {
                name: self.core.name.clone(),
            });
        }
        *self.core.config.borrow_mut() = Some(*config);
        self.core.window.set(Some((start, end)));
        Ok(())
    }

    /// Get or create the slot with external id `slot`.  Repeated calls
    /// hand back the same underlying slot.
    pub fn entry(&self, slot: usize) -> Result<ViewEntry<W>, ConfigError> {
        if let Some(&idx) = self.core.slot_map.borrow().get(&slot) {
            return Ok(self.core.entries.borrow()[idx].clone());
        }
        let config = self
            .core
            .config
            .borrow()
            .ok_or(ConfigError::ViewNotPlaced)?;
        let (ws, we) = self.core.window.get().ok_or(ConfigError::ViewNotPlaced)?;
        let span = ws ^ we;
        let high_bits = 32 - span.leading_zeros();
        let low_bits = config.low_bits();
        let owner = format!("view '{}'[{slot}]", self.core.name);
        let rdef: Rc<dyn ReadHandler<W>> = Rc::new(UnmappedRead::new(false, owner.clone()));
        let wdef: Rc<dyn WriteHandler<W>> = Rc::new(UnmappedWrite::new(false, owner));
        let entry = ViewEntry {
            core: Rc::new(EntryCore {
                view: Rc::downgrade(&self.core),
                slot,
                map: RefCell::new(AddressMap::new()),
                read_tree: Rc::new(RefCell::new(DispatchTree::new(low_bits, high_bits, rdef))),
                write_tree: Rc::new(RefCell::new(DispatchTree::new(low_bits, high_bits, wdef))),
            }),
        };
        let mut entries = self.core.entries.borrow_mut();
        self.core
            .slot_map
            .borrow_mut()
            .insert(slot, entries.len());
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Activate a slot.  Unregistered ids are a configuration error; the
    /// previous selection stays in that case.
    pub fn select(&self, slot: usize) -> Result<(), ConfigError> {
        let idx = *self
            .core
            .slot_map
            .borrow()
            .get(&slot)
            .ok_or_else(|| ConfigError::UnknownSlot {
                view: self.core.name.clone(),
                slot,
            })?;
        trace!("view '{}': select slot {slot}", self.core.name);
        self.core.active.set(Some(idx));
        self.core.cur_slot.set(Some(slot));
        self.core.invalidate();
        Ok(())
    }

    /// Deactivate the view; the window reads as unmapped until the next
    /// select.  The slot configurations are untouched.
    pub fn disable(&self) {
        trace!("view '{}': disable", self.core.name);
        self.core.active.set(None);
        self.core.cur_slot.set(None);
        self.core.invalidate();
    }

    /// External id of the active slot, `None` when disabled.
    pub fn current(&self) -> Option<usize> {
        self.core.cur_slot.get()
    }

    /// Registered slot ids in ascending order.
    pub fn slots(&self) -> Vec<usize> {
        self.core.slot_map.borrow().keys().copied().collect()
    }

    /// Create (or revalidate) the pair of space-side leaves serving the
    /// window.  Called by the installer when the view is placed.
    pub(crate) fn make_handlers(
        &self,
        space: &SpaceRef,
        start: Offs,
        end: Offs,
    ) -> Result<(Rc<dyn ReadHandler<W>>, Rc<dyn WriteHandler<W>>), ConfigError> {
        if let Some(bound) = &*self.core.binding.borrow() {
            // reinstalling at the same place in the same space is
            // idempotent, anywhere else is an error
            if bound.same_space(space) && self.core.window.get() == Some((start, end)) {
                if let Some(leaves) = &*self.core.leaves.borrow() {
                    return Ok(leaves.clone());
                }
            }
            return Err(ConfigError::ViewReinstalled {
                name: self.core.name.clone(),
            });
        }
        if let Some(config) = &*self.core.config.borrow() {
            if self.core.window.get() != Some((start, end)) {
                return Err(ConfigError::ViewRangeMismatch {
                    name: self.core.name.clone(),
                });
            }
            if config != space.config() {
                return Err(ConfigError::ViewConfigMismatch {
                    name: self.core.name.clone(),
                });
            }
        } else {
            *self.core.config.borrow_mut() = Some(*space.config());
            self.core.window.set(Some((start, end)));
        }
        *self.core.binding.borrow_mut() = Some(space.clone());
        let owner = format!("view '{}'", self.core.name);
        let rleaf: Rc<dyn ReadHandler<W>> = Rc::new(ViewReadLeaf {
            name: owner.clone(),
            core: Rc::downgrade(&self.core),
            unmap: Rc::new(UnmappedRead::new(false, owner.clone())),
        });
        let wleaf: Rc<dyn WriteHandler<W>> = Rc::new(ViewWriteLeaf {
            name: owner.clone(),
            core: Rc::downgrade(&self.core),
            unmap: Rc::new(UnmappedWrite::new(false, owner)),
        });
        *self.core.leaves.borrow_mut() = Some((rleaf.clone(), wleaf.clone()));
        Ok((rleaf, wleaf))
    }

    /// Populate every already-configured slot from its map, under the
    /// naming context of the installing space or parent view.
    pub(crate) fn make_subdispatch(&self, context: String) -> Result<(), ConfigError> {
        *self.core.context.borrow_mut() = context;
        let entries: Vec<ViewEntry<W>> = self.core.entries.borrow().clone();
        for entry in entries {
            entry.populate_from_map()?;
        }
        Ok(())
    }
}

struct EntryCore<W: BusWord> {
    view: Weak<ViewCore<W>>,
    slot: usize,
    map: RefCell<AddressMap<W>>,
    read_tree: SharedReadTree<W>,
    write_tree: SharedWriteTree<W>,
}

/// Handle on one slot of a view.  Clones are identity-equal and mutate
/// the same slot.
pub struct ViewEntry<W: BusWord> {
    core: Rc<EntryCore<W>>,
}

impl<W: BusWord> Clone for ViewEntry<W> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<W: BusWord> PartialEq for ViewEntry<W> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<W: BusWord> ViewEntry<W> {
    pub fn slot(&self) -> usize {
        self.core.slot
    }

    /// Edit the slot's declarative map.  Takes effect on the next
    /// population (placement, or an explicit [`Self::populate_from_map`]).
    pub fn with_map(&self, f: impl FnOnce(&mut AddressMap<W>)) {
        f(&mut self.core.map.borrow_mut());
    }

    /// Resolve and install the slot's map into its trees.  Requires the
    /// view to be placed.
    pub fn populate_from_map(&self) -> Result<(), ConfigError> {
        let ctx = self.installer()?;
        ctx.populate_from_map(&mut self.core.map.borrow_mut())
    }

    /// Direct installation context for this slot: same surface as a
    /// space, restricted to the view window.
    pub fn installer(&self) -> Result<InstallCtx<W>, ConfigError> {
        let view = self.core.view.upgrade().ok_or(ConfigError::ViewNotPlaced)?;
        let binding = view
            .binding
            .borrow()
            .clone()
            .ok_or(ConfigError::ViewNotPlaced)?;
        let window = view.window.get().ok_or(ConfigError::ViewNotPlaced)?;
        let key = format!(
            "{}{}[{}].",
            view.context.borrow(),
            view.name,
            self.core.slot
        );
        Ok(InstallCtx {
            space: binding,
            window: Some(window),
            key,
            read_tree: self.core.read_tree.clone(),
            write_tree: self.core.write_tree.clone(),
        })
    }
}

// The leaves hold the view weakly: the core caches its leaf pair, so a
// strong reference here would form a cycle and keep a dropped view (and
// every handler in its slots) alive for the life of the space.
struct ViewReadLeaf<W: BusWord> {
    name: String,
    core: Weak<ViewCore<W>>,
    unmap: Rc<dyn ReadHandler<W>>,
}

impl<W: BusWord> ReadHandler<W> for ViewReadLeaf<W> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&self, addr: Offs, mem_mask: W) -> W {
        // clone the leaf out before calling it: the handler may switch
        // the view under us
        let h = match self.core.upgrade() {
            Some(core) => match core.active.get() {
                Some(idx) => {
                    let entries = core.entries.borrow();
                    entries[idx].core.read_tree.borrow().lookup(addr).clone()
                }
                None => self.unmap.clone(),
            },
            None => self.unmap.clone(),
        };
        h.read(addr, mem_mask)
    }
}

struct ViewWriteLeaf<W: BusWord> {
    name: String,
    core: Weak<ViewCore<W>>,
    unmap: Rc<dyn WriteHandler<W>>,
}

impl<W: BusWord> WriteHandler<W> for ViewWriteLeaf<W> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn write(&self, addr: Offs, data: W, mem_mask: W) {
        let h = match self.core.upgrade() {
            Some(core) => match core.active.get() {
                Some(idx) => {
                    let entries = core.entries.borrow();
                    entries[idx].core.write_tree.borrow().lookup(addr).clone()
                }
                None => self.unmap.clone(),
            },
            None => self.unmap.clone(),
        };
        h.write(addr, data, mem_mask)
    }
}
