// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Configuration errors raised while building address maps.
//!
//! Every variant reflects a static authoring defect in the emulated
//! machine's memory description, discovered once at setup time.  There are
//! no transient or retryable kinds; the caller at the top of machine
//! construction decides whether to abort the process or surface the error
//! as a structured failure.

use thiserror::Error;

use crate::config::Offs;

/// A mistake in the declarative memory configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{width}-bit bus with address shift {shift} is not a supported combination")]
    UnsupportedShape { width: u32, shift: i8 },

    #[error("address width {0} is outside the supported 1-32 bit range")]
    BadAddressWidth(u32),

    #[error("space '{space}' was built for a {expected}-bit bus, not {got}-bit")]
    SpaceWidthMismatch {
        space: String,
        expected: u32,
        got: u32,
    },

    #[error("{function}: invalid range {start:#x}-{end:#x}")]
    EmptyRange {
        function: &'static str,
        start: Offs,
        end: Offs,
    },

    #[error("{function}: range {start:#x}-{end:#x} exceeds the {bits}-bit address space")]
    OutOfSpace {
        function: &'static str,
        start: Offs,
        end: Offs,
        bits: u32,
    },

    #[error("{function}: range {start:#x}-{end:#x} is misaligned, bus granularity is {step:#x}")]
    Misaligned {
        function: &'static str,
        start: Offs,
        end: Offs,
        step: u32,
    },

    #[error("{function}: mask {mask:#x} lies outside the range {start:#x}-{end:#x}")]
    MaskOutsideRange {
        function: &'static str,
        mask: Offs,
        start: Offs,
        end: Offs,
    },

    #[error("{function}: mirror {mirror:#x} touches an address bit used by the range {start:#x}-{end:#x}")]
    BadMirror {
        function: &'static str,
        mirror: Offs,
        start: Offs,
        end: Offs,
    },

    #[error("{function}: select {select:#x} touches an address bit used by the range {start:#x}-{end:#x}")]
    BadSelect {
        function: &'static str,
        select: Offs,
        start: Offs,
        end: Offs,
    },

    #[error("{function}: mirror {mirror:#x} and select {select:#x} overlap")]
    MirrorSelectOverlap {
        function: &'static str,
        mirror: Offs,
        select: Offs,
    },

    #[error("{function}: unit mask {unitmask:#x} does not select whole {bits}-bit lanes")]
    BadUnitMask {
        function: &'static str,
        unitmask: u64,
        bits: u32,
    },

    #[error("{function}: chip select width {cswidth} is invalid for a {access}-bit handler on a {bus}-bit bus")]
    BadCsWidth {
        function: &'static str,
        cswidth: u32,
        access: u32,
        bus: u32,
    },

    #[error(
        "{function}: the range {start:#x}-{end:#x} mirror {mirror:#x} select {select:#x} exceeds \
         the view window boundaries {window_start:#x}-{window_end:#x}"
    )]
    OutsideWindow {
        function: &'static str,
        start: Offs,
        end: Offs,
        mirror: Offs,
        select: Offs,
        window_start: Offs,
        window_end: Offs,
    },

    #[error("{function}: cannot install a {handler_bits}-bit handler on a {bus_bits}-bit bus")]
    HandlerTooWide {
        function: &'static str,
        handler_bits: u32,
        bus_bits: u32,
    },

    #[error(
        "{function}: handler '{name}' failed to resolve for range {start:#x}-{end:#x} \
         mask {mask:#x} mirror {mirror:#x} select {select:#x} umask {unitmask:#x}"
    )]
    UnresolvedHandler {
        function: &'static str,
        name: String,
        start: Offs,
        end: Offs,
        mask: Offs,
        mirror: Offs,
        select: Offs,
        unitmask: u64,
    },

    #[error("{function}: backing for {start:#x}-{end:#x} holds {have:#x} bytes, {need:#x} required")]
    BackingTooSmall {
        function: &'static str,
        start: Offs,
        end: Offs,
        need: usize,
        have: usize,
    },

    #[error("a view must be placed in a map or a space before its slots can be configured")]
    ViewNotPlaced,

    #[error("view '{name}' can be present in only one address map")]
    ViewRebound { name: String },

    #[error("view '{name}' can be installed only once")]
    ViewReinstalled { name: String },

    #[error("view '{name}' must be installed at its configured range")]
    ViewRangeMismatch { name: String },

    #[error("view '{name}' was configured for a different bus shape than the installing space")]
    ViewConfigMismatch { name: String },

    #[error("view '{view}': select of unknown slot {slot}")]
    UnknownSlot { view: String, slot: usize },

    #[error("attempted to map non-existent port '{tag}' in {space}")]
    UnknownPort { tag: String, space: String },

    #[error("{space} map entry {start:#x}-{end:#x} references nonexistent region '{tag}'")]
    UnknownRegion {
        space: String,
        start: Offs,
        end: Offs,
        tag: String,
    },

    #[error("{space} map entry {start:#x}-{end:#x} extends beyond region '{tag}' size ({size:#x})")]
    RegionTooSmall {
        space: String,
        start: Offs,
        end: Offs,
        tag: String,
        size: usize,
    },

    #[error("{space} map entry {start:#x}-{end:#x} has both region() and share()")]
    RegionAndShare {
        space: String,
        start: Offs,
        end: Offs,
    },

    #[error("share '{tag}' {message}")]
    ShareMismatch { tag: String, message: String },

    #[error("{space} map entry {start:#x}-{end:#x} is a ROM with no region, share or default region to bind to")]
    UnboundRom {
        space: String,
        start: Offs,
        end: Offs,
    },
}
