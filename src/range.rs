// Copyright (C) 2025 the mapbus developers
// mapbus - reconfigurable memory dispatch for emulated buses
// This file is part of mapbus.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Range validation and normalization ahead of every install.
//!
//! An install request arrives as (start, end, mask, mirror, select,
//! unitmask, cswidth).  Validation rejects every inconsistent combination
//! with the requesting function named in the error; normalization folds
//! select bits into the mirror and handler mask, fills in default masks,
//! and merges low contiguous mirror bits into the range itself so the
//! dispatch tree populates one wider range instead of many small images.
//! Nothing is mutated on failure, so a rejected install leaves the space
//! untouched.

use crate::config::{DataWidth, Offs, SpaceConfig};
use crate::error::ConfigError;

/// Result of normalizing a (start, end, mirror) triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalizedRange {
    pub start: Offs,
    pub end: Offs,
    /// Folding mask handed to the installed handler.
    pub mask: Offs,
    pub mirror: Offs,
}

/// Result of normalizing a full install request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalizedAll {
    pub range: NormalizedRange,
    pub unitmask: u64,
    pub cswidth_bits: u32,
}

/// Smallest all-ones mask covering `v`.
fn round_up_mask(v: Offs) -> Offs {
    if v == 0 {
        0
    } else {
        Offs::MAX >> v.leading_zeros()
    }
}

/// Bounds and alignment checks common to every ranged operation.
pub fn check_address(
    function: &'static str,
    cfg: &SpaceConfig,
    start: Offs,
    end: Offs,
) -> Result<(), ConfigError> {
    if end < start {
        return Err(ConfigError::EmptyRange { function, start, end });
    }
    if end > cfg.addr_mask() {
        return Err(ConfigError::OutOfSpace {
            function,
            start,
            end,
            bits: cfg.addr_width(),
        });
    }
    let nm = cfg.native_mask();
    if start & nm != 0 || end & nm != nm {
        return Err(ConfigError::Misaligned {
            function,
            start,
            end,
            step: cfg.native_step(),
        });
    }
    Ok(())
}

fn collapse_mirror(start: Offs, end: &mut Offs, mirror: &mut Offs, changing: &mut Offs) {
    // Low mirror bits contiguous with the range widen the range instead;
    // the handler mask keeps the pre-merge changing bits so offsets still
    // fold onto the narrow range.
    if *mirror != 0 && start & *changing == 0 && !*end & *changing == 0 {
        loop {
            let bit = *changing + 1;
            if bit == 0 || *mirror & bit == 0 {
                break;
            }
            *mirror &= !bit;
            *end |= bit;
            *changing |= bit;
        }
    }
}

fn check_window(
    function: &'static str,
    window: Option<(Offs, Offs)>,
    start: Offs,
    end: Offs,
    mirror: Offs,
    select: Offs,
) -> Result<(), ConfigError> {
    if let Some((ws, we)) = window {
        if start < ws || (end | mirror | select) > we {
            return Err(ConfigError::OutsideWindow {
                function,
                start,
                end,
                mirror,
                select,
                window_start: ws,
                window_end: we,
            });
        }
    }
    Ok(())
}

/// Validate and normalize a (start, end, mirror) triple, the reduced form
/// used by RAM, bank, port, view and tap installs.
pub fn check_optimize_mirror(
    function: &'static str,
    cfg: &SpaceConfig,
    window: Option<(Offs, Offs)>,
    start: Offs,
    mut end: Offs,
    mut mirror: Offs,
) -> Result<NormalizedRange, ConfigError> {
    check_address(function, cfg, start, end)?;

    let set_bits = start | end;
    let mut changing = round_up_mask(start ^ end);
    if mirror & !cfg.addr_mask() != 0 || mirror & changing != 0 || mirror & set_bits != 0 {
        return Err(ConfigError::BadMirror {
            function,
            mirror,
            start,
            end,
        });
    }

    let mask = changing;
    collapse_mirror(start, &mut end, &mut mirror, &mut changing);
    check_window(function, window, start, end, mirror, 0)?;

    Ok(NormalizedRange {
        start,
        end,
        mask,
        mirror,
    })
}

/// Validate and normalize a full install request, including the explicit
/// handler mask, select bits, unit mask and chip-select width.
#[allow(clippy::too_many_arguments)]
pub fn check_optimize_all(
    function: &'static str,
    cfg: &SpaceConfig,
    access: DataWidth,
    window: Option<(Offs, Offs)>,
    start: Offs,
    mut end: Offs,
    mask: Offs,
    mut mirror: Offs,
    select: Offs,
    unitmask: u64,
    cswidth_bits: u32,
) -> Result<NormalizedAll, ConfigError> {
    check_address(function, cfg, start, end)?;

    let set_bits = start | end;
    let mut changing = round_up_mask(start ^ end);
    if mask & !changing != 0 {
        return Err(ConfigError::MaskOutsideRange {
            function,
            mask,
            start,
            end,
        });
    }
    if mirror & !cfg.addr_mask() != 0 || mirror & changing != 0 || mirror & set_bits != 0 {
        return Err(ConfigError::BadMirror {
            function,
            mirror,
            start,
            end,
        });
    }
    if select & !cfg.addr_mask() != 0 || select & changing != 0 || select & set_bits != 0 {
        return Err(ConfigError::BadSelect {
            function,
            select,
            start,
            end,
        });
    }
    if mirror & select != 0 {
        return Err(ConfigError::MirrorSelectOverlap {
            function,
            mirror,
            select,
        });
    }

    // unit mask defaults to the whole bus and must select whole lanes
    let nunitmask = if unitmask == 0 {
        cfg.data_width().mask()
    } else {
        unitmask & cfg.data_width().mask()
    };
    let abits = access.bits();
    if abits < cfg.data_width().bits() {
        let acc_mask = access.mask();
        let lanes = cfg.data_width().bytes() / access.bytes();
        for j in 0..lanes {
            let lane = acc_mask << (abits * j);
            let sel = nunitmask & lane;
            if sel != 0 && sel != lane {
                return Err(ConfigError::BadUnitMask {
                    function,
                    unitmask: nunitmask,
                    bits: abits,
                });
            }
        }
    }

    // chip-select width defaults to the access width, must be a multiple
    // of it and divide the bus width
    let ncs = if cswidth_bits == 0 { abits } else { cswidth_bits };
    if ncs < abits || ncs > cfg.data_width().bits() || ncs % abits != 0 {
        return Err(ConfigError::BadCsWidth {
            function,
            cswidth: ncs,
            access: abits,
            bus: cfg.data_width().bits(),
        });
    }

    // select bits reach the handler as extra offset bits, so they join
    // both the folding mask and the mirror expansion
    let base_mask = if mask != 0 { mask } else { changing };
    let nmask = base_mask | select;
    mirror |= select;

    collapse_mirror(start, &mut end, &mut mirror, &mut changing);
    check_window(function, window, start, end, mirror, select)?;

    Ok(NormalizedAll {
        range: NormalizedRange {
            start,
            end,
            mask: nmask,
            mirror,
        },
        unitmask: nunitmask,
        cswidth_bits: ncs,
    })
}
