//! Process-wide debug flags.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugFlag {
    /// Stop updating the displayed tile sets.
    FreezeTiles = 0,
    /// Colorize proxy tiles in the renderer.
    ProxyColors = 1,
    /// Draw tile boundaries.
    TileBounds = 2,
    /// Draw tile ids and states.
    TileInfos = 3,
    /// Draw label debug info.
    Labels = 4,
    /// Draw every label, ignoring collisions.
    DrawAllLabels = 5,
    /// Draw frame timing stats.
    FrameStats = 6,
    /// Show the selection buffer.
    SelectionBuffer = 7,
}

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

pub fn set_debug_flag(flag: DebugFlag, on: bool) {
    let bit = 1u32 << flag as u32;
    if on {
        DEBUG_FLAGS.fetch_or(bit, Ordering::Relaxed);
    } else {
        DEBUG_FLAGS.fetch_and(!bit, Ordering::Relaxed);
    }
}

pub fn get_debug_flag(flag: DebugFlag) -> bool {
    DEBUG_FLAGS.load(Ordering::Relaxed) & (1u32 << flag as u32) != 0
}

pub fn toggle_debug_flag(flag: DebugFlag) {
    DEBUG_FLAGS.fetch_xor(1u32 << flag as u32, Ordering::Relaxed);
}
