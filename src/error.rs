//! The crate's error taxonomy: **Assertion**, **NotFound**, **Exhausted**, and **Spurious**.
//!
//! Only `Assertion` ever changes control flow via unwinding/halting (`kernel_assert!` below).
//! `NotFound` and `Exhausted` are surfaced by the mid-level operations themselves as `bool` or a
//! sentinel address/block number. This module just gives those sentinels names so call sites
//! don't repeat the magic numbers, and gives diagnostics (not control flow) a shared enum.
//! `Spurious` never reaches here at all; it is handled by silently returning from a
//! `dispatch_to_blocked` call (see [`crate::disk`]).

/// Returned by [`crate::memory::ContFramePool::get_frames`] on failure. Never a frame allocated
/// by any pool, because frame 0 always lies inside the kernel pool's own reserved info-frame
/// region.
pub const NO_FRAME: usize = 0;

/// Returned by [`crate::memory::VMPool::allocate`] on failure (arena exhausted).
pub const NO_ADDRESS: u64 = 0;

/// Returned by [`crate::fs::FileSystem::free_block`] when the disk has no free block left. Block 0
/// is always the bitmap itself, so it can never be handed out as a data/info block.
pub const NO_BLOCK: u32 = 0;

/// A diagnostic-only classification of a non-fatal failure. Never propagated as a `Result`; it
/// exists so `printk!` call sites at every `Exhausted`/`NotFound` return site can share one
/// `Display` impl instead of ad hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// No contiguous run of the requested length was free.
    FramesExhausted { requested: usize },
    /// No gap in a `VMPool`'s descriptor list was large enough.
    ArenaExhausted { requested_bytes: u64 },
    /// The file system ran out of free blocks.
    BlocksExhausted,
    /// A lookup (file id, VMPool range) found nothing.
    NotFound,
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Diagnostic::FramesExhausted { requested } => {
                write!(f, "no {requested} contiguous free frames available")
            }
            Diagnostic::ArenaExhausted { requested_bytes } => {
                write!(f, "no {requested_bytes}-byte gap available in arena")
            }
            Diagnostic::BlocksExhausted => write!(f, "no free blocks left on disk"),
            Diagnostic::NotFound => write!(f, "not found"),
        }
    }
}

/// Like `assert!`, but the failure message is also sent through `printk!` first, so a diagnostic
/// reaches the console even if the panic handler's own console access were ever to fail.
#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::printk!("assertion failed: {}\n", stringify!($cond));
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::printk!($($arg)+);
            $crate::printk!("\n");
            panic!($($arg)+);
        }
    };
}

/// Like `assert_eq!`, but routed through [`kernel_assert!`]'s console-first reporting.
#[macro_export]
macro_rules! kernel_assert_eq {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left_val, right_val) => {
                $crate::kernel_assert!(
                    *left_val == *right_val,
                    "assertion failed: `(left == right)`\n  left: `{:?}`\n right: `{:?}`",
                    left_val,
                    right_val
                );
            }
        }
    };
}
