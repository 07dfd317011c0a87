//! The core of a teaching kernel: a contiguous physical frame allocator, a two-level page table
//! with demand paging, per-address-space virtual memory arenas, a blocking ATA disk driver (with
//! a mirrored two-spindle variant), and a small disk-backed file system.
//!
//! Everything in this crate is written against the collaborator traits in [`collab`], so it builds
//! and runs its test suite under plain `cargo test` even though the real target is `no_std`. The
//! `#![no_main]`/`#[global_allocator]`/entry-point wiring lives in the `kernel` binary
//! (`src/main.rs`), not here, since a library crate owns neither.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![cfg_attr(not(test), feature(abi_x86_interrupt))]

extern crate alloc;

#[macro_use]
pub mod console;
#[macro_use]
pub mod error;
pub mod collab;
pub mod disk;
pub mod fs;
pub mod memory;

#[cfg(not(test))]
pub mod bare_bones;
#[cfg(not(test))]
pub mod interrupts;
