//! xos is a small kernel for the x86 family. This crate holds its memory subsystem: the boot-time
//! setup of the physical page allocator and the kernel heap built on top of it.
//!
//! The allocators themselves live in the [`kmm`] crate and are host-testable. This crate wires
//! them to the memory layout handed over by the boot stage and exposes them as process-wide
//! singletons.
//!
//! When the `global-alloc` feature is enabled, the kernel heap also serves the `alloc` crate.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Boot-time memory layout.
pub mod boot;

/// Memory subsystem configuration.
pub mod config;

/// Memory management facilities.
pub mod mm;

#[cfg(test)]
mod testing;

pub use kmm;
