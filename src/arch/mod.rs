//! # Architecture Ports
//!
//! Hardware [`Port`](crate::port::Port) implementations. Currently a
//! single-core Cortex-M4 port; SMP parts add sibling modules with an
//! inter-core interrupt behind `interrupt_core`.

pub mod cortex_m4;

pub use cortex_m4::{configure_systick, set_interrupt_priorities, CortexM4};
