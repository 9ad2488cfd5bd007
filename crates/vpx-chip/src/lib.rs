//! Silicon model for the VPX500 vision co-processor.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the silicon as seen from the host: the control register
//! map, the mailbox message wire format, and the shared-memory layout the
//! firmware and host agree on before the processor leaves reset.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Control register map — offsets, bit fields, semaphore slots |
//! | [`msg`] | Mailbox message wire format — encode/decode, no I/O |
//! | [`layout`] | Segment-window VA plan and debug-memory region layout |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Wire-format packing is explicit byte surgery; the truncating casts are
// the point, not an accident.
#![allow(clippy::cast_possible_truncation)]

pub mod layout;
pub mod msg;
pub mod regs;
