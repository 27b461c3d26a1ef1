//! A stateful TCP middlebox flow-processing core.
//!
//! Lets an inline network element observe and *modify* the payload of TCP
//! connections transparently: payload bytes can be deleted, inserted, or
//! replaced mid-flow while acknowledgments, retransmissions, sequence
//! numbering and connection teardown stay coherent for both endpoints. The
//! crate is not a TCP stack: it never originates connections and holds no
//! data for reliability, it edits a conversation between two real endpoints.
//!
//! The moving parts: [`layer::tcp`] tracks connections and remaps
//! acknowledgements, [`storage`] holds the per-direction sequence
//! translation, per-packet edit lists, and the cross-packet flow buffer,
//! [`packet`] and [`wire`] carry the packets themselves.
//!
//! [`layer::tcp`]: layer/tcp/index.html
//! [`storage`]: storage/index.html
//! [`packet`]: packet/index.html
//! [`wire`]: wire/index.html
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use]
mod macros;
pub mod layer;
pub mod managed;
pub mod packet;
pub mod storage;
pub mod time;
pub mod wire;
