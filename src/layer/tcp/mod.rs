//! The TCP connection tracker and emitter pair.
//!
//! ## Topology
//!
//! A middlebox sees one connection as two flows. Each flow runs through a
//! [`TcpIn`] (validation, association, ack remapping) on entry and a
//! [`TcpOut`] (sequence rewrite, checksum finalization) on exit; protocol
//! logic sits between the two and edits payload bytes through an
//! [`Operator`]. The two directions share one [`Endpoint`], which owns the
//! flow-id table and the pool of per-connection [`TcpCommon`] records — the
//! "return element" of the paired direction is reached through this registry
//! rather than through element back-references.
//!
//! Connection affinity is assumed: both flows of a connection are steered to
//! the worker owning the endpoint, so no state here is synchronized.
//!
//! ## Configuration
//!
//! A tracker pair is configured with its flow direction (0 or 1); [`pair`]
//! builds both directions wired to the same numbering. The element graph
//! passes the shared endpoint into every call, which keeps the elements
//! free of lifetimes and reference cycles.
//!
//! ## Driving
//!
//! Per packet of direction `d`: `tcp_in[d].process(..)`, then any protocol
//! logic (via `tcp_in[d].operator(..)` and a [`FlowBuffer`]), then
//! `tcp_out[d].emit(..)`. Forged reverse-path packets accumulate in the
//! direction's `TcpOut` and are drained with `pop_pending`. Timers are
//! driven by `endpoint.poll(now)`; a fired timer asks for
//! `tcp_out.resend_ack`.
//!
//! [`TcpIn`]: struct.TcpIn.html
//! [`TcpOut`]: struct.TcpOut.html
//! [`Operator`]: struct.Operator.html
//! [`Endpoint`]: struct.Endpoint.html
//! [`TcpCommon`]: struct.TcpCommon.html
//! [`pair`]: fn.pair.html
//! [`FlowBuffer`]: ../../storage/struct.FlowBuffer.html

mod connection;
mod emit;
mod endpoint;
mod timing;


pub use connection::{ClosingState, Direction, Fcb, FourTuple, TcpCommon};
pub use emit::TcpOut;
pub use endpoint::{Counters, Endpoint, Operator, TcpIn, TimerEvent};
pub use timing::{AckSignal, RetransmissionTiming};

/// Build the tracker/emitter elements of both directions, wired together.
pub fn pair() -> ((TcpIn, TcpOut), (TcpIn, TcpOut)) {
    let zero = Direction::new(0).expect("0 is a direction");
    let one = zero.opposite();
    (
        (TcpIn::new(zero), TcpOut::new(zero)),
        (TcpIn::new(one), TcpOut::new(one)),
    )
}
