//! wirecat transfer engine
//!
//! Moves bytes between a network peer and either the process's own standard
//! streams or a spawned child process's stdin/stdout/stderr, under
//! flow-control backpressure, multiple timeout policies, and a
//! join-before-reap shutdown ordering.
//!
//! ## Architecture
//!
//! ```text
//! peer <--> [filters] <--> TransferLoop <--> [filters] <--> stdio / child
//!                              |
//!                        FlowController
//!                              |
//!                       SessionLifecycle
//! ```
//!
//! [`session::Session`] builds a [`relay::TransferLoop`] over a peer endpoint
//! and a target (another stream, or a child spawned via [`child::spawn`]).
//! The loop reads bounded chunks, optionally converts line endings via
//! [`codec`], consults the [`flow::FlowController`] and writes to the
//! destination. The lifecycle drives shutdown: on any terminal condition the
//! pump tasks are joined before the child is reaped, and only then is the
//! peer closed.

pub mod child;
pub mod codec;
pub mod config;
pub mod filter;
pub mod flow;
pub mod relay;
pub mod session;

pub use child::{shell_command, spawn, ChildHandle, ChildOptions, ChildPipes};
pub use codec::CrlfMode;
pub use config::SessionConfig;
pub use filter::{ByteFilter, FilterChain, FilterOutput};
pub use flow::FlowController;
pub use relay::{Direction, Endpoint, RelayConfig, RelayEnd, RelaySummary, TransferLoop};
pub use session::{Session, SessionOutcome, SessionState, SessionTarget, TerminalReason};
