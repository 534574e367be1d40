//! # Chainpool Core
//!
//! Health-checked pool of redundant blockchain JSON-RPC endpoints.
//!
//! A [`Pool`](pool::Pool) serves a single chain. It owns one [`Node`](node::Node) per
//! configured endpoint, runs one background poller per node, and answers
//! [`select_node`](pool::Pool::select_node) with the best endpoint that is connected,
//! verified to serve the expected chain, and caught up with the chain head.
//!
//! - **[`transport`]**: The [`Transport`](transport::Transport) capability (dial, call,
//!   new-head subscription) and an HTTP JSON-RPC implementation.
//!
//! - **[`node`]**: Per-endpoint health state machine, dialer with bounded backoff, and the
//!   poller that drives liveness, chain-id verification and sync status.
//!
//! - **[`pool`]**: Node ownership, lifecycle (`start` / `stop`) and the pure selection
//!   policy.
//!
//! - **[`chain_set`]**: One pool per configured chain, owned explicitly.
//!
//! - **[`config`]**: Layered configuration (TOML file + environment overrides).
//!
//! - **[`metrics`]**: Per-node counters exported through the `metrics` facade.
//!
//! ## Node Lifecycle
//!
//! ```text
//!                 dial ok              chain id ok
//! ┌─────────────┐ ──────► ┌────────┐ ──────────► ┌───────┐ ◄──► ┌────────┐
//! │ Unreachable │         │ Dialed │             │ Alive │      │ InSync │
//! └─────────────┘ ◄────── └────────┘             └───────┘ ◄──► └────────┘
//!        ▲  │     io error     │ chain id            ▲              ▲
//!        │  │                  │ mismatch            ▼              │
//!        │  │ operator         ▼               ┌───────────┐ ◄──────┘
//!        │  ▼           ┌────────────────┐     │ OutOfSync │
//!   ┌──────────┐        │ InvalidChainId │     └───────────┘
//!   │ Unusable │        └────────────────┘
//!   └──────────┘
//!      (terminal)           (terminal)
//!
//!  Alive / InSync / OutOfSync / Dialed ──── consecutive failures ───► Unreachable
//! ```

pub mod chain_set;
pub mod config;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod transport;
pub mod types;

pub use chain_set::{ChainSet, ChainSetError};
pub use node::{Node, NodeState, NodeStatus};
pub use pool::{Pool, PoolBuilder, PoolError, SelectionMode};
pub use transport::{Transport, TransportError};
pub use types::Head;
