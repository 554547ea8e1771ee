//! # Kernel Agent - compute-node agent core
//!
//! Creates, supervises and recovers containerized kernels across backends:
//! - Backend-agnostic kernel and code runner contract (`kernel`)
//! - Process-wide kernel registry with crash-recoverable persistence to
//!   per-kernel scratch storage (`kernel::recovery`, `scratch`)
//! - Bidirectional domain socket proxy for container control sockets (`proxy`)
//! - Container-engine, orchestrator and simulated backends (`backends`)
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!  restart → │  KernelRegistryLoader ─→ KernelRegistry  │ ← creation pipeline
//!            │        ↑                      │          │
//!            │  ScratchStore ←─ RegistryPersistence     │
//!            │                                          │
//!            │  AbstractKernel: docker | k8s | dummy    │
//!            │     ├─ CodeRunner ──tcp──→ kernel runner │
//!            │     └─ DomainSocketProxy ──→ engine sock │
//!            └──────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod backends;
pub mod events;
pub mod kernel;
pub mod proxy;
pub mod repl;
pub mod scratch;
pub mod types;
pub mod validation;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
