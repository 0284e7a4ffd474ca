//! Buffer Pool Module
//!
//! Every connection reads into one fixed-size buffer for its whole lifetime.
//! Those buffers are large and touched on every read cycle, so instead of
//! allocating one per accepted socket they are recycled through a
//! [`BufferPool`].
//!
//! ## Lifecycle
//!
//! ```text
//!   acquire() ──> [ in use by one Connection ] ──> release()
//!       ▲                                              │
//!       │            ┌─────────────┐                   │
//!       └────────────│  free list  │<──────────────────┘
//!     (zero-filled)  └─────────────┘
//!
//!   destroy() ──> free list dropped, every later acquire/release fails
//! ```

pub mod pool;

pub use pool::{BufferPool, BufferPoolError, PoolStats, PooledBuffer};
