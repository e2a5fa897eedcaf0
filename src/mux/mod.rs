//! Session Controller
//!
//! ```text
//! SessionManager (cloneable handle)
//!   └── mpsc<Command> ──> controller task
//!                           ├── HashMap<PaneId, Session>
//!                           ├── pending creations
//!                           └── retired history writers
//! PTY reader / waiter threads ──┘
//! ```

mod controller;
pub mod manager;
pub mod request;


pub use manager::SessionManager;
pub use request::{AttachResult, CreateRequest, KillOutcome, KillSummary};
