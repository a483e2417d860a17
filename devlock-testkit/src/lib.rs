//! In-memory fakes for exercising devlock orchestrators in tests.
//!
//! Every fake is a cheap `Clone` handle over shared state, so a test keeps one
//! clone for assertions after handing another to the orchestrator. A shared
//! [`Journal`] records store, work and acknowledgment calls in order.

pub mod job;
pub mod mock;
pub mod store;
pub mod stream;

pub use job::*;
pub use mock::*;
pub use store::*;
pub use stream::*;
