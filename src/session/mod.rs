pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod store;

pub use model::{
    Session, SessionStatus, TestConfiguration, TestPhase, TestType,
    UserContext,
};
pub use orchestrator::{SessionOrchestrator, SessionStatusReport};
pub use progress::{NoopProgress, ProgressCallback, ProgressEvent};
pub use store::{InMemorySessionStore, SessionStore};
