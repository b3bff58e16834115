pub mod handlers;
pub mod operation;
pub mod responses;
pub mod routes;

pub use operation::{EchoOperation, OperationHandler, OperationInvocation};
pub use routes::{create_router, AppState, SharedCoordinator, SharedPublisher};
