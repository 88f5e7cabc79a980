//! Server side: handler registration, dispatch and the consumer loop.

pub mod dispatcher;
pub mod handler;
pub mod listener;

pub use dispatcher::{DispatchOutcome, ListenerDispatcher};
pub use handler::{HandlerDescriptor, HandlerError, HandlerResult, MessageService};
pub use listener::{ListenerServer, MessageListener};
