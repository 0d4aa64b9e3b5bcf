pub mod mediator;
pub mod runtime;
pub mod session;
