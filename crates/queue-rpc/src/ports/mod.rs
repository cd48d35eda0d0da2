//! Ports Layer
//!
//! Defines the interfaces (traits) for:
//! - Driving Ports (inbound) - local method handlers invoked by the dispatcher
//! - Driven Ports (outbound) - the message queue transport

pub mod inbound;
pub mod outbound;

pub use inbound::{
    callback_handler, handler_fn, parse_args, CallbackHandler, Completion, FnHandler,
    MethodHandler,
};
pub use outbound::{QueueMessage, QueueTransport, ReceiptHandle};
