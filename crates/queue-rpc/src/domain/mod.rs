//! Domain types for the RPC core.
//!
//! Pure data: the wire envelope and its codec, request ids, errors and
//! configuration. Nothing in here performs I/O.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;

pub use config::{RpcConfig, UnregisteredMethodPolicy, MAX_POLL_WAIT};
pub use correlation::RequestId;
pub use envelope::{decode, encode, Action, Envelope};
pub use error::{
    codes, CallError, ConfigError, DecodeError, ExceptionCode, RemoteException, RpcError,
    TransportError,
};
