//! Client side: sending requests, awaiting replies, and interface proxies.

mod macros;
pub mod pending;
pub mod proxy;
pub mod sender;

pub use pending::{
    wait_for_all, AwaitReply, PendingCall, ReplyEnvelope, ReplyExpectation, ReplyKind, ReplyValue,
};
pub use proxy::{
    Argument, InterfaceDef, MethodDescriptor, MethodSignature, ParamRole, ReturnKind, ServiceProxy,
};
pub use sender::{RequestEnvelope, RequestSender};
