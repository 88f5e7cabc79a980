//! Client-side service proxy.
//!
//! An interface is declared once as an [`InterfaceDef`] (by hand, or through
//! the `remote_service!` macro). Building a [`ServiceProxy`] validates every
//! method and precomputes its [`MethodDescriptor`]; invocation only looks the
//! descriptor up by name and routes arguments by position.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::pending::{PendingCall, ReplyExpectation, ReplyKind, ReplyValue};
use super::sender::{RequestEnvelope, RequestSender};
use crate::transport::{Destination, Headers};
use crate::types::{Error, Result};

/// What a method parameter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Overrides the proxy's default destination when set.
    Destination,
    /// Copied onto the request as message properties.
    Headers,
    /// Serialized into the request body.
    Body,
}

/// Declared return of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnKind {
    /// Fire-and-forget: no reply channel, no call handle.
    Nothing,
    /// A call handle without a reply value.
    Acknowledge,
    /// A call handle resolving to a deserialized reply.
    Reply,
    /// Anything else. Rejected when the proxy is built.
    Unsupported(String),
}

/// Declared shape of one interface method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ParamRole>,
    pub returns: ReturnKind,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: ReturnKind::Nothing,
        }
    }

    pub fn param(mut self, role: ParamRole) -> Self {
        self.params.push(role);
        self
    }

    pub fn returns(mut self, returns: ReturnKind) -> Self {
        self.returns = returns;
        self
    }
}

/// A named set of method signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDef {
    pub name: String,
    pub methods: Vec<MethodSignature>,
}

impl InterfaceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }
}

/// Precomputed routing for one method: argument positions per role and the
/// reply expectation (`None` for fire-and-forget).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub destination: Option<usize>,
    pub headers: Option<usize>,
    pub body: Option<usize>,
    pub arity: usize,
    pub reply: Option<ReplyKind>,
}

impl MethodDescriptor {
    pub fn from_signature(interface: &str, signature: &MethodSignature) -> Result<Self> {
        let mut descriptor = Self {
            destination: None,
            headers: None,
            body: None,
            arity: signature.params.len(),
            reply: None,
        };
        for (position, role) in signature.params.iter().enumerate() {
            let slot = match role {
                ParamRole::Destination => &mut descriptor.destination,
                ParamRole::Headers => &mut descriptor.headers,
                ParamRole::Body => &mut descriptor.body,
            };
            if slot.replace(position).is_some() {
                return Err(Error::protocol_violation(format!(
                    "{}::{} declares more than one {:?} parameter",
                    interface, signature.name, role
                )));
            }
        }
        descriptor.reply = match &signature.returns {
            ReturnKind::Nothing => None,
            ReturnKind::Acknowledge => Some(ReplyKind::Acknowledge),
            ReturnKind::Reply => Some(ReplyKind::Value),
            ReturnKind::Unsupported(declared) => {
                return Err(Error::protocol_violation(format!(
                    "{}::{} returns {}; only no value or a pending call is supported",
                    interface, signature.name, declared
                )))
            }
        };
        Ok(descriptor)
    }
}

/// One call argument, tagged with the role it fills.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Destination(Option<Destination>),
    Headers(Option<Headers>),
    Body(Option<Value>),
}

impl Argument {
    pub fn destination(destination: impl Into<Option<Destination>>) -> Self {
        Argument::Destination(destination.into())
    }

    pub fn headers(headers: impl Into<Option<Headers>>) -> Self {
        Argument::Headers(headers.into())
    }

    /// A body argument. A value serializing to `null` sends no body.
    pub fn body<B: Serialize + ?Sized>(body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)?;
        Ok(Argument::Body((!value.is_null()).then_some(value)))
    }

    fn role(&self) -> ParamRole {
        match self {
            Argument::Destination(_) => ParamRole::Destination,
            Argument::Headers(_) => ParamRole::Headers,
            Argument::Body(_) => ParamRole::Body,
        }
    }
}

/// Client for one interface, delegating every method to a [`RequestSender`].
#[derive(Debug)]
pub struct ServiceProxy {
    interface: String,
    sender: RequestSender,
    default_destination: Destination,
    default_timeout: Duration,
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceProxy {
    /// Validate `interface` and precompute its descriptor table.
    pub fn build(
        interface: &InterfaceDef,
        sender: RequestSender,
        default_destination: Destination,
        default_timeout: Duration,
    ) -> Result<Self> {
        let mut methods = HashMap::with_capacity(interface.methods.len());
        for signature in &interface.methods {
            let descriptor = MethodDescriptor::from_signature(&interface.name, signature)?;
            if methods.insert(signature.name.clone(), descriptor).is_some() {
                return Err(Error::protocol_violation(format!(
                    "{} declares method {} more than once",
                    interface.name, signature.name
                )));
            }
        }
        tracing::debug!(
            "proxy_built: interface={}, methods={}, destination={}",
            interface.name,
            methods.len(),
            default_destination
        );
        Ok(Self {
            interface: interface.name.clone(),
            sender,
            default_destination,
            default_timeout,
            methods,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn descriptor(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }

    /// Invoke `method`. Returns the pending call, or `None` for a
    /// fire-and-forget method.
    pub async fn invoke<T: ReplyValue>(
        &self,
        method: &str,
        args: Vec<Argument>,
    ) -> Result<Option<PendingCall<T>>> {
        let descriptor = self.methods.get(method).ok_or_else(|| {
            Error::protocol_violation(format!("{} has no method {}", self.interface, method))
        })?;
        if args.len() != descriptor.arity {
            return Err(Error::protocol_violation(format!(
                "{}::{} takes {} arguments, got {}",
                self.interface,
                method,
                descriptor.arity,
                args.len()
            )));
        }

        let mut destination = None;
        let mut headers = None;
        let mut body = None;
        for (position, arg) in args.into_iter().enumerate() {
            let expected = [
                (descriptor.destination, ParamRole::Destination),
                (descriptor.headers, ParamRole::Headers),
                (descriptor.body, ParamRole::Body),
            ]
            .into_iter()
            .find_map(|(at, role)| (at == Some(position)).then_some(role));
            if expected != Some(arg.role()) {
                return Err(Error::protocol_violation(format!(
                    "{}::{} argument {} is a {:?}, expected {:?}",
                    self.interface,
                    method,
                    position,
                    arg.role(),
                    expected
                )));
            }
            match arg {
                Argument::Destination(value) => destination = value,
                Argument::Headers(value) => headers = value,
                Argument::Body(value) => body = value,
            }
        }

        let mut request =
            RequestEnvelope::new(destination.unwrap_or_else(|| self.default_destination.clone()))
                .with_headers(headers.unwrap_or_default());
        request.body = body;
        let expectation = descriptor.reply.map(|kind| ReplyExpectation {
            kind,
            timeout: self.default_timeout,
        });
        self.sender.send(request, expectation).await
    }

    /// Invoke a method that declares a reply.
    pub async fn call<T: ReplyValue>(
        &self,
        method: &str,
        args: Vec<Argument>,
    ) -> Result<PendingCall<T>> {
        if matches!(self.methods.get(method), Some(d) if d.reply.is_none()) {
            return Err(Error::protocol_violation(format!(
                "{}::{} is fire-and-forget and returns no call",
                self.interface, method
            )));
        }
        self.invoke(method, args)
            .await?
            .ok_or_else(|| Error::transport("reply channel was not opened"))
    }

    /// Invoke a fire-and-forget method.
    pub async fn notify(&self, method: &str, args: Vec<Argument>) -> Result<()> {
        if matches!(self.methods.get(method), Some(d) if d.reply.is_some()) {
            return Err(Error::protocol_violation(format!(
                "{}::{} expects a reply; use call",
                self.interface, method
            )));
        }
        self.invoke::<()>(method, args).await.map(|_| ())
    }
}
