//! `remote_service!`: declare a service interface once and get the trait,
//! its [`InterfaceDef`](crate::client::InterfaceDef) and a proxy-backed client.
//!
//! ```ignore
//! remote_service! {
//!     pub trait SampleService => SampleClient {
//!         fn ping(#[body] ping: PingMessage) -> PendingCall<PingMessage>;
//!         fn ping_at(
//!             #[destination] to: Destination,
//!             #[body] ping: PingMessage,
//!         ) -> PendingCall<PingMessage>;
//!         fn notify(#[headers] headers: Headers, #[body] ping: PingMessage);
//!         fn fire_and_wait() -> PendingCall;
//!     }
//! }
//! ```
//!
//! Every parameter names its role. A method without a return is
//! fire-and-forget; `PendingCall` alone is an acknowledged call without a
//! value. Any other return type does not match the macro and fails to
//! compile.

/// Generate a service trait, its interface definition and a client.
#[macro_export]
macro_rules! remote_service {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident => $client:ident {
            $(
                $(#[$mmeta:meta])*
                fn $method:ident (
                    $( #[$role:ident] $arg:ident : $ty:ty ),* $(,)?
                ) $( -> PendingCall $( < $reply:ty > )? )? ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[$crate::__private::async_trait]
        $vis trait $name: Send + Sync {
            $(
                $(#[$mmeta])*
                async fn $method(&self $(, $arg: $ty)*)
                    -> $crate::Result<$crate::__rs_returns!($( [ $($reply)? ] )?)>;
            )*
        }

        #[derive(Debug, Clone)]
        $vis struct $client {
            proxy: ::std::sync::Arc<$crate::client::ServiceProxy>,
        }

        impl $client {
            /// Declared shape of the interface.
            pub fn interface() -> $crate::client::InterfaceDef {
                $crate::client::InterfaceDef::new(stringify!($name))
                    $(
                        .method(
                            $crate::client::MethodSignature::new(stringify!($method))
                                $( .param($crate::__rs_role!($role)) )*
                                .returns($crate::__rs_ret!($( [ $($reply)? ] )?))
                        )
                    )*
            }

            pub fn new(
                sender: $crate::client::RequestSender,
                default_destination: $crate::transport::Destination,
                default_timeout: ::std::time::Duration,
            ) -> $crate::Result<Self> {
                let proxy = $crate::client::ServiceProxy::build(
                    &Self::interface(),
                    sender,
                    default_destination,
                    default_timeout,
                )?;
                Ok(Self {
                    proxy: ::std::sync::Arc::new(proxy),
                })
            }

            pub fn proxy(&self) -> &$crate::client::ServiceProxy {
                &self.proxy
            }
        }

        #[$crate::__private::async_trait]
        impl $name for $client {
            $(
                async fn $method(&self $(, $arg: $ty)*)
                    -> $crate::Result<$crate::__rs_returns!($( [ $($reply)? ] )?)>
                {
                    let args: ::std::vec::Vec<$crate::client::Argument> =
                        vec![$( $crate::__rs_arg!($role, $arg) ),*];
                    $crate::__rs_invoke!(self.proxy, stringify!($method), args $(, [ $($reply)? ])?)
                }
            )*
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rs_returns {
    () => { () };
    ([]) => { $crate::client::PendingCall<()> };
    ([$reply:ty]) => { $crate::client::PendingCall<$reply> };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rs_ret {
    () => { $crate::client::ReturnKind::Nothing };
    ([]) => { $crate::client::ReturnKind::Acknowledge };
    ([$reply:ty]) => { $crate::client::ReturnKind::Reply };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rs_role {
    (destination) => { $crate::client::ParamRole::Destination };
    (headers) => { $crate::client::ParamRole::Headers };
    (body) => { $crate::client::ParamRole::Body };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rs_arg {
    (destination, $arg:ident) => { $crate::client::Argument::destination($arg) };
    (headers, $arg:ident) => { $crate::client::Argument::headers($arg) };
    (body, $arg:ident) => { $crate::client::Argument::body(&$arg)? };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __rs_invoke {
    ($proxy:expr, $method:expr, $args:expr) => {
        $proxy.notify($method, $args).await
    };
    ($proxy:expr, $method:expr, $args:expr, []) => {
        $proxy.call::<()>($method, $args).await
    };
    ($proxy:expr, $method:expr, $args:expr, [$reply:ty]) => {
        $proxy.call::<$reply>($method, $args).await
    };
}
