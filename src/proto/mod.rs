//! Message schema of the greeter method. The service is intentionally tiny:
//! one request type carrying a name and one reply type carrying the greeting
//! built from it. How these messages travel over a connection is the business
//! of the [`wire`] module, the rest of the crate only reads `name` and writes
//! `message`.

pub mod wire;

/// What the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    /// Name to greet.
    pub name: String,
}

/// What the server sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloReply {
    /// The greeting, `"Hello " + name`.
    pub message: String,
}

/// Application-level outcome of a call, carried next to the reply. A call can
/// complete at the transport level and still fail here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    /// Status code, 0 means OK.
    pub code: u32,

    /// Human readable error description, empty on success.
    pub message: String,
}

impl RpcStatus {
    /// Code reported when a reply does not fit in a wire frame.
    pub const RESOURCE_EXHAUSTED: u32 = 8;

    /// Status of a successful call.
    pub fn ok() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    /// `true` if the call succeeded at the application level.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}
