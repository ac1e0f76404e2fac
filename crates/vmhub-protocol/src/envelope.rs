//! Request-argument envelope.
//!
//! A `Request_VM` argument may wrap the actual initialization argument
//! together with out-of-band headers (auth tokens and the like) under
//! reserved keys. The wrapper is detected structurally and decoded exactly
//! once at the dispatch boundary into a tagged union; everything downstream
//! works with the decoded form.

use serde_json::Value;

/// Reserved key holding the wrapped initialization argument.
pub const VM_ARG_KEY: &str = "$vmArg";

/// Reserved key holding the sibling out-of-band headers.
pub const HEADERS_KEY: &str = "$headers";

/// Decoded `Request_VM` argument.
#[derive(Debug, Clone, PartialEq)]
pub enum VmArg {
    /// The whole argument is the initialization argument; no headers.
    Plain(Option<Value>),
    /// Envelope form: unwrapped argument plus out-of-band headers.
    WithHeaders {
        arg: Option<Value>,
        headers: Option<Value>,
    },
}

impl VmArg {
    /// Decode a raw wire argument. An object carrying a non-null `$vmArg`
    /// key is unwrapped; anything else passes through as [`VmArg::Plain`].
    pub fn decode(raw: Option<Value>) -> Self {
        match raw {
            Some(Value::Object(map)) if map.get(VM_ARG_KEY).is_some_and(|v| !v.is_null()) => {
                Self::WithHeaders {
                    arg: map.get(VM_ARG_KEY).cloned(),
                    headers: map.get(HEADERS_KEY).filter(|v| !v.is_null()).cloned(),
                }
            }
            raw => Self::Plain(raw),
        }
    }

    /// The initialization argument the controller receives.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Plain(arg) => arg.as_ref(),
            Self::WithHeaders { arg, .. } => arg.as_ref(),
        }
    }

    /// Out-of-band headers, if the envelope carried any.
    pub fn headers(&self) -> Option<&Value> {
        match self {
            Self::Plain(_) => None,
            Self::WithHeaders { headers, .. } => headers.as_ref(),
        }
    }

    /// Consume the decoded form into `(argument, headers)`.
    pub fn into_parts(self) -> (Option<Value>, Option<Value>) {
        match self {
            Self::Plain(arg) => (arg, None),
            Self::WithHeaders { arg, headers } => (arg, headers),
        }
    }
}
