//! Identifiers carried on the wire

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mux identifier, unique for the lifetime of one connection
pub type MuxId = u64;

/// Upper bound (exclusive) of the handler id space.
///
/// Handler tables are sized with this constant. Widening `HandlerId` to `u16`
/// is the way out if the named ids ever reach it.
pub const HANDLER_LIMIT: usize = 255;

/// Identity of a registered RPC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(u8);

macro_rules! handler_ids {
    ($($(#[$meta:meta])* $name:ident = $value:literal,)+) => {
        impl HandlerId {
            $(
                $(#[$meta])*
                pub const $name: Self = Self($value);
            )+

            /// All named handler ids, in declaration order
            pub const NAMED: &'static [HandlerId] = &[$(Self::$name),+];

            /// Name of a well-known handler id
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some(stringify!($name)),)+
                    _ => None,
                }
            }
        }

        // Out of ids: widen the inner integer and HANDLER_LIMIT together.
        const _: () = {
            $(assert!(($value as usize) < HANDLER_LIMIT, "out of handler ids");)+
        };
    };
}

handler_ids! {
    /// Connection health check, answered by the transport itself
    PING = 1,
    /// Static description of a node (single request)
    SERVER_INFO = 2,
    /// Best-effort stream of node trace events
    TRACE = 3,
}

impl HandlerId {
    /// Reserved, never dispatched
    pub const INVALID: Self = Self(0);

    /// Create a handler id, rejecting the reserved value and anything outside the table
    pub fn new(value: u8) -> Option<Self> {
        let id = Self(value);
        id.is_valid().then_some(id)
    }

    /// Wrap a raw byte without validation (decoded frames, tests of the rejection paths)
    pub const fn from_raw(value: u8) -> Self {
        Self(value)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0 && (self.0 as usize) < HANDLER_LIMIT
    }

    /// Ids handled by the transport itself; they cannot be registered
    pub fn is_reserved(self) -> bool {
        self == Self::INVALID || self == Self::PING
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for HandlerId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(value)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "handler({})", self.0),
        }
    }
}

/// Opaque 128-bit identifier of one handshake attempt
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(uuid::Uuid);

impl AttemptId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttemptId({})", self.0.simple())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
