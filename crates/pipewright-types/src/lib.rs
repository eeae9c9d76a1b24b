//! Shared types for the pipewright workflow engine.
//!
//! Everything that crosses a crate boundary lives here: run statuses, the
//! closed set of block kinds, update actions, the durable records (tasks,
//! steps, events, delegations, pipeline versions) and the error-kind
//! enumeration used by the HTTP layer.

/// Declares a closed string-tagged enum with serde names, `as_str`,
/// `Display` and `FromStr`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err($crate::UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub mod action;
pub mod block;
pub mod delegation;
pub mod error_kind;
pub mod record;
pub mod status;

pub use action::{UpdateAction, UpdateDescriptor};
pub use block::{
    BlockDefinition, BlockKind, PipelineGraph, Socket, VariableMapping, VersionStatus,
    DEFAULT_SOCKET,
};
pub use delegation::{Delegation, DelegationType};
pub use error_kind::ErrorKind;
pub use record::{
    EditChangeType, EditRecord, EventType, Member, PipelineRecord, PreviousContent, Step, StopPoints,
    Task, TaskEvent, VersionRecord, VersionSettings,
};
pub use status::{HumanStatus, StepStatus, TaskStatus};

/// A wire string that does not name any variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
