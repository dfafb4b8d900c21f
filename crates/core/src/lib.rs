//! Registry operator core types.
//!
//! Everything the other crates agree on lives here: the `Registry` custom
//! resource, the closed set of managed object kinds, object identity and the
//! event vocabulary.

#![forbid(unsafe_code)]

pub mod events;
pub mod object;
pub mod registry;

pub use events::{EventKind, EventSink};
pub use object::{
    from_dynamic, parse_uid, to_dynamic, uid_of, IdentityError, ObjectKey, ObjectKind, OperationResult, Uid,
};
pub use registry::{
    PvcStorage, Registry, RegistrySpec, RegistryStatus, S3Storage, SecretKeySelector, Storage, ValidationError,
};

pub mod prelude {
    pub use super::{
        EventKind, EventSink, ObjectKey, ObjectKind, OperationResult, Registry, RegistrySpec, RegistryStatus, Storage,
        Uid,
    };
}
