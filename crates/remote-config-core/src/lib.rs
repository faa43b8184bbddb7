//! Public entry points for the remote-config core crate.
//!
//! The crate models the client side of Remote Configuration: parsing the
//! signed targets manifest, verifying delivered documents against their
//! advertised digests, and keeping a versioned repository that is only
//! mutated through atomic transactions. Committed change sets are routed to
//! product consumers through the [`Dispatcher`].

pub mod capabilities;
pub mod content;
pub mod digest;
pub mod dispatcher;
pub mod path;
pub mod repository;
pub mod sync;
pub mod targets;
pub mod telemetry;

pub use capabilities::Capabilities;
pub use content::{ApplyState, Content, ContentList, TargetFile};
pub use digest::{hexdigest, Digest, DigestError, DigestList, DigestType};
pub use dispatcher::{Dispatcher, ProductMatcher, Receiver};
pub use path::{ConfigPath, ConfigPathSource, PathParseError};
pub use repository::{
    Change, ChangeSet, ConfigState, Repository, RepositorySnapshot, RepositoryState, SetOptions,
    Transaction, UNVERIFIED_ROOT_VERSION,
};
pub use sync::{apply_config_response, ConfigResponse, SyncError};
pub use targets::{Target, TargetMap, TargetsError};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, TelemetryCounters, TelemetryLevel,
    TelemetrySink, TelemetrySnapshot,
};
