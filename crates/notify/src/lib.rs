mod notifier;
mod resolver;
mod sampling;
mod system;

pub use notifier::{Notifier, Transport, MESSAGE_KIND_NOTICE};
pub use resolver::{AdminResolver, AdminSource, AdminTarget, MembershipSource, RoomMember};
pub use sampling::{ErrorRecord, SamplingRegistry, SamplingStats};
pub use system::{
    global, global_notify, init_tracing, install, parse_duration_or, report, reportf, track,
    Config, System,
};

/// Errors surfaced by the notification pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no admin resolver is wired")]
    NoResolver,
    #[error("admin resolution exhausted every tier")]
    NoAdminResolved,
    #[error("operation cancelled")]
    Cancelled,
    #[error("transport delivery failed")]
    Transport(#[source] anyhow::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
