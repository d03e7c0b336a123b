//! External collaborators: secrets and notifications.
//!
//! Both are consumed through traits so the engine never depends on a
//! particular vault or delivery channel.

mod notify;
mod secrets;

pub use notify::{notify_best_effort, NoOpNotifier, Notification, Notifier, RecordingNotifier, Severity};
pub use secrets::{Credential, CredentialHandle, SecretProvider, StaticSecretProvider};

#[cfg(test)]
pub use notify::MockNotifier;
#[cfg(test)]
pub use secrets::MockSecretProvider;
