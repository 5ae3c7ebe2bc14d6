//! Notification surface toward the host UI.
//!
//! The runtime never calls into UI code directly. It emits [`HostEvent`]s
//! through a [`HostNotifier`], which a desktop shell forwards to its renderer
//! process and the CLI host simply prints.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{LoadedPackage, MenuItem, PackageState, Severity};

/// Catalog row as shown by the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub state: PackageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl From<&LoadedPackage> for PackageSummary {
    fn from(package: &LoadedPackage) -> Self {
        let manifest = &package.manifest;
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            state: package.state,
            error: package.error.clone(),
            icon: manifest.icon.clone(),
        }
    }
}

/// Event emitted toward the host UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HostEvent {
    /// The full catalog after discovery, install or uninstall.
    CatalogChanged { packages: Vec<PackageSummary> },
    /// A single package changed state.
    StateChanged { id: String, state: PackageState },
    /// Something went wrong with a package.
    Error { id: String, message: String },
    /// A package contributed a menu item.
    MenuItemAdded { id: String, item: MenuItem },
    /// A package asked to show a notification.
    Notification { id: String, message: String, severity: Severity },
}

/// Sink for [`HostEvent`]s.
pub trait HostNotifier: Send + Sync {
    /// Deliver an event. Must not block.
    fn notify(&self, event: HostEvent);
}

/// Forwards events over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelNotifier {
    /// Create a notifier together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl HostNotifier for ChannelNotifier {
    fn notify(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Host event dropped: receiver closed");
        }
    }
}

/// Writes events to the log. Used when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl HostNotifier for LogNotifier {
    fn notify(&self, event: HostEvent) {
        match event {
            HostEvent::CatalogChanged { packages } => {
                tracing::info!(count = packages.len(), "Package catalog changed");
            }
            HostEvent::StateChanged { id, state } => {
                tracing::info!(package = %id, state = %state, "Package state changed");
            }
            HostEvent::Error { id, message } => {
                tracing::error!(package = %id, "{}", message);
            }
            HostEvent::MenuItemAdded { id, item } => {
                tracing::info!(
                    package = %id,
                    label = %item.label,
                    command = %item.command,
                    "Menu item added"
                );
            }
            HostEvent::Notification { id, message, severity } => {
                tracing::info!(package = %id, ?severity, "{}", message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event =
            HostEvent::StateChanged { id: "word-count".to_string(), state: PackageState::Enabled };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state-changed");
        assert_eq!(json["id"], "word-count");
        assert_eq!(json["state"], "enabled");
    }

    #[test]
    fn test_summary_omits_empty_optionals() {
        let summary = PackageSummary {
            id: "a".to_string(),
            name: "A".to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            author: String::new(),
            state: PackageState::Installed,
            error: None,
            icon: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("icon").is_none());
    }

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        notifier.notify(HostEvent::Error { id: "a".to_string(), message: "boom".to_string() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, HostEvent::Error { id: "a".to_string(), message: "boom".to_string() });
    }

    #[test]
    fn test_channel_notifier_survives_closed_receiver() {
        let (notifier, rx) = ChannelNotifier::channel();
        drop(rx);
        notifier.notify(HostEvent::Error { id: "a".to_string(), message: "boom".to_string() });
    }
}
