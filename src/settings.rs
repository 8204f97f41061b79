// src/settings.rs - GRBL `$` settings cache
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;

use crate::communication::commands::MachineCommand;
use crate::communication::event_system::LinkEvent;
use crate::communication::serial::{Link, LinkError};

/// Firmware settings as last reported by `$$`, keyed by setting number.
///
/// Entries are only added or updated; [`SettingsStore::reset`] is the one way to drop them.
#[derive(Debug, Default)]
pub struct SettingsStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_setting(&self, id: &str, value: &str) {
        let mut values = self.values.write().await;
        values.insert(id.to_string(), value.to_string());
    }

    pub async fn get(&self, id: &str) -> Option<String> {
        self.values.read().await.get(id).cloned()
    }

    pub async fn get_f64(&self, id: &str) -> Option<f64> {
        self.get(id).await?.parse().ok()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    pub async fn reset(&self) {
        self.values.write().await.clear();
    }

    /// Ask the controller to dump all settings. Replies arrive through the read loop.
    pub async fn request_refresh(&self, link: &Link) -> Result<(), LinkError> {
        link.send_command(&MachineCommand::DumpSettings).await
    }

    /// Write `$<id>=<value>`, then re-read the settings after `refresh_delay`.
    ///
    /// The firmware sends no dedicated confirmation, so the refreshed dump is
    /// what updates the cache.
    pub async fn write_setting(
        &self,
        link: &Link,
        id: u16,
        value: &str,
        refresh_delay: Duration,
    ) -> Result<(), LinkError> {
        tracing::info!("Writing setting ${}={}", id, value);
        link.write(&format!("${id}={value}")).await?;

        let link = link.clone();
        tokio::spawn(async move {
            tokio::time::sleep(refresh_delay).await;
            if let Err(e) = link.settings().request_refresh(&link).await {
                tracing::warn!("Settings refresh after write failed: {}", e);
            }
        });
        Ok(())
    }

    /// [`SettingsStore::write_setting`], then wait up to `timeout` for the
    /// refreshed dump to report the setting back. `Ok(None)` when it never does.
    pub async fn write_setting_confirmed(
        &self,
        link: &Link,
        id: u16,
        value: &str,
        refresh_delay: Duration,
        timeout: Duration,
    ) -> Result<Option<String>, LinkError> {
        let key = id.to_string();
        let mut events = link.subscribe();
        self.write_setting(link, id, value, refresh_delay).await?;

        let reported = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Setting { id, .. }) if id == key => return Ok(()),
                    Ok(LinkEvent::Disconnected) | Err(RecvError::Closed) => {
                        return Err(LinkError::NotConnected);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Settings confirmation missed {} link events", skipped);
                    }
                }
            }
        })
        .await;

        match reported {
            Ok(Ok(())) => Ok(self.get(&key).await),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!("Setting ${} was not reported back within {:?}", id, timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_and_update() {
        let store = SettingsStore::new();
        assert!(store.is_empty().await);
        store.apply_setting("110", "500.000").await;
        store.apply_setting("101", "250.000").await;
        store.apply_setting("110", "800.000").await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("110").await.as_deref(), Some("800.000"));
        assert_eq!(store.get_f64("101").await, Some(250.0));
        assert_eq!(store.get("999").await, None);
        let keys: Vec<String> = store.snapshot().await.into_keys().collect();
        assert_eq!(keys, vec!["101", "110"]);
    }

    #[tokio::test]
    async fn test_reset_clears() {
        let store = SettingsStore::new();
        store.apply_setting("0", "10").await;
        store.reset().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_without_link_fails() {
        let link = Link::native();
        let result = link.settings().request_refresh(&link).await;
        assert!(matches!(result, Err(LinkError::NotConnected)));
    }
}
