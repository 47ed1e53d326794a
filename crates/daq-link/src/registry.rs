//! Shared-link registry.
//!
//! Several devices on one daisy chain share a physical medium. The registry
//! maps each endpoint (port path or `host:port`) to a single
//! [`TransportLink`] so that every session addressed through the same cable
//! serializes on the same lock.
//!
//! The registry is an ordinary value owned by the application (usually in an
//! `Arc`) rather than a process-wide static, so tests and independent
//! subsystems get their own set of links.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::transport::TransportLink;

/// Boxed link opener, as produced by [`LinkConfig::opener`](crate::LinkConfig::opener).
pub type OpenFuture = BoxFuture<'static, LinkResult<TransportLink>>;

type Slot = Arc<OnceCell<Arc<TransportLink>>>;

/// Map from endpoint identity to its shared link.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    // Only held for map lookups, never across an await.
    links: Mutex<HashMap<String, Slot>>,
}

impl LinkRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the link for `endpoint`, opening it with `open` if absent.
    ///
    /// Concurrent acquires for the same endpoint run `open` once and share
    /// its result. Acquires for different endpoints do not wait on each
    /// other. A link that was closed behind the registry's back is replaced.
    ///
    /// # Errors
    ///
    /// `ConfigurationFailure` when `open` fails; nothing is registered.
    pub async fn acquire<F, Fut>(&self, endpoint: &str, open: F) -> LinkResult<Arc<TransportLink>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LinkResult<TransportLink>>,
    {
        let slot = self.slot(endpoint);
        let result = slot
            .get_or_try_init(|| async {
                let link = open().await.map_err(|e| {
                    if e.kind == ErrorKind::ConfigurationFailure {
                        e
                    } else {
                        LinkError::new(
                            ErrorKind::ConfigurationFailure,
                            format!("failed to open link {}", endpoint),
                        )
                        .caused_by(e)
                    }
                })?;
                tracing::info!(endpoint, "Registered shared link");
                Ok::<_, LinkError>(Arc::new(link))
            })
            .await;

        match result {
            Ok(link) => Ok(link.clone()),
            Err(e) => {
                self.forget_slot(endpoint, &slot);
                Err(e)
            }
        }
    }

    fn slot(&self, endpoint: &str) -> Slot {
        let mut links = self.links.lock();
        if let Some(slot) = links.get(endpoint) {
            match slot.get() {
                Some(link) if link.is_closed() => {
                    tracing::warn!(endpoint, "Registered link was closed, reopening");
                }
                _ => return slot.clone(),
            }
        }
        let slot = Slot::default();
        links.insert(endpoint.to_string(), slot.clone());
        slot
    }

    // Remove a slot whose open failed, unless another acquire already replaced it.
    fn forget_slot(&self, endpoint: &str, slot: &Slot) {
        let mut links = self.links.lock();
        if links
            .get(endpoint)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.get().is_none())
        {
            links.remove(endpoint);
        }
    }

    /// Link for `endpoint`, if one is open.
    pub fn get(&self, endpoint: &str) -> Option<Arc<TransportLink>> {
        self.links
            .lock()
            .get(endpoint)
            .and_then(|slot| slot.get().cloned())
    }

    /// Close the link for `endpoint` and forget it.
    ///
    /// Returns whether a link was registered.
    ///
    /// # Errors
    ///
    /// `Io` if the medium fails to shut down; the link is forgotten anyway.
    pub async fn release(&self, endpoint: &str) -> LinkResult<bool> {
        let slot = self.links.lock().remove(endpoint);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(link) => {
                link.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close and forget every link.
    ///
    /// # Errors
    ///
    /// The first shutdown error; every link is closed regardless.
    pub async fn close_all(&self) -> LinkResult<()> {
        let slots: Vec<Slot> = self.links.lock().drain().map(|(_, slot)| slot).collect();
        let count = slots.len();
        let mut first_error = None;
        for link in slots.iter().filter_map(|slot| slot.get()) {
            if let Err(e) = link.close().await {
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(count, "Closed all shared links");
        first_error.map_or(Ok(()), Err)
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.links.lock().values().filter(|slot| slot.initialized()).count()
    }

    /// Whether no link is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered endpoints, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self
            .links
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints
    }
}
