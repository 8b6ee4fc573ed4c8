//! Local, watch-driven mirror of all [`SparkApplication`]s
//!
//! The cache is only ever written by [`ApplicationCache::run`], which consumes a watch
//! stream and tells an [`ApplicationEventHandler`] about applications that appeared or
//! vanished.

use crate::error::{CacheSyncTimeoutSnafu, Error};
use crate::spark_controller::application_key;
use fnv::FnvHashMap;
use futures::{Stream, StreamExt};
use stackable_operator::kube::runtime::watcher;
use stackable_spark_k8s_crd::SparkApplication;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Read access to the locally cached applications
pub trait ApplicationStore: Send + Sync {
    /// Looks up an application by its `namespace/name` key
    fn get_by_key(&self, key: &str) -> Result<Option<SparkApplication>, Error>;
}

/// Callbacks for applications entering or leaving the cache
pub trait ApplicationEventHandler: Send + Sync {
    fn on_add(&self, app: &SparkApplication);
    fn on_delete(&self, app: &SparkApplication);
}

#[derive(Clone)]
pub struct ApplicationCache {
    apps: Arc<RwLock<FnvHashMap<String, SparkApplication>>>,
    synced: Arc<watch::Sender<bool>>,
}

impl Default for ApplicationCache {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        ApplicationCache {
            apps: Arc::default(),
            synced: Arc::new(synced),
        }
    }
}

fn key_of(app: &SparkApplication) -> String {
    application_key(
        app.metadata.namespace.as_deref().unwrap_or_default(),
        app.metadata.name.as_deref().unwrap_or_default(),
    )
}

impl ApplicationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the first full listing has been applied to the cache
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), Error> {
        let mut synced = self.synced.subscribe();
        let wait = async {
            while !*synced.borrow_and_update() {
                if synced.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CacheSyncTimeoutSnafu.build())?;
        if self.has_synced() {
            Ok(())
        } else {
            CacheSyncTimeoutSnafu.fail()
        }
    }

    /// Consumes `events` until the stream ends, keeping the cache up to date
    pub async fn run<S>(&self, events: S, handler: Arc<dyn ApplicationEventHandler>)
    where
        S: Stream<Item = Result<watcher::Event<SparkApplication>, watcher::Error>>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.apply(event, handler.as_ref()),
                // The watcher recovers by itself, the next successful listing restarts it
                Err(err) => warn!("SparkApplication watch failed: {}", err),
            }
        }
        debug!("SparkApplication watch stream ended");
    }

    fn apply(&self, event: watcher::Event<SparkApplication>, handler: &dyn ApplicationEventHandler) {
        match event {
            watcher::Event::Applied(app) => {
                let previous = self.write().insert(key_of(&app), app.clone());
                if previous.is_none() {
                    handler.on_add(&app);
                }
            }
            watcher::Event::Deleted(app) => {
                self.write().remove(&key_of(&app));
                handler.on_delete(&app);
            }
            watcher::Event::Restarted(apps) => {
                let listed = apps
                    .into_iter()
                    .map(|app| (key_of(&app), app))
                    .collect::<FnvHashMap<_, _>>();
                let previous = std::mem::replace(&mut *self.write(), listed.clone());

                for (key, app) in &previous {
                    if !listed.contains_key(key) {
                        handler.on_delete(app);
                    }
                }
                for (key, app) in &listed {
                    if !previous.contains_key(key) {
                        handler.on_add(app);
                    }
                }
                self.synced.send_replace(true);
            }
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FnvHashMap<String, SparkApplication>> {
        self.apps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ApplicationStore for ApplicationCache {
    fn get_by_key(&self, key: &str) -> Result<Option<SparkApplication>, Error> {
        let apps = self
            .apps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(apps.get(key).cloned())
    }
}
