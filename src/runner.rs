//! Watch-stream wiring that turns cluster events into reconcile keys.

use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube_client::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use tokio_util::sync::CancellationToken;

use crate::api::Credential;
use crate::config::Settings;
use crate::index::CredentialIndex;
use crate::reconciler::{reconcile, Context, ReconcileKey};

/// Runs the credential reconciler until the token is cancelled.
///
/// Credential events reconcile their own key; config map events are
/// routed through the index back to the keys of the owning credentials.
/// A failed reconcile is redelivered with backoff; watch errors are
/// logged and the underlying watcher restarts itself.
pub async fn run(client: Client, settings: Settings, shutdown: CancellationToken) {
    let index = Arc::new(CredentialIndex::default());
    let context = Arc::new(Context {
        client: client.clone(),
        settings,
        index: Arc::clone(&index),
    });

    let credentials: Api<Credential> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client);

    let credential_keys = watcher(credentials, watcher::Config::default())
        .touched_objects()
        .map_ok(|credential| vec![ReconcileKey::from_resource(&credential)]);

    let config_map_keys =
        watcher(config_maps, watcher::Config::default()).map_ok(move |event| match event {
            watcher::Event::Applied(config_map) => index.apply(&config_map),
            watcher::Event::Deleted(config_map) => index.forget(&config_map),
            watcher::Event::Restarted(config_maps) => index.replace_all(&config_maps),
        });

    let workers = context.settings.workers;
    let deliveries = stream::select(credential_keys, config_map_keys).for_each_concurrent(
        workers,
        |delivery| {
            let context = Arc::clone(&context);
            async move {
                match delivery {
                    Ok(keys) => {
                        for key in keys {
                            deliver(&context, &key).await;
                        }
                    }
                    Err(error) => log::warn!("watch stream error: {error}"),
                }
            }
        },
    );

    tokio::select! {
        _ = deliveries => {}
        _ = shutdown.cancelled() => log::info!("credential reconciler shutting down"),
    }
}

async fn deliver(context: &Context, key: &ReconcileKey) {
    let mut delay = context.settings.delivery_backoff;
    for attempt in 1..=context.settings.delivery_attempts {
        match reconcile(context, key).await {
            Ok(()) => return,
            Err(error) if attempt == context.settings.delivery_attempts => {
                log::error!("giving up on credential {key} after {attempt} deliveries: {error}");
            }
            Err(error) => {
                log::warn!("reconcile of credential {key} failed, redelivering: {error}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
