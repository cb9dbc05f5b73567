use std::fmt::Debug;

use fakelet_core::WatchEvent;
use futures::{stream, Stream, StreamExt};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Flatten one watcher event into controller observations.
pub fn to_watch_events<K>(event: Event<K>) -> Vec<WatchEvent<K>> {
    match event {
        Event::Applied(o) => vec![WatchEvent::Modified(o)],
        Event::Deleted(o) => vec![WatchEvent::Deleted(o)],
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            list.into_iter().map(WatchEvent::Sync).collect()
        }
    }
}

/// List+watch `api` forever, with the default backoff between failures.
pub fn watch<K>(api: Api<K>, config: watcher::Config) -> impl Stream<Item = WatchEvent<K>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, config)
        .default_backoff()
        .filter_map(|res| async move {
            match res {
                Ok(ev) => Some(stream::iter(to_watch_events(ev))),
                Err(e) => {
                    warn!(error = %e, "watch failed");
                    None
                }
            }
        })
        .flatten()
}
