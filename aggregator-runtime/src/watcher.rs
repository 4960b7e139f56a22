//! Watches a resource for changes, with error recovery

use aggregator_client::{ClusterClient, ErrorResponse, WatchStream};
use aggregator_core::Selector;
use educe::Educe;
use futures::{Stream, StreamExt};
use kube::core::{ApiResource, DynamicObject, TypeMeta, WatchEvent};
use thiserror::Error;

/// Errors surfaced by the [`watcher`]; the stream recovers on the next poll
#[derive(Error, Debug)]
pub enum Error {
    /// The listing that (re)starts a watch failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] aggregator_client::Error),
    /// The watch request was rejected
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] aggregator_client::Error),
    /// The server reported an error inside the watch stream
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch connection broke
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] aggregator_client::Error),
}

impl Error {
    /// Whether the resource cannot be watched by us at all, so retrying is pointless
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::InitialListFailed(err) | Self::WatchStartFailed(err) => err.is_unavailable(),
            Self::WatchError(_) | Self::WatchFailed(_) => false,
        }
    }
}

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone)]
pub enum Event<K = DynamicObject> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: Deletes can be missed while the watcher is down; a following
    /// [`Restarted`](Event::Restarted) is what reconciles them.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

#[derive(Educe)]
#[educe(Debug)]
/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The Watcher is empty, and the next poll will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the server ends the stream then we resume watching from the last seen
    /// resource version by returning to `InitListed`.
    /// If the connection breaks, or we fall out of the watch window, then we propagate
    /// the error and fall back to doing a re-list with `Empty`.
    Watching {
        resource_version: String,
        #[educe(Debug(ignore))]
        stream: WatchStream,
    },
}

struct Params<C> {
    client: C,
    resource: ApiResource,
    selector: Option<Selector>,
}

// Items of a list response carry no type meta of their own
fn with_types(mut obj: DynamicObject, resource: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    obj
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<C: ClusterClient>(params: &Params<C>, state: State) -> (Option<Result<Event>>, State) {
    match state {
        State::Empty => match params.client.list(&params.resource, params.selector.as_ref()).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.unwrap_or_default();
                let objects = list
                    .items
                    .into_iter()
                    .map(|obj| with_types(obj, &params.resource))
                    .collect();
                (Some(Ok(Event::Restarted(objects))), State::InitListed {
                    resource_version,
                })
            }
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { resource_version } => {
            match params
                .client
                .watch(&params.resource, params.selector.as_ref(), &resource_version)
                .await
            {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream,
                }),
                Err(err) => {
                    // an expired cursor cannot be resumed from
                    let new_state = if err.is_gone() {
                        State::Empty
                    } else {
                        State::InitListed { resource_version }
                    };
                    (Some(Err(Error::WatchStartFailed(err))), new_state)
                }
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.metadata.resource_version.clone().unwrap_or(resource_version);
                let obj = with_types(obj, &params.resource);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.metadata.resource_version.clone().unwrap_or(resource_version);
                let obj = with_types(obj, &params.resource);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.metadata.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // HTTP GONE, means we have desynced and need to start over and re-list :(
                let new_state = if err.code == 410 {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            // events may have been lost with the connection
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::Empty),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<C: ClusterClient>(params: &Params<C>, mut state: State) -> (Result<Event>, State) {
    loop {
        match step_trampolined(params, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource for changes continuously
///
/// Starts with a full list emitted as [`Event::Restarted`], then forwards
/// watch events in the order the server sends them. Only objects matching
/// `selector` are seen; an object that stops matching is reported as deleted.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// Apply your own backoff by not polling the stream for a duration after errors,
/// for example with [`StreamBackoff`](kube::runtime::utils::StreamBackoff).
///
/// # Recovery
///
/// If the server closes the watch, it is restarted from the last seen resource
/// version and simply resumes. If the connection breaks, or the resource version
/// has expired (`410 Gone`), we start over with a fresh list and an
/// [`Event::Restarted`], so missed events heal.
pub fn watcher<C: ClusterClient>(
    client: C,
    resource: ApiResource,
    selector: Option<Selector>,
) -> impl Stream<Item = Result<Event>> + Send {
    let params = Params {
        client,
        resource,
        selector,
    };
    futures::stream::unfold((params, State::Empty), |(params, state)| async {
        let (event, state) = step(&params, state).await;
        Some((event, (params, state)))
    })
}
