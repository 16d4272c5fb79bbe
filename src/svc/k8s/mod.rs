//! # Kubernetes module
//!
//! This module provide kubernetes custom resources, helpers and the
//! reconciliation loop plumbing

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

use crate::svc::{cfg::Configuration, provider};

pub mod client;
pub mod finalizer;
#[cfg(test)]
pub mod mock;
pub mod recorder;
pub mod resource;
pub mod secret;

// -----------------------------------------------------------------------------
// Context structure

/// contains the clients and shared services given to each reconciler
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub strategies: Arc<provider::config::ConfigMapConfigManager>,
    pub providers: Arc<provider::Registry>,
    pub config: Arc<Configuration>,
}

impl Context {
    pub fn new(
        kube: kube::Client,
        strategies: Arc<provider::config::ConfigMapConfigManager>,
        providers: Arc<provider::Registry>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            kube,
            strategies,
            providers,
            config,
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug + 'static,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, context: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the two halves of the reconcile function given to a kubernetes
/// controller [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync;

    /// create or update the resource and its third-party counterpart, returns
    /// the next action to schedule
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// delete the third-party counterpart and release the resource, returns
    /// the next action to schedule
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// returns a [`Action`] to perform following the given error
    fn retry(obj: Arc<T>, err: &Self::Error, _ctx: Arc<Context>) -> Action {
        // Re-schedule the event 500 ms later, recovery is driven by
        // re-invocation of the same idempotent workflow
        trace!(
            name = obj.name_any(),
            duration = 500,
            error = err.to_string(),
            "Requeue failed reconciliation",
        );

        Action::requeue(Duration::from_millis(500))
    }

    /// process the resource, routing deletion events to [`Self::delete`] and
    /// everything else to [`Self::upsert`]
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();

        if resource::deleted(&*obj) {
            info!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                "Received deletion event for custom resource",
            );

            return Self::delete(ctx, obj.to_owned()).await.map_err(|err| {
                error!(
                    kind = &api_resource.kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to delete custom resource",
                );
                err
            });
        }

        info!(
            kind = &api_resource.kind,
            namespace = &namespace,
            name = &name,
            "Received upsertion event for custom resource",
        );

        Self::upsert(ctx, obj.to_owned()).await.map_err(|err| {
            error!(
                kind = &api_resource.kind,
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to upsert custom resource",
            );
            err
        })
    }
}

// -----------------------------------------------------------------------------
// WatcherError trait

/// group other trait needed to provide a default implementation for the
/// [`Watcher<T>`] trait
pub trait WatcherError:
    From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error
where
    Self: 'static,
{
}

/// Blanket implementation of [`WatcherError`]
impl<T> WatcherError for T
where
    T: From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error,
    Self: 'static,
{
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of kubernetes custom
/// resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
    <Self as Reconciler<T>>::Error: WatcherError + Send + Sync,
{
    type Error: WatcherError + Send + Sync;

    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, context: Arc<Context>) -> Result<(), <Self as Watcher<T>>::Error> {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(context.to_owned())
            .run(Self::reconcile, Self::retry, context)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return Ok(());
                }
                Ok(Some((obj, _action))) => {
                    info!(
                        kind = &api_resource.kind,
                        namespace = &obj.namespace,
                        name = &obj.name,
                        "Successfully reconcile resource",
                    );
                }
                Err(controller::Error::ObjectNotFound(obj_ref)) => {
                    debug!(
                        namespace = &obj_ref.namespace,
                        name = &obj_ref.name,
                        "Received an event about an already deleted resource",
                    );
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );
                }
            }

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanket implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    U::Error: WatcherError + Send + Sync,
    Self: Send + Sync + 'static,
{
    type Error = U::Error;
}
