use crate::{
    context::Context,
    reconcile::{
        self,
        ReconcileError,
    },
    resources::CloudflareTunnel,
    tunnel::{
        self,
        TUNNEL_FINALIZER,
    },
};
use futures::StreamExt as _;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    runtime::{
        controller::Action,
        finalizer,
        finalizer::Event,
        watcher,
        Controller,
    },
    Api,
    ResourceExt as _,
};
use std::sync::Arc;

pub struct ControllerState {
    pub client: kube::Client,
    pub context: Context,
}

/// Runs the Ingress and the CloudflareTunnel controller until a termination signal arrives.
pub async fn run(client: kube::Client, context: Context) {
    let state = Arc::new(ControllerState {
        client: client.clone(),
        context,
    });

    let ingresses = Controller::new(Api::<Ingress>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_ingress, ingress_error_policy, state.clone())
        .for_each(|msg| async move { debug!("Reconciled: {:?}", msg) });

    let tunnels = Controller::new(Api::<CloudflareTunnel>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_tunnel, tunnel_error_policy, state)
        .for_each(|msg| async move { info!("Reconciled: {:?}", msg) });

    futures::join!(ingresses, tunnels);
}

async fn reconcile_ingress(ingress: Arc<Ingress>, state: Arc<ControllerState>) -> Result<Action, ReconcileError> {
    let name = ingress.metadata.name.as_deref().ok_or(ReconcileError::MissingName)?;
    let ns = ingress.namespace().unwrap_or_default();
    reconcile::reconcile_ingress(&ns, name, &state.context).await
}

fn ingress_error_policy(_object: Arc<Ingress>, err: &ReconcileError, state: Arc<ControllerState>) -> Action {
    reconcile::error_action(err, &state.context)
}

async fn reconcile_tunnel(
    resource: Arc<CloudflareTunnel>,
    state: Arc<ControllerState>,
) -> Result<Action, finalizer::Error<ReconcileError>> {
    let ns = resource.namespace().unwrap_or_default();
    let api: Api<CloudflareTunnel> = Api::namespaced(state.client.clone(), &ns);

    finalizer(&api, TUNNEL_FINALIZER, resource, |event| async {
        let result = match event {
            Event::Apply(object) => tunnel::apply(&object, &state.context).await,
            Event::Cleanup(object) => tunnel::cleanup(&object, &state.context).await,
        };

        match result {
            Err(ReconcileError::Kube(kube::Error::Api(err))) if err.code == 409 => {
                warn!("Conflict when reconciling object: {err}");
                Ok(Action::requeue(state.context.error_requeue_interval))
            }
            result => result,
        }
    })
    .await
}

fn tunnel_error_policy(
    _object: Arc<CloudflareTunnel>,
    err: &finalizer::Error<ReconcileError>,
    state: Arc<ControllerState>,
) -> Action {
    match err {
        finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => {
            reconcile::error_action(err, &state.context)
        }
        err => {
            error!("Error reconciling: {:?}", err);
            Action::requeue(state.context.error_requeue_interval)
        }
    }
}
