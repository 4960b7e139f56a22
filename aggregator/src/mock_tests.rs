use std::time::Duration;

use aggregator_core::{ComponentRef, Operator};
use aggregator_runtime::{
    wait::{await_condition, await_within, conditions},
    Controller, ControllerConfig,
};
use aggregator_test::{fixtures, FakeCluster};
use backon::ExponentialBuilder;
use kube::core::{ApiResource, DynamicObject};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{client::ClusterClient, runtime::wait::Condition};

const KEY: &str = "operators.coreos.com/o";

#[tokio::test]
async fn labeled_components_follow_their_labels() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());

    ctrl.wait("o", conditions::has_component_selector(KEY).and(conditions::references_exactly([])))
        .await;

    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;

    cluster.apply(fixtures::namespace("ns-b"));
    cluster.apply(fixtures::labeled(fixtures::service_account("ns-a", "sa-a"), KEY));
    cluster.apply(fixtures::labeled(fixtures::service_account("ns-b", "sa-b"), KEY));
    ctrl.wait(
        "o",
        conditions::references_exactly([
            namespace("ns-a"),
            service_account("ns-a", "sa-a"),
            service_account("ns-b", "sa-b"),
        ]),
    )
    .await;

    // unlabeling removes only that object
    cluster.apply(fixtures::service_account("ns-b", "sa-b"));
    ctrl.wait(
        "o",
        conditions::references_exactly([namespace("ns-a"), service_account("ns-a", "sa-a")]),
    )
    .await;

    // the namespace takes its service account with it
    cluster.delete(&fixtures::namespace_kind(), None, "ns-a");
    ctrl.wait("o", conditions::references_exactly([])).await;
    ctrl.stop().await;
}

#[tokio::test]
async fn installation_is_adopted_through_owner_references() {
    let cluster = FakeCluster::with_default_kinds();
    let sub = cluster.apply(fixtures::subscription("operators", "kiali", "kiali"));
    let csv = cluster.apply(fixtures::owned_by(
        fixtures::csv("operators", "kiali-operator.v1.4.2"),
        &sub,
    ));
    cluster.apply(fixtures::owned_by(
        fixtures::service_account("operators", "kiali-operator"),
        &csv,
    ));
    cluster.apply(fixtures::owned_by(fixtures::crd("kialis.kiali.io"), &csv));
    cluster.apply(fixtures::owned_by(
        fixtures::crd("monitoringdashboards.monitoring.kiali.io"),
        &csv,
    ));
    // owned by an installation of another package
    let other = cluster.apply(fixtures::subscription("operators", "etcd", "etcd"));
    cluster.apply(fixtures::owned_by(fixtures::service_account("operators", "etcd"), &other));
    cluster.apply(fixtures::operator("kiali.operators"));
    let ctrl = Harness::start(&cluster, fast_config());

    let operator = ctrl
        .wait(
            "kiali.operators",
            conditions::references_exactly([
                reference(&sub),
                reference(&csv),
                service_account("operators", "kiali-operator"),
                crd("kialis.kiali.io"),
                crd("monitoringdashboards.monitoring.kiali.io"),
            ]),
        )
        .await;
    let components = conditions::components_of(&operator).unwrap();
    let csv_ref = components
        .refs
        .iter()
        .find(|r| r.reference.kind == "ClusterServiceVersion")
        .unwrap();
    assert_eq!(csv_ref.conditions[0].type_, "Succeeded");
    assert_eq!(csv_ref.conditions[0].status, "True");

    // a new dependent of the installation is picked up
    cluster.apply(fixtures::owned_by(
        fixtures::service_account("operators", "kiali-extra"),
        &csv,
    ));
    ctrl.wait(
        "kiali.operators",
        conditions::references(service_account("operators", "kiali-extra")),
    )
    .await;
    ctrl.stop().await;
}

#[tokio::test]
async fn relisting_after_expiry_heals_missed_deletes() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-b"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a"), namespace("ns-b")]))
        .await;

    cluster.delete_unobserved(&fixtures::namespace_kind(), None, "ns-b");
    cluster.expire_watches();
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;
    ctrl.stop().await;
}

#[tokio::test]
async fn broken_watches_recover() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-b"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a"), namespace("ns-b")]))
        .await;
    // the labeled and the shared adoption watch are both open
    eventually(|| cluster.watch_count(&fixtures::namespace_kind()) == 2).await;

    // a delete lost with the connection is healed by the relist
    cluster.delete_unobserved(&fixtures::namespace_kind(), None, "ns-b");
    cluster.break_watches();
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;

    cluster.apply(fixtures::labeled(fixtures::namespace("ns-c"), KEY));
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a"), namespace("ns-c")]))
        .await;
    ctrl.stop().await;
}

#[tokio::test]
async fn overwritten_status_is_restored() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());
    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // someone else clears the status
    let operators = ApiResource::erase::<Operator>(&());
    let mut op = cluster.get_object(&fixtures::operator_kind(), None, "o").unwrap();
    if let Some(data) = op.data.as_object_mut() {
        data.remove("status");
    }
    cluster.replace_status(&operators, &op).await.unwrap();
    let cleared = cluster.get_object(&fixtures::operator_kind(), None, "o").unwrap();
    assert!(conditions::components_of(&cleared).is_none());
    let writes = cluster.status_writes();

    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;
    assert!(cluster.status_writes() > writes);
    ctrl.stop().await;
}

#[tokio::test]
async fn adoption_watches_are_shared() {
    let cluster = FakeCluster::with_default_kinds();
    for name in ["a", "b", "c"] {
        cluster.apply(fixtures::operator(name));
    }
    let ctrl = Harness::start(&cluster, fast_config());
    for name in ["a", "b", "c"] {
        ctrl.wait(name, conditions::has_components()).await;
    }
    // one labeled watch per operator plus a single unfiltered one
    eventually(|| cluster.watch_count(&fixtures::namespace_kind()) == 4).await;
    ctrl.stop().await;
}

#[tokio::test]
async fn forbidden_kinds_are_skipped_until_allowed() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.forbid(&fixtures::service_account_kind());
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::labeled(fixtures::service_account("ns-a", "sa-a"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());

    ctrl.wait("o", conditions::references_exactly([namespace("ns-a")]))
        .await;

    cluster.allow(&fixtures::service_account_kind());
    ctrl.wait(
        "o",
        conditions::references_exactly([namespace("ns-a"), service_account("ns-a", "sa-a")]),
    )
    .await;
    ctrl.stop().await;
}

#[tokio::test]
async fn status_conflicts_are_retried() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.inject_status_conflicts(3);
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());

    ctrl.wait("o", conditions::references(namespace("ns-a"))).await;
    ctrl.stop().await;
}

#[tokio::test]
async fn deleting_the_operator_stops_its_watches() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());
    ctrl.wait("o", conditions::has_components()).await;
    // its labeled watch and the shared adoption watch
    eventually(|| cluster.watch_count(&fixtures::namespace_kind()) == 2).await;

    let uid = cluster
        .delete(&fixtures::operator_kind(), None, "o")
        .and_then(|op| op.metadata.uid)
        .unwrap();
    assert!(ctrl.wait_for("o", conditions::is_deleted(&uid)).await.is_none());
    eventually(|| cluster.watch_count(&fixtures::namespace_kind()) == 1).await;
    ctrl.stop().await;
}

#[tokio::test]
async fn recreated_operators_are_tracked_again() {
    let cluster = FakeCluster::with_default_kinds();
    cluster.apply(fixtures::labeled(fixtures::namespace("ns-a"), KEY));
    cluster.apply(fixtures::operator("o"));
    let ctrl = Harness::start(&cluster, fast_config());
    ctrl.wait("o", conditions::references(namespace("ns-a"))).await;

    cluster.delete(&fixtures::operator_kind(), None, "o");
    cluster.apply(fixtures::operator("o"));
    ctrl.wait("o", conditions::references(namespace("ns-a"))).await;
    ctrl.stop().await;
}

#[tokio::test]
async fn subscriptions_get_their_operator() {
    let cluster = FakeCluster::with_default_kinds();
    let sub = cluster.apply(fixtures::subscription("operators", "kiali", "kiali"));
    let config = ControllerConfig {
        ensure_package_operators: true,
        ..fast_config()
    };
    let ctrl = Harness::start(&cluster, config);

    ctrl.wait("kiali.operators", conditions::references(reference(&sub)))
        .await;
    ctrl.stop().await;
}

// ------------------------------------------------------------------------
// controller harness cruft
// ------------------------------------------------------------------------

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        quiescence: Duration::from_millis(20),
        max_publish_delay: Duration::from_millis(200),
        retry_after: Duration::from_millis(50),
        watch_backoff: ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(50))
            .without_max_times(),
        kind_refresh_interval: Duration::from_millis(100),
        ..ControllerConfig::default()
    }
}

/// A controller running against a fake cluster until stopped
struct Harness {
    cluster: FakeCluster,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(cluster: &FakeCluster, config: ControllerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(cluster.clone(), config);
        let handle = tokio::spawn(controller.run(shutdown.clone()));
        Self {
            cluster: cluster.clone(),
            shutdown,
            handle,
        }
    }

    /// Wait for the operator `name` to satisfy `condition`, returning it as it was then
    async fn wait_for(&self, name: &str, condition: impl Condition<DynamicObject>) -> Option<DynamicObject> {
        let operators = ApiResource::erase::<Operator>(&());
        let wait = await_condition(self.cluster.clone(), operators, None, name, condition);
        await_within(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|err| panic!("waiting on operator {name}: {err}"))
    }

    async fn wait(&self, name: &str, condition: impl Condition<DynamicObject>) -> DynamicObject {
        self.wait_for(name, condition)
            .await
            .unwrap_or_else(|| panic!("operator {name} does not exist"))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller did not shut down")
            .expect("controller panicked");
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn namespace(name: &str) -> ComponentRef {
    ComponentRef {
        api_version: "v1".into(),
        kind: "Namespace".into(),
        namespace: None,
        name: name.into(),
    }
}

fn service_account(namespace: &str, name: &str) -> ComponentRef {
    ComponentRef {
        api_version: "v1".into(),
        kind: "ServiceAccount".into(),
        namespace: Some(namespace.into()),
        name: name.into(),
    }
}

fn crd(name: &str) -> ComponentRef {
    ComponentRef {
        api_version: "apiextensions.k8s.io/v1".into(),
        kind: "CustomResourceDefinition".into(),
        namespace: None,
        name: name.into(),
    }
}

fn reference(obj: &DynamicObject) -> ComponentRef {
    ComponentRef::from_object(obj).unwrap()
}
