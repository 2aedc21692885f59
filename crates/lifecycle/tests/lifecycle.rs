use std::time::Duration;

use kform_core::{Attributes, CallKind, Error, Identity, StateRecord};
use kform_lifecycle::{
    Call, ControlApi, Controller, ControllerConfig, DeploymentKind, Existence, MockControl, Propagation, ResourceData,
    RoleKind,
};
use serde_json::{json, Value};

fn config() -> ControllerConfig {
    ControllerConfig {
        create_timeout: Duration::from_secs(5),
        update_timeout: Duration::from_secs(5),
        delete_timeout: Duration::from_secs(5),
        poll_initial: Duration::from_millis(10),
        poll_max: Duration::from_millis(50),
        ..ControllerConfig::default()
    }
}

fn web(replicas: i64) -> Value {
    json!({
        "metadata": [{ "name": "web", "labels": { "app": "web" } }],
        "spec": [{
            "replicas": replicas,
            "template": [{
                "metadata": [{ "labels": { "app": "web" } }],
                "spec": [{ "container": [{ "name": "web", "image": "nginx:1.25" }] }]
            }]
        }]
    })
}

fn deployments() -> Controller<DeploymentKind, MockControl<DeploymentKind>> {
    Controller::new(MockControl::rolling(), config())
}

async fn created(ctl: &Controller<DeploymentKind, MockControl<DeploymentKind>>, replicas: i64) -> ResourceData {
    let mut data = ResourceData::new(web(replicas));
    ctl.create(&mut data).await.unwrap();
    data
}

#[tokio::test(start_paused = true)]
async fn create_defaults_namespace_waits_and_reads_back() {
    let ctl = deployments();
    let data = created(&ctl, 3).await;

    assert_eq!(data.id, Some(Identity::new("default", "web").unwrap()));
    assert_eq!(data.config["metadata"][0]["namespace"], "default");
    assert_eq!(data.config["metadata"][0]["uid"], "mock-uid-1");
    assert_eq!(data.config["status"][0]["replicas"], 3);
    assert_eq!(data.config["spec"][0]["selector"], json!({ "app": "web" }));

    let kinds: Vec<CallKind> = ctl.api().calls().iter().map(Call::kind).collect();
    assert_eq!(kinds, vec![CallKind::Create, CallKind::Get, CallKind::Get, CallKind::Get, CallKind::Get]);
}

#[tokio::test(start_paused = true)]
async fn failed_create_never_sets_identity() {
    let ctl = deployments();
    ctl.api().fail(CallKind::Create, || Error::external(CallKind::Create, "deployment", "forbidden"));
    let mut data = ResourceData::new(web(1));
    let err = ctl.create(&mut data).await.unwrap_err();
    assert!(matches!(err, Error::ExternalCallFailed { call: CallKind::Create, .. }));
    assert!(data.id.is_none());
    assert_eq!(ctl.api().calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn convergence_timeout_keeps_identity() {
    // No progress hook: observed replicas stay at zero.
    let ctl = Controller::<DeploymentKind, _>::new(
        MockControl::<DeploymentKind>::new(),
        ControllerConfig { create_timeout: Duration::from_millis(200), ..config() },
    );
    let mut data = ResourceData::new(web(2));
    let err = ctl.create(&mut data).await.unwrap_err();
    match err {
        Error::Timeout { last, .. } => assert_eq!(last.map(|p| (p.observed, p.desired)), Some((0, 2))),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(data.id.as_ref().map(ToString::to_string).as_deref(), Some("default/web"));
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_fails_before_any_call() {
    let ctl = deployments();
    let mut data = ResourceData::new(json!({ "metadata": [{ "name": "web" }] }));
    assert!(matches!(ctl.create(&mut data).await, Err(Error::InvalidShape(_))));
    assert!(ctl.api().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_drains_to_zero_before_deleting() {
    let ctl = deployments();
    let mut data = created(&ctl, 3).await;
    let before = ctl.api().calls().len();

    ctl.delete(&mut data).await.unwrap();
    assert!(data.id.is_none());
    assert!(ctl.api().object("default", "web").is_none());

    let calls = ctl.api().calls().split_off(before);
    assert_eq!(
        calls.first(),
        Some(&Call::Patch {
            namespace: "default".into(),
            name: "web".into(),
            ops: json!([{ "op": "replace", "path": "/spec/replicas", "value": 0 }]),
        })
    );
    assert_eq!(
        calls.last(),
        Some(&Call::Delete { namespace: "default".into(), name: "web".into(), propagation: Propagation::Foreground })
    );
    let middle = &calls[1..calls.len() - 1];
    assert_eq!(middle.len(), 3, "3 -> 2 -> 1 -> 0 takes three polls");
    assert!(middle.iter().all(|c| c.kind() == CallKind::Get));
}

#[tokio::test(start_paused = true)]
async fn exists_maps_not_found_and_other_errors() {
    let ctl = deployments();
    let ghost = ResourceData { id: Some(Identity::new("default", "ghost").unwrap()), config: Value::Null };
    assert!(matches!(ctl.exists(&ghost).await, (false, None)));

    ctl.api().fail(CallKind::Get, || Error::external(CallKind::Get, "deployment", "connection refused"));
    let (exists, err) = ctl.exists(&ghost).await;
    assert!(exists);
    assert!(matches!(err, Some(Error::ExternalCallFailed { call: CallKind::Get, .. })));
    assert!(matches!(ctl.probe(&ghost).await, Existence::Unknown(_)));

    assert!(matches!(ctl.probe(&ResourceData::default()).await, Existence::Absent));
}

#[tokio::test(start_paused = true)]
async fn exists_reports_created_resource() {
    let ctl = deployments();
    let data = created(&ctl, 1).await;
    assert!(matches!(ctl.probe(&data).await, Existence::Present));
}

#[tokio::test(start_paused = true)]
async fn read_surfaces_not_found() {
    let ctl = deployments();
    let mut data = created(&ctl, 1).await;
    ctl.api().delete("default", "web", Propagation::Background).await.unwrap();
    let err = ctl.read(&mut data).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn unchanged_update_sends_no_patch() {
    let ctl = deployments();
    let mut data = created(&ctl, 2).await;
    assert!(ctl.plan(&data.config, &web(2)).unwrap().is_empty());

    let before = ctl.api().calls().len();
    ctl.update(&mut data, &web(2)).await.unwrap();
    let calls = ctl.api().calls().split_off(before);
    assert!(calls.iter().all(|c| c.kind() == CallKind::Get));
}

#[tokio::test(start_paused = true)]
async fn update_patches_labels_per_key_and_replaces_spec() {
    let ctl = deployments();
    let mut data = created(&ctl, 2).await;

    let mut next = web(4);
    next["metadata"][0]["labels"]["tier"] = json!("frontend");
    let before = ctl.api().calls().len();
    ctl.update(&mut data, &next).await.unwrap();

    let calls = ctl.api().calls().split_off(before);
    let Some(Call::Patch { ops, .. }) = calls.first() else { panic!("expected a patch first, got {:?}", calls) };
    let paths: Vec<&str> = ops.as_array().unwrap().iter().map(|op| op["path"].as_str().unwrap()).collect();
    assert_eq!(paths, vec!["/metadata/labels/tier", "/spec"]);
    assert_eq!(ops[1]["op"], "replace");

    let live = ctl.api().object("default", "web").unwrap();
    assert_eq!(live.spec.as_ref().and_then(|s| s.replicas), Some(4));
    assert_eq!(live.metadata.labels.as_ref().unwrap()["tier"], "frontend");
    assert_eq!(data.config["status"][0]["replicas"], 4);
    assert_eq!(data.config["metadata"][0]["labels"], json!({ "app": "web", "tier": "frontend" }));
}

#[tokio::test(start_paused = true)]
async fn update_without_spec_is_invalid_shape_and_sends_nothing() {
    let ctl = deployments();
    let mut data = created(&ctl, 2).await;
    let prior = data.config.clone();
    let before = ctl.api().calls().len();

    let next = json!({ "metadata": [{ "name": "web" }] });
    assert!(matches!(ctl.update(&mut data, &next).await, Err(Error::InvalidShape(_))));
    assert!(matches!(ctl.plan(&prior, &next), Err(Error::InvalidShape(_))));
    assert_eq!(ctl.api().calls().len(), before);
    assert_eq!(data.config, prior);
}

#[tokio::test(start_paused = true)]
async fn first_annotation_keeps_server_annotations() {
    let ctl = deployments();
    let mut data = created(&ctl, 2).await;
    let mut live = ctl.api().object("default", "web").unwrap();
    live.metadata.annotations = Some([("deployment.kubernetes.io/revision".to_string(), "1".to_string())].into());
    ctl.api().insert("default", live);

    let mut next = web(2);
    next["metadata"][0]["annotations"] = json!({ "owner": "team-a" });
    let before = ctl.api().calls().len();
    ctl.update(&mut data, &next).await.unwrap();

    let calls = ctl.api().calls().split_off(before);
    assert_eq!(calls[0].kind(), CallKind::Get);
    assert_eq!(
        calls[1],
        Call::Patch {
            namespace: "default".into(),
            name: "web".into(),
            ops: json!([{ "op": "add", "path": "/metadata/annotations/owner", "value": "team-a" }]),
        }
    );
    let annotations = ctl.api().object("default", "web").unwrap().metadata.annotations.unwrap();
    assert_eq!(annotations["deployment.kubernetes.io/revision"], "1");
    assert_eq!(annotations["owner"], "team-a");
    assert_eq!(data.config["metadata"][0]["annotations"], json!({ "owner": "team-a" }));
}

#[tokio::test(start_paused = true)]
async fn role_lifecycle_skips_drain() {
    let ctl = Controller::<RoleKind, _>::new(MockControl::<RoleKind>::new(), config());
    let mut data = ResourceData::new(json!({
        "metadata": [{ "name": "reader", "namespace": "team" }],
        "policy_rule": [{ "api_groups": [""], "resources": ["pods"], "verbs": ["get"] }]
    }));
    ctl.create(&mut data).await.unwrap();
    assert_eq!(data.id.as_ref().map(ToString::to_string).as_deref(), Some("team/reader"));

    let mut next = data.config.clone();
    next["policy_rule"][0]["verbs"] = json!(["get", "list"]);
    ctl.update(&mut data, &next).await.unwrap();
    let live = ctl.api().object("team", "reader").unwrap();
    assert_eq!(live.rules.unwrap()[0].verbs, vec!["get", "list"]);

    let before = ctl.api().calls().len();
    ctl.delete(&mut data).await.unwrap();
    let calls = ctl.api().calls().split_off(before);
    assert_eq!(
        calls,
        vec![Call::Delete { namespace: "team".into(), name: "reader".into(), propagation: Propagation::Background }]
    );
}

#[test]
fn stored_v0_record_loads_in_current_shape() {
    let ctl = deployments();
    let attributes: Attributes = [
        ("name", "web"),
        ("spec.#", "1"),
        ("spec.0.replicas", "2"),
        ("spec.0.template.#", "1"),
        ("spec.0.template.0.container.#", "1"),
        ("spec.0.template.0.container.0.name", "web"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let data = ctl.load(StateRecord { id: "default/web".into(), schema_version: 0, attributes }).unwrap();
    assert_eq!(data.id.as_ref().map(Identity::name), Some("web"));
    assert_eq!(data.config["metadata"][0]["name"], "web");
    assert_eq!(data.config["spec"][0]["template"][0]["spec"][0]["container"][0]["name"], "web");

    let stored = ctl.store(&data);
    assert_eq!(stored.schema_version, 2);
    assert_eq!(stored.attributes["spec.0.paused"], "false");
}

#[test]
fn newer_record_is_rejected_on_load() {
    let ctl = deployments();
    let attributes: Attributes = [("spec.#".to_string(), "1".to_string())].into();
    let err = ctl.load(StateRecord { id: String::new(), schema_version: 7, attributes }).unwrap_err();
    assert!(matches!(err, Error::UnknownVersion { found: 7, latest: 2, .. }));
}
