//! Builders shared by the unit tests.

use std::collections::BTreeMap;

use crate::model::{
    labels, Container, GameDeployment, GameDeploymentSpec, InstanceSpec, InstanceTemplate,
    LabelSelector, ObjectMeta, WorkloadInstance,
};

pub(crate) const NAMESPACE: &str = "games";

pub(crate) fn template(app: &str, image: &str) -> InstanceTemplate {
    InstanceTemplate {
        labels: BTreeMap::from([("app".to_string(), app.to_string())]),
        annotations: BTreeMap::new(),
        spec: InstanceSpec {
            containers: vec![Container {
                name: "server".into(),
                image: image.into(),
                ..Default::default()
            }],
            ..Default::default()
        },
    }
}

pub(crate) fn deployment(name: &str, replicas: i32, image: &str) -> GameDeployment {
    GameDeployment {
        meta: ObjectMeta::named(NAMESPACE, name),
        spec: GameDeploymentSpec {
            replicas,
            selector: LabelSelector::from_labels([("app", name)]),
            template: template(name, image),
            scale_strategy: Default::default(),
            update_strategy: Default::default(),
            pre_delete_hook: None,
            min_ready_seconds: 0,
            revision_history_limit: None,
        },
        status: None,
    }
}

/// An instance of `deploy` on `revision`, as the scale engine would build it.
pub(crate) fn instance(deploy: &GameDeployment, revision: &str, identity: &str) -> WorkloadInstance {
    let mut meta = ObjectMeta::named(NAMESPACE, format!("{}-{identity}", deploy.name()));
    meta.labels = deploy.spec.template.labels.clone();
    meta.labels
        .insert(labels::DEPLOYMENT.into(), deploy.name().to_string());
    meta.labels
        .insert(labels::REVISION_HASH.into(), revision.to_string());
    meta.labels
        .insert(labels::INSTANCE_ID.into(), identity.to_string());
    meta.owner_references.push(deploy.owner_reference());
    WorkloadInstance {
        meta,
        spec: deploy.spec.template.spec.clone(),
        status: Default::default(),
    }
}
