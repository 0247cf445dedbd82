//! Deterministic pod name derivation.
//!
//! Pod identities are compared across operations, so every part of the engine derives names
//! through this module. The scheme is `<cluster>-<component>-<ordinal>` for pods of the default
//! template and `<cluster>-<component>-<template>-<ordinal>` for pods of a named instance template.
//! Ordinals count up from 0 per template and skip names listed as offline instances.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{Snafu, ensure};

use crate::crd::cluster::{InstanceTemplate, Ordinals};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "instance template {template:?} provides {available} ordinals but needs {replicas}"
    ))]
    OrdinalsMismatch {
        template: String,
        available: usize,
        replicas: i32,
    },

    #[snafu(display("invalid ordinal range {start}..={end} in instance template {template:?}"))]
    InvalidOrdinalRange {
        template: String,
        start: i32,
        end: i32,
    },

    #[snafu(display("instance name {name:?} is generated more than once"))]
    DuplicateInstanceName { name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Name of the workload that owns the pods of a component.
pub fn workload_name(cluster_name: &str, component_name: &str) -> String {
    format!("{cluster_name}-{component_name}")
}

/// Generates the sorted names of all pods of a component.
pub fn generate_pod_names(
    cluster_name: &str,
    component_name: &str,
    replicas: i32,
    templates: &[InstanceTemplate],
    offline_instances: &[String],
) -> Result<Vec<String>> {
    let parent = workload_name(cluster_name, component_name);
    let offline = offline_instances
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>();

    let mut names = Vec::new();
    let mut template_replicas = 0;
    for template in templates {
        let replicas = template.replicas().max(0);
        names.extend(generate_template_pod_names(
            &parent,
            &template.name,
            replicas,
            &offline,
            template.ordinals.as_ref(),
        )?);
        template_replicas += replicas;
    }
    if template_replicas < replicas {
        names.extend(generate_template_pod_names(
            &parent,
            "",
            replicas - template_replicas,
            &offline,
            None,
        )?);
    }

    let mut seen = BTreeSet::new();
    for name in &names {
        ensure!(seen.insert(name.as_str()), DuplicateInstanceNameSnafu { name });
    }

    names.sort_by(|left, right| {
        let (left_parent, left_ordinal) = parse_parent_name_and_ordinal(left);
        let (right_parent, right_ordinal) = parse_parent_name_and_ordinal(right);
        left_parent
            .cmp(right_parent)
            .then(left_ordinal.cmp(&right_ordinal))
    });
    Ok(names)
}

/// Generates all pod names of a component, mapped to the instance template they belong to. The
/// default template is named `""`.
pub fn generate_pod_name_set(
    cluster_name: &str,
    component_name: &str,
    replicas: i32,
    templates: &[InstanceTemplate],
    offline_instances: &[String],
) -> Result<BTreeMap<String, String>> {
    Ok(generate_pod_names(
        cluster_name,
        component_name,
        replicas,
        templates,
        offline_instances,
    )?
    .into_iter()
    .map(|name| {
        let template = instance_template_name(cluster_name, component_name, &name);
        (name, template)
    })
    .collect())
}

fn generate_template_pod_names(
    parent: &str,
    template_name: &str,
    replicas: i32,
    offline: &BTreeSet<&str>,
    ordinals: Option<&Ordinals>,
) -> Result<Vec<String>> {
    let pod_name = |ordinal: i32| {
        if template_name.is_empty() {
            format!("{parent}-{ordinal}")
        } else {
            format!("{parent}-{template_name}-{ordinal}")
        }
    };

    let ordinal_list = ordinal_list(template_name, ordinals)?;
    if !ordinal_list.is_empty() {
        let names = ordinal_list
            .into_iter()
            .map(pod_name)
            .filter(|name| !offline.contains(name.as_str()))
            .collect::<Vec<_>>();
        ensure!(
            i32::try_from(names.len()).is_ok_and(|available| available == replicas),
            OrdinalsMismatchSnafu {
                template: template_name,
                available: names.len(),
                replicas,
            }
        );
        return Ok(names);
    }

    let mut names = Vec::new();
    let mut ordinal = 0;
    while i32::try_from(names.len()).is_ok_and(|generated| generated < replicas) {
        let name = pod_name(ordinal);
        ordinal += 1;
        if !offline.contains(name.as_str()) {
            names.push(name);
        }
    }
    Ok(names)
}

fn ordinal_list(template_name: &str, ordinals: Option<&Ordinals>) -> Result<Vec<i32>> {
    let Some(ordinals) = ordinals else {
        return Ok(Vec::new());
    };
    let mut list = ordinals.discrete.iter().copied().collect::<BTreeSet<_>>();
    for range in &ordinals.ranges {
        ensure!(
            range.start <= range.end,
            InvalidOrdinalRangeSnafu {
                template: template_name,
                start: range.start,
                end: range.end,
            }
        );
        list.extend(range.start..=range.end);
    }
    Ok(list.into_iter().collect())
}

/// Splits `name` into its parent name and trailing ordinal. Names without an ordinal suffix map
/// to themselves with ordinal `-1`.
pub fn parse_parent_name_and_ordinal(name: &str) -> (&str, i32) {
    name.rsplit_once('-')
        .filter(|(_, ordinal)| !ordinal.is_empty() && ordinal.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|(parent, ordinal)| ordinal.parse().ok().map(|ordinal| (parent, ordinal)))
        .unwrap_or((name, -1))
}

/// Returns the instance template a pod belongs to, `""` for the default template.
pub fn instance_template_name(cluster_name: &str, component_name: &str, pod_name: &str) -> String {
    let prefix = format!("{}-", workload_name(cluster_name, component_name));
    let Some(rest) = pod_name.strip_prefix(&prefix) else {
        return String::new();
    };
    match parse_parent_name_and_ordinal(rest) {
        (_, -1) => String::new(),
        (template, _) => template.to_owned(),
    }
}

/// Counts the given pod names per instance template.
pub fn count_by_template<'a>(
    cluster_name: &str,
    component_name: &str,
    pod_names: impl IntoIterator<Item = &'a String>,
) -> BTreeMap<String, i32> {
    let mut counts = BTreeMap::new();
    for pod_name in pod_names {
        *counts
            .entry(instance_template_name(cluster_name, component_name, pod_name))
            .or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::crd::cluster::OrdinalRange;

    fn template(name: &str, replicas: i32) -> InstanceTemplate {
        InstanceTemplate {
            name: name.to_owned(),
            replicas: Some(replicas),
            ..InstanceTemplate::default()
        }
    }

    #[test]
    fn default_template_only() {
        let names = generate_pod_names("mycluster", "mysql", 3, &[], &[]).unwrap();
        assert_eq!(names, vec![
            "mycluster-mysql-0",
            "mycluster-mysql-1",
            "mycluster-mysql-2"
        ]);
    }

    #[test]
    fn offline_instances_are_skipped() {
        let names = generate_pod_names("mycluster", "mysql", 3, &[], &[
            "mycluster-mysql-1".to_owned(),
        ])
        .unwrap();
        assert_eq!(names, vec![
            "mycluster-mysql-0",
            "mycluster-mysql-2",
            "mycluster-mysql-3"
        ]);
    }

    #[test]
    fn named_templates_take_their_share() {
        let names = generate_pod_names(
            "mycluster",
            "mysql",
            4,
            &[template("big", 1), template("small", 2)],
            &[],
        )
        .unwrap();
        assert_eq!(names, vec![
            "mycluster-mysql-0",
            "mycluster-mysql-big-0",
            "mycluster-mysql-small-0",
            "mycluster-mysql-small-1",
        ]);
    }

    #[test]
    fn ordinals_sort_numerically() {
        let names = generate_pod_names("c", "m", 11, &[], &[]).unwrap();
        assert_eq!(names.last().map(String::as_str), Some("c-m-10"));
        assert_eq!(names[2], "c-m-2");
    }

    #[test]
    fn explicit_ordinals() {
        let mut tpl = template("big", 2);
        tpl.ordinals = Some(Ordinals {
            ranges: vec![OrdinalRange { start: 5, end: 6 }],
            discrete: vec![],
        });
        let names = generate_pod_names("c", "m", 2, &[tpl.clone()], &[]).unwrap();
        assert_eq!(names, vec!["c-m-big-5", "c-m-big-6"]);

        let error = generate_pod_names("c", "m", 2, &[tpl], &["c-m-big-5".to_owned()]);
        assert!(matches!(error, Err(Error::OrdinalsMismatch { .. })));
    }

    #[rstest]
    #[case::default_template("mycluster-mysql-3", "")]
    #[case::named_template("mycluster-mysql-big-3", "big")]
    #[case::dashed_template("mycluster-mysql-very-big-0", "very-big")]
    #[case::foreign_pod("other-mysql-0", "")]
    fn template_name_of_pod(#[case] pod: &str, #[case] expected: &str) {
        assert_eq!(instance_template_name("mycluster", "mysql", pod), expected);
    }

    #[test]
    fn count_pods_by_template() {
        let pods = vec![
            "c-m-0".to_owned(),
            "c-m-big-0".to_owned(),
            "c-m-big-1".to_owned(),
        ];
        let counts = count_by_template("c", "m", &pods);
        assert_eq!(counts.get(""), Some(&1));
        assert_eq!(counts.get("big"), Some(&2));
    }
}
