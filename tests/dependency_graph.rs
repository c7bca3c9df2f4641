// tests/dependency_graph.rs

mod common;
use crate::common::builders::{BundleBuilder, DependencyBuilder};
use crate::common::{expect_err, init_tracing};

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;

use bundlectl::bundle::dependencies::{DEPENDENCIES_V1_KEY, Requires};
use bundlectl::bundle::{Bundle, Dependencies, Dependency};
use bundlectl::dag::{DependencyGraph, Wiring, validate_wiring};
use bundlectl::errors::{BundleError, ErrorKind};
use proptest::prelude::*;
use serde_json::json;

type TestResult = Result<(), Box<dyn Error>>;

fn deps(list: Vec<Dependency>) -> Dependencies {
    Dependencies {
        sequence: Vec::new(),
        requires: Requires(list),
    }
}

fn dep(name: &str) -> DependencyBuilder {
    DependencyBuilder::new(name, &format!("example.com/{name}:v1.0.0"))
}

fn keys(graph: &DependencyGraph) -> Result<Vec<String>, BundleError> {
    Ok(graph.topo_sort()?.into_iter().map(|n| n.key.clone()).collect())
}

#[test]
fn wiring_forms_are_recognised() -> TestResult {
    init_tracing();
    assert_eq!(
        Wiring::parse("${bundle.dependencies.mysql.outputs.connstr}")?,
        Wiring::DependencyOutput {
            dependency: "mysql".into(),
            output: "connstr".into()
        }
    );
    assert_eq!(
        Wiring::parse("bundle.parameters.region")?,
        Wiring::RootParameter("region".into())
    );
    assert_eq!(
        Wiring::parse("${bundle.credentials.kubeconfig}")?,
        Wiring::RootCredential("kubeconfig".into())
    );
    // Anything else passes through untouched, surrounding spaces included.
    assert_eq!(Wiring::parse(" gold ")?, Wiring::Literal(" gold ".into()));
    assert_eq!(
        Wiring::parse("${bundle.outputs.x}")?,
        Wiring::Literal("${bundle.outputs.x}".into())
    );
    Ok(())
}

#[test]
fn wiring_display_is_parseable() -> TestResult {
    init_tracing();
    for raw in [
        "${bundle.dependencies.db.outputs.host}",
        "bundle.parameters.tier",
        "bundle.credentials.token",
        "literal",
    ] {
        let w = Wiring::parse(raw)?;
        assert_eq!(Wiring::parse(&w.to_string())?, w);
    }
    Ok(())
}

#[test]
fn consumers_sort_after_producers() -> TestResult {
    init_tracing();
    // Manifest order puts the consumer first.
    let graph = DependencyGraph::build(&deps(vec![
        dep("app")
            .with_parameter("db", "${bundle.dependencies.mysql.outputs.connstr}")
            .with_parameter("cache", "${bundle.dependencies.redis.outputs.host}")
            .build(),
        dep("redis").build(),
        dep("mysql").build(),
    ]))?;

    assert_eq!(graph.len(), 3);
    assert_eq!(keys(&graph)?, vec!["redis", "mysql", "app"]);
    assert_eq!(graph.dependencies_of("app"), vec!["redis", "mysql"]);
    assert_eq!(graph.dependents_of("mysql"), vec!["app"]);
    assert!(graph.dependencies_of("missing").is_empty());
    assert!(graph.find_cycle().is_none());
    Ok(())
}

#[test]
fn independent_dependencies_keep_requires_order() -> TestResult {
    init_tracing();
    let graph = DependencyGraph::build(&deps(vec![
        dep("zeta").build(),
        dep("alpha").build(),
        dep("mid").build(),
    ]))?;
    assert_eq!(keys(&graph)?, vec!["zeta", "alpha", "mid"]);
    Ok(())
}

#[test]
fn dependencies_read_from_a_bundle_tie_break_by_name() -> TestResult {
    init_tracing();
    let bundle = BundleBuilder::new("shop", "1.0.0")
        .with_dependency(dep("zeta").build())
        .with_dependency(dep("alpha").build())
        .with_dependency(dep("mid").build())
        .build();
    let parsed = Dependencies::from_bundle(&bundle)?.ok_or("missing dependencies")?;
    let graph = DependencyGraph::build(&parsed)?;
    assert_eq!(keys(&graph)?, vec!["alpha", "mid", "zeta"]);
    Ok(())
}

#[test]
fn cycles_are_reported_with_their_path() {
    init_tracing();
    let graph = DependencyGraph::build(&deps(vec![
        dep("a")
            .with_parameter("x", "${bundle.dependencies.b.outputs.y}")
            .build(),
        dep("b")
            .with_parameter("y", "${bundle.dependencies.a.outputs.x}")
            .build(),
    ]))
    .unwrap();
    assert_eq!(
        graph.find_cycle(),
        Some(vec!["a".to_string(), "b".to_string(), "a".to_string()])
    );
    let err = expect_err(keys(&graph));
    assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
}

#[test]
fn self_wiring_is_a_cycle() {
    init_tracing();
    let graph = DependencyGraph::build(&deps(vec![
        dep("a")
            .with_parameter("x", "${bundle.dependencies.a.outputs.y}")
            .build(),
    ]))
    .unwrap();
    assert_eq!(graph.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
    assert_eq!(expect_err(keys(&graph)).kind(), ErrorKind::CyclicDependency);
}

#[test]
fn wiring_to_an_undeclared_dependency_is_rejected() {
    init_tracing();
    let err = expect_err(DependencyGraph::build(&deps(vec![
        dep("app")
            .with_credential("token", "${bundle.dependencies.vault.outputs.token}")
            .build(),
    ])));
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    assert!(err.to_string().contains("vault"), "{err}");
}

#[test]
fn v1_sequence_reorders_requires() -> TestResult {
    init_tracing();
    let bundle = BundleBuilder::new("app", "1.0.0")
        .with_custom(
            DEPENDENCIES_V1_KEY,
            json!({
                "sequence": ["mysql", "app-db"],
                "requires": {
                    "app-db": { "bundle": "example.com/app-db:v1" },
                    "mysql": { "bundle": "example.com/mysql:v5" },
                    "redis": { "bundle": "example.com/redis:v7" }
                }
            }),
        )
        .build();
    let deps = Dependencies::from_bundle(&bundle)?.expect("dependencies present");
    let names: Vec<&str> = deps.requires.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["mysql", "app-db", "redis"]);

    let none = BundleBuilder::new("plain", "1.0.0").build();
    assert!(Dependencies::from_bundle(&none)?.is_none());
    Ok(())
}

#[test]
fn invalid_dependency_names_are_rejected() {
    init_tracing();
    let bundle = BundleBuilder::new("app", "1.0.0")
        .with_custom(
            DEPENDENCIES_V1_KEY,
            json!({ "requires": { "my.sql": { "bundle": "example.com/mysql:v5" } } }),
        )
        .build();
    let err = expect_err(Dependencies::from_bundle(&bundle));
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
}

fn wired_bundles() -> BTreeMap<String, Bundle> {
    let mut bundles = BTreeMap::new();
    bundles.insert(
        "mysql".to_string(),
        BundleBuilder::new("mysql", "5.7.0")
            .with_output("connstr")
            .with_typed_output("port", "integer", false)
            .build(),
    );
    bundles.insert(
        "app".to_string(),
        BundleBuilder::new("app", "1.0.0")
            .with_string_param("db")
            .with_integer_param("port", None)
            .with_output("url")
            .build(),
    );
    bundles
}

#[test]
fn matching_wiring_validates() -> TestResult {
    init_tracing();
    let graph = DependencyGraph::build(&deps(vec![
        dep("mysql").build(),
        dep("app")
            .with_parameter("db", "${bundle.dependencies.mysql.outputs.connstr}")
            .with_parameter("port", "${bundle.dependencies.mysql.outputs.port}")
            .with_output_alias("endpoint", "url")
            .build(),
    ]))?;
    validate_wiring(&graph, &wired_bundles())?;
    Ok(())
}

#[test]
fn every_wiring_problem_is_reported_together() {
    init_tracing();
    let graph = DependencyGraph::build(&deps(vec![
        dep("mysql").build(),
        dep("app")
            // Undeclared output.
            .with_parameter("db", "${bundle.dependencies.mysql.outputs.password}")
            // Integer parameter fed by a string output.
            .with_parameter("port", "${bundle.dependencies.mysql.outputs.connstr}")
            // Parameter the bundle does not declare.
            .with_parameter("replicas", "3")
            .build(),
    ]))
    .unwrap();
    let err = expect_err(validate_wiring(&graph, &wired_bundles()));
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    let msg = err.to_string();
    assert!(msg.contains("3 errors occurred"), "{msg}");
    assert!(msg.contains("password"), "{msg}");
    assert!(msg.contains("is integer but output mysql.connstr is string"), "{msg}");
    assert!(msg.contains("replicas"), "{msg}");
}

/// Dependency `i` may only consume outputs of dependencies with a lower
/// index, which keeps the generated graph acyclic.
fn acyclic_edges() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..9).prop_flat_map(|n| {
        let edges = proptest::collection::vec((0..n, 0..n), 0..20).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a > b)
                .collect::<Vec<_>>()
        });
        (Just(n), edges)
    })
}

proptest! {
    #[test]
    fn topo_sort_respects_every_edge((n, edges) in acyclic_edges()) {
        // Reverse the manifest so the sort has real work to do.
        let list: Vec<Dependency> = (0..n)
            .rev()
            .map(|i| {
                let mut b = dep(&format!("d{i}"));
                for (k, (from, to)) in edges.iter().enumerate() {
                    if *from == i {
                        b = b.with_parameter(
                            &format!("p{k}"),
                            &format!("${{bundle.dependencies.d{to}.outputs.o}}"),
                        );
                    }
                }
                b.build()
            })
            .collect();
        let graph = DependencyGraph::build(&deps(list)).unwrap();
        let order = keys(&graph).unwrap();

        prop_assert_eq!(order.len(), n);
        prop_assert_eq!(order.iter().collect::<BTreeSet<_>>().len(), n);
        let pos = |k: usize| order.iter().position(|x| *x == format!("d{k}")).unwrap();
        for (from, to) in &edges {
            prop_assert!(pos(*to) < pos(*from), "d{} must come before d{}", to, from);
        }
        prop_assert!(graph.find_cycle().is_none());
    }
}
