// tests/parameter_precedence.rs

mod common;
use crate::common::builders::{BundleBuilder, resolved};
use crate::common::{expect_err, init_tracing};

use std::collections::BTreeMap;
use std::error::Error;

use bundlectl::bundle::{Bundle, Schema};
use bundlectl::errors::ErrorKind;
use bundlectl::exec::parameters::{
    finalize_credentials, finalize_parameters, fingerprint, layer_strategies, merge_layers,
    parse_overrides, to_strategies,
};
use bundlectl::secrets::SecretStrategy;
use proptest::prelude::*;
use serde_json::{Value, json};

type TestResult = Result<(), Box<dyn Error>>;

fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn mysql() -> Bundle {
    let mut object = Schema {
        schema_type: Some(json!("object")),
        ..Default::default()
    };
    object.default = Some(json!({}));
    BundleBuilder::new("mysql", "5.7.0")
        .with_default_param("database", "app")
        .with_integer_param("port", Some(3306))
        .with_param(
            "tls",
            Schema {
                schema_type: Some(json!("boolean")),
                ..Default::default()
            },
            false,
        )
        .with_param("settings", object, false)
        .with_required_param("root-password")
        .with_param_for("backup-bucket", &["backup"])
        .with_action("backup", false)
        .with_credential("kubeconfig", true)
        .build()
}

#[test]
fn overrides_beat_resolved_values_which_beat_defaults() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let values = finalize_parameters(
        &bundle,
        "install",
        &resolved(&[("database", "wordpress"), ("port", "3307"), ("root-password", "pw")]),
        &overrides(&[("port", "3308"), ("tls", "true")]),
    )?;
    assert_eq!(values["database"], json!("wordpress"));
    assert_eq!(values["port"], json!(3308));
    assert_eq!(values["tls"], json!(true));
    assert_eq!(values["settings"], json!({}));
    assert_eq!(values["root-password"], json!("pw"));
    assert!(!values.contains_key("backup-bucket"));
    Ok(())
}

#[test]
fn unset_sources_leave_defaults_alone() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let mut values = resolved(&[("root-password", "pw")]);
    values.insert("database".to_string(), None);
    let out = finalize_parameters(&bundle, "install", &values, &BTreeMap::new())?;
    assert_eq!(out["database"], json!("app"));
    assert_eq!(out["port"], json!(3306));
    Ok(())
}

#[test]
fn missing_required_parameters_are_listed() {
    init_tracing();
    let err = expect_err(finalize_parameters(
        &mysql(),
        "install",
        &BTreeMap::new(),
        &BTreeMap::new(),
    ));
    assert_eq!(err.kind(), ErrorKind::MissingSource);
    assert!(err.to_string().contains("root-password"), "{err}");
}

#[test]
fn parameters_are_filtered_by_action() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let values = finalize_parameters(
        &bundle,
        "backup",
        &resolved(&[("backup-bucket", "s3://dumps"), ("root-password", "pw")]),
        &BTreeMap::new(),
    )?;
    assert_eq!(values["backup-bucket"], json!("s3://dumps"));

    let values = finalize_parameters(
        &bundle,
        "upgrade",
        &resolved(&[("backup-bucket", "s3://dumps"), ("root-password", "pw")]),
        &BTreeMap::new(),
    )?;
    assert!(!values.contains_key("backup-bucket"));
    Ok(())
}

#[test]
fn values_that_do_not_fit_the_schema_are_rejected() {
    init_tracing();
    let bundle = mysql();
    let base = resolved(&[("root-password", "pw")]);
    for (name, raw) in [("port", "many"), ("tls", "maybe"), ("settings", "[1]")] {
        let err = expect_err(finalize_parameters(
            &bundle,
            "install",
            &base,
            &overrides(&[(name, raw)]),
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidManifest, "{name}={raw}");
    }
}

#[test]
fn overrides_must_name_declared_parameters() {
    init_tracing();
    let err = expect_err(finalize_parameters(
        &mysql(),
        "install",
        &resolved(&[("root-password", "pw")]),
        &overrides(&[("replicas", "3")]),
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    assert!(err.to_string().contains("has no parameter replicas"), "{err}");
}

#[test]
fn undeclared_resolved_values_are_ignored() -> TestResult {
    init_tracing();
    let values = finalize_parameters(
        &mysql(),
        "install",
        &resolved(&[("root-password", "pw"), ("leftover", "x")]),
        &BTreeMap::new(),
    )?;
    assert!(!values.contains_key("leftover"));
    Ok(())
}

#[test]
fn required_credentials_must_resolve() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let creds = finalize_credentials(&bundle, "install", &resolved(&[("kubeconfig", "cfg")]))?;
    assert_eq!(creds["kubeconfig"], "cfg");

    let mut unset = BTreeMap::new();
    unset.insert("kubeconfig".to_string(), None);
    let err = expect_err(finalize_credentials(&bundle, "install", &unset));
    assert_eq!(err.kind(), ErrorKind::MissingSource);
    assert!(err.to_string().contains("kubeconfig"), "{err}");
    Ok(())
}

#[test]
fn fingerprints_ignore_representation_and_internal_parameters() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let mut typed = BTreeMap::new();
    typed.insert("port".to_string(), json!(3306));
    typed.insert("tls".to_string(), json!(false));
    let mut textual = BTreeMap::new();
    textual.insert("port".to_string(), json!("3306"));
    textual.insert("tls".to_string(), json!("false"));
    textual.insert("porter-debug".to_string(), json!("true"));

    assert_eq!(fingerprint(&bundle, &typed)?, fingerprint(&bundle, &textual)?);
    assert_eq!(fingerprint(&bundle, &typed)?["port"], "3306");
    Ok(())
}

#[test]
fn run_parameters_are_stored_as_literals() -> TestResult {
    init_tracing();
    let bundle = mysql();
    let mut values = BTreeMap::new();
    values.insert("port".to_string(), json!(3306));
    values.insert("settings".to_string(), json!({"a": 1}));
    let strategies = to_strategies(&bundle, &values)?;
    assert_eq!(
        strategies,
        vec![
            SecretStrategy::value("port", "3306"),
            SecretStrategy::value("settings", r#"{"a":1}"#),
        ]
    );
    Ok(())
}

#[test]
fn overrides_parse_name_value_pairs() -> TestResult {
    init_tracing();
    let parsed = parse_overrides(&["a=1".to_string(), " b =x=y".to_string(), "c=".to_string()])?;
    assert_eq!(parsed, overrides(&[("a", "1"), ("b", "x=y"), ("c", "")]));

    for bad in ["novalue", "=3"] {
        let err = expect_err(parse_overrides(&[bad.to_string()]));
        assert_eq!(err.kind(), ErrorKind::InvalidManifest, "{bad}");
    }
    Ok(())
}

#[test]
fn strategy_layers_let_the_last_entry_win() {
    init_tracing();
    let sets = vec![
        SecretStrategy::value("region", "us"),
        SecretStrategy::value("tier", "bronze"),
    ];
    let inline = vec![SecretStrategy::value("tier", "gold")];
    let merged = layer_strategies([sets.as_slice(), inline.as_slice()]);
    assert_eq!(
        merged,
        vec![
            SecretStrategy::value("region", "us"),
            SecretStrategy::value("tier", "gold"),
        ]
    );
}

proptest! {
    #[test]
    fn merged_layers_take_each_key_from_the_last_layer_holding_it(
        layers in proptest::collection::vec(
            proptest::collection::btree_map("[a-e]", 0u32..100, 0..5),
            0..5,
        )
    ) {
        let merged = merge_layers(layers.iter());
        for (key, value) in &merged {
            let last = layers.iter().rev().find_map(|l| l.get(key));
            prop_assert_eq!(Some(value), last);
        }
        for layer in &layers {
            for key in layer.keys() {
                prop_assert!(merged.contains_key(key));
            }
        }
    }

    #[test]
    fn integer_values_survive_conversion(n in any::<i64>()) {
        let bundle = BundleBuilder::new("n", "1.0.0").with_integer_param("n", None).build();
        let values = finalize_parameters(
            &bundle,
            "install",
            &resolved(&[("n", n.to_string().as_str())]),
            &BTreeMap::new(),
        ).unwrap();
        prop_assert_eq!(&values["n"], &Value::from(n));
    }
}
