//! Suite loading and command line tests for benchrun
//!
//! These tests build throwaway suite roots with tempfile and verify:
//! - Layout checks and optional suite.json
//! - Plugin units flowing into a runnable suite
//! - `check` and `run` through `cli::execute`

use benchrun::cli::{self, Cli};
use benchrun::{
    EngineError, FlowDefinition, Namespace, Parameters, PluginSet, ProcedureDefinition,
    SessionStatus, SuiteView, ToolRegistration,
};
use clap::Parser;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn suite_root(config: Option<&str>) -> TempDir {
    let root = TempDir::new().expect("Should create temp dir");
    for dir in ["tools", "procedures", "flows"] {
        fs::create_dir(root.path().join(dir)).unwrap();
    }
    if let Some(config) = config {
        fs::write(root.path().join("suite.json"), config).unwrap();
    }
    root
}

struct Supply {
    volts: f64,
}

fn station_plugins() -> PluginSet {
    PluginSet::new()
        .tools("bench", |r| {
            r.register_tool(ToolRegistration::new(
                "supply",
                |view: &SuiteView<'_>, args: &[Value]| {
                    let volts = args
                        .first()
                        .and_then(Value::as_f64)
                        .or_else(|| view.configuration().get_f64("nominal_volts"))
                        .unwrap_or(5.0);
                    Ok(Supply { volts })
                },
            ))?;
            Ok(())
        })
        .procedures("power", |r| {
            r.register_procedure(
                ProcedureDefinition::builder("read_supply")
                    .tool("supply")
                    .output("volts")
                    .build(|ctx| {
                        let supply = ctx.tool::<Supply>("supply")?;
                        ctx.post_finding("volts", supply.volts);
                        Ok(json!(supply.volts))
                    })?,
            )?;
            r.register_procedure(
                ProcedureDefinition::builder("read_rail")
                    .tool("supply")
                    .build(|ctx| Ok(json!(ctx.tool::<Supply>("supply")?.volts)))?,
            )?;
            r.associate_tool("supply", "read_rail", vec![json!(3.3)])?;
            Ok(())
        })
        .flows("main", |r| {
            r.register_flow(
                FlowDefinition::new("power_check", |session| {
                    let handle = session.stage_procedure("read_supply", Parameters::new())?;
                    handle.run()?.wait();
                    if handle.status().is_failure() {
                        session.indicate_non_completion()?;
                    } else {
                        session.indicate_completion()?;
                    }
                    Ok(())
                })
                .with_description("Read the bench supply"),
            )?;
            r.register_flow(FlowDefinition::new("always_fails", |_| {
                anyhow::bail!("station interlock open")
            }))?;
            Ok(())
        })
}

#[test]
fn test_open_requires_all_directories() {
    let root = TempDir::new().unwrap();
    fs::create_dir(root.path().join("tools")).unwrap();

    let err = benchrun::Suite::open(root.path(), &PluginSet::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::SuiteLayout(_))
    ));
    assert!(err.to_string().contains("procedures"));
}

#[test]
fn test_open_rejects_non_object_configuration() {
    let root = suite_root(Some("[1, 2, 3]"));
    let err = benchrun::Suite::open(root.path(), &PluginSet::new()).unwrap_err();
    assert!(format!("{:#}", err).contains("must be a JSON object"));
}

#[test]
fn test_open_loads_configuration_and_plugins() {
    let root = suite_root(Some(r#"{"nominal_volts": 12.0}"#));
    let suite = benchrun::Suite::open(root.path(), &station_plugins()).unwrap();

    let summary = suite.load_summary();
    assert_eq!(summary.registered(Namespace::Tools), 1);
    assert_eq!(summary.registered(Namespace::Procedures), 2);
    assert_eq!(summary.registered(Namespace::Flows), 2);
    assert_eq!(suite.view().configuration().get_f64("nominal_volts"), Some(12.0));
    assert!(suite.registry().unresolved_dependencies().is_empty());

    let outcome = suite.run_flow("power_check", Parameters::new()).unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.findings["volts"], json!(12.0));
}

#[test]
fn test_association_overrides_configuration_default() {
    let root = suite_root(None);
    let plugins = station_plugins().flows("rail", |r| {
        r.register_flow(FlowDefinition::new("rail_check", |session| {
            let handle = session.stage_procedure("read_rail", Parameters::new())?;
            handle.run()?.wait();
            let volts = handle
                .result()
                .and_then(|r| r.value().cloned())
                .unwrap_or(Value::Null);
            session.post_finding("rail", volts);
            session.indicate_completion()?;
            Ok(())
        }))?;
        Ok(())
    });

    let suite = benchrun::Suite::open(root.path(), &plugins).unwrap();
    let outcome = suite.run_flow("rail_check", Parameters::new()).unwrap();
    assert_eq!(outcome.findings["rail"], json!(3.3));
}

fn run_cli(args: &[&str], plugins: &PluginSet) -> anyhow::Result<bool> {
    let cli = Cli::try_parse_from(args)?;
    cli::execute(&cli, plugins)
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("temp path should be UTF-8")
}

#[test]
fn test_cli_check_passes_for_resolved_suite() {
    let root = suite_root(None);
    let ok = run_cli(&["benchrun", "check", path_arg(root.path())], &station_plugins()).unwrap();
    assert!(ok);
}

#[test]
fn test_cli_check_fails_on_unresolved_dependency() {
    let root = suite_root(None);
    let plugins = PluginSet::new().procedures("orphans", |r| {
        r.register_procedure(
            ProcedureDefinition::builder("scan_label")
                .tool("barcode_reader")
                .build(|_| Ok(Value::Null))?,
        )?;
        Ok(())
    });

    let ok = run_cli(&["benchrun", "check", path_arg(root.path())], &plugins).unwrap();
    assert!(!ok);
}

#[test]
fn test_cli_run_reports_flow_status() {
    let root = suite_root(None);
    let plugins = station_plugins();

    let completed = run_cli(
        &["benchrun", "run", path_arg(root.path()), "power_check", "-p", "operator=kim"],
        &plugins,
    )
    .unwrap();
    assert!(completed);

    let failed = run_cli(
        &["benchrun", "run", path_arg(root.path()), "always_fails"],
        &plugins,
    )
    .unwrap();
    assert!(!failed);
}

#[test]
fn test_cli_run_unknown_flow_is_error() {
    let root = suite_root(None);
    let err = run_cli(
        &["benchrun", "run", path_arg(root.path()), "no_such_flow"],
        &station_plugins(),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::TestFlowDoesNotExist { .. })
    ));
}

#[test]
fn test_cli_missing_root_is_error() {
    let root = TempDir::new().unwrap();
    let missing = root.path().join("nowhere");
    let result = run_cli(&["benchrun", "check", path_arg(&missing)], &PluginSet::new());
    assert!(result.is_err());
}
