//! Reported errors reach the tracer and the host's original callback

mod utils;

use serial_test::serial;
use tracehook::error_hook::ErrorReport;
use tracehook::host::{E_ERROR, E_WARNING};
use utils::*;

fn warning(message: &str) -> ErrorReport {
    ErrorReport {
        error_type: E_WARNING,
        message: message.to_string(),
        file: "index.php".to_string(),
        line: 7,
    }
}

#[test]
#[serial]
fn test_error_reaches_tracer_and_host() {
    let fixture = AgentFixture::start();

    report_error(&warning("division by zero"));

    assert_eq!(fixture.source.reported_errors(), vec![warning("division by zero")]);
    assert_eq!(host_errors(), vec![warning("division by zero")]);
}

#[test]
#[serial]
fn test_disabled_request_only_reaches_host() {
    let fixture = AgentFixture::start();
    fixture.source.set_request_disabled(true);

    report_error(&warning("ignored by tracer"));

    assert!(fixture.source.reported_errors().is_empty());
    assert_eq!(host_errors().len(), 1);
}

#[test]
#[serial]
fn test_tracing_disabled_only_reaches_host() {
    let config = tracehook::config::AgentConfig {
        trace_enabled: false,
        ..Default::default()
    };
    let fixture = AgentFixture::start_with(config, |_| {});

    report_error(&ErrorReport {
        error_type: E_ERROR,
        message: "fatal".to_string(),
        file: "boot.php".to_string(),
        line: 1,
    });

    assert!(fixture.source.reported_errors().is_empty());
    assert_eq!(host_errors()[0].message, "fatal");
}

#[test]
#[serial]
fn test_host_callback_restored_after_shutdown() {
    let fixture = AgentFixture::start();
    let source = fixture.source.clone();
    drop(fixture);

    report_error(&warning("after shutdown"));
    assert!(source.reported_errors().is_empty());
    assert_eq!(host_errors().len(), 1);
}
