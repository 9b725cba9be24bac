use ax_core::config::GeneralConfig;
use ax_telemetry::logging::{self, LogFormat};

#[test]
fn init_logging_twice_is_a_no_op() {
    logging::init_logging("ax-test", "debug");
    logging::init_logging("ax-test", "info");

    tracing::info!(execution_id = "e-1", "human-readable log line");
}

#[test]
fn init_logging_json_after_human_does_not_panic() {
    // The global subscriber may already be set by another test.
    logging::init_logging_json("ax-test-json", "info");

    tracing::info!(execution_id = "e-2", "json log line");
}

#[test]
fn init_from_config_reports_format() {
    let general = GeneralConfig {
        log_json: true,
        ..GeneralConfig::default()
    };
    assert_eq!(logging::init_from_config(&general), LogFormat::Json);
    assert_eq!(
        logging::init_from_config(&GeneralConfig::default()),
        LogFormat::Human
    );
}

#[test]
fn only_the_first_init_installs_a_subscriber() {
    logging::init("ax-test-first", "info", LogFormat::Human);
    assert!(!logging::init("ax-test-second", "info", LogFormat::Json));
}
