//! Scenario runner over the scenarios that need no EVerest installation

use evt_harness::{get_scenario, list_scenarios, run_suite, HarnessConfig, ScenarioRunner};
use std::time::Duration;

fn config() -> HarnessConfig {
    HarnessConfig::default().with_command_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_malformed_frames_scenario() {
    let scenario = get_scenario("malformed-frames").unwrap();
    let result = ScenarioRunner::new(config()).run(scenario).await;
    assert!(result.passed, "{:?}", result.failure);
    assert!(!result.skipped);
}

#[tokio::test]
async fn test_suite_without_installation() {
    let results = run_suite(config()).await;
    let live = list_scenarios().iter().filter(|s| s.is_live()).count();

    assert_eq!(results.total, list_scenarios().len());
    assert_eq!(results.skipped, live);
    assert_eq!(results.passed, results.total - live);
    assert!(results.success());

    let xml = results.to_junit_xml();
    assert!(xml.contains("<testcase name=\"error-history\""));
    assert!(xml.contains("<skipped message=\"no EVerest installation configured\"/>"));
}
