//! Suite summary and JUnit XML report

use crate::scenarios::ScenarioResult;

/// Test suite results
#[derive(Debug, Clone)]
pub struct SuiteResults {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<ScenarioResult>,
}

impl SuiteResults {
    pub fn from_results(results: Vec<ScenarioResult>) -> Self {
        let skipped = results.iter().filter(|r| r.skipped).count();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed - skipped,
            skipped,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Generate JUnit XML report
    pub fn to_junit_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuite name=\"EVerest OCPP Scenarios\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" errors=\"0\">\n",
            self.total, self.failed, self.skipped
        ));

        for result in &self.results {
            xml.push_str(&format!(
                "  <testcase name=\"{}\" time=\"{:.3}\"",
                escape(&result.name),
                result.duration.as_secs_f64()
            ));

            if result.passed {
                xml.push_str(" />\n");
                continue;
            }
            xml.push_str(">\n");
            let message = result.failure.as_deref().unwrap_or("Unknown failure");
            if result.skipped {
                xml.push_str(&format!("    <skipped message=\"{}\"/>\n", escape(message)));
            } else {
                xml.push_str(&format!("    <failure message=\"{}\">", escape(message)));
                xml.push_str(&escape(&result.history.join("\n")));
                xml.push_str("</failure>\n");
            }
            xml.push_str("  </testcase>\n");
        }

        xml.push_str("</testsuite>\n");
        xml
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(name: &str, passed: bool, skipped: bool, failure: Option<&str>) -> ScenarioResult {
        ScenarioResult {
            name: name.to_string(),
            passed,
            skipped,
            duration: Duration::from_millis(1500),
            failure: failure.map(str::to_string),
            history: if passed || skipped {
                Vec::new()
            } else {
                vec!["[+0.100s] station -> csms [2,\"1\",\"Heartbeat\",{}]".to_string()]
            },
        }
    }

    #[test]
    fn test_suite_results_junit() {
        let results = SuiteResults::from_results(vec![
            result("malformed-frames", true, false, None),
            result("ac-plug-start-stop", false, false, Some("expected <Charging>, observed \"Preparing\"")),
            result("composite-schedule", false, true, Some("no EVerest installation configured")),
        ]);
        assert_eq!((results.total, results.passed, results.failed, results.skipped), (3, 1, 1, 1));
        assert!(!results.success());

        let xml = results.to_junit_xml();
        assert!(xml.contains("tests=\"3\" failures=\"1\" skipped=\"1\""));
        assert!(xml.contains("<testcase name=\"malformed-frames\" time=\"1.500\" />"));
        assert!(xml.contains("message=\"expected &lt;Charging&gt;, observed &quot;Preparing&quot;\""));
        assert!(xml.contains("[2,&quot;1&quot;,&quot;Heartbeat&quot;,{}]</failure>"));
        assert!(xml.contains("<skipped message=\"no EVerest installation configured\"/>"));
    }
}
