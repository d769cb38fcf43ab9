use tally_types::artifacts::{RawJobRun, RawTestResult};
use tally_types::{RunOutcome, TestStatus};

pub const INSTALL_TEST: &str = "sippy.[sig-sippy] infrastructure should work";
pub const TESTS_TEST: &str = "sippy.[sig-sippy] openshift-tests should work";

/// Derives extra test results from the overall shape of a job run.
pub trait SyntheticTests: Send + Sync {
    fn synthesize(&self, run: &RawJobRun) -> Vec<RawTestResult>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoSyntheticTests;

impl SyntheticTests for NoSyntheticTests {
    fn synthesize(&self, _: &RawJobRun) -> Vec<RawTestResult> {
        Vec::new()
    }
}

/// Reports whether the cluster came up and whether the test binary passed,
/// as tests of the `sippy` suite.
#[derive(Clone, Copy, Debug, Default)]
pub struct OutcomeTests;

impl SyntheticTests for OutcomeTests {
    fn synthesize(&self, run: &RawJobRun) -> Vec<RawTestResult> {
        let status = |failed: bool| {
            if failed {
                TestStatus::Failure
            } else {
                TestStatus::Success
            }
        };
        match run.outcome {
            RunOutcome::Unknown | RunOutcome::Aborted => Vec::new(),
            RunOutcome::InfrastructureFailure => vec![RawTestResult {
                name: INSTALL_TEST.to_string(),
                status: TestStatus::Failure,
            }],
            RunOutcome::Success | RunOutcome::Failure => {
                let tests_failed = run
                    .tests
                    .iter()
                    .filter(|test| !test.name.starts_with("sippy."))
                    .any(|test| test.status.is_failure());
                vec![
                    RawTestResult {
                        name: INSTALL_TEST.to_string(),
                        status: TestStatus::Success,
                    },
                    RawTestResult {
                        name: TESTS_TEST.to_string(),
                        status: status(tests_failed || run.outcome == RunOutcome::Failure),
                    },
                ]
            }
        }
    }
}
