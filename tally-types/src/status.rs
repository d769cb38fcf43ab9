use serde::{Deserialize, Serialize};

/** The outcome of one test invocation within a job run. The numeric
 * values are the ones stored in the `test_results.status` column and
 * referenced by the aggregate queries, so they must never change. */
#[derive(
    Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize, strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TestStatus {
    #[serde(alias = "passed", alias = "pass")]
    Success = 1,
    #[serde(alias = "failed", alias = "fail")]
    Failure = 12,
    #[serde(alias = "flaked")]
    Flake = 13,
}

impl TestStatus {
    pub fn is_failure(self) -> bool {
        self == Self::Failure
    }
}

impl TryFrom<i32> for TestStatus {
    type Error = ();
    fn try_from(n: i32) -> Result<TestStatus, ()> {
        match n {
            1 => Ok(Self::Success),
            12 => Ok(Self::Failure),
            13 => Ok(Self::Flake),
            _ => Err(()),
        }
    }
}
impl From<TestStatus> for i32 {
    fn from(x: TestStatus) -> i32 {
        (x as u8) as i32
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Flake => write!(f, "flake"),
        }
    }
}

/** The overall result of a job run, as reported by the CI system. */
#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumIter,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum RunOutcome {
    #[default]
    Unknown = 0,
    Success = 1,
    Failure = 2,
    Aborted = 3,
    /** The run failed before any test could tell us something useful
     * (install, provisioning, ...). */
    InfrastructureFailure = 4,
}

impl RunOutcome {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failure | Self::InfrastructureFailure)
    }
}

impl TryFrom<i32> for RunOutcome {
    type Error = ();
    fn try_from(n: i32) -> Result<RunOutcome, ()> {
        let arr = [
            Self::Unknown,
            Self::Success,
            Self::Failure,
            Self::Aborted,
            Self::InfrastructureFailure,
        ];
        usize::try_from(n).ok().and_then(|n| arr.get(n)).ok_or(()).copied()
    }
}
impl From<RunOutcome> for i32 {
    fn from(x: RunOutcome) -> i32 {
        (x as u8) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(i32::from(TestStatus::Success), 1);
        assert_eq!(i32::from(TestStatus::Failure), 12);
        assert_eq!(i32::from(TestStatus::Flake), 13);
        for status in TestStatus::iter() {
            assert_eq!(TestStatus::try_from(i32::from(status)), Ok(status));
        }
        assert!(TestStatus::try_from(2).is_err());
    }

    #[test]
    fn run_outcome_rejects_unknown_codes() {
        for outcome in RunOutcome::iter() {
            assert_eq!(RunOutcome::try_from(i32::from(outcome)), Ok(outcome));
        }
        assert!(RunOutcome::try_from(-1).is_err());
        assert!(RunOutcome::try_from(5).is_err());
    }

    #[test]
    fn test_status_accepts_junit_spellings() {
        let parsed: Vec<TestStatus> =
            serde_json::from_str(r#"["success", "failed", "flake", "passed"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                TestStatus::Success,
                TestStatus::Failure,
                TestStatus::Flake,
                TestStatus::Success
            ]
        );
    }
}
