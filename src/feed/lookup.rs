//! Pure queries over cached commit data. Absence is a normal outcome here:
//! every helper answers `None`/`false` instead of failing.

use super::{TaskRun, TestStatus, Version};

/// Find the run of `task_name` on `build_variant` in `version`.
///
/// A display name that appears more than once within the variant is
/// ambiguous and treated as absent.
pub fn find_task<'a>(
    version: &'a Version,
    build_variant: &str,
    task_name: &str,
) -> Option<&'a TaskRun> {
    let build = version.build_by_variant(build_variant)?;
    let mut matching = build.tasks.iter().filter(|t| t.display_name == task_name);
    let task = matching.next()?;
    if matching.next().is_some() {
        return None;
    }
    Some(task)
}

/// Test ids reported with `status` in `task`, in report order.
pub fn tests_with_status(task: &TaskRun, status: TestStatus) -> Vec<&str> {
    task.tests
        .iter()
        .filter(|t| t.status == status)
        .map(|t| t.test_file.as_str())
        .collect()
}

pub fn failing_tests(task: &TaskRun) -> Vec<&str> {
    tests_with_status(task, TestStatus::Fail)
}

pub fn passing_tests(task: &TaskRun) -> Vec<&str> {
    tests_with_status(task, TestStatus::Pass)
}

/// True when `test` appears exactly once among the tests of `task` reported
/// with `status`.
pub fn has_test_with_status(task: &TaskRun, test: &str, status: TestStatus) -> bool {
    task.tests
        .iter()
        .filter(|t| t.status == status && t.test_file == test)
        .count()
        == 1
}

pub fn is_test_failing(task: &TaskRun, test: &str) -> bool {
    has_test_with_status(task, test, TestStatus::Fail)
}

pub fn is_test_passing(task: &TaskRun, test: &str) -> bool {
    has_test_with_status(task, test, TestStatus::Pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Build, TaskStatus, TestResult};

    fn task(name: &str, tests: Vec<TestResult>) -> TaskRun {
        TaskRun {
            task_id: format!("{name}_100"),
            display_name: name.to_string(),
            build_variant: "linux".to_string(),
            order: 100,
            version_id: "v100".to_string(),
            status: TaskStatus::Failed,
            timed_out: false,
            tests,
        }
    }

    fn version(tasks: Vec<TaskRun>) -> Version {
        Version {
            version_id: "v100".to_string(),
            order: 100,
            project: "proj".to_string(),
            builds: vec![Build {
                build_id: "b1".to_string(),
                build_variant: "linux".to_string(),
                display_name: "! Linux".to_string(),
                tasks,
            }],
        }
    }

    #[test]
    fn finds_task_by_variant_and_name() {
        let v = version(vec![task("jsCore", vec![]), task("sharding", vec![])]);
        assert_eq!(
            find_task(&v, "linux", "sharding").map(|t| t.display_name.as_str()),
            Some("sharding")
        );
        assert!(find_task(&v, "windows", "sharding").is_none());
        assert!(find_task(&v, "linux", "aggregation").is_none());
    }

    #[test]
    fn duplicate_task_names_are_ambiguous() {
        let v = version(vec![task("jsCore", vec![]), task("jsCore", vec![])]);
        assert!(find_task(&v, "linux", "jsCore").is_none());
    }

    #[test]
    fn statuses_are_looked_up_per_test() {
        let t = task(
            "jsCore",
            vec![
                TestResult::new("a.js", TestStatus::Fail),
                TestResult::new("b.js", TestStatus::Pass),
                TestResult::new("c.js", TestStatus::Other),
            ],
        );
        assert!(is_test_failing(&t, "a.js"));
        assert!(is_test_passing(&t, "b.js"));
        assert!(!is_test_failing(&t, "c.js") && !is_test_passing(&t, "c.js"));
        assert!(!is_test_failing(&t, "missing.js") && !is_test_passing(&t, "missing.js"));
        assert_eq!(failing_tests(&t), vec!["a.js"]);
        assert_eq!(passing_tests(&t), vec!["b.js"]);
    }

    #[test]
    fn duplicate_test_entries_are_ambiguous() {
        let t = task(
            "jsCore",
            vec![
                TestResult::new("a.js", TestStatus::Pass),
                TestResult::new("a.js", TestStatus::Pass),
            ],
        );
        assert!(!is_test_passing(&t, "a.js"));
    }
}
