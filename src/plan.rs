//! Dependency relation between the cases of a suite.
//!
//! Case `j` depends on every earlier case `i` that extracts a variable
//! `j` references in its endpoint, headers, query or body. The relation
//! is computed once per run and gates parallel scheduling.

use std::collections::BTreeSet;

use crate::model::{TestCase, TestSuite};
use crate::variables::{referenced_names, referenced_names_in_value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// `dependencies[j]` holds the indices `j` waits for, ascending.
    dependencies: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    pub fn new(suite: &TestSuite) -> Self {
        let dependencies = suite
            .test_cases
            .iter()
            .enumerate()
            .map(|(j, case)| {
                let names = referenced_variables(case);
                suite.test_cases[..j]
                    .iter()
                    .enumerate()
                    .filter(|(_, earlier)| earlier.extract.keys().any(|key| names.contains(key)))
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        Self { dependencies }
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether no case waits on another.
    pub fn is_independent(&self) -> bool {
        self.dependencies.iter().all(Vec::is_empty)
    }
}

/// Every variable name referenced by the request fields of `case`.
pub fn referenced_variables(case: &TestCase) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = referenced_names(&case.endpoint).into_iter().collect();
    for value in case.headers.values().chain(case.query.values()) {
        names.extend(referenced_names(value));
    }
    if let Some(body) = &case.body {
        referenced_names_in_value(body, &mut names);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(yaml: &str) -> TestSuite {
        TestSuite::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_dependencies_follow_extract_references() {
        let suite = suite(
            r#"
test_cases:
  - id: login
    method: POST
    endpoint: /login
    extract:
      token: $.token
  - id: create
    method: POST
    endpoint: /users
    headers:
      Authorization: "Bearer {{token}}"
    extract:
      user_id: $.id
  - id: health
    endpoint: /health
  - id: fetch
    endpoint: /users/{{user_id}}
    query:
      auth: "{{token}}"
  - id: update
    method: PUT
    endpoint: /users/1
    body:
      owner: "{{user_id}}"
"#,
        );
        let plan = ExecutionPlan::new(&suite);

        assert_eq!(plan.len(), 5);
        assert!(plan.dependencies(0).is_empty());
        assert_eq!(plan.dependencies(1), &[0]);
        assert!(plan.dependencies(2).is_empty());
        assert_eq!(plan.dependencies(3), &[0, 1]);
        assert_eq!(plan.dependencies(4), &[1]);
        assert!(!plan.is_independent());
    }

    #[test]
    fn test_later_extractions_are_not_dependencies() {
        let suite = suite(
            r#"
test_cases:
  - id: early
    endpoint: /items/{{item}}
  - id: late
    endpoint: /items
    extract:
      item: $.id
"#,
        );
        let plan = ExecutionPlan::new(&suite);
        assert!(plan.dependencies(0).is_empty());
        assert!(plan.is_independent());
    }

    #[test]
    fn test_every_extractor_of_a_name_is_a_dependency() {
        let suite = suite(
            r#"
test_cases:
  - id: first
    endpoint: /a
    extract:
      id: $.id
  - id: second
    endpoint: /b
    extract:
      id: $.id
  - id: consumer
    endpoint: /c/{{id}}
"#,
        );
        let plan = ExecutionPlan::new(&suite);
        assert_eq!(plan.dependencies(2), &[0, 1]);
    }

    #[test]
    fn test_seeded_variables_create_no_dependency() {
        let suite = suite(
            r#"
variables:
  host: http://localhost
test_cases:
  - id: a
    endpoint: "{{host}}/a"
"#,
        );
        let plan = ExecutionPlan::new(&suite);
        assert!(plan.is_independent());
        assert_eq!(plan.dependencies(7), &[] as &[usize]);
    }
}
