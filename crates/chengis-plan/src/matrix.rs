//! Matrix expansion: Cartesian product of axes with exclusions, stage-name
//! suffixing, and `MATRIX_*` env injection into every step of the expanded
//! stage.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use chengis_types::{MatrixDef, StageDef};

/// One concrete combination of axis values, e.g. `{os: linux, jdk: 11}`.
pub type Combination = BTreeMap<String, String>;

/// Cartesian product of `matrix.axes`, with any combination matching an
/// `exclude` entry (by containment: every key/value pair in the exclude
/// entry is present in the combination) dropped.
pub fn expand_combinations(matrix: &MatrixDef) -> Vec<Combination> {
    let mut combos: Vec<Combination> = vec![Combination::new()];
    for (key, values) in &matrix.axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.into_iter().filter(|combo| !matches_any_exclude(combo, &matrix.exclude)).collect()
}

fn matches_any_exclude(combo: &Combination, excludes: &[Combination]) -> bool {
    excludes.iter().any(|exclude| exclude.iter().all(|(k, v)| combo.get(k) == Some(v)))
}

/// Stage name suffix for a combination: `"{base} (k1=v1, k2=v2)"`, keys in
/// sorted order for determinism (the combination is already a `BTreeMap`).
pub fn suffixed_stage_name(base: &str, combo: &Combination) -> String {
    let suffix = combo.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");
    format!("{base} ({suffix})")
}

/// `MATRIX_<KEY>` env var name for an axis key, upper-cased.
fn matrix_env_name(key: &str) -> String {
    format!("MATRIX_{}", key.to_uppercase())
}

/// Expand one stage definition into one copy per combination, injecting
/// `MATRIX_*` env vars into every step and renaming the stage.
pub fn expand_stage(stage: &StageDef, combo: &Combination) -> StageDef {
    let mut expanded = stage.clone();
    expanded.stage_name = suffixed_stage_name(&stage.stage_name, combo);
    for step in &mut expanded.steps {
        for (key, value) in combo {
            step.env.insert(matrix_env_name(key), value.clone());
        }
    }
    expanded
}

/// Expand every matrix-bearing stage in a pipeline, respecting
/// `max_combinations * stages.len()`. `matrix: None` returns the input
/// stages unchanged.
pub fn expand_pipeline(stages: &[StageDef], matrix: Option<&MatrixDef>, max_combinations: usize) -> Result<Vec<StageDef>> {
    let Some(matrix) = matrix else {
        return Ok(stages.to_vec());
    };
    let combinations = expand_combinations(matrix);
    if combinations.len().saturating_mul(stages.len()) > max_combinations {
        bail!(
            "matrix expansion of {} combinations over {} stages exceeds the {} limit",
            combinations.len(),
            stages.len(),
            max_combinations
        );
    }

    let mut expanded = Vec::with_capacity(combinations.len() * stages.len());
    for stage in stages {
        for combo in &combinations {
            expanded.push(expand_stage(stage, combo));
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_types::{StepDef, StepType};
    use std::collections::BTreeMap;

    fn axes(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs.iter().map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect())).collect()
    }

    #[test]
    fn two_by_two_expands_to_four_combinations() {
        let matrix = MatrixDef { axes: axes(&[("os", &["linux", "mac"]), ("jdk", &["11", "17"])]), exclude: vec![] };
        let combos = expand_combinations(&matrix);
        assert_eq!(combos.len(), 4);
    }

    #[test]
    fn exclude_drops_matching_combination() {
        let mut exclude = Combination::new();
        exclude.insert("os".into(), "mac".into());
        exclude.insert("jdk".into(), "11".into());
        let matrix = MatrixDef { axes: axes(&[("os", &["linux", "mac"]), ("jdk", &["11", "17"])]), exclude: vec![exclude] };
        let combos = expand_combinations(&matrix);
        assert_eq!(combos.len(), 3);
        assert!(!combos.iter().any(|c| c.get("os").map(String::as_str) == Some("mac") && c.get("jdk").map(String::as_str) == Some("11")));
    }

    #[test]
    fn expanded_stage_name_contains_each_axis_value() {
        let matrix = MatrixDef { axes: axes(&[("os", &["linux", "mac"]), ("jdk", &["11", "17"])]), exclude: vec![] };
        let step = StepDef {
            step_name: "build".into(),
            step_type: StepType::Shell,
            command: Some("echo hi".into()),
            image: None,
            env: BTreeMap::new(),
            timeout_ms: None,
            condition: None,
            cache_volumes: BTreeMap::new(),
            volumes: vec![],
            network: None,
            workdir: None,
            extra_args: vec![],
        };
        let stage = StageDef { stage_name: "build".into(), parallel: false, depends_on: vec![], approval: None, cache: None, steps: vec![step] };

        let expanded = expand_pipeline(&[stage], Some(&matrix), 100).unwrap();
        assert_eq!(expanded.len(), 4);
        for s in &expanded {
            assert!(s.stage_name.contains("os=linux") || s.stage_name.contains("os=mac"));
            assert!(s.stage_name.contains("jdk=11") || s.stage_name.contains("jdk=17"));
            let env = &s.steps[0].env;
            assert!(env.contains_key("MATRIX_OS"));
            assert!(env.contains_key("MATRIX_JDK"));
        }
    }

    #[test]
    fn expansion_over_limit_is_rejected() {
        let matrix = MatrixDef { axes: axes(&[("a", &["1", "2", "3"])]), exclude: vec![] };
        let stages = vec![
            StageDef { stage_name: "s1".into(), parallel: false, depends_on: vec![], approval: None, cache: None, steps: vec![] },
            StageDef { stage_name: "s2".into(), parallel: false, depends_on: vec![], approval: None, cache: None, steps: vec![] },
        ];
        assert!(expand_pipeline(&stages, Some(&matrix), 4).is_err());
    }

    #[test]
    fn no_matrix_returns_stages_unchanged() {
        let stages = vec![StageDef { stage_name: "s1".into(), parallel: false, depends_on: vec![], approval: None, cache: None, steps: vec![] }];
        let expanded = expand_pipeline(&stages, None, 100).unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].stage_name, "s1");
    }
}
