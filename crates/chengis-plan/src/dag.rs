//! Stage dependency graph: validation, topological ordering, and the
//! per-wave ready-set computation the pipeline executor drives.

use std::collections::{BTreeMap, HashSet};

use chengis_types::StageDef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    SelfDependency(String),
    UnknownDependency { stage: String, dependency: String },
    Cycle(Vec<String>),
}

impl std::fmt::Display for DagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DagError::SelfDependency(s) => write!(f, "stage {s} depends on itself"),
            DagError::UnknownDependency { stage, dependency } => {
                write!(f, "stage {stage} depends on unknown stage {dependency}")
            }
            DagError::Cycle(path) => write!(f, "dependency cycle: {}", path.join(" -> ")),
        }
    }
}

impl std::error::Error for DagError {}

/// Type alias for the adjacency map this module builds and consumes:
/// stage name -> its declared dependency names.
pub type Dag = BTreeMap<String, Vec<String>>;

/// True iff any stage declares `depends_on`. Callers fall back to linear
/// sequential execution when this is false.
pub fn has_dag(stages: &[StageDef]) -> bool {
    stages.iter().any(|s| !s.depends_on.is_empty())
}

/// Build and validate the dependency graph: rejects self-dependency,
/// references to unknown stages, and any cycle (detected fail-fast during
/// DFS coloring).
pub fn build_dag(stages: &[StageDef]) -> Result<Dag, DagError> {
    let names: HashSet<&str> = stages.iter().map(|s| s.stage_name.as_str()).collect();
    let mut dag = Dag::new();
    for stage in stages {
        for dep in &stage.depends_on {
            if dep == &stage.stage_name {
                return Err(DagError::SelfDependency(stage.stage_name.clone()));
            }
            if !names.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency { stage: stage.stage_name.clone(), dependency: dep.clone() });
            }
        }
        dag.insert(stage.stage_name.clone(), stage.depends_on.clone());
    }
    detect_cycle(&dag)?;
    Ok(dag)
}

fn detect_cycle(dag: &Dag) -> Result<(), DagError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(node: &str, dag: &Dag, colors: &mut BTreeMap<String, Color>, stack: &mut Vec<String>) -> Result<(), DagError> {
        match colors.get(node) {
            Some(Color::Black) => return Ok(()),
            Some(Color::Gray) => {
                stack.push(node.to_string());
                return Err(DagError::Cycle(stack.clone()));
            }
            _ => {}
        }
        colors.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());
        if let Some(deps) = dag.get(node) {
            for dep in deps {
                visit(dep, dag, colors, stack)?;
            }
        }
        stack.pop();
        colors.insert(node.to_string(), Color::Black);
        Ok(())
    }

    let mut colors: BTreeMap<String, Color> = dag.keys().map(|k| (k.clone(), Color::White)).collect();
    for name in dag.keys() {
        let mut stack = Vec::new();
        visit(name, dag, &mut colors, &mut stack)?;
    }
    Ok(())
}

/// Kahn's algorithm with a deterministic tie-break: among stages whose
/// dependencies are all satisfied, the one declared earliest goes first.
pub fn topological_sort(stages: &[StageDef]) -> Result<Vec<String>, DagError> {
    let dag = build_dag(stages)?;
    let order_index: BTreeMap<&str, usize> = stages.iter().enumerate().map(|(i, s)| (s.stage_name.as_str(), i)).collect();

    let mut in_degree: BTreeMap<String, usize> = dag.iter().map(|(k, v)| (k.clone(), v.len())).collect();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (stage, deps) in &dag {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(stage.clone());
        }
    }

    let mut queue: Vec<String> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(k, _)| k.clone()).collect();
    let mut result = Vec::with_capacity(stages.len());

    while !queue.is_empty() {
        queue.sort_by_key(|name| order_index[name.as_str()]);
        let next = queue.remove(0);
        result.push(next.clone());
        if let Some(deps_of) = dependents.get(&next) {
            for dependent in deps_of {
                let degree = in_degree.get_mut(dependent).expect("dependent tracked in in_degree");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(dependent.clone());
                }
            }
        }
    }

    Ok(result)
}

/// Stages ready to launch this wave: all dependencies completed, and none
/// of their own dependencies failed.
pub fn ready_set(dag: &Dag, completed: &HashSet<String>, failed: &HashSet<String>) -> Vec<String> {
    let mut ready: Vec<String> = dag
        .iter()
        .filter(|(name, deps)| {
            !completed.contains(*name)
                && !failed.contains(*name)
                && deps.iter().all(|d| completed.contains(d))
                && !deps.iter().any(|d| failed.contains(d))
        })
        .map(|(name, _)| name.clone())
        .collect();
    ready.sort();
    ready
}

/// Stages that can never run because a dependency failed; the executor
/// marks these `aborted` without launching them.
pub fn cascade_aborted(dag: &Dag, completed: &HashSet<String>, failed: &HashSet<String>) -> Vec<String> {
    dag.iter()
        .filter(|(name, deps)| !completed.contains(*name) && !failed.contains(*name) && deps.iter().any(|d| failed.contains(d)))
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, deps: &[&str]) -> StageDef {
        StageDef {
            stage_name: name.to_string(),
            parallel: false,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            approval: None,
            cache: None,
            steps: vec![],
        }
    }

    #[test]
    fn has_dag_false_with_no_depends_on() {
        let stages = vec![stage("a", &[]), stage("b", &[])];
        assert!(!has_dag(&stages));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let stages = vec![stage("a", &["a"])];
        assert_eq!(build_dag(&stages), Err(DagError::SelfDependency("a".into())));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let stages = vec![stage("a", &["ghost"])];
        assert!(matches!(build_dag(&stages), Err(DagError::UnknownDependency { .. })));
    }

    #[test]
    fn cycle_is_rejected() {
        let stages = vec![stage("a", &["b"]), stage("b", &["a"])];
        assert!(matches!(build_dag(&stages), Err(DagError::Cycle(_))));
    }

    #[test]
    fn topological_sort_respects_declaration_order_tie_break() {
        let stages = vec![stage("a", &[]), stage("b", &[]), stage("c", &["a", "b"])];
        let order = topological_sort(&stages).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_dag_ready_sets_progress_in_waves() {
        let stages = vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["a"]), stage("d", &["b", "c"])];
        let dag = build_dag(&stages).unwrap();

        let mut completed = HashSet::new();
        let failed = HashSet::new();
        assert_eq!(ready_set(&dag, &completed, &failed), vec!["a".to_string()]);

        completed.insert("a".to_string());
        assert_eq!(ready_set(&dag, &completed, &failed), vec!["b".to_string(), "c".to_string()]);

        completed.insert("b".to_string());
        completed.insert("c".to_string());
        assert_eq!(ready_set(&dag, &completed, &failed), vec!["d".to_string()]);
    }

    #[test]
    fn failed_dependency_cascades_to_aborted() {
        let stages = vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["b"])];
        let dag = build_dag(&stages).unwrap();
        let completed = HashSet::new();
        let mut failed = HashSet::new();
        failed.insert("a".to_string());

        assert!(ready_set(&dag, &completed, &failed).is_empty());
        assert_eq!(cascade_aborted(&dag, &completed, &failed), vec!["b".to_string()]);
    }
}
