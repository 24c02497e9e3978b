use serde::{Deserialize, Serialize};

/// Access pattern of a subtree, decides what unit gets exported for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    #[default]
    Generic,
    /// Few hot directories close to the root, export their busy grandchildren.
    HotRoot,
    /// Wide scans, export the enclosing parent in one piece.
    Scan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRule {
    pub prefix: String,
    pub workload: WorkloadType,
}

pub trait PathClassifier: Send {
    fn classify(&self, path: &str) -> WorkloadType;
}

/// Longest matching prefix wins, unmatched paths are generic.
#[derive(Clone, Debug, Default)]
pub struct PrefixClassifier {
    rules: Vec<WorkloadRule>,
}

impl PrefixClassifier {
    pub fn new(mut rules: Vec<WorkloadRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl PathClassifier for PrefixClassifier {
    fn classify(&self, path: &str) -> WorkloadType {
        self.rules
            .iter()
            .find(|rule| matches_prefix(path, &rule.prefix))
            .map(|rule| rule.workload)
            .unwrap_or_default()
    }
}
