// Context file loading for agent turns: a fixed base set plus
// query-scored supplemental selection.
use std::collections::BTreeMap;
use std::path::Path;

pub const WORKER_BASE_CONTEXT_FILES: [&str; 1] = ["context/KERNEL.md"];
pub const TASK_AGENT_BASE_CONTEXT_FILES: [&str; 4] = [
    "context/KERNEL.md",
    "context/TASK_AGENT.md",
    "context/TASK_SOUL.md",
    "context/USER.md",
];
pub const CHAT_BASE_CONTEXT_FILES: [&str; 3] =
    ["context/AGENT.md", "context/SOUL.md", "context/USER.md"];

pub const WORKER_OPERATING_PROMPT: &str = "# WORKER\n\
You are a non-user-facing worker agent.\n\
Focus only on the assigned task and return structured, concise outcomes.\n\
If blocked, clearly report what is missing.\n";

/// Read a list of repo-relative files; missing or unreadable files are
/// silently skipped.
pub fn load_context_files<I, S>(root: &Path, files: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut loaded = BTreeMap::new();
    for rel in files {
        let rel = rel.as_ref();
        let path = root.join(rel);
        if !path.is_file() {
            continue;
        }
        if let Ok(text) = std::fs::read_to_string(&path) {
            if !text.trim().is_empty() {
                loaded.insert(rel.to_string(), text);
            }
        }
    }
    loaded
}

fn score_file(query: &str, rel_path: &str, text: &str) -> usize {
    let haystack = format!(
        "{} {}",
        rel_path.to_lowercase(),
        text.chars().take(2000).collect::<String>().to_lowercase()
    );
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|token| token.len() >= 3)
        .filter(|token| haystack.contains(*token))
        .count()
}

/// Select up to `max_files` supplemental context files under
/// `context/more-about-human/` by simple substring scoring against the
/// query. Zero-score files are never selected.
pub fn select_supplemental_files(
    root: &Path,
    query: &str,
    max_files: usize,
) -> BTreeMap<String, String> {
    let mut candidates: Vec<(usize, String, String)> = Vec::new();
    let dirs = [
        root.join("context").join("more-about-human"),
        root.join("context").join("more-about-human").join("projects"),
    ];
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "md").unwrap_or(false))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let score = score_file(query, &rel, &text);
            if score > 0 {
                candidates.push((score, rel, text));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates
        .into_iter()
        .take(max_files)
        .map(|(_, rel, text)| (rel, text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("context")).unwrap();
        std::fs::write(dir.path().join("context").join("KERNEL.md"), "kernel rules").unwrap();

        let loaded = load_context_files(dir.path(), TASK_AGENT_BASE_CONTEXT_FILES);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("context/KERNEL.md"));
    }

    #[test]
    fn supplemental_selection_scores_by_query() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("context").join("more-about-human");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("climbing.md"), "notes about climbing trips").unwrap();
        std::fs::write(base.join("cooking.md"), "favorite recipes").unwrap();

        let selected = select_supplemental_files(dir.path(), "plan a climbing weekend", 3);
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("context/more-about-human/climbing.md"));

        let none = select_supplemental_files(dir.path(), "zz", 3);
        assert!(none.is_empty());
    }
}
