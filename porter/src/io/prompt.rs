//! Structured prompt builder for engine input.
//!
//! Prompts are rendered from templates into marked sections, then fitted
//! to a byte budget by dropping droppable sections before truncating.
//! Small source files are inlined; larger ones are snapshotted to disk and
//! referenced by path so prompts stay bounded.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::Task;
use crate::io::write_safety::content_hash;

const CONVERT_TEMPLATE: &str = include_str!("prompts/convert.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");

/// One source file as it appears in a prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub path: String,
    pub inline: Option<String>,
    pub snapshot: Option<String>,
    pub missing: bool,
}

/// Inputs for a convert-task prompt.
#[derive(Debug, Clone)]
pub struct ConvertPromptInputs {
    pub goal: String,
    pub source_repo: String,
    pub target_repo: String,
    pub sources: Vec<SourceEntry>,
    pub existing_snapshots: Vec<String>,
    pub requirements: Vec<String>,
    pub acceptance: Vec<String>,
    pub deliverables: Vec<String>,
}

impl ConvertPromptInputs {
    /// Gather prompt inputs for a task, snapshotting oversized sources and
    /// any existing target content.
    pub fn gather(
        task: &Task,
        source_root: &Path,
        target_root: &Path,
        snapshots_dir: &Path,
        inline_limit_bytes: usize,
    ) -> Result<Self> {
        let mut sources = Vec::new();
        for source_file in &task.source_files {
            let full = source_root.join(source_file);
            if !full.exists() {
                sources.push(SourceEntry {
                    path: source_file.clone(),
                    inline: None,
                    snapshot: None,
                    missing: true,
                });
                continue;
            }
            let content = fs::read_to_string(&full)
                .with_context(|| format!("read source {}", full.display()))?;
            if content.len() > inline_limit_bytes {
                let snapshot = create_snapshot(&content, snapshots_dir, source_file)?;
                sources.push(SourceEntry {
                    path: source_file.clone(),
                    inline: None,
                    snapshot: Some(snapshot.display().to_string()),
                    missing: false,
                });
            } else {
                sources.push(SourceEntry {
                    path: source_file.clone(),
                    inline: Some(content),
                    snapshot: None,
                    missing: false,
                });
            }
        }

        let mut existing_snapshots = Vec::new();
        for target_file in &task.target_files {
            let full = target_root.join(target_file);
            if full.exists() {
                let content = fs::read_to_string(&full)
                    .with_context(|| format!("read target {}", full.display()))?;
                let snapshot = create_snapshot(&content, snapshots_dir, target_file)?;
                existing_snapshots.push(snapshot.display().to_string());
            }
        }

        let deliverables = if task.deliverables.is_empty() {
            task.target_files.clone()
        } else {
            task.deliverables.clone()
        };

        Ok(Self {
            goal: task.criteria_text(),
            source_repo: source_root.display().to_string(),
            target_repo: target_root.display().to_string(),
            sources,
            existing_snapshots,
            requirements: vec![],
            acceptance: task.acceptance_criteria.clone(),
            deliverables,
        })
    }
}

/// Candidate summary line rendered into the judge prompt.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeCandidate {
    pub engine: String,
    pub deliverables_ok: bool,
    pub equivalence: String,
    pub confidence: f64,
    pub placeholder_penalty: u32,
    pub validation: String,
    pub output_json: String,
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Render the convert prompt for a task.
    pub fn build_convert(&self, inputs: &ConvertPromptInputs) -> String {
        let env = template_env();
        let template = env
            .get_template("convert")
            .expect("convert template is registered");
        let rendered = template
            .render(context! {
                goal => &inputs.goal,
                source_repo => &inputs.source_repo,
                target_repo => &inputs.target_repo,
                source_list => non_empty_join(inputs.sources.iter().map(|s| s.path.as_str())),
                target_list => non_empty_join(inputs.deliverables.iter().map(String::as_str)),
                sources => &inputs.sources,
                existing => &inputs.existing_snapshots,
                requirements => &inputs.requirements,
                acceptance => &inputs.acceptance,
                deliverables => &inputs.deliverables,
            })
            .expect("convert template rendering should not fail");

        self.fit_to_budget(&rendered)
    }

    /// Render the judge comparison prompt.
    pub fn build_judge(&self, criteria: &str, candidates: &[JudgeCandidate]) -> String {
        let env = template_env();
        let template = env
            .get_template("judge")
            .expect("judge template is registered");
        let rendered = template
            .render(context! {
                criteria => criteria,
                candidates => candidates,
            })
            .expect("judge template rendering should not fail");

        self.fit_to_budget(&rendered)
    }

    fn fit_to_budget(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn non_empty_join<'a>(items: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined: Vec<&str> = items.collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(", "))
    }
}

fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("convert", CONVERT_TEMPLATE)
        .expect("convert template should be valid");
    env.add_template("judge", JUDGE_TEMPLATE)
        .expect("judge template should be valid");
    env
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered output using HTML comment markers:
/// `<!-- section:KEY required|droppable -->`.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Drop droppable sections (existing first, then sources) and finally
/// truncate the last section when still over budget.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    if total(sections) <= budget {
        return;
    }

    for key in ["existing", "sources"] {
        if total(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, "dropped prompt section for budget");
            sections.remove(idx);
        }
    }

    if total(sections) > budget && !sections.is_empty() {
        let other: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other);
        let last = sections.last_mut().unwrap();
        if last.content.len() > allowed {
            if allowed > 12 {
                last.content.truncate(allowed - 12);
                last.content.push_str("\n[truncated]");
            } else {
                last.content.truncate(allowed);
            }
        }
    }
}

/// Write content to a content-hash-named snapshot file, returning its path.
pub fn create_snapshot(content: &str, snapshots_dir: &Path, label: &str) -> Result<PathBuf> {
    fs::create_dir_all(snapshots_dir)
        .with_context(|| format!("create snapshot dir {}", snapshots_dir.display()))?;
    let digest = content_hash(content.as_bytes());
    let stem = Path::new(label)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let path = snapshots_dir.join(format!("{stem}_{}.txt", &digest[..16]));
    if !path.exists() {
        fs::write(&path, content).with_context(|| format!("write snapshot {}", path.display()))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Phase;
    use crate::test_support::task;

    fn inputs_for(task: &Task, temp: &Path) -> ConvertPromptInputs {
        ConvertPromptInputs::gather(task, &temp.join("src"), &temp.join("dst"), &temp.join("snap"), 100)
            .expect("gather")
    }

    #[test]
    fn prompt_has_required_sections_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        let mut t = task("t-001", Phase::File);
        t.acceptance_criteria = vec!["convert the parser".to_string()];
        t.target_files = vec!["src/parser.rs".to_string()];

        let prompt = PromptBuilder::new(40_000).build_convert(&inputs_for(&t, temp.path()));

        let goal = prompt.find("## GOAL").expect("goal");
        let ctx = prompt.find("## CONTEXT").expect("context");
        let req = prompt.find("## REQUIREMENTS").expect("requirements");
        let acc = prompt.find("## ACCEPTANCE CRITERIA").expect("acceptance");
        let del = prompt.find("## DELIVERABLES").expect("deliverables");
        assert!(goal < ctx && ctx < req && req < acc && acc < del);
        assert!(prompt.contains("convert the parser"));
        assert!(prompt.contains("\"files\""));
    }

    #[test]
    fn small_sources_are_inlined_large_ones_snapshotted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("small.py"), "print('small')").expect("small");
        fs::write(src.join("big.py"), "x".repeat(500)).expect("big");

        let mut t = task("t-001", Phase::File);
        t.source_files = vec!["small.py".to_string(), "big.py".to_string()];

        let inputs = inputs_for(&t, temp.path());
        assert_eq!(inputs.sources.len(), 2);
        assert!(inputs.sources[0].inline.is_some());
        assert!(inputs.sources[1].snapshot.is_some());
        let snapshot_path = inputs.sources[1].snapshot.as_ref().expect("snapshot");
        assert!(Path::new(snapshot_path).exists());

        let prompt = PromptBuilder::new(40_000).build_convert(&inputs);
        assert!(prompt.contains("print('small')"));
        assert!(prompt.contains("large file, see snapshot"));
    }

    #[test]
    fn missing_sources_are_marked() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        let mut t = task("t-001", Phase::File);
        t.source_files = vec!["ghost.py".to_string()];

        let prompt = PromptBuilder::new(40_000).build_convert(&inputs_for(&t, temp.path()));
        assert!(prompt.contains("`ghost.py` (not found)"));
    }

    #[test]
    fn budget_drops_source_sections_before_required_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("a.py"), "y".repeat(90)).expect("seed");

        let mut t = task("t-001", Phase::File);
        t.acceptance_criteria = vec!["convert a".to_string()];
        t.source_files = vec!["a.py".to_string()];

        let prompt = PromptBuilder::new(450).build_convert(&inputs_for(&t, temp.path()));
        assert!(!prompt.contains("## SOURCE FILES"));
        assert!(prompt.contains("## GOAL"));
    }

    #[test]
    fn snapshots_are_content_addressed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_snapshot("same content", temp.path(), "a.py").expect("first");
        let second = create_snapshot("same content", temp.path(), "a.py").expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn judge_prompt_lists_candidates_and_format() {
        let candidates = vec![JudgeCandidate {
            engine: "claude".to_string(),
            deliverables_ok: true,
            equivalence: "high".to_string(),
            confidence: 0.8,
            placeholder_penalty: 0,
            validation: "passed".to_string(),
            output_json: "{\"files\": []}".to_string(),
        }];
        let prompt = PromptBuilder::new(40_000).build_judge("do the thing", &candidates);
        assert!(prompt.contains("### ENGINE: claude"));
        assert!(prompt.contains("winner_engine"));
        assert!(prompt.contains("do the thing"));
    }
}
