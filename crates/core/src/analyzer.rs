//! # Codebase Analyzer
//!
//! The "brain" that seeds the pipeline: scans a codebase in one of four
//! modes, turns findings into scored umbrella tasks, and decomposes each
//! into its three concern children. Analysis is all-or-nothing: candidates
//! are gathered completely before the first store write, so a failed scan
//! never leaves a partial batch behind.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decompose::Decomposer;
use crate::error::Result;
use crate::scoring::WsjfInputs;
use crate::state::{generate_task_id, Task, TaskStore};
use crate::tools::Codebase;

/// Ceiling on tasks created per analysis run
const MAX_CANDIDATES: usize = 25;

/// Line count above which a file is considered a refactor target
const LONG_FILE_LINES: usize = 400;

/// What the analyzer looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzeMode {
    /// Coarse gaps: top-level areas with no test coverage at all
    Vision,
    /// Deferred-work markers (TODO, FIXME, HACK)
    Fix,
    /// Panic-prone and unsafe patterns
    Security,
    /// Oversized files
    Refactor,
}

impl AnalyzeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Fix => "fix",
            Self::Security => "security",
            Self::Refactor => "refactor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "vision" => Self::Vision,
            "fix" => Self::Fix,
            "security" => Self::Security,
            "refactor" => Self::Refactor,
            _ => return None,
        })
    }
}

impl fmt::Display for AnalyzeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding not yet committed to the store
struct Candidate {
    title: String,
    description: String,
    files: Vec<String>,
    inputs: WsjfInputs,
    complexity: u32,
}

/// Scans a codebase and seeds scored, decomposed tasks
pub struct Analyzer {
    store: TaskStore,
    decomposer: Decomposer,
}

impl Analyzer {
    pub fn new(store: TaskStore) -> Self {
        let decomposer = Decomposer::new(store.clone());
        Self { store, decomposer }
    }

    /// Run one analysis pass. Returns the umbrella tasks created (their
    /// concern children are in the store as well).
    pub fn analyze(&self, codebase: &Codebase, mode: AnalyzeMode) -> Result<Vec<Task>> {
        let mut candidates = match mode {
            AnalyzeMode::Vision => self.scan_vision(codebase)?,
            AnalyzeMode::Fix => self.scan_fix(codebase)?,
            AnalyzeMode::Security => self.scan_security(codebase)?,
            AnalyzeMode::Refactor => self.scan_refactor(codebase)?,
        };

        candidates.sort_by(|a, b| {
            b.inputs
                .score()
                .partial_cmp(&a.inputs.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(MAX_CANDIDATES);

        tracing::info!(
            mode = %mode,
            count = candidates.len(),
            "Analysis complete, seeding tasks"
        );

        let mut parents = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let task = Task::new(generate_task_id(), candidate.title)
                .with_description(candidate.description)
                .with_priority(candidate.inputs.score())
                .with_complexity(candidate.complexity)
                .with_files(candidate.files);
            self.store.create(&task)?;
            self.decomposer.decompose(&task.id)?;
            parents.push(self.store.get(&task.id)?);
        }
        Ok(parents)
    }

    fn scan_fix(&self, codebase: &Codebase) -> Result<Vec<Candidate>> {
        let marker = Regex::new(r"\b(TODO|FIXME|HACK)\b").expect("static regex");
        let mut candidates = Vec::new();
        for path in codebase.source_files() {
            let Ok(contents) = codebase.read(&path) else {
                // Binary or unreadable file, not a finding
                continue;
            };
            let marks = marker.find_iter(&contents).count();
            if marks == 0 {
                continue;
            }
            let rel = codebase.relative(&path);
            candidates.push(Candidate {
                title: format!("Resolve deferred work in {}", rel),
                description: format!("{} deferred-work markers in {}", marks, rel),
                files: vec![rel],
                inputs: WsjfInputs {
                    value: marks as f64,
                    time_criticality: 2.0,
                    risk_reduction: 1.0,
                    job_size: (marks as f64 / 2.0).max(1.0),
                },
                complexity: (marks as u32).clamp(1, 8),
            });
        }
        Ok(candidates)
    }

    fn scan_security(&self, codebase: &Codebase) -> Result<Vec<Candidate>> {
        let risky = Regex::new(r"\.unwrap\(\)|\.expect\(|panic!\(|\bunsafe\b").expect("static regex");
        let mut candidates = Vec::new();
        for path in codebase.source_files() {
            if path.extension().and_then(|e| e.to_str()) != Some("rs") {
                continue;
            }
            let Ok(contents) = codebase.read(&path) else {
                continue;
            };
            let hits = risky.find_iter(&contents).count();
            if hits == 0 {
                continue;
            }
            let rel = codebase.relative(&path);
            candidates.push(Candidate {
                title: format!("Harden panic-prone paths in {}", rel),
                description: format!("{} panic-prone or unsafe sites in {}", hits, rel),
                files: vec![rel],
                inputs: WsjfInputs {
                    value: hits as f64,
                    time_criticality: 1.0,
                    risk_reduction: hits as f64,
                    job_size: (hits as f64 / 3.0).max(1.0),
                },
                complexity: (hits as u32 / 2).clamp(1, 8),
            });
        }
        Ok(candidates)
    }

    fn scan_refactor(&self, codebase: &Codebase) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for path in codebase.source_files() {
            let Ok(contents) = codebase.read(&path) else {
                continue;
            };
            let lines = contents.lines().count();
            if lines <= LONG_FILE_LINES {
                continue;
            }
            let rel = codebase.relative(&path);
            let overshoot = (lines - LONG_FILE_LINES) as f64 / LONG_FILE_LINES as f64;
            candidates.push(Candidate {
                title: format!("Split oversized module {}", rel),
                description: format!("{} lines in {}", lines, rel),
                files: vec![rel],
                inputs: WsjfInputs {
                    value: 2.0,
                    time_criticality: 1.0,
                    risk_reduction: 2.0 + overshoot,
                    job_size: (lines as f64 / LONG_FILE_LINES as f64).max(1.0),
                },
                complexity: ((lines / LONG_FILE_LINES) as u32 + 2).clamp(2, 10),
            });
        }
        Ok(candidates)
    }

    fn scan_vision(&self, codebase: &Codebase) -> Result<Vec<Candidate>> {
        let files = codebase.source_files();
        let mut candidates = Vec::new();
        for dir in codebase.top_level_dirs() {
            let rel_dir = codebase.relative(&dir);
            let in_dir: Vec<&std::path::PathBuf> =
                files.iter().filter(|f| f.starts_with(&dir)).collect();
            if in_dir.is_empty() {
                continue;
            }
            let has_tests = in_dir.iter().any(|f| {
                let p = f.to_string_lossy();
                p.contains("/tests/")
                    || p.contains("_test.")
                    || codebase
                        .read(f)
                        .map(|c| c.contains("#[cfg(test)]") || c.contains("#[test]"))
                        .unwrap_or(false)
            });
            if has_tests {
                continue;
            }
            candidates.push(Candidate {
                title: format!("Establish test coverage for {}/", rel_dir),
                description: format!(
                    "{} source files under {}/ with no tests",
                    in_dir.len(),
                    rel_dir
                ),
                files: in_dir.iter().map(|f| codebase.relative(f)).collect(),
                inputs: WsjfInputs {
                    value: 3.0,
                    time_criticality: 2.0,
                    risk_reduction: in_dir.len() as f64,
                    job_size: (in_dir.len() as f64 / 2.0).max(1.0),
                },
                complexity: (in_dir.len() as u32).clamp(2, 10),
            });
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Concern, ForgeDb, TaskStatus};
    use std::fs;
    use std::path::PathBuf;

    fn setup(name: &str) -> (Analyzer, TaskStore, PathBuf, PathBuf) {
        let db_path = std::env::temp_dir().join(format!("forge_analyzer_{}.db", name));
        let _ = fs::remove_file(&db_path);
        let db = ForgeDb::open_at(&db_path).unwrap();
        let store = TaskStore::new(&db);

        let tree = std::env::temp_dir().join(format!("forge_analyzer_tree_{}", name));
        let _ = fs::remove_dir_all(&tree);
        fs::create_dir_all(tree.join("src")).unwrap();

        (Analyzer::new(store.clone()), store, db_path, tree)
    }

    fn cleanup(db_path: &PathBuf, tree: &PathBuf) {
        let _ = fs::remove_file(db_path);
        let _ = fs::remove_dir_all(tree);
    }

    #[test]
    fn test_fix_mode_seeds_decomposed_tasks() {
        let (analyzer, store, db_path, tree) = setup("fix");
        fs::write(
            tree.join("src/lib.rs"),
            "// TODO: handle overflow\n// FIXME: leaks\nfn f() {}\n",
        )
        .unwrap();
        fs::write(tree.join("src/clean.rs"), "fn g() {}\n").unwrap();

        let cb = Codebase::open(&tree).unwrap();
        let parents = analyzer.analyze(&cb, AnalyzeMode::Fix).unwrap();
        assert_eq!(parents.len(), 1);

        let parent = &parents[0];
        assert_eq!(parent.concern, Concern::Unscoped);
        assert_eq!(parent.children.len(), 3);
        assert!(parent.priority > 0.0);

        // Each child is claimable; the parent is not
        let counts = store.counts_by_status().unwrap();
        assert_eq!(counts.pending, 4);
        for suffix in ["feature", "guard", "failure"] {
            let child = store.get(&format!("{}-{}", parent.id, suffix)).unwrap();
            assert_eq!(child.status, TaskStatus::Pending);
            assert_ne!(child.concern, Concern::Unscoped);
        }
        cleanup(&db_path, &tree);
    }

    #[test]
    fn test_security_mode_scores_by_hit_count() {
        let (analyzer, _store, db_path, tree) = setup("security");
        fs::write(
            tree.join("src/risky.rs"),
            "fn f() { x.unwrap(); y.unwrap(); panic!(\"no\"); }\n",
        )
        .unwrap();
        fs::write(tree.join("src/notes.md"), "unwrap() in prose\n").unwrap();

        let cb = Codebase::open(&tree).unwrap();
        let parents = analyzer.analyze(&cb, AnalyzeMode::Security).unwrap();
        // Markdown file is skipped; only the .rs file is a finding
        assert_eq!(parents.len(), 1);
        assert!(parents[0].title.contains("risky.rs"));
        cleanup(&db_path, &tree);
    }

    #[test]
    fn test_refactor_mode_flags_long_files_only() {
        let (analyzer, _store, db_path, tree) = setup("refactor");
        let long = "fn x() {}\n".repeat(LONG_FILE_LINES + 50);
        fs::write(tree.join("src/huge.rs"), long).unwrap();
        fs::write(tree.join("src/small.rs"), "fn y() {}\n").unwrap();

        let cb = Codebase::open(&tree).unwrap();
        let parents = analyzer.analyze(&cb, AnalyzeMode::Refactor).unwrap();
        assert_eq!(parents.len(), 1);
        assert!(parents[0].title.contains("huge.rs"));
        cleanup(&db_path, &tree);
    }

    #[test]
    fn test_vision_mode_skips_tested_areas() {
        let (analyzer, _store, db_path, tree) = setup("vision");
        fs::write(tree.join("src/lib.rs"), "fn f() {}\n").unwrap();
        fs::create_dir_all(tree.join("covered")).unwrap();
        fs::write(
            tree.join("covered/mod.rs"),
            "fn g() {}\n#[cfg(test)]\nmod tests {}\n",
        )
        .unwrap();

        let cb = Codebase::open(&tree).unwrap();
        let parents = analyzer.analyze(&cb, AnalyzeMode::Vision).unwrap();
        assert_eq!(parents.len(), 1);
        assert!(parents[0].title.contains("src/"));
        cleanup(&db_path, &tree);
    }

    #[test]
    fn test_unreadable_root_creates_nothing() {
        let (analyzer, store, db_path, tree) = setup("unreadable");
        assert!(Codebase::open(tree.join("missing")).is_err());
        // No store writes happened
        assert_eq!(store.counts_by_status().unwrap().total(), 0);
        drop(analyzer);
        cleanup(&db_path, &tree);
    }

    #[test]
    fn test_mode_roundtrip() {
        for m in [
            AnalyzeMode::Vision,
            AnalyzeMode::Fix,
            AnalyzeMode::Security,
            AnalyzeMode::Refactor,
        ] {
            assert_eq!(AnalyzeMode::parse(m.as_str()), Some(m));
        }
        assert_eq!(AnalyzeMode::parse("bogus"), None);
    }
}
