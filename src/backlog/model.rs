//! Backlog grammar.
//!
//! ```text
//! ## Phase 1
//! - [ ] 1.1 Add tests
//!   Criterion: cargo test passes
//!   File: src/lib.rs
//!   Blocker: none
//! - [~] 1.2 Wire the CLI
//! - [x] 1.3 Scaffold crate
//! ```
//!
//! A milestone's metadata runs until a blank line, the next milestone, or a
//! section header. Everything else in the file is left untouched.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

static MILESTONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[( |~|x)\] (\d+\.\d+) (.+)$").expect("milestone pattern is valid")
});

/// Blocker value meaning "nothing to wait for". Case-sensitive.
pub const NO_BLOCKER: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MilestoneState {
    Todo,
    InProgress,
    Done,
}

impl MilestoneState {
    pub fn marker(&self) -> char {
        match self {
            Self::Todo => ' ',
            Self::InProgress => '~',
            Self::Done => 'x',
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            " " => Some(Self::Todo),
            "~" => Some(Self::InProgress),
            "x" => Some(Self::Done),
            _ => None,
        }
    }

    /// The `- [m] {num} ` prefix identifying a milestone line in this state.
    pub fn line_prefix(&self, number: &str) -> String {
        format!("- [{}] {number} ", self.marker())
    }
}

/// One parsed backlog item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Milestone {
    pub number: String,
    pub description: String,
    pub state: MilestoneState,
    pub criterion: String,
    pub file: String,
    pub blocker: String,
    pub note: Option<String>,
    /// Zero-based line of the milestone header.
    pub line: usize,
    /// Zero-based line of its `Blocker:` entry, if present.
    pub blocker_line: Option<usize>,
}

impl Milestone {
    pub fn is_eligible(&self) -> bool {
        self.state == MilestoneState::Todo && self.blocker == NO_BLOCKER
    }

    /// Brief handed to the subagent that works on this milestone.
    pub fn task_brief(&self, backlog_path: &Path) -> String {
        let mut brief = format!(
            "## Milestone {}: {}\nCriterion: {}\nFile: {}\nBlocker: {}",
            self.number, self.description, self.criterion, self.file, self.blocker
        );
        if let Some(note) = &self.note {
            brief.push_str(&format!("\nNote: {note}"));
        }
        brief.push_str(&format!(
            "\n\nWhen complete, edit {} and change `{}` to `{}`. \
             Use the edit_file tool and make this your final step before reporting done.",
            backlog_path.display(),
            MilestoneState::InProgress.line_prefix(&self.number),
            MilestoneState::Done.line_prefix(&self.number),
        ));
        brief
    }
}

/// Parse every milestone in file order.
pub fn parse_milestones(content: &str) -> Vec<Milestone> {
    let lines: Vec<&str> = content.lines().collect();
    let mut milestones = Vec::new();

    for (i, raw) in lines.iter().enumerate() {
        let Some(caps) = MILESTONE_RE.captures(raw.trim()) else {
            continue;
        };
        let Some(state) = MilestoneState::from_marker(&caps[1]) else {
            continue;
        };

        let mut milestone = Milestone {
            number: caps[2].to_string(),
            description: caps[3].trim().to_string(),
            state,
            criterion: String::new(),
            file: String::new(),
            blocker: NO_BLOCKER.to_string(),
            note: None,
            line: i,
            blocker_line: None,
        };

        for (j, meta) in lines.iter().enumerate().skip(i + 1) {
            let meta = meta.trim();
            if meta.is_empty() || meta.starts_with("- [") || meta.starts_with("##") {
                break;
            }
            if let Some(v) = meta.strip_prefix("Criterion:") {
                milestone.criterion = v.trim().to_string();
            } else if let Some(v) = meta.strip_prefix("File:") {
                milestone.file = v.trim().to_string();
            } else if let Some(v) = meta.strip_prefix("Blocker:") {
                milestone.blocker = v.trim().to_string();
                milestone.blocker_line = Some(j);
            } else if let Some(v) = meta.strip_prefix("Note:") {
                milestone.note = Some(v.trim().to_string());
            }
        }

        milestones.push(milestone);
    }

    milestones
}

/// First milestone, in file order, that is todo and unblocked.
pub fn find_eligible(milestones: &[Milestone]) -> Option<&Milestone> {
    milestones.iter().find(|m| m.is_eligible())
}

pub fn completed_numbers(milestones: &[Milestone]) -> HashSet<&str> {
    milestones
        .iter()
        .filter(|m| m.state == MilestoneState::Done)
        .map(|m| m.number.as_str())
        .collect()
}

/// Rewrite the marker of the first milestone line `- [from] {num} ` to `to`.
///
/// Returns `None` when no such line exists. Line endings are preserved.
pub fn set_marker(
    content: &str,
    number: &str,
    from: MilestoneState,
    to: MilestoneState,
) -> Option<String> {
    let needle = from.line_prefix(number);
    let replacement = to.line_prefix(number);
    let mut found = false;

    let updated: String = content
        .split_inclusive('\n')
        .map(|line| {
            if !found && line.trim_start().starts_with(&needle) {
                found = true;
                line.replacen(&needle, &replacement, 1)
            } else {
                line.to_string()
            }
        })
        .collect();

    found.then_some(updated)
}

/// Whether a task label refers to milestone `number`.
///
/// Labels are the milestone number itself, optionally followed by a space
/// and free text. `"21.1"` does not match `"1.1"`.
pub fn match_milestone_label(label: &str, number: &str) -> bool {
    label == number
        || label
            .strip_prefix(number)
            .is_some_and(|rest| rest.starts_with(' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKLOG: &str = "\
# Backlog

## Phase 1
- [x] 1.1 Scaffold crate
- [~] 1.2 Wire the CLI
  Blocker: none
- [ ] 2.1 Add parser
  Criterion: parses the sample file
  File: src/parser.rs
  Blocker: 1.3
- [ ] 2.2 Add tests
  Criterion: cargo test passes
  Blocker: none
  Note: keep fixtures small

## Later
- [ ] 3.1 Docs
";

    #[test]
    fn parses_markers_and_metadata() {
        let ms = parse_milestones(BACKLOG);
        assert_eq!(ms.len(), 5);
        assert_eq!(ms[0].state, MilestoneState::Done);
        assert_eq!(ms[1].state, MilestoneState::InProgress);

        let parser = &ms[2];
        assert_eq!(parser.number, "2.1");
        assert_eq!(parser.description, "Add parser");
        assert_eq!(parser.criterion, "parses the sample file");
        assert_eq!(parser.file, "src/parser.rs");
        assert_eq!(parser.blocker, "1.3");
        assert_eq!(parser.blocker_line, Some(9));
        assert!(!parser.is_eligible());

        assert_eq!(ms[3].note.as_deref(), Some("keep fixtures small"));
        assert_eq!(ms[4].blocker, NO_BLOCKER);
    }

    #[test]
    fn first_unblocked_todo_wins() {
        let ms = parse_milestones(BACKLOG);
        assert_eq!(find_eligible(&ms).unwrap().number, "2.2");
    }

    #[test]
    fn blocker_is_case_sensitive() {
        let ms = parse_milestones("- [ ] 1.1 X\n  Blocker: None\n");
        assert!(find_eligible(&ms).is_none());
    }

    #[test]
    fn metadata_stops_at_section_header() {
        let ms = parse_milestones("- [ ] 1.1 X\n## Next\nBlocker: 9.9\n");
        assert_eq!(ms[0].blocker, NO_BLOCKER);
    }

    #[test]
    fn set_marker_touches_one_line() {
        let updated =
            set_marker(BACKLOG, "2.2", MilestoneState::Todo, MilestoneState::InProgress).unwrap();
        assert!(updated.contains("- [~] 2.2 Add tests\n"));
        assert!(updated.contains("- [ ] 2.1 Add parser\n"));
        assert_eq!(updated.len(), BACKLOG.len());

        assert!(set_marker(BACKLOG, "2.2", MilestoneState::InProgress, MilestoneState::Todo).is_none());
        assert!(set_marker(BACKLOG, "9.9", MilestoneState::Todo, MilestoneState::Done).is_none());
    }

    #[test]
    fn set_marker_does_not_match_longer_numbers() {
        let content = "- [ ] 11.1 Other\n- [ ] 1.1 Target\n";
        let updated =
            set_marker(content, "1.1", MilestoneState::Todo, MilestoneState::InProgress).unwrap();
        assert_eq!(updated, "- [ ] 11.1 Other\n- [~] 1.1 Target\n");
    }

    #[test]
    fn label_matching() {
        assert!(match_milestone_label("1.1", "1.1"));
        assert!(match_milestone_label("1.1 retry", "1.1"));
        assert!(!match_milestone_label("21.1", "1.1"));
        assert!(!match_milestone_label("1.10", "1.1"));
    }

    #[test]
    fn brief_names_the_marker_to_flip() {
        let ms = parse_milestones(BACKLOG);
        let brief = ms[3].task_brief(Path::new("/ws/memory/BACKLOG.md"));
        assert!(brief.starts_with("## Milestone 2.2: Add tests\nCriterion: cargo test passes\n"));
        assert!(brief.contains("Note: keep fixtures small"));
        assert!(brief.contains("change `- [~] 2.2 ` to `- [x] 2.2 `"));
        assert!(brief.contains("/ws/memory/BACKLOG.md"));
    }
}
