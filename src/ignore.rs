//! SCM ignore-rule engine.
//!
//! Grounded on `baboon/plugins/git/monitor_git.py`'s `EventHandlerGit`: an
//! ignore file is read line by line, `!`-prefixed lines are include
//! overrides and are evaluated first, every other non-comment/non-blank
//! line is translated to a regex and wrapped so it matches anywhere in the
//! path. A fixed set of patterns is always excluded regardless of the
//! ignore file's contents.

use std::path::Path;

use regex::Regex;

/// Patterns that are always excluded, independent of project-specific
/// ignore rules: SCM lock files, and baboon's own sentinel/metadata paths.
const ALWAYS_EXCLUDE: &[&str] = &[
    r".*\.git/.*\.lock",
    r".*\.baboon-timestamp",
    r".*baboon.*",
];

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    is_override: bool,
}

/// Two ordered lists of compiled regular expressions for one project:
/// include overrides and excludes. A path is ignored iff it matches some
/// exclude and no include override.
#[derive(Debug, Clone)]
pub struct IgnoreRuleSet {
    rules: Vec<CompiledRule>,
}

impl IgnoreRuleSet {
    /// Builds a rule set from the raw contents of a gitignore-style file.
    /// Always-on excludes are appended last so they're present even with an
    /// empty or missing ignore file.
    pub fn compile(ignore_file_contents: &str) -> Self {
        let mut lines: Vec<&str> = ignore_file_contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        // Overrides (`!`-prefixed) are sorted to the front so they are
        // evaluated first, independent of the order the user wrote them in.
        lines.sort_by_key(|l| if l.starts_with('!') { 0 } else { 1 });

        let mut rules: Vec<CompiledRule> = lines
            .into_iter()
            .filter_map(|line| compile_line(line))
            .collect();

        for pattern in ALWAYS_EXCLUDE {
            rules.push(CompiledRule {
                regex: Regex::new(pattern).expect("static always-exclude pattern must compile"),
                is_override: false,
            });
        }

        Self { rules }
    }

    pub fn empty() -> Self {
        Self::compile("")
    }

    /// `isIgnored(relPath)`: true iff some exclude rule matches and no
    /// override rule matches. Idempotent: repeated calls with the same
    /// rule set and path always agree (invariant 4 in section 8).
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let normalized = normalize(rel_path);
        let mut excluded = false;
        for rule in &self.rules {
            if rule.regex.is_match(&normalized) {
                if rule.is_override {
                    return false;
                }
                excluded = true;
            }
        }
        excluded
    }
}

fn normalize(rel_path: &str) -> String {
    rel_path.replace('\\', "/")
}

/// Translates one gitignore-style line into a compiled regex. Shell-glob
/// conversion mirrors `fnmatch.translate`: `*` becomes `[^/]*`-like greedy
/// wildcard (kept non-path-aware to match the original's behaviour), `?`
/// becomes any single character, `.` is escaped. Both override and
/// non-override lines are wrapped with `.*...` on both ends so they match
/// anywhere within the path, the same as the original's unanchored
/// `.search()` against every line regardless of `!`. Anchoring override
/// lines would break their "wins over excludes on any matching sub-path"
/// semantics.
fn compile_line(line: &str) -> Option<CompiledRule> {
    let is_override = line.starts_with('!');
    let pattern = if is_override { &line[1..] } else { line };
    if pattern.is_empty() {
        return None;
    }

    let glob_regex = glob_to_regex(pattern);
    let full_pattern = format!(".*{}.*", glob_regex);

    Regex::new(&full_pattern).ok().map(|regex| CompiledRule { regex, is_override })
}

/// Shell-glob to regex conversion, equivalent in spirit to
/// `fnmatch.translate` but without its trailing `\Z(?ms)` anchor (the
/// caller supplies its own anchoring/wrapping).
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '[' => {
                // Pass through a character class verbatim (common in
                // gitignore patterns like `[Bb]uild`).
                out.push('[');
                while let Some(&next) = chars.peek() {
                    out.push(next);
                    chars.next();
                    if next == ']' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether a directory should be descended into during a tree walk: a
/// directory can be safely pruned if its own relative path (with a
/// trailing slash, so directory-only exclude patterns still line up) is
/// ignored.
pub fn should_descend(rule_set: &IgnoreRuleSet, dir_rel_path: &str) -> bool {
    if dir_rel_path.is_empty() {
        return true;
    }
    !rule_set.is_ignored(dir_rel_path)
}

/// Detects whether a path refers to the ignore file itself, which forces a
/// rebuild of the rule set before the triggering event is processed.
pub fn is_ignore_file(rel_path: &str, ignore_file_name: &str) -> bool {
    rel_path == ignore_file_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_excludes_baboon_metadata() {
        let rules = IgnoreRuleSet::empty();
        assert!(rules.is_ignored(".baboon-timestamp"));
        assert!(rules.is_ignored(".baboon/index"));
        assert!(rules.is_ignored(".git/refs/heads/master.lock"));
    }

    #[test]
    fn excludes_glob_pattern() {
        let rules = IgnoreRuleSet::compile("build/*\n*.o\n");
        assert!(rules.is_ignored("build/out.o"));
        assert!(rules.is_ignored("main.o"));
        assert!(!rules.is_ignored("src/main.rs"));
    }

    #[test]
    fn override_wins_regardless_of_order() {
        // Override appears after the exclude in the file, but must still
        // win because overrides are sorted to the front before compiling.
        let rules = IgnoreRuleSet::compile("*.log\n!keep.log\n");
        assert!(rules.is_ignored("debug.log"));
        assert!(!rules.is_ignored("keep.log"));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let rules = IgnoreRuleSet::compile("# a comment\n\n*.tmp\n");
        assert!(rules.is_ignored("scratch.tmp"));
    }

    #[test]
    fn idempotent_on_repeated_calls() {
        let rules = IgnoreRuleSet::compile("*.log\n");
        let first = rules.is_ignored("a.log");
        let second = rules.is_ignored("a.log");
        assert_eq!(first, second);
    }

    #[test]
    fn should_descend_prunes_ignored_directories() {
        let rules = IgnoreRuleSet::compile("node_modules/*\n");
        assert!(!should_descend(&rules, "node_modules/pkg"));
        assert!(should_descend(&rules, "src"));
    }

    #[test]
    fn windows_style_separators_are_normalized() {
        let rules = IgnoreRuleSet::compile("build/*\n");
        assert!(rules.is_ignored("build\\out.o"));
    }
}
