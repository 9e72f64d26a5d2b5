//! Exclusion and inclusion rule files.
//!
//! One rule per line. A line starting with `r/` is a regular expression
//! (any partial match fires), `R/` an inverted regular expression (fires
//! when it does NOT match), anything else a plain substring. Blank lines
//! are skipped. Inclusion rules are only consulted after an exclusion rule
//! fired, to pull a path back in.

use std::path::Path;

use anyhow::{format_err, Error};

enum Rule {
    Substring(String),
    Regex(regex::Regex),
    InvertedRegex(regex::Regex),
}

impl Rule {
    fn parse(line: &str) -> Result<Self, Error> {
        if let Some(pattern) = line.strip_prefix("r/") {
            Ok(Rule::Regex(regex::Regex::new(pattern)?))
        } else if let Some(pattern) = line.strip_prefix("R/") {
            Ok(Rule::InvertedRegex(regex::Regex::new(pattern)?))
        } else {
            Ok(Rule::Substring(line.to_string()))
        }
    }

    fn matches(&self, rel_path: &str) -> bool {
        match self {
            Rule::Substring(needle) => rel_path.contains(needle),
            Rule::Regex(re) => re.is_match(rel_path),
            Rule::InvertedRegex(re) => !re.is_match(rel_path),
        }
    }
}

#[derive(Default)]
pub struct ExcludeList {
    exclude: Vec<Rule>,
    include: Vec<Rule>,
}

impl ExcludeList {
    /// Load the rule files named on the command line (either may be absent).
    ///
    /// Include rules without an exclude list are inert (they only override
    /// exclusions) but still parsed, so a broken rule file is reported.
    pub fn load(exclude_file: Option<&Path>, include_file: Option<&Path>) -> Result<Self, Error> {
        let mut list = Self::default();
        if let Some(path) = exclude_file {
            list.exclude = Self::load_rules(path)?;
        }
        if let Some(path) = include_file {
            list.include = Self::load_rules(path)?;
        }
        Ok(list)
    }

    fn load_rules(path: &Path) -> Result<Vec<Rule>, Error> {
        let content = proxmox_sys::fs::file_get_contents(path)?;
        let content = String::from_utf8(content)
            .map_err(|_| format_err!("rule file {:?} is not valid UTF-8", path))?;
        let mut rules = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            rules.push(
                Rule::parse(line)
                    .map_err(|err| format_err!("bad rule {:?} in {:?} - {}", line, path, err))?,
            );
        }
        Ok(rules)
    }

    /// Whether a relative path is excluded from the backup.
    ///
    /// `was_excluded` reports that an exclusion rule fired even when an
    /// inclusion rule re-included the path.
    pub fn is_excluded(&self, rel_path: &str, was_excluded: &mut bool) -> bool {
        for rule in &self.exclude {
            if rule.matches(rel_path) {
                *was_excluded = true;
                for include in &self.include {
                    if include.matches(rel_path) {
                        return false;
                    }
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_rules(name: &str, content: &str) -> std::path::PathBuf {
        let path =
            std::env::temp_dir().join(format!("frost-rules-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn substring_regex_and_inclusion() -> Result<(), Error> {
        let exc = write_rules("exc", "subDir/\nr/\\.tmp$\n\nR/^keep");
        let inc = write_rules("inc", "subDir/important");
        let list = ExcludeList::load(Some(&exc), Some(&inc))?;

        let mut flagged = false;
        // substring rule
        assert!(list.is_excluded("subDir/file.txt", &mut flagged));
        // final slash means the directory itself stays included
        assert!(!list.is_excluded("keep-subDir", &mut flagged));
        // regex rule, partial match
        assert!(list.is_excluded("keep-a/b.tmp", &mut flagged));
        // inverted regex: everything not starting with "keep" is excluded
        assert!(list.is_excluded("other.bin", &mut flagged));
        // inclusion wins over exclusion
        flagged = false;
        assert!(!list.is_excluded("subDir/important", &mut flagged));
        assert!(flagged);

        std::fs::remove_file(exc)?;
        std::fs::remove_file(inc)?;
        Ok(())
    }

    #[test]
    fn empty_list_excludes_nothing() {
        let list = ExcludeList::default();
        let mut flagged = false;
        assert!(!list.is_excluded("anything", &mut flagged));
        assert!(!flagged);
    }

    #[test]
    fn include_rules_load_without_an_exclude_list() -> Result<(), Error> {
        let inc = write_rules("inc-alone", "subDir/important");
        let list = ExcludeList::load(None, Some(&inc))?;
        let mut flagged = false;
        assert!(!list.is_excluded("subDir/important", &mut flagged));
        assert!(!flagged);
        std::fs::remove_file(&inc)?;

        // a broken include file is an error even with no exclude list
        let broken = write_rules("inc-broken", "r/[unclosed");
        assert!(ExcludeList::load(None, Some(&broken)).is_err());
        std::fs::remove_file(&broken)?;
        Ok(())
    }
}
