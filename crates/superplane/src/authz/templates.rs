use std::path::Path;

use super::roles::DomainKind;
use super::rules::PolicyRule;
use crate::error::{Error, Result};

const ORG_TEMPLATE: &str = include_str!("../../policies/org.policy");
const CANVAS_TEMPLATE: &str = include_str!("../../policies/canvas.policy");

/// Rules instantiated whenever an organization or canvas is provisioned.
///
/// Lines are `p, ...` or `g, ...`; blank lines and `#` comments are skipped.
/// The domain column carries `{ORG_ID}` or `{CANVAS_ID}`.
#[derive(Debug, Clone)]
pub struct PolicyTemplate {
    kind: DomainKind,
    lines: Vec<String>,
}

impl PolicyTemplate {
    pub fn parse(kind: DomainKind, text: &str) -> Result<Self> {
        let placeholder = placeholder(kind);
        let mut lines = Vec::new();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Validate shape with a dummy id so errors surface at load time.
            PolicyRule::parse_line(&line.replace(placeholder, "0"))
                .map_err(|e| Error::Config(format!("line {}: {e}", number + 1)))?;

            if !line.contains(placeholder) {
                return Err(Error::Config(format!(
                    "line {}: missing {placeholder} placeholder",
                    number + 1
                )));
            }

            lines.push(line.to_string());
        }

        Ok(Self { kind, lines })
    }

    pub fn load(kind: DomainKind, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read policy template {}: {e}", path.display())))?;
        Self::parse(kind, &text)
    }

    pub fn builtin(kind: DomainKind) -> Self {
        let text = match kind {
            DomainKind::Org => ORG_TEMPLATE,
            DomainKind::Canvas => CANVAS_TEMPLATE,
        };
        Self {
            kind,
            lines: text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    /// Concrete rules for one domain id.
    pub fn instantiate(&self, id: &str) -> Result<Vec<PolicyRule>> {
        let placeholder = placeholder(self.kind);
        self.lines
            .iter()
            .map(|line| PolicyRule::parse_line(&line.replace(placeholder, id)))
            .collect()
    }
}

fn placeholder(kind: DomainKind) -> &'static str {
    match kind {
        DomainKind::Org => "{ORG_ID}",
        DomainKind::Canvas => "{CANVAS_ID}",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_templates_are_well_formed() {
        for kind in [DomainKind::Org, DomainKind::Canvas] {
            let builtin = PolicyTemplate::builtin(kind);
            let text = match kind {
                DomainKind::Org => ORG_TEMPLATE,
                DomainKind::Canvas => CANVAS_TEMPLATE,
            };
            let parsed = PolicyTemplate::parse(kind, text).unwrap();
            assert_eq!(builtin.lines, parsed.lines);
            assert!(!builtin.instantiate("abc").unwrap().is_empty());
        }
    }

    #[test]
    fn instantiation_substitutes_domain() {
        let template = PolicyTemplate::parse(
            DomainKind::Canvas,
            "p, role:canvas_viewer, canvas:{CANVAS_ID}, stage, read\n\
             g, role:canvas_admin, role:canvas_viewer, canvas:{CANVAS_ID}\n",
        )
        .unwrap();

        let rules = template.instantiate("c1").unwrap();
        assert_eq!(
            rules,
            vec![
                PolicyRule::grant("role:canvas_viewer", "canvas:c1", "stage", "read"),
                PolicyRule::edge("role:canvas_admin", "role:canvas_viewer", "canvas:c1"),
            ]
        );
    }

    #[test]
    fn rejects_lines_without_placeholder() {
        let err = PolicyTemplate::parse(DomainKind::Org, "p, role:org_viewer, org:1, org, read")
            .unwrap_err();
        assert!(err.message().contains("{ORG_ID}"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# custom").unwrap();
        writeln!(file, "p, role:org_viewer, org:{{ORG_ID}}, org, read").unwrap();
        let template = PolicyTemplate::load(DomainKind::Org, file.path()).unwrap();
        assert_eq!(template.instantiate("o").unwrap().len(), 1);
    }
}
