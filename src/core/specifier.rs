//! Python version specifiers
//!
//! Decides whether a recorded python package version already satisfies a
//! requirement's specifier (`>=1.0,<2.0`, `==1.2.*`, `~=1.4`, ...), so an
//! unchanged dependency is not reinstalled. Each clause is translated to a
//! semver comparator. Anything that cannot be translated faithfully counts as
//! "not satisfied", which only costs a reinstall.

use regex::Regex;
use semver::{Version, VersionReq};
use std::sync::LazyLock;

static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(===|==|!=|~=|>=|<=|>|<)\s*([0-9A-Za-z.*+!-]+)$").expect("valid regex")
});

/// A single translated clause
#[derive(Debug, Clone, PartialEq)]
struct Clause {
    requirement: VersionReq,
    negate: bool,
}

impl Clause {
    fn matches(&self, version: &Version) -> bool {
        self.requirement.matches(version) != self.negate
    }
}

/// Parse a plain numeric version (`1`, `1.2`, `1.2.3`, optional `v` prefix)
pub fn lenient_version(version: &str) -> Option<Version> {
    let numbers = numeric_parts(version.trim().trim_start_matches('v'))?;
    Some(Version::new(numbers[0], numbers[1], numbers[2]))
}

/// Split into at most three numeric components, zero padded
fn numeric_parts(version: &str) -> Option<[u64; 3]> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some(numbers)
}

fn full(numbers: [u64; 3]) -> String {
    format!("{}.{}.{}", numbers[0], numbers[1], numbers[2])
}

fn req(text: &str) -> Option<VersionReq> {
    VersionReq::parse(text).ok()
}

fn translate_clause(clause: &str) -> Option<Vec<Clause>> {
    let caps = CLAUSE_RE.captures(clause.trim())?;
    let operator = &caps[1];
    let version = &caps[2];

    let plain = |op: &str| -> Option<Vec<Clause>> {
        Some(vec![Clause {
            requirement: req(&format!("{op}{}", full(numeric_parts(version)?)))?,
            negate: false,
        }])
    };

    match operator {
        "==" | "===" | "!=" => {
            let negate = operator == "!=";
            let requirement = if let Some(prefix) = version.strip_suffix(".*") {
                // semver partial versions are prefix matches
                numeric_parts(prefix)?;
                req(&format!("={prefix}"))?
            } else {
                req(&format!("={}", full(numeric_parts(version)?)))?
            };
            Some(vec![Clause {
                requirement,
                negate,
            }])
        }
        "~=" => {
            let parts: Vec<&str> = version.split('.').collect();
            let numbers = numeric_parts(version)?;
            let upper = match parts.len() {
                2 => [numbers[0] + 1, 0, 0],
                3 => [numbers[0], numbers[1] + 1, 0],
                _ => return None,
            };
            Some(vec![Clause {
                requirement: req(&format!(">={}, <{}", full(numbers), full(upper)))?,
                negate: false,
            }])
        }
        ">=" | "<=" | ">" | "<" => plain(operator),
        _ => None,
    }
}

/// Translate a whole specifier; `None` when any clause is untranslatable
fn translate(specifier: &str) -> Option<Vec<Clause>> {
    let mut clauses = Vec::new();
    for clause in specifier.split(',').filter(|c| !c.trim().is_empty()) {
        clauses.extend(translate_clause(clause)?);
    }
    Some(clauses)
}

/// Whether `installed` satisfies every clause of `specifier`.
///
/// An empty specifier accepts any installed version.
pub fn satisfies(installed: &str, specifier: &str) -> bool {
    let Some(version) = lenient_version(installed) else {
        tracing::debug!("Cannot compare non-numeric version {}", installed);
        return false;
    };
    let Some(clauses) = translate(specifier) else {
        tracing::debug!("Cannot evaluate specifier {:?}", specifier);
        return false;
    };
    clauses.iter().all(|clause| clause.matches(&version))
}
