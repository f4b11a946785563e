//! Deterministic source paths
//!
//! A deterministic report must not depend on where the sources were checked
//! out. Local prefixes are swapped for stable roots such as `/_/`.

use crate::config::CoverageParameters;

/// Rewrites document paths for deterministic reports
#[derive(Debug, Clone, Default)]
pub struct SourceRootTranslator {
    /// (local prefix, mapped root), longest prefix first
    mappings: Vec<(String, String)>,
    active: bool,
}

impl SourceRootTranslator {
    /// Translator for the given parameters; inactive unless deterministic
    #[must_use]
    pub fn new(params: &CoverageParameters) -> Self {
        let mut mappings: Vec<(String, String)> = params
            .source_root_mappings
            .iter()
            .map(|(local, mapped)| (normalize(local), normalize(mapped)))
            .collect();
        mappings.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            mappings,
            active: params.deterministic_report,
        }
    }

    /// Translator that leaves every path alone
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Whether paths are rewritten
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Path as it should appear in a report
    #[must_use]
    pub fn translate(&self, path: &str) -> String {
        if !self.active {
            return path.to_string();
        }
        let normalized = normalize(path);
        for (local, mapped) in &self.mappings {
            if let Some(rest) = strip_dir_prefix(&normalized, local) {
                return join(mapped, rest);
            }
        }
        path.to_string()
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// `path` without `prefix`, only when the prefix ends on a directory boundary
fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/') {
        Some(rest.trim_start_matches('/'))
    } else {
        None
    }
}

fn join(root: &str, rest: &str) -> String {
    if rest.is_empty() {
        root.to_string()
    } else if root.ends_with('/') {
        format!("{root}{rest}")
    } else {
        format!("{root}/{rest}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn translator(deterministic: bool) -> SourceRootTranslator {
        let params = CoverageParameters::builder()
            .deterministic_report(deterministic)
            .source_root("/home/ci/src/", "/_/")
            .source_root("/home/ci/src/vendor", "/_1/")
            .build()
            .unwrap();
        SourceRootTranslator::new(&params)
    }

    #[test]
    fn test_inactive_unless_deterministic() {
        let t = translator(false);
        assert!(!t.is_active());
        assert_eq!(t.translate("/home/ci/src/a.cs"), "/home/ci/src/a.cs");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let t = translator(true);
        assert_eq!(t.translate("/home/ci/src/app/a.cs"), "/_/app/a.cs");
        assert_eq!(t.translate("/home/ci/src/vendor/b.cs"), "/_1/b.cs");
    }

    #[test]
    fn test_prefix_must_end_on_directory() {
        let t = translator(true);
        assert_eq!(t.translate("/home/ci/src/vendored/c.cs"), "/_/vendored/c.cs");
        assert_eq!(t.translate("/elsewhere/d.cs"), "/elsewhere/d.cs");
    }

    #[test]
    fn test_backslashes_are_normalized() {
        let params = CoverageParameters::builder()
            .deterministic_report(true)
            .source_root("C:\\build\\", "/_/")
            .build()
            .unwrap();
        let t = SourceRootTranslator::new(&params);
        assert_eq!(t.translate("C:\\build\\src\\a.cs"), "/_/src/a.cs");
    }
}
