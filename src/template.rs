//! Job template rendering.
//!
//! Templates are Beaker job XML files with `##NAME##` placeholders. Rendering
//! is a literal text replacement, not XML-aware: values are inserted exactly
//! as given, so a value that needs escaping must already be escaped.
//!
//! ```
//! use labrun::template::{render, Replacements};
//!
//! let mut values = Replacements::new();
//! values.insert("KVER".to_string(), "4.17.0-rc1".into());
//!
//! let xml = render("<job><whiteboard>##KVER## ##UNKNOWN##</whiteboard></job>", &values).unwrap();
//! assert_eq!(xml, "<job><whiteboard>4.17.0-rc1 ##UNKNOWN##</whiteboard></job>");
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

/// Placeholder values keyed by placeholder name (without the `##`).
///
/// Values are JSON values so that absent configuration (`null`) and other
/// non-string input can be detected and rejected instead of being
/// stringified into a job description.
pub type Replacements = BTreeMap<String, Value>;

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to read job template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A replacement value is not a string.
    #[error("Replacement for ##{name}## must be a string, got {kind}")]
    NonStringValue { name: String, kind: &'static str },
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"##(\w+)##").expect("placeholder pattern is valid"));

/// Substitutes every known placeholder in `template`.
///
/// Unknown placeholders are left verbatim.
///
/// # Errors
///
/// Returns [`TemplateError::NonStringValue`] if any value in `values` is
/// not a string, whether or not the template uses it.
pub fn render(template: &str, values: &Replacements) -> TemplateResult<String> {
    let mut strings: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, value) in values {
        match value {
            Value::String(s) => {
                strings.insert(name.as_str(), s.as_str());
            }
            other => {
                return Err(TemplateError::NonStringValue {
                    name: name.clone(),
                    kind: value_kind(other),
                });
            }
        }
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match strings.get(&caps[1]) {
            Some(value) => (*value).to_string(),
            None => caps[0].to_string(),
        }
    });

    Ok(rendered.into_owned())
}

/// Reads a template file and renders it.
pub fn render_file(path: &Path, values: &Replacements) -> TemplateResult<String> {
    let template = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    render(&template, values)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEMPLATE: &str = include_str!("../testdata/job.xml");

    fn values(pairs: &[(&str, &str)]) -> Replacements {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_render_no_values_is_identity() {
        assert_eq!(render(TEMPLATE, &Replacements::new()).unwrap(), TEMPLATE);
    }

    #[test]
    fn test_render_replaces() {
        let result = render(TEMPLATE, &values(&[("KVER", "kernel-4.16")])).unwrap();
        assert_eq!(result, TEMPLATE.replace("##KVER##", "kernel-4.16"));
    }

    #[test]
    fn test_render_multi_instance() {
        assert!(TEMPLATE.matches("##ARCH##").count() > 1);
        let result = render(TEMPLATE, &values(&[("ARCH", "s390x")])).unwrap();
        assert_eq!(result, TEMPLATE.replace("##ARCH##", "s390x"));
    }

    #[test]
    fn test_render_rejects_null() {
        let mut values = Replacements::new();
        values.insert("KVER".to_string(), Value::Null);
        let err = render(TEMPLATE, &values).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::NonStringValue { ref name, kind: "null" } if name == "KVER"
        ));
    }

    #[test]
    fn test_render_rejects_number_even_if_unused() {
        let mut values = Replacements::new();
        values.insert("NOT_IN_TEMPLATE".to_string(), Value::from(3));
        assert!(render("<job/>", &values).is_err());
    }

    #[test]
    fn test_render_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "<job>##UID##</job>").unwrap();
        let result = render_file(file.path(), &values(&[("UID", "ci build.tar.gz")])).unwrap();
        assert_eq!(result, "<job>ci build.tar.gz</job>");
    }

    #[test]
    fn test_render_file_missing() {
        let err = render_file(Path::new("/nonexistent/job.xml"), &Replacements::new());
        assert!(matches!(err, Err(TemplateError::Read { .. })));
    }
}
