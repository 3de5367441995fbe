use serde::{Deserialize, Serialize};

/// A single job variable as delivered with the job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVariable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub file: bool,
    #[serde(default)]
    pub masked: bool,
}

impl JobVariable {
    /// A public variable.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            value: value.into(),
            public: true,
            internal: false,
            file: false,
            masked: false,
        }
    }
}

/// Ordered list of job variables. Lookups resolve to the last declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobVariables(pub Vec<JobVariable>);

impl JobVariables {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobVariable> {
        self.0.iter()
    }

    pub fn push(&mut self, variable: JobVariable) {
        self.0.push(variable);
    }

    /// Value of the last variable named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Value of `key` or an empty string, matching how unset variables expand.
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    /// Expand `$NAME` and `${NAME}` references in `input` against this set.
    ///
    /// Unknown names expand to the empty string. A `$` that is not followed by a
    /// name is kept as is.
    pub fn expand_value(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek() {
                Some((_, '{')) => {
                    let rest = &input[i + 2..];
                    match rest.find('}') {
                        Some(end) => {
                            out.push_str(self.value(&rest[..end]));
                            // skip "{name}"
                            for _ in 0..rest[..end].chars().count() + 2 {
                                chars.next();
                            }
                        }
                        None => out.push(c),
                    }
                }
                Some((_, n)) if is_name_char(*n) => {
                    let mut name = String::new();
                    while let Some((_, n)) = chars.peek() {
                        if !is_name_char(*n) {
                            break;
                        }
                        name.push(*n);
                        chars.next();
                    }
                    out.push_str(self.value(&name));
                }
                _ => out.push(c),
            }
        }

        out
    }

    /// Copy of the set with every value expanded against the original set.
    pub fn expand(&self) -> JobVariables {
        JobVariables(
            self.0
                .iter()
                .map(|v| JobVariable {
                    value: self.expand_value(&v.value),
                    ..v.clone()
                })
                .collect(),
        )
    }

    /// Variables visible to the build container environment.
    pub fn public_or_internal(&self) -> JobVariables {
        JobVariables(
            self.0
                .iter()
                .filter(|v| v.public || v.internal)
                .cloned()
                .collect(),
        )
    }

    /// One entry per key, in first-declaration order, carrying the last declared value.
    pub fn deduplicated(&self) -> JobVariables {
        let mut out: Vec<JobVariable> = Vec::with_capacity(self.0.len());
        for v in &self.0 {
            match out.iter_mut().find(|o| o.key == v.key) {
                Some(existing) => *existing = v.clone(),
                None => out.push(v.clone()),
            }
        }
        JobVariables(out)
    }

    /// Variables whose key starts with `prefix`, in declaration order.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a JobVariable> {
        self.0.iter().filter(move |v| v.key.starts_with(prefix))
    }

    /// Whether a feature-flag style variable is set to a truthy value.
    pub fn is_enabled(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

impl FromIterator<JobVariable> for JobVariables {
    fn from_iter<I: IntoIterator<Item = JobVariable>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> JobVariables {
        pairs.iter().map(|(k, v)| JobVariable::new(*k, *v)).collect()
    }

    #[test]
    fn get_returns_last_declaration() {
        let v = vars(&[("A", "1"), ("B", "2"), ("A", "3")]);
        assert_eq!(v.get("A"), Some("3"));
        assert_eq!(v.get("C"), None);
    }

    #[test]
    fn expand_value_handles_both_forms() {
        let v = vars(&[("NS", "team"), ("ENV", "prod")]);
        assert_eq!(v.expand_value("$NS-${ENV}"), "team-prod");
        assert_eq!(v.expand_value("ci-$MISSING"), "ci-");
        assert_eq!(v.expand_value("cost: 5$"), "cost: 5$");
        assert_eq!(v.expand_value("${unterminated"), "${unterminated");
    }

    #[test]
    fn expand_is_not_recursive() {
        let v = vars(&[("A", "$B"), ("B", "$A")]);
        let expanded = v.expand();
        assert_eq!(expanded.get("A"), Some("$A"));
        assert_eq!(expanded.get("B"), Some("$B"));
    }

    #[test]
    fn public_or_internal_filters_private() {
        let mut v = vars(&[("PUB", "1")]);
        v.push(JobVariable {
            public: false,
            internal: true,
            ..JobVariable::new("INT", "2")
        });
        v.push(JobVariable {
            public: false,
            ..JobVariable::new("SECRET", "3")
        });

        let keys: Vec<_> = v.public_or_internal().iter().map(|v| v.key.clone()).collect();
        assert_eq!(keys, vec!["PUB", "INT"]);
    }

    #[test]
    fn deduplicated_keeps_position_and_last_value() {
        let v = vars(&[("A", "1"), ("B", "2"), ("A", "3")]).deduplicated();
        let pairs: Vec<_> = v.iter().map(|v| (v.key.as_str(), v.value.as_str())).collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn feature_flags() {
        let v = vars(&[("FF_ON", "true"), ("FF_OFF", "false")]);
        assert!(v.is_enabled("FF_ON"));
        assert!(!v.is_enabled("FF_OFF"));
        assert!(!v.is_enabled("FF_MISSING"));
    }
}
