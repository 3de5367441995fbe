//! Naming rules for Kubernetes objects and labels.

/// Maximum length of a DNS-1123 label.
pub const DNS1123_LABEL_MAX_LENGTH: usize = 63;

const GENERATED_SUFFIX_LENGTH: usize = 8;

/// Turn an arbitrary string into something usable as a DNS-1123 label.
///
/// Lowercases, drops everything outside `[a-z0-9-]`, strips leading and trailing
/// hyphens and truncates to 63 bytes. The result may be empty.
pub fn make_dns1123_compatible(name: &str) -> String {
    let allowed: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    let mut out = allowed.trim_start_matches('-').to_string();
    out.truncate(DNS1123_LABEL_MAX_LENGTH);
    out.trim_end_matches('-').to_string()
}

/// Check `value` against `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$` with the 63 byte limit.
pub fn validate_dns1123_label(value: &str) -> Result<(), String> {
    if value.len() > DNS1123_LABEL_MAX_LENGTH {
        return Err(format!(
            "must be no more than {} characters",
            DNS1123_LABEL_MAX_LENGTH
        ));
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = !value.is_empty()
        && value.chars().all(|c| valid_char(c) || c == '-')
        && value.starts_with(valid_char)
        && value.ends_with(valid_char);

    if valid {
        Ok(())
    } else {
        Err("a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', \
             and must start and end with an alphanumeric character"
            .to_string())
    }
}

/// Object name made of a sanitised prefix and a random 8 character suffix.
pub fn generate_name(prefix: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(GENERATED_SUFFIX_LENGTH)
        .collect();

    let mut base = make_dns1123_compatible(prefix);
    base.truncate(DNS1123_LABEL_MAX_LENGTH - GENERATED_SUFFIX_LENGTH - 1);
    let base = base.trim_end_matches('-');

    if base.is_empty() {
        suffix
    } else {
        format!("{}-{}", base, suffix)
    }
}

/// Make a string usable as a label value: invalid characters become `_`,
/// separators are trimmed from both ends and the length is capped at 63.
pub fn sanitize_label_value(value: &str) -> String {
    let trim = |s: &str| s.trim_matches(|c| c == '-' || c == '_' || c == '.').to_string();

    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut out = trim(&replaced);
    out.truncate(DNS1123_LABEL_MAX_LENGTH);
    trim(&out)
}
