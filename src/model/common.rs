use uuid::Uuid;

pub type Id = String;

/// Flat key/value form fields submitted with an edit
pub type FieldUpdates = std::collections::BTreeMap<String, String>;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Case-insensitive name comparison used for pipeline, stage, job and group names
pub fn same_name(left: &str, right: &str) -> bool {
    left.eq_ignore_ascii_case(right)
}

/// Normalized form of a name used as a lookup key
pub fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Split a comma separated attribute value (e.g. `admins`) into trimmed entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_ignores_case() {
        assert!(same_name("Build-Linux", "build-linux"));
        assert!(!same_name("build", "build2"));
    }

    #[test]
    fn test_split_list_trims_and_skips_blanks() {
        assert_eq!(split_list(" alice, bob ,,"), vec!["alice", "bob"]);
        assert!(split_list("").is_empty());
    }
}
