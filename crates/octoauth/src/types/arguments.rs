//! Space-delimited protocol arguments (scopes, audiences, response types).

use std::fmt;

use serde::{Deserialize, Serialize};

/// An ordered, de-duplicated list of protocol arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(Vec<String>);

impl Arguments {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits a space-delimited parameter value.
    #[must_use]
    pub fn from_space_delimited(value: &str) -> Self {
        value.split_whitespace().collect()
    }

    /// Returns true if `arg` is present.
    #[must_use]
    pub fn has(&self, arg: &str) -> bool {
        self.0.iter().any(|a| a == arg)
    }

    /// Returns true if any of `args` is present.
    #[must_use]
    pub fn has_one_of(&self, args: &[String]) -> bool {
        args.iter().any(|a| self.has(a))
    }

    /// Returns true if the list holds exactly `arg` and nothing else.
    #[must_use]
    pub fn exact(&self, arg: &str) -> bool {
        self.0.len() == 1 && self.0[0] == arg
    }

    /// Returns true if both lists hold the same set of values.
    #[must_use]
    pub fn matches(&self, args: &[&str]) -> bool {
        self.0.len() == args.len() && args.iter().all(|a| self.has(a))
    }

    /// Appends `arg` unless it is already present.
    pub fn append(&mut self, arg: impl Into<String>) {
        let arg = arg.into();
        if !self.has(&arg) {
            self.0.push(arg);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns the values as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Joins the values with single spaces.
    #[must_use]
    pub fn join(&self) -> String {
        self.0.join(" ")
    }
}

impl<S: Into<String>> FromIterator<S> for Arguments {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut args = Self::new();
        for arg in iter {
            args.append(arg);
        }
        args
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_dedup() {
        let args = Arguments::from_space_delimited("openid  offline openid profile");
        assert_eq!(args.as_slice(), ["openid", "offline", "profile"]);
        assert_eq!(args.join(), "openid offline profile");
    }

    #[test]
    fn test_exact_and_matches() {
        let code = Arguments::from_space_delimited("code");
        assert!(code.exact("code"));
        let hybrid = Arguments::from_space_delimited("id_token code");
        assert!(!hybrid.exact("code"));
        assert!(hybrid.has("code"));
        assert!(hybrid.matches(&["code", "id_token"]));
        assert!(!hybrid.matches(&["code"]));
    }

    #[test]
    fn test_has_one_of() {
        let args = Arguments::from_space_delimited("openid offline_access");
        assert!(args.has_one_of(&["offline".to_string(), "offline_access".to_string()]));
        assert!(!Arguments::new().has_one_of(&["offline".to_string()]));
    }
}
