//! NewType wrappers for the identifiers that flow through a batch run.
//!
//! These keep a function name from being passed where a namespace or a
//! project name is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a deployed function. Unique within a namespace and therefore
    /// unique within a batch run.
    FunctionName
);

newtype_string!(
    /// Namespace the functions of a batch run live in.
    Namespace
);

newtype_string!(
    /// Project (owner group) a function belongs to, taken from its labels.
    ProjectName
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_function_name_creation() {
        let name = FunctionName::new("echo");
        assert_eq!(name.as_str(), "echo");
        assert_eq!(name.to_string(), "echo");
    }

    #[test]
    fn test_function_name_serde() {
        let name = FunctionName::new("echo");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"echo\"");

        let parsed: FunctionName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_borrow_allows_str_lookup() {
        let set: HashSet<ProjectName> = [ProjectName::new("billing")].into_iter().collect();
        assert!(set.contains("billing"));
        assert!(!set.contains("search"));
    }

    #[test]
    fn test_namespace_into_inner() {
        let ns: Namespace = "default".into();
        assert_eq!(ns.into_inner(), "default");
    }
}
