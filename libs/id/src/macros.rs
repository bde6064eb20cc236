//! Macros for defining typed provider ID types.

/// Macro to define a typed provider ID with a specific prefix.
///
/// This generates a newtype wrapper around the canonical string with:
/// - A `PREFIX` constant
/// - `parse()` with prefix, length and character-set validation
/// - `Display`, `FromStr`, `AsRef<str>` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(InstanceId, "i", [8, 17], |c: char| c.is_ascii_hexdigit());
///
/// let id: InstanceId = "i-0abc123def4567890".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, [$($len:literal),+], $allowed:expr) => {
        /// A typed provider ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Suffix lengths the provider issues for this ID type.
            pub const SUFFIX_LENGTHS: &'static [usize] = &[$($len),+];

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}-{suffix}`. Upper-case
            /// suffixes are normalised to lower case.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, suffix)) = s.split_once('-') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                if !Self::SUFFIX_LENGTHS.contains(&suffix.len()) {
                    return Err($crate::IdError::InvalidLength { len: suffix.len() });
                }

                let allowed: fn(char) -> bool = $allowed;
                if let Some(found) = suffix.chars().find(|c| !allowed(*c)) {
                    return Err($crate::IdError::InvalidCharacter { found });
                }

                Ok(Self(format!("{}-{}", Self::PREFIX, suffix.to_ascii_lowercase())))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
