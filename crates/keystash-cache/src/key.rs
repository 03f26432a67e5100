//! Composed cache keys
//!
//! A composed key joins provider key, dynamic key and dynamic key group with
//! an unescaped `$`. Components escape `\` and `$`, so the join is injective
//! and [`decompose`] recovers the exact triple.

const DELIMITER: char = '$';
const ESCAPE: char = '\\';

/// Reserved key holding the persisted cache schema version.
///
/// It contains no unescaped delimiter, so no composed key can collide with it.
pub const VERSION_KEY: &str = "keystash.cache_version";

/// The three components addressing one record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyParts {
    pub provider_key: String,
    pub dynamic_key: String,
    pub dynamic_key_group: String,
}

impl KeyParts {
    /// Create key parts from borrowed components
    pub fn new(provider_key: &str, dynamic_key: &str, dynamic_key_group: &str) -> Self {
        Self {
            provider_key: provider_key.to_string(),
            dynamic_key: dynamic_key.to_string(),
            dynamic_key_group: dynamic_key_group.to_string(),
        }
    }

    /// The composed key for these parts
    pub fn compose(&self) -> String {
        compose(&self.provider_key, &self.dynamic_key, &self.dynamic_key_group)
    }
}

/// Which records a scope eviction removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScope<'a> {
    /// Every record of the provider, whatever its dynamic key and group
    Provider { provider_key: &'a str },
    /// Every group under one dynamic key of the provider
    DynamicKey {
        provider_key: &'a str,
        dynamic_key: &'a str,
    },
    /// Exactly one record
    DynamicKeyGroup {
        provider_key: &'a str,
        dynamic_key: &'a str,
        dynamic_key_group: &'a str,
    },
}

impl<'a> KeyScope<'a> {
    /// Narrowest scope covering the supplied keys: group, then dynamic key, then provider
    pub fn narrowest(
        provider_key: &'a str,
        dynamic_key: &'a str,
        dynamic_key_group: &'a str,
    ) -> Self {
        if !dynamic_key_group.is_empty() {
            KeyScope::DynamicKeyGroup {
                provider_key,
                dynamic_key,
                dynamic_key_group,
            }
        } else if !dynamic_key.is_empty() {
            KeyScope::DynamicKey {
                provider_key,
                dynamic_key,
            }
        } else {
            KeyScope::Provider { provider_key }
        }
    }

    /// Whether a composed key falls inside this scope.
    ///
    /// Strings that are not composed keys (the version key, foreign files) never match.
    pub fn matches(&self, composed_key: &str) -> bool {
        let Some(parts) = decompose(composed_key) else {
            return false;
        };

        match self {
            KeyScope::Provider { provider_key } => parts.provider_key == *provider_key,
            KeyScope::DynamicKey {
                provider_key,
                dynamic_key,
            } => parts.provider_key == *provider_key && parts.dynamic_key == *dynamic_key,
            KeyScope::DynamicKeyGroup {
                provider_key,
                dynamic_key,
                dynamic_key_group,
            } => {
                parts.provider_key == *provider_key
                    && parts.dynamic_key == *dynamic_key
                    && parts.dynamic_key_group == *dynamic_key_group
            }
        }
    }
}

fn escape(component: &str, out: &mut String) {
    for c in component.chars() {
        if c == ESCAPE || c == DELIMITER {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Compose the cache address for a provider key, dynamic key and group
pub fn compose(provider_key: &str, dynamic_key: &str, dynamic_key_group: &str) -> String {
    let mut key = String::with_capacity(
        provider_key.len() + dynamic_key.len() + dynamic_key_group.len() + 2,
    );
    escape(provider_key, &mut key);
    key.push(DELIMITER);
    escape(dynamic_key, &mut key);
    key.push(DELIMITER);
    escape(dynamic_key_group, &mut key);
    key
}

/// Split a composed key back into its components.
///
/// Returns `None` unless the input is exactly three escaped components
/// joined by two unescaped delimiters.
pub fn decompose(composed_key: &str) -> Option<KeyParts> {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    let mut current = String::new();
    let mut chars = composed_key.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(next) if next == ESCAPE || next == DELIMITER => current.push(next),
                _ => return None,
            },
            DELIMITER => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);

    if parts.len() != 3 {
        return None;
    }
    let dynamic_key_group = parts.pop()?;
    let dynamic_key = parts.pop()?;
    let provider_key = parts.pop()?;

    Some(KeyParts {
        provider_key,
        dynamic_key,
        dynamic_key_group,
    })
}

/// Whether a stored key is reserved for engine bookkeeping
pub fn is_reserved(key: &str) -> bool {
    key == VERSION_KEY
}
