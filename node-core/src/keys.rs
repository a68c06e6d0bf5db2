use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_128;

/// How a user's credentials are derived from their `key` seed.
///
/// `Hashed` (the default) feeds the seed through xxh128 so the controller
/// never hands a raw secret to the node; `Plain` treats the seed itself as
/// the credential, for deployments that manage their own UUID/password
/// assignment upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    #[default]
    Hashed,
    Plain,
}

/// Derive a deterministic UUID from `key` under the given mode.
///
/// In `Hashed` mode the 128-bit xxh3 digest of `key` is used directly as
/// the UUID's bytes. In `Plain` mode `key` itself must already be a valid
/// UUID string; callers that can't guarantee this should stay in `Hashed`
/// mode.
pub fn uuid(key: &str, mode: CredentialMode) -> Uuid {
    match mode {
        CredentialMode::Hashed => Uuid::from_u128(xxh3_128(key.as_bytes())),
        CredentialMode::Plain => Uuid::parse_str(key).unwrap_or_else(|_| uuid(key, CredentialMode::Hashed)),
    }
}

/// Derive a deterministic 32-character lowercase hex password from `key`.
pub fn password(key: &str, mode: CredentialMode) -> String {
    match mode {
        CredentialMode::Hashed => hex::encode(xxh3_128(key.as_bytes()).to_be_bytes()),
        CredentialMode::Plain => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_deterministic() {
        assert_eq!(uuid("seed-1", CredentialMode::Hashed), uuid("seed-1", CredentialMode::Hashed));
    }

    #[test]
    fn uuid_is_pure_over_distinct_seeds() {
        assert_ne!(uuid("seed-1", CredentialMode::Hashed), uuid("seed-2", CredentialMode::Hashed));
    }

    #[test]
    fn password_is_deterministic_and_well_formed() {
        let p1 = password("seed-1", CredentialMode::Hashed);
        let p2 = password("seed-1", CredentialMode::Hashed);
        assert_eq!(p1, p2);
        assert_eq!(p1.len(), 32);
        assert!(p1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn plain_mode_passes_key_through() {
        assert_eq!(password("raw-secret", CredentialMode::Plain), "raw-secret");
    }

    #[test]
    fn plain_mode_uuid_parses_valid_uuid_strings() {
        let seed = "5a9cfa9c-e69f-4c6f-8d7a-0f6a4c2e9b1a";
        assert_eq!(uuid(seed, CredentialMode::Plain).to_string(), seed);
    }

    #[test]
    fn default_mode_is_hashed() {
        assert_eq!(CredentialMode::default(), CredentialMode::Hashed);
    }
}
