//! Structured IBE identity strings.
//!
//! An identity names the key a ciphertext is sealed under and is what the
//! permission predicate evaluates. The textual form is stable wire format:
//!
//! ```text
//! self:<addr>
//! app:<addr>:<target>
//! time:<addr>:<ms>
//! role:<addr>:<role>
//! cond:<addr>:<h16>
//! ```
//!
//! The byte form (`as_bytes`) is the textual form's UTF-8 bytes; it is used
//! both as AEAD associated data and as the key-share derivation input.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::UserAddress;

/// Length of the truncated condition-hash token in the textual form.
const COND_HASH_CHARS: usize = 16;

/// Identity under which content is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IbeIdentity {
    /// Owner-only access.
    Owner { user: UserAddress },
    /// Cross-app grant: `app` may read `user`'s content subject to consent.
    App { user: UserAddress, app: UserAddress },
    /// Decryptable only once wall-clock reaches `unlock_ms`.
    Time { user: UserAddress, unlock_ms: i64 },
    /// Role-gated; resolution delegates to a registered role evaluator.
    Role { user: UserAddress, role_id: String },
    /// Predicate-gated; `condition_h16` is the first 16 hex chars of the
    /// condition hash.
    Cond {
        user: UserAddress,
        condition_h16: String,
    },
}

impl IbeIdentity {
    /// Owner-only identity for `user`.
    #[must_use]
    pub fn owner(user: UserAddress) -> Self {
        IbeIdentity::Owner { user }
    }

    /// Cross-app identity.
    #[must_use]
    pub fn app(user: UserAddress, app: UserAddress) -> Self {
        IbeIdentity::App { user, app }
    }

    /// Time-locked identity.
    #[must_use]
    pub fn time(user: UserAddress, unlock_ms: i64) -> Self {
        IbeIdentity::Time { user, unlock_ms }
    }

    /// Role-gated identity.
    #[must_use]
    pub fn role(user: UserAddress, role_id: impl Into<String>) -> Self {
        IbeIdentity::Role {
            user,
            role_id: role_id.into(),
        }
    }

    /// Condition-gated identity; `condition_hash` is truncated to its first
    /// 16 hex characters.
    #[must_use]
    pub fn cond(user: UserAddress, condition_hash: &str) -> Self {
        IbeIdentity::Cond {
            user,
            condition_h16: condition_hash.chars().take(COND_HASH_CHARS).collect(),
        }
    }

    /// The address owning the sealed content.
    #[must_use]
    pub fn user(&self) -> &UserAddress {
        match self {
            IbeIdentity::Owner { user }
            | IbeIdentity::App { user, .. }
            | IbeIdentity::Time { user, .. }
            | IbeIdentity::Role { user, .. }
            | IbeIdentity::Cond { user, .. } => user,
        }
    }

    /// Stable textual serialisation.
    #[must_use]
    pub fn to_identity_string(&self) -> String {
        match self {
            IbeIdentity::Owner { user } => format!("self:{user}"),
            IbeIdentity::App { user, app } => format!("app:{user}:{app}"),
            IbeIdentity::Time { user, unlock_ms } => format!("time:{user}:{unlock_ms}"),
            IbeIdentity::Role { user, role_id } => format!("role:{user}:{role_id}"),
            IbeIdentity::Cond {
                user,
                condition_h16,
            } => format!("cond:{user}:{condition_h16}"),
        }
    }

    /// Byte form used as AEAD associated data and share-derivation input.
    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_identity_string().into_bytes()
    }

    /// Parse the textual form back into a structured identity.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let tag = parts
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("empty identity string: {s:?}")))?;
        let user = parts
            .next()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("identity missing address: {s:?}")))?;
        let rest = parts.next();

        let user = UserAddress::new(user);
        match (tag, rest) {
            ("self", None) => Ok(IbeIdentity::Owner { user }),
            ("app", Some(target)) if !target.is_empty() => Ok(IbeIdentity::App {
                user,
                app: UserAddress::new(target),
            }),
            ("time", Some(ms)) => {
                let unlock_ms = ms.parse::<i64>().map_err(|_| {
                    Error::InvalidInput(format!("invalid unlock timestamp in identity: {s:?}"))
                })?;
                Ok(IbeIdentity::Time { user, unlock_ms })
            }
            ("role", Some(role_id)) if !role_id.is_empty() => Ok(IbeIdentity::Role {
                user,
                role_id: role_id.to_string(),
            }),
            ("cond", Some(h16))
                if h16.len() == COND_HASH_CHARS
                    && h16.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(IbeIdentity::Cond {
                    user,
                    condition_h16: h16.to_ascii_lowercase(),
                })
            }
            _ => Err(Error::InvalidInput(format!(
                "unrecognised identity string: {s:?}"
            ))),
        }
    }
}

impl fmt::Display for IbeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_identity_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> UserAddress {
        UserAddress::new(s)
    }

    #[test]
    fn serialises_every_variant() {
        assert_eq!(
            IbeIdentity::owner(addr("0xa1")).to_identity_string(),
            "self:0xa1"
        );
        assert_eq!(
            IbeIdentity::app(addr("0xa1"), addr("0xb2")).to_identity_string(),
            "app:0xa1:0xb2"
        );
        assert_eq!(
            IbeIdentity::time(addr("0xa1"), 1_700_000_000_000).to_identity_string(),
            "time:0xa1:1700000000000"
        );
        assert_eq!(
            IbeIdentity::role(addr("0xa1"), "admin").to_identity_string(),
            "role:0xa1:admin"
        );
        assert_eq!(
            IbeIdentity::cond(addr("0xa1"), "deadbeefcafebabe1122334455").to_identity_string(),
            "cond:0xa1:deadbeefcafebabe"
        );
    }

    #[test]
    fn round_trips_through_parse() {
        let identities = vec![
            IbeIdentity::owner(addr("0xa1b2c3")),
            IbeIdentity::app(addr("0xa1"), addr("0xdeadbeef")),
            IbeIdentity::time(addr("0xa1"), -5),
            IbeIdentity::role(addr("0xa1"), "curator"),
            IbeIdentity::cond(addr("0xa1"), "0123456789abcdef0123"),
        ];
        for id in identities {
            let text = id.to_identity_string();
            assert_eq!(IbeIdentity::parse(&text).unwrap(), id, "identity {text}");
        }
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in [
            "",
            "self",
            "self:",
            "app:0xa1",
            "app:0xa1:",
            "time:0xa1:soon",
            "cond:0xa1:short",
            "cond:0xa1:zzzzzzzzzzzzzzzz",
            "grant:0xa1:0xb2",
        ] {
            assert!(IbeIdentity::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn byte_form_matches_textual_form() {
        let id = IbeIdentity::app(addr("0xa1"), addr("0xb2"));
        assert_eq!(id.as_bytes(), b"app:0xa1:0xb2".to_vec());
    }

    #[test]
    fn user_accessor_covers_all_variants() {
        let u = addr("0xowner");
        for id in [
            IbeIdentity::owner(u.clone()),
            IbeIdentity::app(u.clone(), addr("0xapp")),
            IbeIdentity::time(u.clone(), 0),
            IbeIdentity::role(u.clone(), "r"),
            IbeIdentity::cond(u.clone(), "00112233445566778899"),
        ] {
            assert_eq!(id.user(), &u);
        }
    }
}
