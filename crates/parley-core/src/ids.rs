use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(RequestId, "req");
branded_id!(ToolCallId, "toolu");

/// Which producer minted a [`BlockId`]. Each producer gets its own prefix so
/// ids from the moderation gate, the generation loop and the refusal path can
/// never collide within one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdNamespace {
    Moderation,
    Generation,
    Refusal,
}

impl IdNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Moderation => "mod",
            Self::Generation => "gen",
            Self::Refusal => "ref",
        }
    }
}

/// Identifier scoping one start/delta/end bracket in the output stream.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(namespace: IdNamespace) -> Self {
        Self(format!("{}_{}", namespace.prefix(), Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> Option<IdNamespace> {
        let prefix = self.0.split('_').next()?;
        [IdNamespace::Moderation, IdNamespace::Generation, IdNamespace::Refusal]
            .into_iter()
            .find(|ns| ns.prefix() == prefix)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_has_prefix() {
        let id = RequestId::new();
        assert!(id.as_str().starts_with("req_"), "got: {id}");
    }

    #[test]
    fn tool_call_id_has_prefix() {
        let id = ToolCallId::new();
        assert!(id.as_str().starts_with("toolu_"), "got: {id}");
    }

    #[test]
    fn block_ids_carry_their_namespace() {
        let gate = BlockId::new(IdNamespace::Moderation);
        let gen = BlockId::new(IdNamespace::Generation);
        let refusal = BlockId::new(IdNamespace::Refusal);
        assert!(gate.as_str().starts_with("mod_"));
        assert!(gen.as_str().starts_with("gen_"));
        assert!(refusal.as_str().starts_with("ref_"));
        assert_eq!(gate.namespace(), Some(IdNamespace::Moderation));
        assert_eq!(gen.namespace(), Some(IdNamespace::Generation));
        assert_eq!(refusal.namespace(), Some(IdNamespace::Refusal));
    }

    #[test]
    fn block_ids_never_collide_across_namespaces() {
        let a = BlockId::new(IdNamespace::Moderation);
        let b = BlockId::new(IdNamespace::Generation);
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = ToolCallId::new();
        let parsed: ToolCallId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = ToolCallId::from_raw("toolu_custom");
        assert_eq!(id.as_str(), "toolu_custom");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<BlockId> = (0..100).map(|_| BlockId::new(IdNamespace::Generation)).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
